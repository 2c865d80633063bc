//! Error types for unitwork operations.

use crate::value::Value;
use std::fmt;

/// The primary error type for all unitwork operations.
#[derive(Debug)]
pub enum Error {
    /// Failed to acquire or open a backend connection
    Connection(ConnectionError),
    /// Statement preparation or execution failed in the backend
    Query(QueryError),
    /// Value conversion failed while reading or writing a field
    Type(TypeError),
    /// An entity type is not mapped correctly
    Metadata(MetadataError),
    /// A query expected exactly one row
    Cardinality(CardinalityError),
    /// The inverse field of a one-to-many relation is missing
    RelatedFieldNotFound(RelatedFieldError),
    /// `persist` was called for a key that is already managed
    DuplicateEntity(EntityStateError),
    /// `remove` was called for a key that is not managed
    NotManaged(EntityStateError),
    /// The session was closed before the operation
    SessionClosed,
    /// Eager to-one loading went deeper than the configured limit
    FetchDepthExceeded {
        /// Entity being loaded when the limit was hit
        entity: &'static str,
        /// The configured limit
        depth: usize,
    },
    /// Custom error with message
    Custom(String),
}

#[derive(Debug)]
pub struct ConnectionError {
    pub kind: ConnectionErrorKind,
    pub message: String,
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionErrorKind {
    /// Failed to establish connection
    Connect,
    /// Connection lost during operation
    Disconnected,
    /// The data source could not hand out a connection
    Unavailable,
}

#[derive(Debug)]
pub struct QueryError {
    pub kind: QueryErrorKind,
    pub sql: Option<String>,
    pub message: String,
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryErrorKind {
    /// Syntax error in SQL
    Syntax,
    /// Constraint violation (unique, foreign key, etc.)
    Constraint,
    /// Table or column not found
    NotFound,
    /// Permission denied
    Permission,
    /// Data too large for column
    DataTruncation,
    /// Database is busy or locked
    Busy,
    /// Interrupted
    Cancelled,
    /// Other database error
    Database,
}

#[derive(Debug)]
pub struct TypeError {
    pub expected: &'static str,
    pub actual: String,
    pub column: Option<String>,
    pub rust_type: Option<&'static str>,
}

#[derive(Debug)]
pub struct MetadataError {
    /// Name of the entity type whose mapping is invalid.
    pub entity: &'static str,
    pub message: String,
}

#[derive(Debug)]
pub struct CardinalityError {
    pub entity: &'static str,
    /// Column used in the predicate.
    pub column: String,
    /// Bound predicate value.
    pub value: Value,
    /// Number of rows actually returned.
    pub found: usize,
}

#[derive(Debug)]
pub struct RelatedFieldError {
    /// Entity declaring the one-to-many field.
    pub owner: &'static str,
    /// The one-to-many field on the owner.
    pub field: &'static str,
    /// Entity expected to carry the back-reference.
    pub related: &'static str,
    /// Declared `mapped_by` name, if any.
    pub mapped_by: Option<&'static str>,
}

#[derive(Debug)]
pub struct EntityStateError {
    pub entity: &'static str,
    pub id: Value,
}

impl Error {
    /// Is this a failure surfaced by the backend (connection or statement)?
    pub fn is_backend(&self) -> bool {
        matches!(self, Error::Connection(_) | Error::Query(_))
    }

    /// Is this the error returned for operations on a closed session?
    pub fn is_session_closed(&self) -> bool {
        matches!(self, Error::SessionClosed)
    }

    /// Get the SQL that caused this error, if available
    pub fn sql(&self) -> Option<&str> {
        match self {
            Error::Query(q) => q.sql.as_deref(),
            _ => None,
        }
    }

    pub(crate) fn metadata(entity: &'static str, message: impl Into<String>) -> Self {
        Error::Metadata(MetadataError {
            entity,
            message: message.into(),
        })
    }

    /// Error for a field name an entity does not declare.
    pub fn unknown_field(entity: &'static str, field: &str) -> Self {
        Error::metadata(entity, format!("no mapped field named '{field}'"))
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Connection(e) => write!(f, "Connection error: {}", e.message),
            Error::Query(e) => write!(f, "Query error: {}", e.message),
            Error::Type(e) => {
                if let Some(col) = &e.column {
                    write!(
                        f,
                        "Type error in column '{}': expected {}, found {}",
                        col, e.expected, e.actual
                    )
                } else {
                    write!(f, "Type error: expected {}, found {}", e.expected, e.actual)
                }
            }
            Error::Metadata(e) => write!(f, "Metadata error: {}", e),
            Error::Cardinality(e) => write!(f, "Cardinality error: {}", e),
            Error::RelatedFieldNotFound(e) => write!(f, "Related field not found: {}", e),
            Error::DuplicateEntity(e) => write!(f, "Entity already managed: {}", e),
            Error::NotManaged(e) => write!(f, "Entity not managed by this session: {}", e),
            Error::SessionClosed => write!(f, "Session is closed"),
            Error::FetchDepthExceeded { entity, depth } => write!(
                f,
                "Eager fetch of {} exceeded the maximum depth of {}",
                entity, depth
            ),
            Error::Custom(msg) => write!(f, "{}", msg),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Connection(e) => e
                .source
                .as_deref()
                .map(|err| err as &(dyn std::error::Error + 'static)),
            Error::Query(e) => e
                .source
                .as_deref()
                .map(|err| err as &(dyn std::error::Error + 'static)),
            _ => None,
        }
    }
}

impl fmt::Display for ConnectionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl fmt::Display for QueryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(sql) = &self.sql {
            write!(f, "{} (SQL: {})", self.message, sql)
        } else {
            write!(f, "{}", self.message)
        }
    }
}

impl fmt::Display for TypeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(col) = &self.column {
            write!(
                f,
                "expected {} for column '{}', found {}",
                self.expected, col, self.actual
            )
        } else {
            write!(f, "expected {}, found {}", self.expected, self.actual)
        }
    }
}

impl fmt::Display for MetadataError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.entity, self.message)
    }
}

impl fmt::Display for CardinalityError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "expected exactly one {} where {} = {:?}, found {}",
            self.entity, self.column, self.value, self.found
        )
    }
}

impl fmt::Display for RelatedFieldError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.mapped_by {
            Some(name) => write!(
                f,
                "{}.{} is mapped by '{}', which is not a reference to {} on {}",
                self.owner, self.field, name, self.owner, self.related
            ),
            None => write!(
                f,
                "{} has no field referencing {} (needed by {}.{})",
                self.related, self.owner, self.owner, self.field
            ),
        }
    }
}

impl fmt::Display for EntityStateError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{:?}", self.entity, self.id)
    }
}

impl From<ConnectionError> for Error {
    fn from(err: ConnectionError) -> Self {
        Error::Connection(err)
    }
}

impl From<QueryError> for Error {
    fn from(err: QueryError) -> Self {
        Error::Query(err)
    }
}

impl From<TypeError> for Error {
    fn from(err: TypeError) -> Self {
        Error::Type(err)
    }
}

impl From<MetadataError> for Error {
    fn from(err: MetadataError) -> Self {
        Error::Metadata(err)
    }
}

impl From<CardinalityError> for Error {
    fn from(err: CardinalityError) -> Self {
        Error::Cardinality(err)
    }
}

impl From<RelatedFieldError> for Error {
    fn from(err: RelatedFieldError) -> Self {
        Error::RelatedFieldNotFound(err)
    }
}

/// Result type alias for unitwork operations.
pub type Result<T> = std::result::Result<T, Error>;

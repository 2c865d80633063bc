//! Blocking SQLite driver.
//!
//! [`SqliteConnection`] owns one database handle and runs statements through
//! it; [`SqliteDataSource`] opens a handle per acquisition.

// C integer widths are fixed by the SQLite API
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_sign_loss)]
#![allow(clippy::result_large_err)]
#![allow(clippy::borrow_as_ptr)]

use crate::ffi;
use crate::types;
use serde::{Deserialize, Serialize};
use std::ffi::{CStr, CString, c_int};
use std::ptr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use unitwork_core::{
    ColumnInfo, Connection, DataSource, Error, Row, Value,
    error::{ConnectionError, ConnectionErrorKind, QueryError, QueryErrorKind},
};

const MEMORY_PATH: &str = ":memory:";

/// Where and how to open a database.
///
/// Missing keys fall back to [`SqliteConfig::default`], an in-memory
/// database opened read-write with a five second busy timeout.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SqliteConfig {
    /// File path, or `:memory:`.
    pub path: String,
    pub flags: OpenFlags,
    /// How long a statement waits on a locked database; 0 fails at once.
    pub busy_timeout_ms: u32,
}

/// Access mode for a database file.
///
/// With neither `read_only` nor `read_write` set the file is opened
/// read-write and created if missing.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct OpenFlags {
    pub read_only: bool,
    pub read_write: bool,
    /// Create the file when it does not exist.
    pub create: bool,
}

impl OpenFlags {
    pub fn read_only() -> Self {
        Self {
            read_only: true,
            ..Self::default()
        }
    }

    /// Read-write on an existing file.
    pub fn read_write() -> Self {
        Self {
            read_write: true,
            ..Self::default()
        }
    }

    pub fn create_read_write() -> Self {
        Self {
            read_write: true,
            create: true,
            ..Self::default()
        }
    }

    fn bits(self) -> c_int {
        let mode = [
            (self.read_only, ffi::SQLITE_OPEN_READONLY),
            (self.read_write, ffi::SQLITE_OPEN_READWRITE),
            (self.create, ffi::SQLITE_OPEN_CREATE),
        ]
        .into_iter()
        .filter(|(set, _)| *set)
        .fold(0, |bits, (_, flag)| bits | flag);

        if mode & (ffi::SQLITE_OPEN_READONLY | ffi::SQLITE_OPEN_READWRITE) == 0 {
            mode | ffi::SQLITE_OPEN_READWRITE | ffi::SQLITE_OPEN_CREATE
        } else {
            mode
        }
    }
}

impl Default for SqliteConfig {
    fn default() -> Self {
        Self {
            path: MEMORY_PATH.to_string(),
            flags: OpenFlags::create_read_write(),
            busy_timeout_ms: 5000,
        }
    }
}

impl SqliteConfig {
    pub fn file(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            ..Self::default()
        }
    }

    pub fn memory() -> Self {
        Self::default()
    }

    pub fn flags(mut self, flags: OpenFlags) -> Self {
        self.flags = flags;
        self
    }

    pub fn busy_timeout(mut self, ms: u32) -> Self {
        self.busy_timeout_ms = ms;
        self
    }

    pub fn is_memory(&self) -> bool {
        self.path == MEMORY_PATH
    }
}

struct Handle {
    db: *mut ffi::sqlite3,
}

// SAFETY: the raw handle is only used while its Mutex is locked.
unsafe impl Send for Handle {}

/// A connection to a SQLite database.
///
/// Statements are serialized through an internal mutex, so a connection can
/// be shared across threads and lent out as a [`DataSource`].
pub struct SqliteConnection {
    handle: Mutex<Handle>,
    path: String,
}

impl std::fmt::Debug for SqliteConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteConnection")
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}

fn connect_error(message: String) -> Error {
    Error::Connection(ConnectionError {
        kind: ConnectionErrorKind::Connect,
        message,
        source: None,
    })
}

impl SqliteConnection {
    pub fn open(config: &SqliteConfig) -> Result<Self, Error> {
        let c_path = CString::new(config.path.as_str())
            .map_err(|_| connect_error(format!("database path {:?} contains NUL", config.path)))?;
        let flags = config.flags.bits();
        let mut db: *mut ffi::sqlite3 = ptr::null_mut();

        // SAFETY: c_path outlives the call; db receives the new handle
        let rc = unsafe { ffi::sqlite3_open_v2(c_path.as_ptr(), &mut db, flags, ptr::null()) };
        if rc != ffi::SQLITE_OK {
            // A handle is usually allocated even on failure and must be released
            let reason = if db.is_null() {
                ffi::error_string(rc).to_string()
            } else {
                // SAFETY: db came from sqlite3_open_v2 and is not used afterwards
                unsafe {
                    let reason = errmsg(db);
                    ffi::sqlite3_close(db);
                    reason
                }
            };
            tracing::warn!(path = %config.path, error = %reason, "Could not open SQLite database");
            return Err(connect_error(format!(
                "cannot open {}: {reason}",
                config.path
            )));
        }

        if config.busy_timeout_ms > 0 {
            // SAFETY: db is an open handle
            unsafe { ffi::sqlite3_busy_timeout(db, config.busy_timeout_ms as c_int) };
        }
        tracing::debug!(path = %config.path, flags, "Opened SQLite database");

        Ok(Self {
            handle: Mutex::new(Handle { db }),
            path: config.path.clone(),
        })
    }

    /// Open an in-memory database.
    pub fn open_memory() -> Result<Self, Error> {
        Self::open(&SqliteConfig::memory())
    }

    /// Open a file-based database.
    pub fn open_file(path: impl Into<String>) -> Result<Self, Error> {
        Self::open(&SqliteConfig::file(path))
    }

    /// Get the database path.
    pub fn path(&self) -> &str {
        &self.path
    }

    fn lock(&self) -> MutexGuard<'_, Handle> {
        self.handle.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Run one or more `;`-separated statements without parameters.
    pub fn execute_raw(&self, sql: &str) -> Result<(), Error> {
        let handle = self.lock();
        let c_sql = CString::new(sql).map_err(|_| nul_in_sql(sql))?;
        let mut message: *mut std::ffi::c_char = ptr::null_mut();

        // SAFETY: c_sql outlives the call; message is freed below
        let rc = unsafe {
            ffi::sqlite3_exec(handle.db, c_sql.as_ptr(), None, ptr::null_mut(), &mut message)
        };
        if rc == ffi::SQLITE_OK {
            tracing::trace!(sql = %sql, "Ran SQL script");
            return Ok(());
        }

        let reason = if message.is_null() {
            ffi::error_string(rc).to_string()
        } else {
            // SAFETY: sqlite3_exec allocated message and hands ownership to us
            unsafe {
                let reason = CStr::from_ptr(message).to_string_lossy().into_owned();
                ffi::sqlite3_free(message.cast());
                reason
            }
        };
        Err(query_error(error_code_to_kind(rc), sql, reason))
    }

    /// Rowid of the most recent successful INSERT.
    pub fn last_insert_rowid(&self) -> i64 {
        let handle = self.lock();
        // SAFETY: open handle
        unsafe { ffi::sqlite3_last_insert_rowid(handle.db) }
    }

    /// Rows changed by the most recent INSERT, UPDATE or DELETE.
    pub fn changes(&self) -> i32 {
        let handle = self.lock();
        // SAFETY: open handle
        unsafe { ffi::sqlite3_changes(handle.db) }
    }

    fn run_query(&self, sql: &str, params: &[Value]) -> Result<Vec<Row>, Error> {
        let handle = self.lock();
        let stmt = Statement::prepare(handle.db, sql)?;
        stmt.bind(params)?;

        let columns = Arc::new(ColumnInfo::new(stmt.column_names()));
        let mut rows = Vec::new();
        while stmt.step()? {
            rows.push(Row::with_columns(Arc::clone(&columns), stmt.row_values()));
        }
        tracing::trace!(sql = %sql, rows = rows.len(), "Query complete");
        Ok(rows)
    }

    fn run_statement(&self, sql: &str, params: &[Value]) -> Result<u64, Error> {
        let handle = self.lock();
        let stmt = Statement::prepare(handle.db, sql)?;
        stmt.bind(params)?;
        stmt.step()?;

        // SAFETY: open handle
        let changed = unsafe { ffi::sqlite3_changes(handle.db) } as u64;
        tracing::trace!(sql = %sql, rows_affected = changed, "Statement complete");
        Ok(changed)
    }
}

impl Drop for SqliteConnection {
    fn drop(&mut self) {
        let handle = self.lock();
        if handle.db.is_null() {
            return;
        }
        // SAFETY: statements are finalized when their Statement drops, so
        // none outlive a call
        let rc = unsafe { ffi::sqlite3_close(handle.db) };
        if rc == ffi::SQLITE_OK {
            tracing::trace!(path = %self.path, "Closed SQLite database");
        } else {
            tracing::warn!(path = %self.path, code = rc, "SQLite database did not close cleanly");
        }
    }
}

impl Connection for SqliteConnection {
    fn query(&self, sql: &str, params: &[Value]) -> Result<Vec<Row>, Error> {
        self.run_query(sql, params)
    }

    fn execute(&self, sql: &str, params: &[Value]) -> Result<u64, Error> {
        self.run_statement(sql, params)
    }
}

/// A single connection lends itself for every acquisition. Sessions built on
/// it all see the same database, including an in-memory one.
impl DataSource for SqliteConnection {
    fn connection(&self) -> Result<Box<dyn Connection + '_>, Error> {
        Ok(Box::new(self))
    }
}

/// Data source that opens a fresh connection for every acquisition and
/// closes it on release.
///
/// Use it with file databases; every acquisition of an in-memory
/// configuration would see a new, empty database.
#[derive(Debug, Clone)]
pub struct SqliteDataSource {
    config: SqliteConfig,
}

impl SqliteDataSource {
    pub fn new(config: SqliteConfig) -> Self {
        if config.is_memory() {
            tracing::warn!("In-memory SQLite data source opens an empty database per statement");
        }
        Self { config }
    }

    /// Data source for a file database, created on first use.
    pub fn file(path: impl Into<String>) -> Self {
        Self::new(SqliteConfig::file(path))
    }

    pub fn config(&self) -> &SqliteConfig {
        &self.config
    }
}

impl DataSource for SqliteDataSource {
    fn connection(&self) -> Result<Box<dyn Connection + '_>, Error> {
        Ok(Box::new(SqliteConnection::open(&self.config)?))
    }
}

// Helper functions

/// Current error message of `db`.
///
/// # Safety
/// `db` must be a valid connection handle.
unsafe fn errmsg(db: *mut ffi::sqlite3) -> String {
    unsafe { CStr::from_ptr(ffi::sqlite3_errmsg(db)) }
        .to_string_lossy()
        .into_owned()
}

fn query_error(kind: QueryErrorKind, sql: &str, message: String) -> Error {
    tracing::debug!(sql = %sql, kind = ?kind, error = %message, "SQLite statement failed");
    Error::Query(QueryError {
        kind,
        sql: Some(sql.to_string()),
        message,
        source: None,
    })
}

fn nul_in_sql(sql: &str) -> Error {
    query_error(
        QueryErrorKind::Syntax,
        sql,
        "SQL contains null byte".to_string(),
    )
}

/// A prepared statement, finalized on drop.
///
/// Only lives while the connection mutex is held.
struct Statement<'a> {
    db: *mut ffi::sqlite3,
    raw: *mut ffi::sqlite3_stmt,
    sql: &'a str,
}

impl<'a> Statement<'a> {
    fn prepare(db: *mut ffi::sqlite3, sql: &'a str) -> Result<Self, Error> {
        let c_sql = CString::new(sql).map_err(|_| nul_in_sql(sql))?;
        let mut raw: *mut ffi::sqlite3_stmt = ptr::null_mut();

        // SAFETY: db is open and c_sql outlives the call
        let rc = unsafe {
            ffi::sqlite3_prepare_v2(
                db,
                c_sql.as_ptr(),
                c_sql.as_bytes().len() as c_int,
                &mut raw,
                ptr::null_mut(),
            )
        };
        if rc != ffi::SQLITE_OK {
            return Err(step_error(db, sql));
        }
        Ok(Self { db, raw, sql })
    }

    /// Bind positional parameters, starting at index 1.
    fn bind(&self, params: &[Value]) -> Result<(), Error> {
        for (position, param) in (1..).zip(params) {
            // SAFETY: raw is a live statement and position is 1-based
            let rc = unsafe { types::bind_value(self.raw, position, param) };
            if rc != ffi::SQLITE_OK {
                // SAFETY: open handle
                let reason = unsafe { errmsg(self.db) };
                return Err(query_error(
                    QueryErrorKind::Database,
                    self.sql,
                    format!("cannot bind parameter {position}: {reason}"),
                ));
            }
        }
        Ok(())
    }

    fn column_names(&self) -> Vec<String> {
        // SAFETY: raw is a live statement
        let count = unsafe { ffi::sqlite3_column_count(self.raw) };
        (0..count)
            .map(|i| {
                // SAFETY: i is below the column count
                unsafe { types::column_name(self.raw, i) }.unwrap_or_else(|| format!("col{i}"))
            })
            .collect()
    }

    /// Advance one row. `Ok(false)` once the statement is done.
    fn step(&self) -> Result<bool, Error> {
        // SAFETY: raw is a live statement
        match unsafe { ffi::sqlite3_step(self.raw) } {
            ffi::SQLITE_ROW => Ok(true),
            ffi::SQLITE_DONE => Ok(false),
            _ => Err(step_error(self.db, self.sql)),
        }
    }

    /// Values of the current row; call only after `step` returned `true`.
    fn row_values(&self) -> Vec<Value> {
        // SAFETY: raw is a live statement positioned on a row
        let count = unsafe { ffi::sqlite3_column_count(self.raw) };
        (0..count)
            .map(|i| unsafe { types::read_column(self.raw, i) })
            .collect()
    }
}

impl Drop for Statement<'_> {
    fn drop(&mut self) {
        // SAFETY: raw came from sqlite3_prepare_v2 and is finalized once
        unsafe { ffi::sqlite3_finalize(self.raw) };
    }
}

fn step_error(db: *mut ffi::sqlite3, sql: &str) -> Error {
    // SAFETY: db is valid
    let (msg, code) = unsafe { (errmsg(db), ffi::sqlite3_errcode(db)) };
    query_error(error_code_to_kind(code), sql, msg)
}

fn error_code_to_kind(code: c_int) -> QueryErrorKind {
    match code {
        ffi::SQLITE_CONSTRAINT => QueryErrorKind::Constraint,
        ffi::SQLITE_BUSY | ffi::SQLITE_LOCKED => QueryErrorKind::Busy,
        ffi::SQLITE_PERM | ffi::SQLITE_AUTH | ffi::SQLITE_READONLY => QueryErrorKind::Permission,
        ffi::SQLITE_NOTFOUND => QueryErrorKind::NotFound,
        ffi::SQLITE_TOOBIG => QueryErrorKind::DataTruncation,
        ffi::SQLITE_INTERRUPT => QueryErrorKind::Cancelled,
        _ => QueryErrorKind::Database,
    }
}

//! Backend contract used by the session runtime.
//!
//! The runtime never holds a connection across statements: every statement
//! asks the [`DataSource`] for a connection, uses it, and drops it. Dropping
//! the boxed connection is the release point, so release happens on every exit
//! path including errors.

use crate::Result;
use crate::row::Row;
use crate::value::Value;

/// A live connection able to run one parameterized statement at a time.
///
/// Parameters are positional (`?`) and bound left to right.
pub trait Connection {
    /// Execute a query and return every row.
    #[allow(clippy::result_large_err)]
    fn query(&self, sql: &str, params: &[Value]) -> Result<Vec<Row>>;

    /// Execute a statement and return the number of rows affected.
    #[allow(clippy::result_large_err)]
    fn execute(&self, sql: &str, params: &[Value]) -> Result<u64>;
}

impl<C: Connection + ?Sized> Connection for &C {
    fn query(&self, sql: &str, params: &[Value]) -> Result<Vec<Row>> {
        (**self).query(sql, params)
    }

    fn execute(&self, sql: &str, params: &[Value]) -> Result<u64> {
        (**self).execute(sql, params)
    }
}

impl<C: Connection + ?Sized> Connection for Box<C> {
    fn query(&self, sql: &str, params: &[Value]) -> Result<Vec<Row>> {
        (**self).query(sql, params)
    }

    fn execute(&self, sql: &str, params: &[Value]) -> Result<u64> {
        (**self).execute(sql, params)
    }
}

/// Source of scoped connections.
///
/// Implementations decide what "acquire" means: open a new handle, lend a
/// shared one, or check one out of a pool. The returned box releases the
/// connection when dropped.
pub trait DataSource: Send + Sync {
    #[allow(clippy::result_large_err)]
    fn connection(&self) -> Result<Box<dyn Connection + '_>>;
}

impl<D: DataSource + ?Sized> DataSource for std::sync::Arc<D> {
    fn connection(&self) -> Result<Box<dyn Connection + '_>> {
        (**self).connection()
    }
}

/// Acquire a connection, run `f` against it, and release it.
#[allow(clippy::result_large_err)]
pub fn with_connection<T>(
    source: &dyn DataSource,
    f: impl FnOnce(&dyn Connection) -> Result<T>,
) -> Result<T> {
    let conn = source.connection()?;
    tracing::trace!("Acquired connection");
    let result = f(conn.as_ref());
    drop(conn);
    tracing::trace!(ok = result.is_ok(), "Released connection");
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{ConnectionError, ConnectionErrorKind, Error};
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct CountingSource {
        acquired: AtomicUsize,
        released: std::sync::Arc<AtomicUsize>,
        fail: bool,
        statements: Mutex<Vec<String>>,
    }

    struct CountingConnection<'a> {
        source: &'a CountingSource,
    }

    impl Drop for CountingConnection<'_> {
        fn drop(&mut self) {
            self.source.released.fetch_add(1, Ordering::SeqCst);
        }
    }

    impl Connection for CountingConnection<'_> {
        fn query(&self, sql: &str, _params: &[Value]) -> Result<Vec<Row>> {
            self.source.statements.lock().unwrap().push(sql.to_string());
            Ok(Vec::new())
        }

        fn execute(&self, sql: &str, _params: &[Value]) -> Result<u64> {
            self.source.statements.lock().unwrap().push(sql.to_string());
            Err(Error::Custom("execute failed".to_string()))
        }
    }

    impl DataSource for CountingSource {
        fn connection(&self) -> Result<Box<dyn Connection + '_>> {
            if self.fail {
                return Err(Error::Connection(ConnectionError {
                    kind: ConnectionErrorKind::Unavailable,
                    message: "no connection".to_string(),
                    source: None,
                }));
            }
            self.acquired.fetch_add(1, Ordering::SeqCst);
            Ok(Box::new(CountingConnection { source: self }))
        }
    }

    #[test]
    fn connection_released_on_success_and_failure() {
        let source = CountingSource::default();

        let rows = with_connection(&source, |conn| conn.query("SELECT 1", &[])).unwrap();
        assert!(rows.is_empty());

        let err = with_connection(&source, |conn| conn.execute("DELETE FROM t", &[]));
        assert!(err.is_err());

        assert_eq!(source.acquired.load(Ordering::SeqCst), 2);
        assert_eq!(source.released.load(Ordering::SeqCst), 2);
        assert_eq!(source.statements.lock().unwrap().len(), 2);
    }

    #[test]
    fn acquisition_failure_is_backend_error() {
        let source = CountingSource {
            fail: true,
            ..CountingSource::default()
        };
        let err = with_connection(&source, |conn| conn.query("SELECT 1", &[])).unwrap_err();
        assert!(err.is_backend());
        assert_eq!(source.released.load(Ordering::SeqCst), 0);
    }
}

//! SQLite backend for unitwork.
//!
// FFI bindings require unsafe code - this is expected for database drivers
#![allow(unsafe_code)]
//!
//! This crate provides a synchronous SQLite driver on top of the bundled
//! libsqlite3. It implements the `Connection` and `DataSource` traits from
//! unitwork-core so sessions can run against a real database.
//!
//! # Data sources
//!
//! - [`SqliteConnection`] lends itself for every acquisition; use it for
//!   in-memory databases and single-threaded applications
//! - [`SqliteDataSource`] opens a connection per acquisition and closes it on
//!   release
//!
//! # Example
//!
//! ```rust,ignore
//! use unitwork_sqlite::SqliteConnection;
//! use unitwork_core::{Connection, Value};
//!
//! let conn = SqliteConnection::open_memory()?;
//! conn.execute_raw("CREATE TABLE users (id INTEGER PRIMARY KEY, name TEXT)")?;
//! conn.execute("INSERT INTO users (name) VALUES (?)", &[Value::Text("Alice".into())])?;
//! let rows = conn.query("SELECT * FROM users", &[])?;
//! ```
//!
//! # Type Mapping
//!
//! | Value | SQLite Type |
//! |-----------|-------------|
//! | `Bool` | INTEGER (0/1) |
//! | `Int`, `BigInt` | INTEGER |
//! | `Double` | REAL |
//! | `Text` | TEXT |
//! | `Bytes` | BLOB |
//! | `Json` | TEXT |
//! | `Null` | NULL |
//!
//! Integers read back as `Int` when they fit in 32 bits, `BigInt` otherwise.

pub mod connection;
pub mod ffi;
pub mod types;

pub use connection::{OpenFlags, SqliteConfig, SqliteConnection, SqliteDataSource};

/// Re-export the SQLite library version.
pub fn sqlite_version() -> &'static str {
    ffi::version()
}

/// Re-export the SQLite library version number.
pub fn sqlite_version_number() -> i32 {
    ffi::version_number()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sqlite_version() {
        let version = sqlite_version();
        assert!(
            version.starts_with('3'),
            "Expected SQLite 3.x, got {}",
            version
        );
    }

    #[test]
    fn test_sqlite_version_number() {
        let num = sqlite_version_number();
        assert!(
            num >= 3_000_000,
            "Expected SQLite 3.x.x (>= 3000000), got {}",
            num
        );
    }
}

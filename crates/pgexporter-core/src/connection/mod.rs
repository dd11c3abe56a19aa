//! Database connection seam.
//!
//! The collector never talks to the `postgres` crate directly. It goes through
//! [`Connector`] / [`Connection`], so scraping logic can be exercised against
//! [`mock::MockConnector`] without a running server.
//!
//! ```text
//!   ServerPool ──connect──► Connector ──► Box<dyn Connection>
//!                              │
//!                  ┌───────────┴───────────┐
//!             PgConnector            MockConnector
//!          (postgres + TLS)        (scripted results)
//! ```
//!
//! Rows use the simple query protocol: every value arrives as text (or NULL)
//! and value extraction happens in [`crate::values`].

pub mod mock;
mod pg;

use std::sync::Arc;

use crate::error::{ConnectionError, QueryError};

pub use mock::MockConnector;
pub use pg::PgConnector;

/// Opens connections from keyword/value connection strings.
pub trait Connector: Send + Sync {
    fn connect(&self, conn_str: &str) -> Result<Box<dyn Connection>, ConnectionError>;
}

/// A single live database session. Not safe for concurrent use; the pool
/// serializes access per target.
pub trait Connection: Send {
    /// Runs a statement and returns its rows with values in text form.
    fn query(&mut self, sql: &str) -> Result<Vec<Row>, QueryError>;

    /// Runs a statement whose result is not needed.
    fn execute(&mut self, sql: &str) -> Result<(), QueryError> {
        self.query(sql).map(|_| ())
    }

    /// Whether the server side of the session is gone.
    fn is_closed(&self) -> bool;

    /// Handle that can cancel the statement currently running on this session
    /// from another thread.
    fn cancel_handle(&self) -> Box<dyn CancelHandle>;
}

/// Out-of-band statement cancellation.
pub trait CancelHandle: Send + Sync {
    fn cancel(&self) -> Result<(), ConnectionError>;
}

/// One result row. Column names are shared between rows of the same result.
#[derive(Debug, Clone, PartialEq)]
pub struct Row {
    columns: Arc<[String]>,
    values: Vec<Option<String>>,
}

impl Row {
    pub fn new(columns: Arc<[String]>, values: Vec<Option<String>>) -> Self {
        debug_assert_eq!(columns.len(), values.len());
        Self { columns, values }
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn has_column(&self, column: &str) -> bool {
        self.columns.iter().any(|c| c == column)
    }

    /// Text value of `column`; `None` for NULL or a missing column.
    pub fn get(&self, column: &str) -> Option<&str> {
        self.columns
            .iter()
            .position(|c| c == column)
            .and_then(|idx| self.values.get(idx))
            .and_then(|v| v.as_deref())
    }

    /// Iterates `(column, value)` pairs in result order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, Option<&str>)> {
        self.columns
            .iter()
            .map(String::as_str)
            .zip(self.values.iter().map(|v| v.as_deref()))
    }
}

//! In-memory connector for testing the collector without a database.
//!
//! Responses are scripted by SQL substring, optionally scoped to one database
//! name. Later registrations win over earlier ones, database-scoped ones win
//! over global ones.

use std::collections::HashSet;
use std::sync::Arc;

use parking_lot::Mutex;

use super::{CancelHandle, Connection, Connector, Row};
use crate::dsn::Dsn;
use crate::error::{ConnectionError, QueryError};

/// Scripted outcome of a query.
#[derive(Debug, Clone)]
pub enum MockResult {
    Rows {
        columns: Vec<String>,
        rows: Vec<Vec<Option<String>>>,
    },
    Error(String),
    /// Fails the query and marks the connection closed.
    LoseConnection,
}

impl MockResult {
    /// Rows without NULLs.
    pub fn rows(columns: &[&str], rows: &[&[&str]]) -> Self {
        MockResult::Rows {
            columns: columns.iter().map(|c| c.to_string()).collect(),
            rows: rows
                .iter()
                .map(|r| r.iter().map(|v| Some(v.to_string())).collect())
                .collect(),
        }
    }

    /// Rows where `None` stands for NULL.
    pub fn nullable_rows(columns: &[&str], rows: &[&[Option<&str>]]) -> Self {
        MockResult::Rows {
            columns: columns.iter().map(|c| c.to_string()).collect(),
            rows: rows
                .iter()
                .map(|r| r.iter().map(|v| v.map(str::to_string)).collect())
                .collect(),
        }
    }
}

#[derive(Debug, Clone)]
struct Script {
    database: Option<String>,
    needle: String,
    result: MockResult,
}

#[derive(Debug)]
struct MockState {
    scripts: Vec<Script>,
    refused: HashSet<String>,
    connects: Vec<String>,
    executed: Vec<(String, String)>,
    cancels: usize,
    server_version_num: String,
    server_version: String,
}

impl Default for MockState {
    fn default() -> Self {
        Self {
            scripts: Vec::new(),
            refused: HashSet::new(),
            connects: Vec::new(),
            executed: Vec::new(),
            cancels: 0,
            server_version_num: "160002".to_string(),
            server_version: "PostgreSQL 16.2 on x86_64-pc-linux-gnu, compiled by gcc, 64-bit"
                .to_string(),
        }
    }
}

/// Connector whose connections answer from a shared script.
///
/// Clones share state, so a test can keep one handle for assertions while
/// the pool owns another.
#[derive(Debug, Clone, Default)]
pub struct MockConnector {
    state: Arc<Mutex<MockState>>,
}

#[allow(dead_code)]
impl MockConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Answers queries containing `needle` on any database.
    pub fn with_result(self, needle: &str, result: MockResult) -> Self {
        self.script(None, needle, result);
        self
    }

    /// Answers queries containing `needle` on database `database` only.
    pub fn with_database_result(self, database: &str, needle: &str, result: MockResult) -> Self {
        self.script(Some(database), needle, result);
        self
    }

    pub fn with_rows(self, needle: &str, columns: &[&str], rows: &[&[&str]]) -> Self {
        self.with_result(needle, MockResult::rows(columns, rows))
    }

    pub fn with_error(self, needle: &str, message: &str) -> Self {
        self.with_result(needle, MockResult::Error(message.to_string()))
    }

    pub fn with_server_version(self, num: &str, text: &str) -> Self {
        {
            let mut state = self.state.lock();
            state.server_version_num = num.to_string();
            state.server_version = text.to_string();
        }
        self
    }

    /// Refuses connections to a database name or `host:port` fingerprint.
    pub fn refuse(self, database_or_server: &str) -> Self {
        self.state.lock().refused.insert(database_or_server.to_string());
        self
    }

    /// Adds a script entry after construction.
    pub fn script(&self, database: Option<&str>, needle: &str, result: MockResult) {
        self.state.lock().scripts.push(Script {
            database: database.map(str::to_string),
            needle: needle.to_string(),
            result,
        });
    }

    /// Database names of every successful connect, in order.
    pub fn connects(&self) -> Vec<String> {
        self.state.lock().connects.clone()
    }

    pub fn connect_count(&self) -> usize {
        self.state.lock().connects.len()
    }

    /// `(database, sql)` of every statement executed, in order.
    pub fn executed(&self) -> Vec<(String, String)> {
        self.state.lock().executed.clone()
    }

    /// Number of out-of-band cancel requests received.
    pub fn cancels(&self) -> usize {
        self.state.lock().cancels
    }
}

impl Connector for MockConnector {
    fn connect(&self, conn_str: &str) -> Result<Box<dyn Connection>, ConnectionError> {
        let dsn = Dsn::parse(conn_str).map_err(|e| ConnectionError::Connect {
            server: "<unparsable>".to_string(),
            message: e.to_string(),
        })?;
        let database = dsn.dbname().unwrap_or_default().to_string();
        let server = dsn.fingerprint();

        let mut state = self.state.lock();
        if state.refused.contains(&database) || state.refused.contains(&server) {
            return Err(ConnectionError::Connect {
                server,
                message: "connection refused".to_string(),
            });
        }
        state.connects.push(database.clone());

        Ok(Box::new(MockConnection {
            state: self.state.clone(),
            database,
            server,
            closed: false,
        }))
    }
}

struct MockConnection {
    state: Arc<Mutex<MockState>>,
    database: String,
    server: String,
    closed: bool,
}

impl Connection for MockConnection {
    fn query(&mut self, sql: &str) -> Result<Vec<Row>, QueryError> {
        if self.closed {
            return Err(ConnectionError::Lost(self.server.clone()).into());
        }

        let mut state = self.state.lock();
        state.executed.push((self.database.clone(), sql.to_string()));

        let scripted = state
            .scripts
            .iter()
            .rev()
            .filter(|s| s.database.as_deref() == Some(self.database.as_str()))
            .chain(state.scripts.iter().rev().filter(|s| s.database.is_none()))
            .find(|s| sql.contains(&s.needle))
            .map(|s| s.result.clone());

        let result = match scripted {
            Some(result) => result,
            None if sql.contains("server_version_num") => {
                MockResult::rows(&["server_version_num"], &[&[state.server_version_num.as_str()]])
            }
            None if sql.contains("version()") => {
                MockResult::rows(&["version"], &[&[state.server_version.as_str()]])
            }
            None if sql.starts_with("SET ") || sql.starts_with("RESET ") => MockResult::Rows {
                columns: Vec::new(),
                rows: Vec::new(),
            },
            None => MockResult::Error(format!("no scripted response for: {sql}")),
        };
        drop(state);

        match result {
            MockResult::Rows { columns, rows } => {
                let columns: Arc<[String]> = columns.into();
                Ok(rows
                    .into_iter()
                    .map(|values| Row::new(columns.clone(), values))
                    .collect())
            }
            MockResult::Error(message) => Err(QueryError::Execution(message)),
            MockResult::LoseConnection => {
                self.closed = true;
                Err(ConnectionError::Lost(self.server.clone()).into())
            }
        }
    }

    fn is_closed(&self) -> bool {
        self.closed
    }

    fn cancel_handle(&self) -> Box<dyn CancelHandle> {
        Box::new(MockCancelHandle {
            state: self.state.clone(),
        })
    }
}

struct MockCancelHandle {
    state: Arc<Mutex<MockState>>,
}

impl CancelHandle for MockCancelHandle {
    fn cancel(&self) -> Result<(), ConnectionError> {
        self.state.lock().cancels += 1;
        Ok(())
    }
}

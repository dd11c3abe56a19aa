//! Error types shared across the exporter engine.
//!
//! Only [`DataSourceError`] at startup and listener failures in the binary are
//! fatal. Everything raised while scraping is absorbed into the scrape result.

use std::path::PathBuf;

use thiserror::Error;

/// Failure to load or validate the auth-module configuration file.
///
/// Always recoverable: the previously active config stays in place.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config file {path}: {message}")]
    Parse { path: PathBuf, message: String },

    #[error("auth module {module:?}: {reason}")]
    InvalidAuthModule { module: String, reason: String },

    #[error("target {target:?} references unknown auth module {module:?}")]
    UnknownAuthModule { target: String, module: String },
}

/// Failure to turn environment, legacy parameters or config entries into DSNs.
#[derive(Debug, Error)]
pub enum DataSourceError {
    #[error("no data source could be resolved (set DATA_SOURCE_NAME, DATA_SOURCE_URI or config targets)")]
    NoDataSources,

    #[error("failed to read {var} file {path}: {source}")]
    SecretFile {
        var: &'static str,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid DSN {dsn:?}: {reason}")]
    InvalidDsn { dsn: String, reason: String },

    #[error("auth module {0:?} not found")]
    UnknownAuthModule(String),

    #[error("target {0:?} could not be resolved")]
    Unresolvable(String),
}

/// Per-target connection failure.
#[derive(Debug, Clone, Error)]
pub enum ConnectionError {
    #[error("failed to connect to {server}: {message}")]
    Connect { server: String, message: String },

    #[error("TLS setup failed: {0}")]
    Tls(String),

    #[error("connection to {0} was lost")]
    Lost(String),

    #[error("server pool is closed")]
    PoolClosed,
}

/// Per-descriptor query failure.
#[derive(Debug, Clone, Error)]
pub enum QueryError {
    #[error("query failed: {0}")]
    Execution(String),

    #[error("statement cancelled: scrape deadline exceeded")]
    Deadline,

    #[error("column {column:?}: {reason}")]
    Column { column: String, reason: String },

    #[error(transparent)]
    Connection(#[from] ConnectionError),
}

impl QueryError {
    /// Whether the underlying connection must be discarded after this error.
    pub fn is_fatal_for_connection(&self) -> bool {
        matches!(
            self,
            QueryError::Connection(ConnectionError::Lost(_) | ConnectionError::PoolClosed)
        )
    }
}

/// Failure to load the user query file. The exporter keeps running with the
/// built-in mappings and reports the failure as a metric.
#[derive(Debug, Error)]
pub enum UserQueriesError {
    #[error("failed to read user queries file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse user queries file {path}: {message}")]
    Parse { path: PathBuf, message: String },

    #[error("user query {namespace:?}: {reason}")]
    Invalid { namespace: String, reason: String },
}

/// Invalid combination or format of exporter options.
#[derive(Debug, Error)]
pub enum OptionsError {
    #[error("invalid constant label {0:?}: expected name=value")]
    ConstantLabelFormat(String),

    #[error("invalid constant label name {0:?}")]
    ConstantLabelName(String),

    #[error("constant label {0:?} collides with a label reserved by the exporter")]
    ReservedLabel(String),
}

/// Driver error as shown in logs and scrape errors: server errors carry their
/// SQLSTATE, client-side errors are shortened to the useful part.
pub(crate) fn format_postgres_error(e: &postgres::Error) -> String {
    if let Some(db_error) = e.as_db_error() {
        return format!(
            "{} ({}): {}",
            db_error.severity(),
            db_error.code().code(),
            db_error.message()
        );
    }

    let msg = e.to_string();
    if msg.contains("Connection refused") {
        "connection refused".to_string()
    } else if msg.contains("password authentication failed") {
        "password authentication failed".to_string()
    } else if let Some((_, detail)) = msg.rsplit_once("FATAL:") {
        detail.trim().to_string()
    } else {
        msg
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lost_connection_is_fatal_for_connection() {
        let err = QueryError::from(ConnectionError::Lost("db:5432".into()));
        assert!(err.is_fatal_for_connection());
        assert!(!QueryError::Deadline.is_fatal_for_connection());
        assert!(!QueryError::Execution("syntax error".into()).is_fatal_for_connection());
    }

    #[test]
    fn data_source_error_messages_name_the_input() {
        let err = DataSourceError::UnknownAuthModule("prod".into());
        assert_eq!(err.to_string(), "auth module \"prod\" not found");
    }
}

//! `postgres`-backed connections.

use std::sync::Arc;

use native_tls::TlsConnector;
use postgres::config::{Host, SslMode};
use postgres::error::SqlState;
use postgres::{CancelToken, Client, Config, NoTls, SimpleQueryMessage};
use postgres_native_tls::MakeTlsConnector;
use tracing::debug;

use super::{CancelHandle, Connection, Connector, Row};
use crate::error::{ConnectionError, QueryError, format_postgres_error};

/// Production connector.
///
/// `sslmode=disable` connects in plain text. `prefer` and `require` negotiate
/// TLS without certificate verification, matching libpq semantics for those
/// modes.
#[derive(Debug, Default, Clone, Copy)]
pub struct PgConnector;

impl PgConnector {
    pub fn new() -> Self {
        Self
    }
}

impl Connector for PgConnector {
    fn connect(&self, conn_str: &str) -> Result<Box<dyn Connection>, ConnectionError> {
        let config: Config = conn_str.parse().map_err(|e: postgres::Error| {
            ConnectionError::Connect {
                server: "<unparsable>".to_string(),
                message: format_postgres_error(&e),
            }
        })?;
        let server = server_name(&config);

        let (client, tls) = match config.get_ssl_mode() {
            SslMode::Disable => {
                let client = config.connect(NoTls).map_err(|e| ConnectionError::Connect {
                    server: server.clone(),
                    message: format_postgres_error(&e),
                })?;
                (client, None)
            }
            _ => {
                let connector = TlsConnector::builder()
                    .danger_accept_invalid_certs(true)
                    .danger_accept_invalid_hostnames(true)
                    .build()
                    .map_err(|e| ConnectionError::Tls(e.to_string()))?;
                let tls = MakeTlsConnector::new(connector);
                let client =
                    config
                        .connect(tls.clone())
                        .map_err(|e| ConnectionError::Connect {
                            server: server.clone(),
                            message: format_postgres_error(&e),
                        })?;
                (client, Some(tls))
            }
        };

        debug!(server = %server, "connection established");
        Ok(Box::new(PgConnection {
            client,
            server: Arc::from(server),
            tls,
        }))
    }
}

struct PgConnection {
    client: Client,
    server: Arc<str>,
    tls: Option<MakeTlsConnector>,
}

impl PgConnection {
    fn map_error(&self, e: postgres::Error) -> QueryError {
        if e.code() == Some(&SqlState::QUERY_CANCELED) {
            return QueryError::Deadline;
        }
        if e.is_closed() || self.client.is_closed() {
            return ConnectionError::Lost(self.server.to_string()).into();
        }
        QueryError::Execution(format_postgres_error(&e))
    }
}

impl Connection for PgConnection {
    fn query(&mut self, sql: &str) -> Result<Vec<Row>, QueryError> {
        let messages = match self.client.simple_query(sql) {
            Ok(messages) => messages,
            Err(e) => return Err(self.map_error(e)),
        };

        let mut columns: Option<Arc<[String]>> = None;
        let mut rows = Vec::new();
        for message in messages {
            if let SimpleQueryMessage::Row(row) = message {
                let names = columns
                    .get_or_insert_with(|| {
                        row.columns()
                            .iter()
                            .map(|c| c.name().to_string())
                            .collect()
                    })
                    .clone();
                let values = (0..row.len())
                    .map(|idx| row.get(idx).map(str::to_owned))
                    .collect();
                rows.push(Row::new(names, values));
            }
        }
        Ok(rows)
    }

    fn is_closed(&self) -> bool {
        self.client.is_closed()
    }

    fn cancel_handle(&self) -> Box<dyn CancelHandle> {
        Box::new(PgCancelHandle {
            token: self.client.cancel_token(),
            tls: self.tls.clone(),
            server: self.server.clone(),
        })
    }
}

struct PgCancelHandle {
    token: CancelToken,
    tls: Option<MakeTlsConnector>,
    server: Arc<str>,
}

impl CancelHandle for PgCancelHandle {
    fn cancel(&self) -> Result<(), ConnectionError> {
        let result = match &self.tls {
            Some(tls) => self.token.cancel_query(tls.clone()),
            None => self.token.cancel_query(NoTls),
        };
        result.map_err(|e| ConnectionError::Connect {
            server: self.server.to_string(),
            message: format_postgres_error(&e),
        })
    }
}

/// `host:port` of the first configured host, for error messages.
fn server_name(config: &Config) -> String {
    let host = match config.get_hosts().first() {
        Some(Host::Tcp(host)) => host.clone(),
        #[cfg(unix)]
        Some(Host::Unix(path)) => path.display().to_string(),
        None => "localhost".to_string(),
    };
    let port = config.get_ports().first().copied().unwrap_or(5432);
    format!("{host}:{port}")
}

//! Server pool.
//!
//! The pool is the only owner of live database connections. Each distinct
//! connection string maps to one [`PooledServer`]; a scrape borrows it through
//! a [`ServerLease`], which holds the server's lock for the duration of that
//! target's queries. Two scrapes of the same target therefore run one after
//! the other, while different targets proceed in parallel.
//!
//! Connections are (re)established lazily by [`ServerPool::acquire`]. A lost
//! connection is dropped and the next acquire reconnects.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use parking_lot::{ArcMutexGuard, Mutex, RawMutex};
use tracing::{debug, info, warn};

use crate::connection::{CancelHandle, Connection, Connector, Row};
use crate::datasource::DataSourceSpec;
use crate::descriptors::ServerVersion;
use crate::error::{ConnectionError, QueryError};
use crate::scrape::{Sample, ScrapeContext};

/// How long `close` waits for an in-flight scrape to release a server.
const CLOSE_WAIT: Duration = Duration::from_secs(5);

const DISCOVERY_QUERY: &str =
    "SELECT datname FROM pg_database WHERE NOT datistemplate AND datallowconn ORDER BY datname";

#[derive(Debug, Clone)]
struct CachedSamples {
    at: Instant,
    samples: Vec<Sample>,
}

#[derive(Default)]
struct ServerState {
    conn: Option<Box<dyn Connection>>,
    up: bool,
    last_scrape: Option<Instant>,
    server_version: Option<ServerVersion>,
    version_text: Option<String>,
    statement_timeout_set: bool,
    databases: Vec<String>,
    databases_at: Option<Instant>,
    metric_cache: HashMap<String, CachedSamples>,
}

impl ServerState {
    /// Forgets everything tied to the current session.
    fn reset_session(&mut self) {
        self.conn = None;
        self.up = false;
        self.server_version = None;
        self.version_text = None;
        self.statement_timeout_set = false;
        self.databases.clear();
        self.databases_at = None;
        self.metric_cache.clear();
    }
}

/// One pooled target.
pub struct PooledServer {
    spec: DataSourceSpec,
    key: String,
    state: Arc<Mutex<ServerState>>,
    cancel: Mutex<Option<Box<dyn CancelHandle>>>,
    busy: AtomicBool,
    pool_closed: Arc<AtomicBool>,
}

impl PooledServer {
    pub fn spec(&self) -> &DataSourceSpec {
        &self.spec
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    /// Time of the last successful scrape. Waits for an in-flight scrape.
    pub fn last_scrape(&self) -> Option<Instant> {
        self.state.lock().last_scrape
    }

    pub fn is_up(&self) -> bool {
        self.state.lock().up
    }

    fn cancel_running(&self) {
        if !self.busy.load(Ordering::SeqCst) {
            return;
        }
        if let Some(handle) = self.cancel.lock().as_ref()
            && let Err(e) = handle.cancel()
        {
            warn!(server = %self.spec.dsn.fingerprint(), error = %e, "failed to cancel running statement");
        }
    }
}

/// Exclusive access to one [`PooledServer`] for the duration of a scrape.
pub struct ServerLease {
    server: Arc<PooledServer>,
    state: ArcMutexGuard<RawMutex, ServerState>,
}

impl ServerLease {
    pub fn spec(&self) -> &DataSourceSpec {
        &self.server.spec
    }

    pub fn server(&self) -> &Arc<PooledServer> {
        &self.server
    }

    pub fn server_version(&self) -> Option<ServerVersion> {
        self.state.server_version
    }

    pub fn version_text(&self) -> Option<&str> {
        self.state.version_text.as_deref()
    }

    /// Runs `sql` within the scrape deadline. The remaining budget is
    /// installed as `statement_timeout` so the server cancels an overrunning
    /// statement itself.
    pub fn query(&mut self, sql: &str, ctx: &ScrapeContext) -> Result<Vec<Row>, QueryError> {
        if self.server.pool_closed.load(Ordering::SeqCst) {
            self.state.reset_session();
            return Err(ConnectionError::PoolClosed.into());
        }
        if ctx.expired() {
            return Err(QueryError::Deadline);
        }

        let result = self.run(sql, ctx);
        if let Err(e) = &result
            && e.is_fatal_for_connection()
        {
            warn!(server = %self.server.spec.dsn.fingerprint(), error = %e, "dropping connection");
            self.state.reset_session();
        }
        result
    }

    fn run(&mut self, sql: &str, ctx: &ScrapeContext) -> Result<Vec<Row>, QueryError> {
        let server = self.server.spec.dsn.fingerprint();
        let state = &mut *self.state;
        let conn = state
            .conn
            .as_mut()
            .ok_or_else(|| QueryError::from(ConnectionError::Lost(server)))?;

        match ctx.remaining() {
            Some(remaining) => {
                // statement_timeout is an int4 of milliseconds
                let ms = remaining.as_millis().clamp(1, i32::MAX as u128);
                conn.execute(&format!("SET statement_timeout = {ms}"))?;
                state.statement_timeout_set = true;
            }
            None if state.statement_timeout_set => {
                conn.execute("SET statement_timeout = 0")?;
                state.statement_timeout_set = false;
            }
            None => {}
        }

        self.server.busy.store(true, Ordering::SeqCst);
        let result = conn.query(sql);
        self.server.busy.store(false, Ordering::SeqCst);
        result
    }

    /// Samples cached for `namespace` if younger than `ttl`.
    pub fn cached(&self, namespace: &str, ttl: Duration) -> Option<Vec<Sample>> {
        self.state
            .metric_cache
            .get(namespace)
            .filter(|c| c.at.elapsed() < ttl)
            .map(|c| c.samples.clone())
    }

    pub fn store_cache(&mut self, namespace: &str, samples: Vec<Sample>) {
        self.state.metric_cache.insert(
            namespace.to_string(),
            CachedSamples {
                at: Instant::now(),
                samples,
            },
        );
    }

    /// Databases hosted by this server, refreshed at most every `interval`.
    /// A failed refresh falls back to the previous list if there is one.
    pub fn databases(&mut self, interval: Duration, ctx: &ScrapeContext) -> Result<Vec<String>, QueryError> {
        if let Some(at) = self.state.databases_at
            && at.elapsed() < interval
        {
            return Ok(self.state.databases.clone());
        }

        match self.query(DISCOVERY_QUERY, ctx) {
            Ok(rows) => {
                let databases: Vec<String> = rows
                    .iter()
                    .filter_map(|row| row.get("datname").map(str::to_string))
                    .collect();
                debug!(
                    server = %self.server.spec.dsn.fingerprint(),
                    databases = ?databases,
                    "discovered databases"
                );
                self.state.databases = databases.clone();
                self.state.databases_at = Some(Instant::now());
                Ok(databases)
            }
            Err(e) if self.state.databases_at.is_some() => {
                warn!(error = %e, "failed to refresh database list, using previous one");
                Ok(self.state.databases.clone())
            }
            Err(e) => Err(e),
        }
    }

    /// Records a completed scrape of this server.
    pub fn mark_scraped(&mut self) {
        self.state.up = true;
        self.state.last_scrape = Some(Instant::now());
    }
}

/// Owner of every live connection, keyed by connection string.
pub struct ServerPool {
    connector: Arc<dyn Connector>,
    servers: Mutex<BTreeMap<String, Arc<PooledServer>>>,
    closed: Arc<AtomicBool>,
}

impl ServerPool {
    pub fn new(connector: Arc<dyn Connector>) -> Self {
        Self {
            connector,
            servers: Mutex::new(BTreeMap::new()),
            closed: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Leases the server for `spec`, creating the pool entry and connecting
    /// if needed. Blocks while another scrape holds the same server.
    pub fn acquire(&self, spec: &DataSourceSpec) -> Result<ServerLease, ConnectionError> {
        if self.is_closed() {
            return Err(ConnectionError::PoolClosed);
        }

        let key = spec.key();
        let server = {
            let mut servers = self.servers.lock();
            servers
                .entry(key.clone())
                .or_insert_with(|| {
                    debug!(dsn = %spec.dsn, "new pool entry");
                    Arc::new(PooledServer {
                        spec: spec.clone(),
                        key: key.clone(),
                        state: Arc::new(Mutex::new(ServerState::default())),
                        cancel: Mutex::new(None),
                        busy: AtomicBool::new(false),
                        pool_closed: self.closed.clone(),
                    })
                })
                .clone()
        };

        let mut state = server.state.lock_arc();
        if self.is_closed() {
            return Err(ConnectionError::PoolClosed);
        }
        self.ensure_connected(&server, &mut state)?;

        Ok(ServerLease { server, state })
    }

    fn ensure_connected(&self, server: &PooledServer, state: &mut ServerState) -> Result<(), ConnectionError> {
        if state.conn.as_ref().is_some_and(|c| !c.is_closed()) {
            return Ok(());
        }
        state.reset_session();

        let mut conn = match self.connector.connect(&server.key) {
            Ok(conn) => conn,
            Err(e) => {
                warn!(dsn = %server.spec.dsn, error = %e, "connection failed");
                return Err(e);
            }
        };

        state.server_version = conn
            .query("SHOW server_version_num")
            .ok()
            .and_then(|rows| rows.first().and_then(|r| r.get("server_version_num")?.parse().ok()))
            .map(ServerVersion::from_num);
        state.version_text = conn
            .query("SELECT version()")
            .ok()
            .and_then(|rows| rows.first().and_then(|r| r.get("version").map(str::to_string)));
        if state.server_version.is_none() {
            warn!(dsn = %server.spec.dsn, "could not determine server version");
        }

        *server.cancel.lock() = Some(conn.cancel_handle());
        state.conn = Some(conn);
        info!(
            dsn = %server.spec.dsn,
            version = ?state.server_version.map(|v| v.to_string()),
            "connected"
        );
        Ok(())
    }

    /// Entry for a connection string, if one was created.
    pub fn get(&self, key: &str) -> Option<Arc<PooledServer>> {
        self.servers.lock().get(key).cloned()
    }

    pub fn len(&self) -> usize {
        self.servers.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.servers.lock().is_empty()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Releases every connection, in connection-string order. Running
    /// statements are cancelled first; later acquires and queries fail with
    /// [`ConnectionError::PoolClosed`]. Only the first call has an effect.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        let servers: Vec<Arc<PooledServer>> = self.servers.lock().values().cloned().collect();
        for server in &servers {
            server.cancel_running();
        }

        let mut released = 0;
        for server in &servers {
            match server.state.try_lock_for(CLOSE_WAIT) {
                Some(mut state) => {
                    state.reset_session();
                    *server.cancel.lock() = None;
                    released += 1;
                }
                None => {
                    warn!(dsn = %server.spec.dsn, "scrape still running, connection left to the scrape to drop");
                }
            }
        }

        self.servers.lock().clear();
        info!(released, total = servers.len(), "server pool closed");
    }
}

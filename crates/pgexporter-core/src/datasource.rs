//! Data source resolution.
//!
//! Startup targets are merged from, in priority order:
//! 1. `DATA_SOURCE_NAME` / `DATA_SOURCE_NAME_FILE` (comma-separated DSNs),
//! 2. the legacy `DATA_SOURCE_URI` + `DATA_SOURCE_USER` + `DATA_SOURCE_PASS`
//!    triple (each with a `_FILE` variant),
//! 3. `targets` entries of the config file, configured with their auth module.
//!
//! The first resolved target is the primary one.

use std::path::PathBuf;
use std::sync::Arc;

use tracing::{debug, warn};

use crate::config::ConfigStore;
use crate::dsn::Dsn;
use crate::error::DataSourceError;

/// A resolved target, immutable for the duration of a scrape.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataSourceSpec {
    pub dsn: Dsn,
    /// Configured (as opposed to auto-discovered) target. Master-only
    /// query mappings and settings run on primary targets only.
    pub primary: bool,
    /// Labels replacing the exporter's own label values for this target.
    pub labels: Vec<(String, String)>,
}

impl DataSourceSpec {
    pub fn new(dsn: Dsn) -> Self {
        Self {
            dsn,
            primary: true,
            labels: Vec::new(),
        }
    }

    /// Spec for another database on the same server.
    pub fn discovered(&self, dbname: &str) -> Self {
        Self {
            dsn: self.dsn.with_dbname(dbname),
            primary: false,
            labels: self.labels.clone(),
        }
    }

    /// Pool key.
    pub fn key(&self) -> String {
        self.dsn.to_connection_string()
    }
}

/// Snapshot of the data source environment variables.
#[derive(Debug, Clone, Default)]
pub struct DataSourceEnv {
    pub name: Option<String>,
    pub name_file: Option<PathBuf>,
    pub uri: Option<String>,
    pub uri_file: Option<PathBuf>,
    pub user: Option<String>,
    pub user_file: Option<PathBuf>,
    pub pass: Option<String>,
    pub pass_file: Option<PathBuf>,
}

impl DataSourceEnv {
    pub fn from_process() -> Self {
        let var = |name: &str| std::env::var(name).ok().filter(|v| !v.is_empty());
        Self {
            name: var("DATA_SOURCE_NAME"),
            name_file: var("DATA_SOURCE_NAME_FILE").map(PathBuf::from),
            uri: var("DATA_SOURCE_URI"),
            uri_file: var("DATA_SOURCE_URI_FILE").map(PathBuf::from),
            user: var("DATA_SOURCE_USER"),
            user_file: var("DATA_SOURCE_USER_FILE").map(PathBuf::from),
            pass: var("DATA_SOURCE_PASS"),
            pass_file: var("DATA_SOURCE_PASS_FILE").map(PathBuf::from),
        }
    }

    /// Explicit DSN list.
    fn explicit(&self) -> Result<Vec<String>, DataSourceError> {
        let list = read_value(&self.name, &self.name_file, "DATA_SOURCE_NAME_FILE")?;
        Ok(list
            .map(|l| {
                l.split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default())
    }

    /// DSN assembled from the individual legacy variables.
    fn legacy(&self) -> Result<Option<Dsn>, DataSourceError> {
        let Some(uri) = read_value(&self.uri, &self.uri_file, "DATA_SOURCE_URI_FILE")? else {
            return Ok(None);
        };
        let user = read_value(&self.user, &self.user_file, "DATA_SOURCE_USER_FILE")?;
        let pass = read_value(&self.pass, &self.pass_file, "DATA_SOURCE_PASS_FILE")?;
        let dsn = Dsn::parse(&uri)?;
        Ok(Some(dsn.with_credentials(user.as_deref(), pass.as_deref())))
    }
}

/// File variant wins over the plain variable; file contents are trimmed.
fn read_value(
    value: &Option<String>,
    file: &Option<PathBuf>,
    var: &'static str,
) -> Result<Option<String>, DataSourceError> {
    if let Some(path) = file {
        let content = std::fs::read_to_string(path).map_err(|source| {
            DataSourceError::SecretFile {
                var,
                path: path.clone(),
                source,
            }
        })?;
        let content = content.trim().to_string();
        return Ok((!content.is_empty()).then_some(content));
    }
    Ok(value.clone())
}

/// Turns environment and config into [`DataSourceSpec`]s.
pub struct DataSourceResolver {
    env: DataSourceEnv,
    config: Arc<ConfigStore>,
}

impl DataSourceResolver {
    pub fn new(env: DataSourceEnv, config: Arc<ConfigStore>) -> Self {
        Self { env, config }
    }

    /// All startup targets, deduplicated, primary first.
    pub fn resolve_startup_targets(&self) -> Result<Vec<DataSourceSpec>, DataSourceError> {
        let mut dsns = self.env_dsns()?;

        let config = self.config.current();
        for (identity, module_name) in &config.targets {
            let Some(module) = config.auth_module(module_name) else {
                continue;
            };
            match Dsn::parse(identity) {
                Ok(dsn) => dsns.push(module.configure(&dsn)),
                Err(e) => warn!(target = %identity, error = %e, "skipping config target"),
            }
        }

        let mut specs: Vec<DataSourceSpec> = Vec::with_capacity(dsns.len());
        for dsn in dsns {
            if specs.iter().all(|s| s.dsn != dsn) {
                specs.push(DataSourceSpec::new(dsn));
            }
        }

        if specs.is_empty() {
            return Err(DataSourceError::NoDataSources);
        }
        debug!(
            targets = ?specs.iter().map(|s| s.dsn.redacted()).collect::<Vec<_>>(),
            "resolved startup targets"
        );
        Ok(specs)
    }

    /// Resolves one caller-supplied target for a probe.
    ///
    /// `auth_module` names a module explicitly; otherwise the config's
    /// `targets` mapping, then a startup DSN for the same server, then the
    /// identity itself (if it carries a user) are tried.
    pub fn resolve_target(
        &self,
        identity: &str,
        auth_module: Option<&str>,
    ) -> Result<DataSourceSpec, DataSourceError> {
        let identity = identity.trim();
        if identity.is_empty() {
            return Err(DataSourceError::Unresolvable(String::new()));
        }

        let config = self.config.current();
        let module = match auth_module.filter(|m| !m.is_empty()) {
            Some(name) => Some(
                config
                    .auth_module(name)
                    .ok_or_else(|| DataSourceError::UnknownAuthModule(name.to_string()))?,
            ),
            None => config.auth_module_for_target(identity),
        };

        let dsn = Dsn::parse(identity)?;
        if let Some(module) = module {
            return Ok(DataSourceSpec::new(module.configure(&dsn)));
        }

        if let Some(known) = self
            .env_dsns()
            .unwrap_or_default()
            .into_iter()
            .find(|known| same_target(known, &dsn))
        {
            return Ok(DataSourceSpec::new(known));
        }

        if dsn.user().is_some() {
            return Ok(DataSourceSpec::new(dsn));
        }

        Err(DataSourceError::Unresolvable(dsn.redacted()))
    }

    /// Explicit and legacy DSNs in priority order. Invalid explicit entries
    /// are skipped with a warning.
    fn env_dsns(&self) -> Result<Vec<Dsn>, DataSourceError> {
        let mut dsns = Vec::new();
        for raw in self.env.explicit()? {
            match Dsn::parse(&raw) {
                Ok(dsn) => dsns.push(dsn),
                Err(e) => warn!(error = %e, "skipping invalid DATA_SOURCE_NAME entry"),
            }
        }
        if let Some(dsn) = self.env.legacy()? {
            dsns.push(dsn);
        }
        Ok(dsns)
    }
}

/// Same server, and same database when the probe names one.
fn same_target(known: &Dsn, requested: &Dsn) -> bool {
    known.fingerprint() == requested.fingerprint()
        && requested
            .dbname()
            .is_none_or(|db| known.dbname() == Some(db))
}

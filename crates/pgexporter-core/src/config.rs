//! Hot-reloadable auth-module configuration.
//!
//! The active [`Config`] lives behind an [`ArcSwap`]. Readers take a snapshot
//! with [`ConfigStore::current`] and keep using it for the rest of their
//! operation; [`ConfigStore::reload`] parses a complete new value first and
//! only then swaps the pointer, so a reader never sees a half-applied file.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use arc_swap::ArcSwap;
use parking_lot::Mutex;
use serde::Deserialize;
use tracing::{info, warn};

use crate::dsn::Dsn;
use crate::error::ConfigError;

/// Parsed configuration document plus the generation it was loaded as.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Config {
    /// 0 for the built-in empty config, incremented on every successful reload.
    pub generation: u64,
    pub auth_modules: BTreeMap<String, AuthModule>,
    /// Target identity (`host[:port][/db]` or DSN) → auth module name.
    pub targets: BTreeMap<String, String>,
}

impl Config {
    pub fn auth_module(&self, name: &str) -> Option<&AuthModule> {
        self.auth_modules.get(name)
    }

    /// Auth module configured for `identity` in the `targets` section.
    pub fn auth_module_for_target(&self, identity: &str) -> Option<&AuthModule> {
        self.targets
            .get(identity)
            .and_then(|module| self.auth_modules.get(module))
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AuthModule {
    #[serde(rename = "type")]
    pub kind: AuthModuleKind,
    #[serde(default)]
    pub userpass: UserPass,
    /// Extra connection parameters, e.g. `sslmode`.
    #[serde(default)]
    pub options: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuthModuleKind {
    Userpass,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct UserPass {
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
}

impl AuthModule {
    /// Applies this module's credentials and options on top of `dsn`.
    pub fn configure(&self, dsn: &Dsn) -> Dsn {
        let mut dsn = match self.kind {
            AuthModuleKind::Userpass => dsn.with_credentials(
                Some(self.userpass.username.as_str()),
                Some(self.userpass.password.as_str()),
            ),
        };
        for (key, value) in &self.options {
            dsn = dsn.with_param(key, value);
        }
        dsn
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct ConfigFile {
    #[serde(default)]
    auth_modules: BTreeMap<String, AuthModule>,
    #[serde(default)]
    targets: BTreeMap<String, String>,
}

/// Owner of the active [`Config`].
#[derive(Debug)]
pub struct ConfigStore {
    current: ArcSwap<Config>,
    /// Last generation handed out. Held for the whole reload so that
    /// generations are stored in the order they are assigned.
    generation: Mutex<u64>,
}

impl Default for ConfigStore {
    fn default() -> Self {
        Self::new()
    }
}

impl ConfigStore {
    /// Starts with an empty config; callers proceed without per-target auth.
    pub fn new() -> Self {
        Self {
            current: ArcSwap::from_pointee(Config::default()),
            generation: Mutex::new(0),
        }
    }

    /// Snapshot of the active config.
    pub fn current(&self) -> Arc<Config> {
        self.current.load_full()
    }

    /// Parses `path` and swaps it in. On failure the active config is kept.
    pub fn reload(&self, path: &Path) -> Result<Arc<Config>, ConfigError> {
        let mut last = self.generation.lock();
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;

        let file = parse_config(path, &content)?;
        *last += 1;
        let generation = *last;
        let config = Arc::new(Config {
            generation,
            auth_modules: file.auth_modules,
            targets: file.targets,
        });

        self.current.store(config.clone());
        drop(last);
        info!(
            path = %path.display(),
            generation,
            auth_modules = config.auth_modules.len(),
            targets = config.targets.len(),
            "config loaded"
        );
        Ok(config)
    }

    /// Reload that logs instead of returning the error.
    pub fn reload_or_warn(&self, path: &Path) -> Option<Arc<Config>> {
        match self.reload(path) {
            Ok(config) => Some(config),
            Err(e) => {
                warn!(error = %e, "error loading config, keeping previous configuration");
                None
            }
        }
    }
}

fn parse_config(path: &Path, content: &str) -> Result<ConfigFile, ConfigError> {
    let file: ConfigFile = if content.trim().is_empty() {
        ConfigFile::default()
    } else {
        serde_yml::from_str(content).map_err(|e| ConfigError::Parse {
            path: path.to_path_buf(),
            message: e.to_string(),
        })?
    };

    for (name, module) in &file.auth_modules {
        match module.kind {
            AuthModuleKind::Userpass if module.userpass.username.is_empty() => {
                return Err(ConfigError::InvalidAuthModule {
                    module: name.clone(),
                    reason: "userpass requires a username".to_string(),
                });
            }
            AuthModuleKind::Userpass => {}
        }
    }

    for (target, module) in &file.targets {
        if !file.auth_modules.contains_key(module) {
            return Err(ConfigError::UnknownAuthModule {
                target: target.clone(),
                module: module.clone(),
            });
        }
    }

    Ok(file)
}

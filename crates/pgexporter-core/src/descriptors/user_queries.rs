//! User query file (`--extend.query-path`).
//!
//! ```yaml
//! pg_replication:
//!   query: "SELECT EXTRACT(EPOCH FROM (now() - pg_last_xact_replay_timestamp())) AS lag"
//!   master: true
//!   cache_seconds: 30
//!   runonserver: ">=10.0.0"
//!   metrics:
//!     - lag:
//!         usage: "GAUGE"
//!         description: "Replication lag behind master in seconds"
//! ```

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use serde::Deserialize;
use tracing::{info, warn};
use xxhash_rust::xxh3::xxh3_64;

use super::{ColumnMapping, ColumnUsage, MappingOrigin, QueryMapping, UserQueriesStatus, VersionRange};
use crate::error::UserQueriesError;

#[derive(Debug, Deserialize)]
struct UserQuery {
    query: String,
    #[serde(default)]
    metrics: Vec<BTreeMap<String, UserColumn>>,
    #[serde(default)]
    master: bool,
    #[serde(default)]
    cache_seconds: u64,
    #[serde(default)]
    runonserver: String,
}

#[derive(Debug, Deserialize)]
struct UserColumn {
    usage: ColumnUsage,
    #[serde(default)]
    description: String,
    #[serde(default)]
    metric_mapping: BTreeMap<String, f64>,
}

/// Loads `path`, never failing: problems are logged and reported in the
/// returned status so the exporter keeps its built-in mappings.
pub fn load(path: &Path) -> (UserQueriesStatus, Vec<QueryMapping>) {
    let mut status = UserQueriesStatus {
        path: path.to_path_buf(),
        hashsum: String::new(),
        error: None,
    };

    let content = match std::fs::read(path) {
        Ok(content) => content,
        Err(source) => {
            let e = UserQueriesError::Read {
                path: path.to_path_buf(),
                source,
            };
            warn!(error = %e, "failed to load user queries");
            status.error = Some(e.to_string());
            return (status, Vec::new());
        }
    };
    status.hashsum = format!("{:016x}", xxh3_64(&content));

    match parse(path, &String::from_utf8_lossy(&content)) {
        Ok(mappings) => {
            info!(
                file = %path.display(),
                hashsum = %status.hashsum,
                queries = mappings.len(),
                "user queries loaded"
            );
            (status, mappings)
        }
        Err(e) => {
            warn!(error = %e, "failed to load user queries");
            status.error = Some(e.to_string());
            (status, Vec::new())
        }
    }
}

/// Parses a user query document. Any invalid entry fails the whole file.
pub fn parse(path: &Path, content: &str) -> Result<Vec<QueryMapping>, UserQueriesError> {
    if content.trim().is_empty() {
        return Ok(Vec::new());
    }
    let queries: BTreeMap<String, UserQuery> =
        serde_yml::from_str(content).map_err(|e| UserQueriesError::Parse {
            path: path.to_path_buf(),
            message: e.to_string(),
        })?;

    queries
        .into_iter()
        .map(|(namespace, query)| {
            let invalid = |reason: String| UserQueriesError::Invalid {
                namespace: namespace.clone(),
                reason,
            };
            let range = VersionRange::parse(&query.runonserver).map_err(invalid)?;

            let mut mapping = QueryMapping::new(&namespace, MappingOrigin::User)
                .query(range, &query.query)
                .master(query.master);
            if query.cache_seconds > 0 {
                mapping.cache_ttl = Some(Duration::from_secs(query.cache_seconds));
            }

            for entry in query.metrics {
                for (column, def) in entry {
                    if def.usage == ColumnUsage::MappedMetric && def.metric_mapping.is_empty() {
                        return Err(invalid(format!(
                            "column {column:?} is MAPPEDMETRIC without metric_mapping"
                        )));
                    }
                    mapping.columns.push(ColumnMapping {
                        name: column,
                        usage: def.usage,
                        description: def.description,
                        mapping: def.metric_mapping,
                    });
                }
            }
            Ok(mapping)
        })
        .collect()
}

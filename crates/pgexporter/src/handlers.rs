//! HTTP request handlers: metrics, probe, landing page, config reload.

use std::time::Duration;

use axum::Router;
use axum::extract::{Query, State};
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::{Html, IntoResponse, Response};
use axum::routing::{get, post};
use prometheus::{Encoder, TextEncoder};
use serde::Deserialize;
use tower_http::compression::CompressionLayer;
use tracing::{error, info, warn};

use pgexporter_core::collector::MetricCollector;
use pgexporter_core::probe::ProbeCollector;
use pgexporter_core::scrape::{ScrapeContext, ScrapeResult};

use crate::state::AppState;

const SCRAPE_TIMEOUT_HEADER: &str = "X-Prometheus-Scrape-Timeout-Seconds";

pub(crate) fn router(state: AppState) -> Router {
    let mut router = Router::new()
        .route(&state.telemetry_path, get(handle_metrics))
        .route("/probe", get(handle_probe))
        .route("/-/reload", post(handle_reload));
    if state.telemetry_path != "/" {
        router = router.route("/", get(handle_landing));
    }
    router.layer(CompressionLayer::new()).with_state(state)
}

/// Deadline from the scrape timeout announced by Prometheus, minus `offset`.
/// An offset not smaller than the timeout is ignored.
pub(crate) fn scrape_context(headers: &HeaderMap, offset: Duration) -> ScrapeContext {
    let Some(timeout) = headers
        .get(SCRAPE_TIMEOUT_HEADER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<f64>().ok())
        .filter(|t| t.is_finite() && *t > 0.0)
    else {
        return ScrapeContext::default();
    };

    let offset = offset.as_secs_f64();
    let budget = if offset < timeout {
        timeout - offset
    } else {
        warn!(timeout, offset, "scrape timeout offset is not smaller than the scrape timeout, ignoring it");
        timeout
    };
    match Duration::try_from_secs_f64(budget) {
        Ok(budget) => ScrapeContext::with_timeout(budget),
        Err(_) => ScrapeContext::default(),
    }
}

fn encode(result: &ScrapeResult) -> Response {
    let encoder = TextEncoder::new();
    let mut buf = Vec::new();
    if let Err(e) = encoder.encode(&result.metric_families(), &mut buf) {
        error!(error = %e, "failed to encode metrics");
        return StatusCode::INTERNAL_SERVER_ERROR.into_response();
    }
    ([(header::CONTENT_TYPE, encoder.format_type().to_string())], buf).into_response()
}

pub(crate) async fn handle_metrics(State(state): State<AppState>, headers: HeaderMap) -> Response {
    let ctx = scrape_context(&headers, state.timeout_offset);
    // Blocking driver: collect off the async runtime
    match tokio::task::spawn_blocking(move || state.exporter.collect(&ctx)).await {
        Ok(result) => encode(&result),
        Err(e) => {
            error!(error = %e, "collect panicked in spawn_blocking");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

#[derive(Deserialize)]
pub(crate) struct ProbeQuery {
    target: Option<String>,
    auth_module: Option<String>,
}

pub(crate) async fn handle_probe(
    State(state): State<AppState>,
    Query(query): Query<ProbeQuery>,
    headers: HeaderMap,
) -> Response {
    let Some(target) = query.target.filter(|t| !t.trim().is_empty()) else {
        return (StatusCode::BAD_REQUEST, "target is required\n").into_response();
    };
    let ctx = scrape_context(&headers, state.timeout_offset);

    let result = tokio::task::spawn_blocking(move || {
        let probe = ProbeCollector::new(
            state.exporter.scraper().clone(),
            &state.resolver,
            &target,
            query.auth_module.as_deref(),
        );
        probe.collect(&ctx)
    })
    .await;

    match result {
        Ok(result) => encode(&result),
        Err(e) => {
            error!(error = %e, "probe panicked in spawn_blocking");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

pub(crate) async fn handle_landing(State(state): State<AppState>) -> Html<String> {
    Html(format!(
        "<html>\n<head><title>Postgres Exporter</title></head>\n<body>\n\
         <h1>Postgres Exporter</h1>\n<p><a href=\"{path}\">Metrics</a></p>\n\
         </body>\n</html>\n",
        path = state.telemetry_path
    ))
}

pub(crate) async fn handle_reload(State(state): State<AppState>) -> Response {
    let result = tokio::task::spawn_blocking(move || state.config.reload(&state.config_path)).await;
    match result {
        Ok(Ok(config)) => {
            info!(generation = config.generation, "config reloaded via HTTP");
            (StatusCode::OK, "config reloaded\n").into_response()
        }
        Ok(Err(e)) => {
            warn!(error = %e, "config reload failed, keeping previous configuration");
            (StatusCode::INTERNAL_SERVER_ERROR, format!("{e}\n")).into_response()
        }
        Err(e) => {
            error!(error = %e, "config reload panicked in spawn_blocking");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;
    use std::sync::Arc;

    use axum::body::Body;
    use axum::http::{Method, Request};
    use tower::ServiceExt;

    use pgexporter_core::collector::{Exporter, Scraper};
    use pgexporter_core::config::ConfigStore;
    use pgexporter_core::connection::MockConnector;
    use pgexporter_core::datasource::{DataSourceEnv, DataSourceResolver};
    use pgexporter_core::descriptors::DescriptorTable;
    use pgexporter_core::options::ExporterOptions;
    use pgexporter_core::pool::ServerPool;

    use crate::state::AppInner;

    const DSN: &str = "host=db1 user=exporter dbname=postgres";

    fn state(connector: &MockConnector, telemetry_path: &str, config_path: &Path) -> AppState {
        let options = ExporterOptions {
            disable_default_metrics: true,
            disable_settings_metrics: true,
            ..Default::default()
        };
        let table = DescriptorTable::build(&options);
        let pool = Arc::new(ServerPool::new(Arc::new(connector.clone())));
        let scraper = Scraper::new(Arc::new(table), pool, Arc::new(options));

        let config = Arc::new(ConfigStore::new());
        let resolver = DataSourceResolver::new(
            DataSourceEnv {
                name: Some(DSN.to_string()),
                ..Default::default()
            },
            config.clone(),
        );
        let targets = resolver.resolve_startup_targets().unwrap();

        Arc::new(AppInner {
            exporter: Exporter::new(scraper, targets),
            resolver,
            config,
            config_path: config_path.to_path_buf(),
            telemetry_path: telemetry_path.to_string(),
            timeout_offset: Duration::from_millis(500),
        })
    }

    async fn get(router: Router, uri: &str) -> (StatusCode, String) {
        request(router, Method::GET, uri).await
    }

    async fn request(router: Router, method: Method, uri: &str) -> (StatusCode, String) {
        let response = router
            .oneshot(Request::builder().method(method).uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        (status, String::from_utf8(body.to_vec()).unwrap())
    }

    #[tokio::test]
    async fn metrics_exposes_default_targets() {
        let dir = tempfile::tempdir().unwrap();
        let connector = MockConnector::new();
        let router = router(state(&connector, "/metrics", &dir.path().join("c.yml")));

        let (status, body) = get(router, "/metrics").await;
        assert_eq!(status, StatusCode::OK);
        assert!(body.contains("pg_up{server=\"db1:5432\"} 1"), "{body}");
        assert!(body.contains("pg_exporter_scrapes_total 1"));
        assert!(body.contains("pg_static{server=\"db1:5432\",short_version=\"16.2\""));
    }

    #[tokio::test]
    async fn probe_requires_target() {
        let dir = tempfile::tempdir().unwrap();
        let connector = MockConnector::new();
        let router = router(state(&connector, "/metrics", &dir.path().join("c.yml")));

        let (status, _) = get(router, "/probe").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn probe_of_unresolvable_target_is_well_formed() {
        let dir = tempfile::tempdir().unwrap();
        let connector = MockConnector::new();
        let router = router(state(&connector, "/metrics", &dir.path().join("c.yml")));

        let (status, body) = get(router, "/probe?target=unknown-host").await;
        assert_eq!(status, StatusCode::OK);
        assert!(body.contains("probe_success 0"), "{body}");
        assert!(body.contains("probe_duration_seconds"));
        assert_eq!(connector.connect_count(), 0);
    }

    #[tokio::test]
    async fn probe_scrapes_requested_target_only() {
        let dir = tempfile::tempdir().unwrap();
        let connector = MockConnector::new();
        let router = router(state(&connector, "/metrics", &dir.path().join("c.yml")));

        let (status, body) = get(
            router,
            "/probe?target=host%3Ddb2%20user%3Dexporter%20dbname%3Dpostgres",
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert!(body.contains("probe_success 1"), "{body}");
        assert!(body.contains("pg_up{server=\"db2:5432\"} 1"));
        assert!(!body.contains("db1:5432"));
        assert!(!body.contains("pg_exporter_scrapes_total"));
    }

    #[tokio::test]
    async fn landing_page_links_metrics_path() {
        let dir = tempfile::tempdir().unwrap();
        let connector = MockConnector::new();
        let router = router(state(&connector, "/custom", &dir.path().join("c.yml")));

        let (status, body) = get(router, "/").await;
        assert_eq!(status, StatusCode::OK);
        assert!(body.contains("href=\"/custom\""));
    }

    #[tokio::test]
    async fn root_telemetry_path_serves_metrics() {
        let dir = tempfile::tempdir().unwrap();
        let connector = MockConnector::new();
        let router = router(state(&connector, "/", &dir.path().join("c.yml")));

        let (status, body) = get(router, "/").await;
        assert_eq!(status, StatusCode::OK);
        assert!(body.contains("pg_up"));
    }

    #[tokio::test]
    async fn reload_swaps_config_or_keeps_previous() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("postgres_exporter.yml");
        std::fs::write(
            &path,
            "auth_modules:\n  prod:\n    type: userpass\n    userpass:\n      username: exporter\n      password: secret\n",
        )
        .unwrap();
        let connector = MockConnector::new();
        let state = state(&connector, "/metrics", &path);

        let (status, _) = request(router(state.clone()), Method::POST, "/-/reload").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(state.config.current().generation, 1);
        assert!(state.config.current().auth_module("prod").is_some());

        std::fs::write(&path, "auth_modules: [broken").unwrap();
        let (status, body) = request(router(state.clone()), Method::POST, "/-/reload").await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert!(body.contains("postgres_exporter.yml"));
        assert_eq!(state.config.current().generation, 1);
    }

    #[test]
    fn scrape_timeout_header_sets_deadline() {
        let offset = Duration::from_millis(500);
        assert!(scrape_context(&HeaderMap::new(), offset).deadline.is_none());

        let mut headers = HeaderMap::new();
        headers.insert(SCRAPE_TIMEOUT_HEADER, "10".parse().unwrap());
        let remaining = scrape_context(&headers, offset).remaining().unwrap();
        assert!(remaining <= Duration::from_millis(9500));
        assert!(remaining > Duration::from_secs(9));

        headers.insert(SCRAPE_TIMEOUT_HEADER, "0.2".parse().unwrap());
        let remaining = scrape_context(&headers, offset).remaining().unwrap();
        assert!(remaining > Duration::from_millis(100));

        headers.insert(SCRAPE_TIMEOUT_HEADER, "soon".parse().unwrap());
        assert!(scrape_context(&headers, offset).deadline.is_none());
    }

    #[test]
    fn huge_scrape_timeout_means_no_deadline() {
        let mut headers = HeaderMap::new();
        for timeout in ["1e300", "1e19"] {
            headers.insert(SCRAPE_TIMEOUT_HEADER, timeout.parse().unwrap());
            let ctx = scrape_context(&headers, Duration::from_millis(500));
            assert!(!ctx.expired(), "{timeout}");
        }
        headers.insert(SCRAPE_TIMEOUT_HEADER, "1e300".parse().unwrap());
        assert!(scrape_context(&headers, Duration::ZERO).deadline.is_none());
    }

    #[tokio::test]
    async fn huge_scrape_timeout_still_serves_metrics() {
        let dir = tempfile::tempdir().unwrap();
        let connector = MockConnector::new();
        let router = router(state(&connector, "/metrics", &dir.path().join("c.yml")));

        let response = router
            .oneshot(
                Request::builder()
                    .uri("/metrics")
                    .header(SCRAPE_TIMEOUT_HEADER, "1e300")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }
}

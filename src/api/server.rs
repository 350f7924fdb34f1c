use axum::{routing::get, Router};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use super::handlers::{dispatch, health_check, list_dialects, AppState};
use crate::cluster::ClusterConfig;
use crate::query::HttpQueryExecutor;

/// Server configuration
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Storage engine that executes normalized queries
    pub engine_url: String,
    pub query_timeout_secs: u64,
    pub cluster_config: ClusterConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8086,
            engine_url: "http://127.0.0.1:9000".to_string(),
            query_timeout_secs: 30,
            cluster_config: ClusterConfig::default(),
        }
    }
}

/// Build the application router
pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/dialects", get(list_dialects))
        // Every dialect surface goes through prefix dispatch
        .fallback(dispatch)
        // Middleware
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .with_state(state)
}

/// Run the HTTP server
pub async fn run_server(config: ServerConfig) -> Result<(), Box<dyn std::error::Error>> {
    let timeout = Duration::from_secs(config.query_timeout_secs);
    let executor = HttpQueryExecutor::new(&config.engine_url, timeout)?;
    tracing::info!("Forwarding queries to engine at {}", executor.base_url());

    if config.cluster_config.is_distributed() {
        tracing::info!(
            "Cluster mode enabled: node_id={}, peers={}",
            config.cluster_config.node_id,
            config.cluster_config.peers.len()
        );
    } else {
        tracing::info!("Running in single-node mode");
    }

    let mut state = AppState::new(Arc::new(executor));
    state.default_timeout = Some(timeout).filter(|t| !t.is_zero());
    let app = build_router(Arc::new(state));

    let addr: SocketAddr = format!("{}:{}", config.host, config.port).parse()?;
    tracing::info!("Starting polyql server on {}", addr);

    let listener = TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("polyql server stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to install CTRL+C signal handler: {}", e);
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutdown signal received");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dialect::format::fixtures::host_series;
    use crate::query::{ExecuteError, ExecuteOptions, ParsedQuery, QueryExecutor, QueryResult};
    use async_trait::async_trait;
    use axum::body::Body;
    use axum::http::{header, Request, StatusCode};
    use parking_lot::Mutex;
    use tower::util::ServiceExt;

    /// Answers every query with the same result and records what it saw
    #[derive(Default)]
    struct RecordingExecutor {
        result: Option<QueryResult>,
        delay: Option<Duration>,
        seen: Mutex<Vec<(ParsedQuery, ExecuteOptions)>>,
    }

    #[async_trait]
    impl QueryExecutor for RecordingExecutor {
        async fn execute(
            &self,
            query: &ParsedQuery,
            opts: &ExecuteOptions,
        ) -> Result<QueryResult, ExecuteError> {
            self.seen.lock().push((query.clone(), opts.clone()));
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            self.result
                .clone()
                .ok_or_else(|| ExecuteError::Engine("engine unavailable".into()))
        }
    }

    fn recording() -> Arc<RecordingExecutor> {
        Arc::new(RecordingExecutor {
            result: Some(host_series()),
            ..Default::default()
        })
    }

    fn create_test_app(executor: Arc<RecordingExecutor>) -> Router {
        build_router(Arc::new(AppState::new(executor)))
    }

    async fn send(app: Router, request: Request<Body>) -> (StatusCode, String, serde_json::Value) {
        let response = app.oneshot(request).await.unwrap();
        let status = response.status();
        let content_type = response
            .headers()
            .get(header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_string();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let json = serde_json::from_slice(&bytes)
            .unwrap_or_else(|_| serde_json::Value::String(String::from_utf8_lossy(&bytes).into_owned()));
        (status, content_type, json)
    }

    fn get_request(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    fn post_request(uri: &str, content_type: &str, body: &str) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header("content-type", content_type)
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    #[tokio::test]
    async fn test_health_check() {
        let (status, _, body) = send(create_test_app(recording()), get_request("/health")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "healthy");
        assert_eq!(body["version"], env!("CARGO_PKG_VERSION"));
    }

    #[tokio::test]
    async fn test_list_dialects() {
        let (status, _, body) = send(create_test_app(recording()), get_request("/dialects")).await;
        assert_eq!(status, StatusCode::OK);
        let dialects = body["dialects"].as_array().unwrap();
        assert_eq!(dialects.len(), 13);
        assert_eq!(dialects[0], "influxql");
    }

    #[tokio::test]
    async fn test_prometheus_missing_query_is_bad_data() {
        let executor = recording();
        let (status, _, body) =
            send(create_test_app(executor.clone()), get_request("/api/v1/query")).await;

        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["status"], "error");
        assert_eq!(body["errorType"], "bad_data");
        assert!(executor.seen.lock().is_empty());
    }

    #[tokio::test]
    async fn test_prometheus_instant_query() {
        let executor = recording();
        let (status, _, body) = send(
            create_test_app(executor.clone()),
            get_request("/api/v1/query?query=rate(http_requests_total%5B5m%5D)&time=1700000000"),
        )
        .await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "success");
        assert_eq!(body["data"]["resultType"], "vector");

        let seen = executor.seen.lock();
        assert_eq!(seen[0].0.primary_source(), Some("http_requests_total"));
        assert_eq!(seen[0].1.end.unwrap().timestamp(), 1_700_000_000);
    }

    #[tokio::test]
    async fn test_prometheus_range_query_from_form() {
        let executor = recording();
        let (status, _, body) = send(
            create_test_app(executor.clone()),
            post_request(
                "/api/v1/query_range",
                "application/x-www-form-urlencoded",
                "query=up&start=1700000000&end=1700003600&step=15s",
            ),
        )
        .await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"]["resultType"], "matrix");
        let seen = executor.seen.lock();
        assert_eq!(seen[0].1.step, Some(Duration::from_secs(15)));
        assert_eq!(seen[0].1.start.unwrap().timestamp(), 1_700_000_000);
    }

    #[tokio::test]
    async fn test_influxql_with_database() {
        let executor = recording();
        let (status, _, body) = send(
            create_test_app(executor.clone()),
            get_request("/query?db=telegraf&q=SELECT%20mean(value)%20FROM%20cpu"),
        )
        .await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["results"][0]["statement_id"], 0);
        let seen = executor.seen.lock();
        assert_eq!(seen[0].1.database.as_deref(), Some("telegraf"));
        assert_eq!(seen[0].0.primary_source(), Some("cpu"));
    }

    #[tokio::test]
    async fn test_flux_returns_csv() {
        let executor = recording();
        let request = Request::builder()
            .method("POST")
            .uri("/api/v2/query")
            .header("content-type", "application/json")
            .header("X-Org", "acme")
            .body(Body::from(
                serde_json::json!({"query": r#"from(bucket:"b") |> range(start: -1h)"#}).to_string(),
            ))
            .unwrap();
        let (status, content_type, body) = send(create_test_app(executor.clone()), request).await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(content_type, "text/csv; charset=utf-8");
        assert!(body.as_str().unwrap().starts_with(",result,table,"));
        assert_eq!(executor.seen.lock()[0].1.database.as_deref(), Some("acme"));
    }

    #[tokio::test]
    async fn test_questdb_echoes_query() {
        let (status, _, body) = send(
            create_test_app(recording()),
            get_request("/exec?query=SELECT%20*%20FROM%20trades"),
        )
        .await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["query"], "SELECT * FROM trades");
        assert_eq!(body["count"], 4);
    }

    #[tokio::test]
    async fn test_druid_sql_and_native_are_distinct() {
        let executor = recording();
        let app = create_test_app(executor.clone());

        let (status, _, _) = send(
            app.clone(),
            post_request(
                "/druid/v2/sql",
                "application/json",
                r#"{"query": "SELECT COUNT(*) FROM wikipedia"}"#,
            ),
        )
        .await;
        assert_eq!(status, StatusCode::OK);

        let (status, _, body) = send(
            app,
            post_request(
                "/druid/v2",
                "application/json",
                r#"{"queryType": "timeseries", "dataSource": "wikipedia"}"#,
            ),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert!(body[0]["timestamp"].is_string());

        let seen = executor.seen.lock();
        assert_eq!(seen[0].0.dialect, crate::dialect::Dialect::DruidSQL);
        assert_eq!(seen[1].0.dialect, crate::dialect::Dialect::DruidJSON);
    }

    #[tokio::test]
    async fn test_druid_malformed_body_is_bad_data() {
        let (status, _, body) = send(
            create_test_app(recording()),
            post_request("/druid/v2", "application/json", "{not json"),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["errorType"], "bad_data");
    }

    #[tokio::test]
    async fn test_opentsdb_url_form() {
        let executor = recording();
        let (status, _, body) = send(
            create_test_app(executor.clone()),
            get_request("/api/query?start=1h-ago&m=sum:sys.cpu.user%7Bhost=a%7D"),
        )
        .await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body[0]["aggregateTags"], serde_json::json!([]));
        assert_eq!(executor.seen.lock()[0].0.primary_source(), Some("sys.cpu.user"));
    }

    #[tokio::test]
    async fn test_graphite_time_window() {
        let executor = recording();
        let (status, _, body) = send(
            create_test_app(executor.clone()),
            get_request("/render?target=sumSeries(servers.*.cpu)&from=-1h&until=now"),
        )
        .await;

        assert_eq!(status, StatusCode::OK);
        assert!(body[0]["datapoints"].is_array());
        let seen = executor.seen.lock();
        let (start, end) = (seen[0].1.start.unwrap(), seen[0].1.end.unwrap());
        assert_eq!((end - start).num_seconds(), 3600);
    }

    #[tokio::test]
    async fn test_auto_detect() {
        let (status, _, body) = send(
            create_test_app(recording()),
            post_request(
                "/dialect/auto",
                "application/json",
                r#"{"query": "sum(rate(http_requests_total{job=\"api\"}[5m])) by (instance)"}"#,
            ),
        )
        .await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "success");
        assert_eq!(body["detected_dialect"], "promql");
        assert!(body["confidence"].as_f64().unwrap() > 0.0);
        assert!(body["data"].is_object());
    }

    #[tokio::test]
    async fn test_default_route_is_sql() {
        let executor = recording();
        let (status, _, body) = send(
            create_test_app(executor.clone()),
            post_request("/sql?database=metrics", "text/plain", "SELECT host FROM cpu LIMIT 5"),
        )
        .await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["rows"][0][1], "a");
        let seen = executor.seen.lock();
        assert_eq!(seen[0].0.limit, Some(5));
        assert_eq!(seen[0].1.database.as_deref(), Some("metrics"));
    }

    #[tokio::test]
    async fn test_executor_failure_is_execution_error() {
        let app = create_test_app(Arc::new(RecordingExecutor::default()));
        let (status, _, body) = send(app, get_request("/query?q=SELECT%20*%20FROM%20cpu")).await;

        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body["errorType"], "execution");
        assert!(body["error"].as_str().unwrap().contains("engine unavailable"));
    }

    #[tokio::test]
    async fn test_request_timeout_is_execution_error() {
        let executor = Arc::new(RecordingExecutor {
            result: Some(QueryResult::empty()),
            delay: Some(Duration::from_secs(5)),
            ..Default::default()
        });
        let (status, _, body) = send(
            create_test_app(executor),
            get_request("/api/v1/query?query=up&timeout=50ms"),
        )
        .await;

        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body["errorType"], "execution");
    }

    #[tokio::test]
    async fn test_oversized_timeout_and_step_are_bad_data() {
        for uri in [
            "/api/v1/query?query=up&timeout=1e300",
            "/api/v1/query_range?query=up&start=1700000000&end=1700003600&step=1e300",
            "/api/v1/query?query=up&timeout=soon",
        ] {
            let executor = recording();
            let (status, _, body) = send(create_test_app(executor.clone()), get_request(uri)).await;
            assert_eq!(status, StatusCode::BAD_REQUEST, "{}", uri);
            assert_eq!(body["errorType"], "bad_data");
            assert!(executor.seen.lock().is_empty());
        }

        let (status, _, body) = send(
            create_test_app(recording()),
            post_request("/dialect/auto", "application/json", r#"{"query": "up", "timeout": 1e300}"#),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["errorType"], "bad_data");
    }

    #[tokio::test]
    async fn test_oversized_promql_range_is_not_fatal() {
        let (status, _, body) = send(
            create_test_app(recording()),
            get_request("/api/v1/query?query=rate(up%5B18446744073709551615s1s%5D)"),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "success");
    }

    #[tokio::test]
    async fn test_missing_handler_is_internal() {
        let state = AppState {
            registry: Arc::new(crate::dialect::HandlerRegistry::new()),
            detector: Arc::new(crate::dialect::DialectDetector::new()),
            executor: recording(),
            default_timeout: None,
        };
        let app = build_router(Arc::new(state));
        let (status, _, body) = send(app, get_request("/query?q=SELECT%201")).await;

        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body["errorType"], "internal");
    }

    #[test]
    fn test_default_config() {
        let config = ServerConfig::default();
        assert_eq!(config.port, 8086);
        assert_eq!(config.query_timeout_secs, 30);
        assert!(!config.cluster_config.is_distributed());
    }
}

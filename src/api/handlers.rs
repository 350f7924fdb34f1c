use axum::{
    body::Bytes,
    extract::State,
    http::{header, HeaderMap, Method, StatusCode, Uri},
    response::{IntoResponse, Response},
    Json,
};
use chrono::Utc;
use serde::Serialize;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use super::request::{json_timeout, parse_graphite_time, parse_prometheus_time, RawRequest};
use crate::dialect::{duration, Dialect, DialectDetector, FormattedResponse, HandlerRegistry};
use crate::query::{ExecuteError, ExecuteOptions, QueryExecutor};

/// Application state shared across handlers
pub struct AppState {
    pub registry: Arc<HandlerRegistry>,
    pub detector: Arc<DialectDetector>,
    pub executor: Arc<dyn QueryExecutor>,
    /// Applied when the request carries no timeout of its own
    pub default_timeout: Option<Duration>,
}

impl AppState {
    pub fn new(executor: Arc<dyn QueryExecutor>) -> Self {
        Self {
            registry: Arc::new(HandlerRegistry::with_defaults()),
            detector: Arc::new(DialectDetector::new()),
            executor,
            default_timeout: None,
        }
    }
}

// ============================================================================
// Health Check
// ============================================================================

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
}

pub async fn health_check() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy",
        version: env!("CARGO_PKG_VERSION"),
    })
}

// ============================================================================
// Dialects
// ============================================================================

#[derive(Serialize)]
pub struct DialectsResponse {
    pub dialects: Vec<Dialect>,
}

pub async fn list_dialects(State(state): State<Arc<AppState>>) -> Json<DialectsResponse> {
    Json(DialectsResponse {
        dialects: state.registry.dialects(),
    })
}

// ============================================================================
// Query Dispatch
// ============================================================================

/// How the formatted payload is wrapped before it goes on the wire
#[derive(Debug, Clone, Copy, PartialEq)]
enum Envelope {
    /// Payload as the handler produced it
    Native,
    /// Prometheus `{status, data}`
    Prometheus,
    /// QuestDB `/exec`, which echoes the statement text
    QuestDB,
    /// `/dialect/auto`, which reports what was detected
    Detected { confidence: f64 },
}

/// Everything needed to run one query, collected from the request
#[derive(Debug)]
struct Endpoint {
    dialect: Dialect,
    query: String,
    opts: ExecuteOptions,
    format: String,
    envelope: Envelope,
}

impl Endpoint {
    fn new(dialect: Dialect, query: String, format: &str) -> Self {
        Self {
            dialect,
            query,
            opts: ExecuteOptions::default(),
            format: format.to_string(),
            envelope: Envelope::Native,
        }
    }
}

/// Entry point for every query surface. Dispatch is by path prefix, checked
/// in a fixed order, so `/api/v1/query_range` lands on the Prometheus
/// surface and `/druid/v2/sql` wins over `/druid/v2`.
pub async fn dispatch(
    State(state): State<Arc<AppState>>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let req = RawRequest::new(method, uri, headers, body);
    let path = req.path().to_string();

    let endpoint = if path.starts_with("/api/v1/query") {
        prometheus_endpoint(&req)
    } else if path.starts_with("/query") {
        influxql_endpoint(&req)
    } else if path.starts_with("/api/v2/query") {
        flux_endpoint(&req)
    } else if path.starts_with("/druid/v2/sql") {
        body_endpoint(&req, Dialect::DruidSQL, "json")
    } else if path.starts_with("/druid/v2") {
        druid_endpoint(&req)
    } else if path.starts_with("/api/query") {
        opentsdb_endpoint(&req)
    } else if path.starts_with("/render") {
        graphite_endpoint(&req)
    } else if path.starts_with("/exec") {
        questdb_endpoint(&req)
    } else if path.starts_with("/dialect/auto") {
        auto_endpoint(&state, &req)
    } else {
        sql_endpoint(&req)
    };

    let result = match endpoint {
        Ok(endpoint) => {
            debug!(path = %path, dialect = %endpoint.dialect, "Dispatching query");
            run_query(&state, endpoint).await
        }
        Err(e) => Err(e),
    };

    result.unwrap_or_else(|e| {
        warn!(path = %path, error = %e, "Query request failed");
        e.into_response()
    })
}

/// extract → resolve → parse → execute → format → envelope
async fn run_query(state: &AppState, endpoint: Endpoint) -> Result<Response, ApiError> {
    let handler = state.registry.resolve(endpoint.dialect).ok_or_else(|| {
        ApiError::Internal(format!("no handler registered for dialect '{}'", endpoint.dialect))
    })?;

    let parsed = handler
        .parse(&endpoint.query)
        .map_err(|e| ApiError::BadData(e.to_string()))?;

    let mut opts = endpoint.opts;
    if opts.timeout.is_none() {
        opts.timeout = state.default_timeout;
    }

    let execution = state.executor.execute(&parsed, &opts);
    let result = match opts.timeout {
        Some(limit) => tokio::time::timeout(limit, execution)
            .await
            .map_err(|_| ApiError::Execution(ExecuteError::Timeout.to_string()))?,
        None => execution.await,
    }
    .map_err(|e| ApiError::Execution(e.to_string()))?;

    let formatted = handler
        .format_response(&result, &endpoint.format)
        .map_err(|e| ApiError::Internal(e.to_string()))?;

    Ok(match (endpoint.envelope, formatted) {
        (Envelope::Native, FormattedResponse::Json(body)) => Json(body).into_response(),
        (Envelope::Native, FormattedResponse::Text(body)) => csv_response(body),
        (Envelope::Prometheus, payload) => {
            Json(json!({ "status": "success", "data": payload_json(payload) })).into_response()
        }
        (Envelope::QuestDB, FormattedResponse::Json(mut body)) => {
            if let Some(obj) = body.as_object_mut() {
                obj.insert("query".to_string(), json!(endpoint.query));
            }
            Json(body).into_response()
        }
        (Envelope::QuestDB, FormattedResponse::Text(body)) => csv_response(body),
        (Envelope::Detected { confidence }, payload) => Json(json!({
            "status": "success",
            "detected_dialect": endpoint.dialect,
            "confidence": confidence,
            "data": payload_json(payload),
        }))
        .into_response(),
    })
}

fn payload_json(payload: FormattedResponse) -> serde_json::Value {
    match payload {
        FormattedResponse::Json(v) => v,
        FormattedResponse::Text(s) => serde_json::Value::String(s),
    }
}

fn csv_response(body: String) -> Response {
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "text/csv; charset=utf-8")],
        body,
    )
        .into_response()
}

fn missing(what: &str) -> ApiError {
    ApiError::BadData(format!("missing {} parameter", what))
}

fn invalid(what: &str, value: impl std::fmt::Display) -> ApiError {
    ApiError::BadData(format!("invalid {} parameter '{}'", what, value))
}

/// Absent is fine; present but unparseable is bad data
fn duration_param(req: &RawRequest, name: &str) -> Result<Option<Duration>, ApiError> {
    req.param_or_form(name)
        .map(|raw| duration::parse_param(raw).ok_or_else(|| invalid(name, raw)))
        .transpose()
}

/// `/api/v1/query` and `/api/v1/query_range`
fn prometheus_endpoint(req: &RawRequest) -> Result<Endpoint, ApiError> {
    let query = req.param_or_form("query").ok_or_else(|| missing("query"))?;
    let range = req.path().starts_with("/api/v1/query_range");
    let format = if range { "matrix" } else { "prometheus" };

    let mut endpoint = Endpoint::new(Dialect::PromQL, query.to_string(), format);
    endpoint.envelope = Envelope::Prometheus;

    let time_param = |name: &str| req.param_or_form(name).and_then(parse_prometheus_time);
    if range {
        endpoint.opts.start = time_param("start");
        endpoint.opts.end = time_param("end");
    } else if let Some(at) = time_param("time") {
        endpoint.opts.end = Some(at);
    }
    endpoint.opts.step = duration_param(req, "step")?;
    endpoint.opts.timeout = duration_param(req, "timeout")?;
    Ok(endpoint)
}

/// InfluxDB 1.x `/query`: `q` from the URL, a form, or the raw body
fn influxql_endpoint(req: &RawRequest) -> Result<Endpoint, ApiError> {
    let query = req
        .param_or_form("q")
        .map(str::to_string)
        .or_else(|| req.body_text().map(str::to_string))
        .ok_or_else(|| missing("q"))?;

    let format = if req.param("epoch").is_some() { "epoch" } else { "influxdb" };
    let mut endpoint = Endpoint::new(Dialect::InfluxQL, query, format);
    endpoint.opts.database = req.param_or_form("db").map(str::to_string);
    Ok(endpoint)
}

/// InfluxDB 2.x `/api/v2/query`: CSV out, org names the database
fn flux_endpoint(req: &RawRequest) -> Result<Endpoint, ApiError> {
    let query = req.body_query().ok_or_else(|| missing("query"))?;
    let mut endpoint = Endpoint::new(Dialect::Flux, query, "csv");
    endpoint.opts.database = req
        .header("x-org")
        .or_else(|| req.param("org"))
        .map(str::to_string);
    Ok(endpoint)
}

fn druid_endpoint(req: &RawRequest) -> Result<Endpoint, ApiError> {
    let query = req.body_text().ok_or_else(|| missing("query body"))?;
    Ok(Endpoint::new(Dialect::DruidJSON, query.to_string(), "druid"))
}

/// OpenTSDB `/api/query`: JSON body, or the `?start=..&m=..` URL form
fn opentsdb_endpoint(req: &RawRequest) -> Result<Endpoint, ApiError> {
    let query = req
        .body_text()
        .or_else(|| req.uri.query().filter(|q| !q.is_empty()))
        .ok_or_else(|| missing("query"))?;
    Ok(Endpoint::new(Dialect::OpenTSDB, query.to_string(), "opentsdb"))
}

/// Graphite `/render`
fn graphite_endpoint(req: &RawRequest) -> Result<Endpoint, ApiError> {
    let target = req.param_or_form("target").ok_or_else(|| missing("target"))?;
    let format = req.param_or_form("format").unwrap_or("json");

    let mut endpoint = Endpoint::new(Dialect::Graphite, target.to_string(), format);
    let now = Utc::now();
    endpoint.opts.start = req
        .param_or_form("from")
        .and_then(|s| parse_graphite_time(s, now));
    endpoint.opts.end = req
        .param_or_form("until")
        .and_then(|s| parse_graphite_time(s, now));
    Ok(endpoint)
}

/// QuestDB `/exec`
fn questdb_endpoint(req: &RawRequest) -> Result<Endpoint, ApiError> {
    let query = req
        .param_or_form("query")
        .map(str::to_string)
        .or_else(|| req.body_text().map(str::to_string))
        .ok_or_else(|| missing("query"))?;
    let format = req.param("fmt").unwrap_or("questdb");
    let mut endpoint = Endpoint::new(Dialect::QuestDB, query, format);
    endpoint.envelope = Envelope::QuestDB;
    Ok(endpoint)
}

/// Detect the dialect, then run it like any other surface
fn auto_endpoint(state: &AppState, req: &RawRequest) -> Result<Endpoint, ApiError> {
    let body = req.query_body();
    let query = if body.query.trim().is_empty() {
        req.body_text().map(str::to_string)
    } else {
        Some(body.query)
    }
    .ok_or_else(|| missing("query"))?;

    let (dialect, confidence) = state.detector.detect(&query);
    debug!(dialect = %dialect, confidence, "Auto-detected dialect");

    let format = body.format.as_deref().filter(|f| !f.is_empty()).unwrap_or("json");
    let mut endpoint = Endpoint::new(dialect, query, format);
    endpoint.envelope = Envelope::Detected { confidence };
    endpoint.opts.database = body.db.filter(|db| !db.is_empty());
    endpoint.opts.timeout = match body.timeout.as_ref().filter(|t| !t.is_null()) {
        Some(raw) => Some(json_timeout(raw).ok_or_else(|| invalid("timeout", raw))?),
        None => None,
    };
    Ok(endpoint)
}

/// Generic SQL for any path not claimed above
fn sql_endpoint(req: &RawRequest) -> Result<Endpoint, ApiError> {
    let query = req
        .param("query")
        .map(str::to_string)
        .or_else(|| req.body_query())
        .ok_or_else(|| missing("query"))?;
    let mut endpoint = Endpoint::new(Dialect::SQL, query, "json");
    endpoint.opts.database = req.param("database").map(str::to_string);
    Ok(endpoint)
}

/// `{query}` JSON or raw text body
fn body_endpoint(req: &RawRequest, dialect: Dialect, format: &str) -> Result<Endpoint, ApiError> {
    let query = req.body_query().ok_or_else(|| missing("query"))?;
    Ok(Endpoint::new(dialect, query, format))
}

// ============================================================================
// Error Handling
// ============================================================================

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("{0}")]
    BadData(String),

    #[error("{0}")]
    Execution(String),

    #[error("{0}")]
    Internal(String),
}

impl ApiError {
    pub fn error_type(&self) -> &'static str {
        match self {
            ApiError::BadData(_) => "bad_data",
            ApiError::Execution(_) => "execution",
            ApiError::Internal(_) => "internal",
        }
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            ApiError::BadData(_) => StatusCode::BAD_REQUEST,
            ApiError::Execution(_) | ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> axum::response::Response {
        let body = json!({
            "status": "error",
            "error": self.to_string(),
            "errorType": self.error_type(),
        });
        (self.status_code(), Json(body)).into_response()
    }
}

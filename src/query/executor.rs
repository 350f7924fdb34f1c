use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use super::ir::ParsedQuery;
use super::result::QueryResult;

/// Per-request execution options collected by the router
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExecuteOptions {
    #[serde(default, with = "opt_secs", skip_serializing_if = "Option::is_none")]
    pub timeout: Option<Duration>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub database: Option<String>,
    #[serde(default, with = "opt_secs", skip_serializing_if = "Option::is_none")]
    pub step: Option<Duration>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end: Option<DateTime<Utc>>,
}

/// The storage/compute engine that runs a normalized query
#[async_trait]
pub trait QueryExecutor: Send + Sync {
    async fn execute(
        &self,
        query: &ParsedQuery,
        opts: &ExecuteOptions,
    ) -> Result<QueryResult, ExecuteError>;
}

/// Forwards normalized queries to a storage engine over HTTP
#[derive(Debug, Clone)]
pub struct HttpQueryExecutor {
    http_client: reqwest::Client,
    base_url: String,
}

#[derive(Serialize)]
struct EngineRequest<'a> {
    query: &'a ParsedQuery,
    options: &'a ExecuteOptions,
}

impl HttpQueryExecutor {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, ExecuteError> {
        let http_client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ExecuteError::Transport(e.to_string()))?;

        Ok(Self {
            http_client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }
}

#[async_trait]
impl QueryExecutor for HttpQueryExecutor {
    async fn execute(
        &self,
        query: &ParsedQuery,
        opts: &ExecuteOptions,
    ) -> Result<QueryResult, ExecuteError> {
        let url = format!("{}/v1/execute", self.base_url);

        let mut request = self.http_client.post(&url).json(&EngineRequest {
            query,
            options: opts,
        });
        if let Some(timeout) = opts.timeout {
            request = request.timeout(timeout);
        }

        let response = request.send().await.map_err(|e| {
            if e.is_timeout() {
                ExecuteError::Timeout
            } else {
                ExecuteError::Transport(e.to_string())
            }
        })?;

        if !response.status().is_success() {
            let error_text = response.text().await.unwrap_or_default();
            return Err(ExecuteError::Engine(error_text));
        }

        response
            .json::<QueryResult>()
            .await
            .map_err(|e| ExecuteError::Transport(e.to_string()))
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ExecuteError {
    #[error("Engine error: {0}")]
    Engine(String),

    #[error("Query timed out")]
    Timeout,

    #[error("Transport error: {0}")]
    Transport(String),
}

mod opt_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Option<Duration>, s: S) -> Result<S::Ok, S::Error> {
        match value {
            Some(d) => s.serialize_f64(d.as_secs_f64()),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Duration>, D::Error> {
        Ok(Option::<f64>::deserialize(d)?.and_then(|secs| Duration::try_from_secs_f64(secs).ok()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::Value;
    use crate::dialect::Dialect;
    use crate::query::ColumnMeta;
    use axum::{routing::post, Json, Router};
    use tokio::net::TcpListener;

    async fn spawn_engine(app: Router) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{}", addr)
    }

    #[tokio::test]
    async fn test_http_executor_round_trip() {
        let app = Router::new().route(
            "/v1/execute",
            post(|Json(body): Json<serde_json::Value>| async move {
                let source = body["query"]["sources"][0]["name"]
                    .as_str()
                    .unwrap_or_default()
                    .to_string();
                Json(QueryResult {
                    columns: vec![ColumnMeta::field("source", "string")],
                    rows: vec![vec![Value::String(source)]],
                    stats: Default::default(),
                })
            }),
        );
        let base = spawn_engine(app).await;

        let executor = HttpQueryExecutor::new(&base, Duration::from_secs(5)).unwrap();
        let mut parsed = ParsedQuery::new(Dialect::SQL, "SELECT * FROM cpu");
        parsed.add_source("cpu");

        let result = executor
            .execute(&parsed, &ExecuteOptions::default())
            .await
            .unwrap();
        assert_eq!(result.rows, vec![vec![Value::from("cpu")]]);
    }

    #[tokio::test]
    async fn test_http_executor_engine_error() {
        let app = Router::new().route(
            "/v1/execute",
            post(|| async { (axum::http::StatusCode::INTERNAL_SERVER_ERROR, "disk on fire") }),
        );
        let base = spawn_engine(app).await;

        let executor = HttpQueryExecutor::new(&base, Duration::from_secs(5)).unwrap();
        let parsed = ParsedQuery::new(Dialect::SQL, "SELECT 1");
        let err = executor
            .execute(&parsed, &ExecuteOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, ExecuteError::Engine(msg) if msg == "disk on fire"));
    }
}

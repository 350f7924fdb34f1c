//! Query dialects: detection, per-dialect parsing and native response shaping
//!
//! Every supported query language collapses into the same [`ParsedQuery`]
//! through a [`DialectHandler`], and every handler knows how to render a
//! [`QueryResult`] back into the envelope its native clients expect.

pub mod detector;
pub mod druid;
pub mod duration;
pub mod flux;
pub mod format;
pub mod graphite;
pub mod influxql;
pub mod opentsdb;
pub mod promql;
pub mod registry;
pub mod sql;

pub use detector::DialectDetector;
pub use registry::HandlerRegistry;

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::query::{ParsedQuery, QueryResult};

/// Supported query languages
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Dialect {
    InfluxQL,
    Flux,
    PromQL,
    MetricsQL,
    TDengine,
    TimescaleDB,
    QuestDB,
    ClickHouse,
    DruidSQL,
    #[serde(rename = "druidnative")]
    DruidJSON,
    OpenTSDB,
    Graphite,
    SQL,
}

impl Dialect {
    /// Every dialect, in detector scan order
    pub const ALL: [Dialect; 13] = [
        Dialect::InfluxQL,
        Dialect::Flux,
        Dialect::PromQL,
        Dialect::MetricsQL,
        Dialect::TDengine,
        Dialect::TimescaleDB,
        Dialect::QuestDB,
        Dialect::ClickHouse,
        Dialect::DruidSQL,
        Dialect::DruidJSON,
        Dialect::OpenTSDB,
        Dialect::Graphite,
        Dialect::SQL,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Dialect::InfluxQL => "influxql",
            Dialect::Flux => "flux",
            Dialect::PromQL => "promql",
            Dialect::MetricsQL => "metricsql",
            Dialect::TDengine => "tdengine",
            Dialect::TimescaleDB => "timescaledb",
            Dialect::QuestDB => "questdb",
            Dialect::ClickHouse => "clickhouse",
            Dialect::DruidSQL => "druidsql",
            Dialect::DruidJSON => "druidnative",
            Dialect::OpenTSDB => "opentsdb",
            Dialect::Graphite => "graphite",
            Dialect::SQL => "sql",
        }
    }
}

impl fmt::Display for Dialect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Dialect {
    type Err = HandlerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let lower = s.trim().to_ascii_lowercase();
        Dialect::ALL
            .iter()
            .copied()
            .find(|d| d.as_str() == lower)
            .ok_or_else(|| HandlerError::InvalidQuery(format!("unknown dialect '{}'", s)))
    }
}

/// Rendered payload for a dialect's native clients
#[derive(Debug, Clone, PartialEq)]
pub enum FormattedResponse {
    Json(serde_json::Value),
    /// Plain text body, used for CSV
    Text(String),
}

impl FormattedResponse {
    pub fn as_json(&self) -> Option<&serde_json::Value> {
        match self {
            FormattedResponse::Json(v) => Some(v),
            FormattedResponse::Text(_) => None,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            FormattedResponse::Text(s) => Some(s),
            FormattedResponse::Json(_) => None,
        }
    }
}

/// Parses one dialect into the shared IR and renders results back
pub trait DialectHandler: Send + Sync {
    fn dialect(&self) -> Dialect;

    /// Extract whatever clauses are recognisable; missing optional clauses are not an error
    fn parse(&self, query: &str) -> Result<ParsedQuery, HandlerError>;

    fn format_response(
        &self,
        result: &QueryResult,
        format: &str,
    ) -> Result<FormattedResponse, HandlerError>;
}

#[derive(Debug, thiserror::Error)]
pub enum HandlerError {
    #[error("Invalid query: {0}")]
    InvalidQuery(String),

    #[error("Format error: {0}")]
    Format(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dialect_names_round_trip() {
        for dialect in Dialect::ALL {
            assert_eq!(dialect.as_str().parse::<Dialect>().unwrap(), dialect);
            let json = serde_json::to_value(dialect).unwrap();
            assert_eq!(json, serde_json::Value::String(dialect.as_str().to_string()));
        }
    }

    #[test]
    fn test_unknown_dialect() {
        assert!("cobol".parse::<Dialect>().is_err());
    }
}

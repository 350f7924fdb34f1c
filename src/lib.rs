//! PolyQL: Multi-Dialect Time-Series Query Front End
//!
//! Accepts queries written for InfluxDB, Prometheus, Druid, OpenTSDB, Graphite,
//! QuestDB and plain SQL engines, normalises them into one intermediate
//! representation, hands that to a pluggable execution engine, and renders the
//! result back in the envelope each dialect's clients expect.
//!
//! # Features
//!
//! - **Wire-Compatible Endpoints**: `/api/v1/query`, `/query`, `/api/v2/query`, `/render`, ...
//! - **Dialect Detection**: Confidence-scored guessing for `/dialect/auto`
//! - **Shared IR**: Sources, filters, aggregations, grouping, time ranges
//! - **Native Responses**: Prometheus matrices, InfluxDB series, Flux CSV, Druid events
//! - **Plan Executor**: Point lookup, scatter-gather, aggregation and join across shards
//!
//! # Example
//!
//! ```
//! use polyql::dialect::{Dialect, DialectDetector, HandlerRegistry};
//!
//! let detector = DialectDetector::new();
//! let query = r#"rate(http_requests_total{job="api"}[5m])"#;
//! let (dialect, _confidence) = detector.detect(query);
//! assert_eq!(dialect, Dialect::PromQL);
//!
//! let registry = HandlerRegistry::with_defaults();
//! let parsed = registry.resolve(dialect).unwrap().parse(query).unwrap();
//! assert_eq!(parsed.primary_source(), Some("http_requests_total"));
//! ```

pub mod api;
pub mod cluster;
pub mod data;
pub mod dialect;
pub mod query;

// Re-export commonly used types
pub use data::Value;
pub use dialect::{Dialect, DialectDetector, DialectHandler, HandlerError, HandlerRegistry};
pub use query::{ExecuteError, ExecuteOptions, ParsedQuery, QueryExecutor, QueryResult};

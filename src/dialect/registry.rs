use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;

use super::druid::DruidHandler;
use super::flux::FluxHandler;
use super::graphite::GraphiteHandler;
use super::influxql::InfluxQLHandler;
use super::opentsdb::OpenTSDBHandler;
use super::promql::PromQLHandler;
use super::sql::SqlHandler;
use super::{Dialect, DialectHandler};

/// Dialect → handler lookup.
///
/// Built once at startup and shared through the router state. Reads vastly
/// outnumber writes, so lookups take a read lock and clone the `Arc` out.
pub struct HandlerRegistry {
    handlers: RwLock<HashMap<Dialect, Arc<dyn DialectHandler>>>,
}

impl HandlerRegistry {
    /// Empty registry, mostly useful for tests
    pub fn new() -> Self {
        Self {
            handlers: RwLock::new(HashMap::new()),
        }
    }

    /// Registry with a handler for every supported dialect
    pub fn with_defaults() -> Self {
        let registry = Self::new();
        registry.register(Arc::new(InfluxQLHandler));
        registry.register(Arc::new(FluxHandler));
        registry.register(Arc::new(PromQLHandler::promql()));
        registry.register(Arc::new(PromQLHandler::metricsql()));
        for dialect in [
            Dialect::SQL,
            Dialect::TDengine,
            Dialect::TimescaleDB,
            Dialect::QuestDB,
            Dialect::ClickHouse,
            Dialect::DruidSQL,
        ] {
            registry.register(Arc::new(SqlHandler::new(dialect)));
        }
        registry.register(Arc::new(DruidHandler));
        registry.register(Arc::new(OpenTSDBHandler));
        registry.register(Arc::new(GraphiteHandler));
        registry
    }

    /// Register (or replace) the handler for its dialect
    pub fn register(&self, handler: Arc<dyn DialectHandler>) {
        let dialect = handler.dialect();
        self.handlers.write().insert(dialect, handler);
    }

    pub fn get(&self, dialect: Dialect) -> Option<Arc<dyn DialectHandler>> {
        self.handlers.read().get(&dialect).cloned()
    }

    /// Handler for `dialect`, falling back to generic SQL when the dialect has
    /// no dedicated handler
    pub fn resolve(&self, dialect: Dialect) -> Option<Arc<dyn DialectHandler>> {
        let handlers = self.handlers.read();
        handlers
            .get(&dialect)
            .or_else(|| handlers.get(&Dialect::SQL))
            .cloned()
    }

    /// Registered dialects in detector order
    pub fn dialects(&self) -> Vec<Dialect> {
        let handlers = self.handlers.read();
        Dialect::ALL
            .into_iter()
            .filter(|d| handlers.contains_key(d))
            .collect()
    }
}

impl Default for HandlerRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}

pub mod executor;
pub mod ir;
pub mod result;

pub use executor::{ExecuteError, ExecuteOptions, HttpQueryExecutor, QueryExecutor};
pub use ir::{Aggregation, DataSource, Filter, FilterOperator, OrderBy, ParsedQuery, TimeRange};
pub use result::{ColumnMeta, ExecutionStats, QueryResult};

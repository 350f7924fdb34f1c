pub mod client;
pub mod config;
pub mod executor;
pub mod merge;
pub mod plan;

pub use client::{ClusterClient, ClusterError, HttpClusterClient};
pub use config::{ClusterConfig, PeerNode};
pub use executor::{ExecutorError, PlanExecutor};
pub use merge::{MergeError, MergePrimitives, NativeMerge};
pub use plan::{AggregateOp, AggregateSpec, Plan, PlanType, ShardResult, Statement, ALL_SHARDS};

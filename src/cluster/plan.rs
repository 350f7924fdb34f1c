//! Distributed query plans and per-shard results

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use super::merge::MergeError;

/// Shard sentinel meaning "every known node", resolved when the plan runs
pub const ALL_SHARDS: &str = "*";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanType {
    PointLookup,
    ScatterGather,
    Aggregation,
    Join,
}

impl PlanType {
    pub fn as_str(&self) -> &'static str {
        match self {
            PlanType::PointLookup => "point_lookup",
            PlanType::ScatterGather => "scatter_gather",
            PlanType::Aggregation => "aggregation",
            PlanType::Join => "join",
        }
    }
}

impl fmt::Display for PlanType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Statement shipped to a shard
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Statement {
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub database: Option<String>,
}

impl Statement {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            database: None,
        }
    }
}

/// Associative merge applied to per-shard partials
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum AggregateOp {
    Sum,
    Count,
    Min,
    Max,
    Avg,
}

impl FromStr for AggregateOp {
    type Err = MergeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "SUM" => Ok(AggregateOp::Sum),
            "COUNT" => Ok(AggregateOp::Count),
            "MIN" => Ok(AggregateOp::Min),
            "MAX" => Ok(AggregateOp::Max),
            "AVG" | "MEAN" => Ok(AggregateOp::Avg),
            _ => Err(MergeError::UnsupportedOperator(s.to_string())),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AggregateSpec {
    pub op: AggregateOp,
    /// Document field holding each shard's partial; the whole document when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub field: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Plan {
    pub plan_type: PlanType,
    #[serde(default)]
    pub shards: Vec<String>,
    pub query: Statement,
    /// Only meaningful for joins, which need exactly two
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub sub_plans: Vec<Plan>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub aggregate: Option<AggregateSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub join_key: Option<String>,
}

impl Plan {
    fn new(plan_type: PlanType, shards: Vec<String>, query: Statement) -> Self {
        Self {
            plan_type,
            shards,
            query,
            sub_plans: Vec::new(),
            aggregate: None,
            join_key: None,
        }
    }

    pub fn point_lookup(shard: impl Into<String>, query: Statement) -> Self {
        Self::new(PlanType::PointLookup, vec![shard.into()], query)
    }

    pub fn scatter_gather(shards: Vec<String>, query: Statement) -> Self {
        Self::new(PlanType::ScatterGather, shards, query)
    }

    /// Fan out to every node
    pub fn broadcast(query: Statement) -> Self {
        Self::scatter_gather(vec![ALL_SHARDS.to_string()], query)
    }

    pub fn aggregation(shards: Vec<String>, query: Statement, aggregate: AggregateSpec) -> Self {
        let mut plan = Self::new(PlanType::Aggregation, shards, query);
        plan.aggregate = Some(aggregate);
        plan
    }

    pub fn join(left: Plan, right: Plan, join_key: impl Into<String>) -> Self {
        let mut plan = Self::new(PlanType::Join, Vec::new(), Statement::new(""));
        plan.sub_plans = vec![left, right];
        plan.join_key = Some(join_key.into());
        plan
    }
}

/// What a shard (or a merged fan-out) returns
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ShardResult {
    pub count: usize,
    #[serde(default)]
    pub documents: Vec<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ShardResult {
    pub fn from_documents(documents: Vec<serde_json::Value>) -> Self {
        Self {
            count: documents.len(),
            documents,
            error: None,
        }
    }
}

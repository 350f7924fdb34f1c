//! Distributed plan execution over an injected cluster client

use futures::future::{BoxFuture, FutureExt};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tracing::{debug, warn};

use super::client::{ClusterClient, ClusterError};
use super::merge::{MergeError, MergePrimitives, NativeMerge};
use super::plan::{AggregateOp, Plan, PlanType, ShardResult, Statement, ALL_SHARDS};

const DEFAULT_JOIN_KEY: &str = "id";

/// Runs [`Plan`]s against the cluster
#[derive(Clone)]
pub struct PlanExecutor {
    client: Arc<dyn ClusterClient>,
    merge: Arc<dyn MergePrimitives>,
    call_timeout: Option<Duration>,
}

impl PlanExecutor {
    pub fn new(client: Arc<dyn ClusterClient>) -> Self {
        Self {
            client,
            merge: Arc::new(NativeMerge),
            call_timeout: None,
        }
    }

    pub fn with_merge(mut self, merge: Arc<dyn MergePrimitives>) -> Self {
        self.merge = merge;
        self
    }

    /// Bound every individual shard call
    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = Some(timeout);
        self
    }

    pub fn execute<'a>(&'a self, plan: &'a Plan) -> BoxFuture<'a, Result<ShardResult, ExecutorError>> {
        async move {
            debug!(plan_type = %plan.plan_type, shards = ?plan.shards, "Executing plan");
            match plan.plan_type {
                PlanType::PointLookup => self.point_lookup(plan).await,
                PlanType::ScatterGather => self.scatter_gather(plan).await,
                PlanType::Aggregation => self.aggregation(plan).await,
                PlanType::Join => self.join(plan).await,
            }
        }
        .boxed()
    }

    async fn point_lookup(&self, plan: &Plan) -> Result<ShardResult, ExecutorError> {
        let target = match plan.shards.as_slice() {
            [] => return Err(ExecutorError::NoTarget(plan.plan_type)),
            [target] if target == ALL_SHARDS => {
                return Err(ExecutorError::InvalidPlan(
                    "point lookup needs a concrete shard".to_string(),
                ))
            }
            [target] => target,
            _ => {
                return Err(ExecutorError::InvalidPlan(format!(
                    "point lookup targets {} shards",
                    plan.shards.len()
                )))
            }
        };

        Ok(call_shard(
            self.client.as_ref(),
            target,
            &plan.query,
            self.call_timeout,
        )
        .await?)
    }

    async fn scatter_gather(&self, plan: &Plan) -> Result<ShardResult, ExecutorError> {
        let targets = self.resolve_targets(plan)?;
        Ok(self.fan_out(targets, &plan.query).await)
    }

    async fn aggregation(&self, plan: &Plan) -> Result<ShardResult, ExecutorError> {
        let targets = self.resolve_targets(plan)?;
        let gathered = self.fan_out(targets, &plan.query).await;

        let (op, field) = match &plan.aggregate {
            Some(spec) => (spec.op, spec.field.as_deref()),
            None => (AggregateOp::Sum, None),
        };
        let partials: Vec<serde_json::Value> = gathered
            .documents
            .into_iter()
            .filter_map(|doc| match field {
                Some(field) => doc.get(field).cloned(),
                None => Some(doc),
            })
            .collect();

        let merged = self.merge.aggregate(&partials, op)?;
        Ok(ShardResult {
            count: 1,
            documents: vec![json!({ "result": merged })],
            error: None,
        })
    }

    async fn join(&self, plan: &Plan) -> Result<ShardResult, ExecutorError> {
        let [left, right] = plan.sub_plans.as_slice() else {
            return Err(ExecutorError::InvalidPlan(format!(
                "join needs exactly 2 sub-plans, got {}",
                plan.sub_plans.len()
            )));
        };

        let mut tasks = JoinSet::new();
        for (side, sub_plan) in [(0usize, left.clone()), (1, right.clone())] {
            let executor = self.clone();
            tasks.spawn(async move { (side, executor.execute(&sub_plan).await) });
        }

        let mut outputs: [Option<Vec<serde_json::Value>>; 2] = [None, None];
        while let Some(joined) = tasks.join_next().await {
            // Dropping the set aborts whichever side is still running
            let (side, result) = joined.map_err(|e| ExecutorError::Task(e.to_string()))?;
            outputs[side] = Some(result?.documents);
        }

        let [Some(left_docs), Some(right_docs)] = outputs else {
            return Err(ExecutorError::Task("join side produced no output".to_string()));
        };
        let key = plan.join_key.as_deref().unwrap_or(DEFAULT_JOIN_KEY);
        let documents = self.merge.hash_join(left_docs, right_docs, key);
        Ok(ShardResult::from_documents(documents))
    }

    /// Expand `*` into the client's current peer list
    fn resolve_targets(&self, plan: &Plan) -> Result<Vec<String>, ExecutorError> {
        let mut targets = Vec::with_capacity(plan.shards.len());
        for shard in &plan.shards {
            if shard == ALL_SHARDS {
                targets.extend(self.client.peers());
            } else {
                targets.push(shard.clone());
            }
        }
        if targets.is_empty() {
            return Err(ExecutorError::NoTarget(plan.plan_type));
        }
        Ok(targets)
    }

    /// One task per target; failed shards are logged and left out
    async fn fan_out(&self, targets: Vec<String>, statement: &Statement) -> ShardResult {
        let mut tasks = JoinSet::new();
        for target in targets {
            let client = Arc::clone(&self.client);
            let statement = statement.clone();
            let call_timeout = self.call_timeout;
            tasks.spawn(async move {
                let result = call_shard(client.as_ref(), &target, &statement, call_timeout).await;
                (target, result)
            });
        }

        let mut merged = ShardResult::default();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((_, Ok(result))) => {
                    merged.count += result.count;
                    merged.documents.extend(result.documents);
                }
                Ok((target, Err(e))) => {
                    warn!("Shard query failed on {}: {}", target, e);
                }
                Err(e) => {
                    warn!("Shard task failed: {}", e);
                }
            }
        }
        merged
    }
}

fn is_local(client: &dyn ClusterClient, target: &str) -> bool {
    target == client.local_addr() || target == "localhost"
}

async fn call_shard(
    client: &dyn ClusterClient,
    target: &str,
    statement: &Statement,
    call_timeout: Option<Duration>,
) -> Result<ShardResult, ClusterError> {
    let call = async {
        let result = if is_local(client, target) {
            client.execute_local(statement).await?
        } else {
            client.execute_remote(target, statement).await?
        };
        match result.error {
            Some(error) => Err(ClusterError::RemoteError(error)),
            None => Ok(result),
        }
    };

    match call_timeout {
        Some(limit) => tokio::time::timeout(limit, call)
            .await
            .map_err(|_| ClusterError::Timeout)?,
        None => call.await,
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ExecutorError {
    #[error("No target shards for {0} plan")]
    NoTarget(PlanType),

    #[error("Invalid plan: {0}")]
    InvalidPlan(String),

    #[error("Cluster error: {0}")]
    Cluster(#[from] ClusterError),

    #[error("Merge error: {0}")]
    Merge(#[from] MergeError),

    #[error("Task failed: {0}")]
    Task(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::plan::AggregateSpec;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use proptest::prelude::*;
    use std::collections::HashMap;

    const LOCAL: &str = "10.0.0.1:8086";

    #[derive(Clone)]
    enum Reply {
        Docs(Vec<serde_json::Value>),
        Fail,
        Slow(Duration, Vec<serde_json::Value>),
    }

    /// Records which node each call was routed to
    struct MockClient {
        peers: Vec<String>,
        replies: HashMap<String, Reply>,
        calls: Mutex<Vec<String>>,
    }

    impl MockClient {
        fn new(replies: &[(&str, Reply)]) -> Self {
            Self {
                peers: replies.iter().map(|(addr, _)| addr.to_string()).collect(),
                replies: replies
                    .iter()
                    .map(|(addr, reply)| (addr.to_string(), reply.clone()))
                    .collect(),
                calls: Mutex::new(Vec::new()),
            }
        }

        fn calls(&self) -> Vec<String> {
            let mut calls = self.calls.lock().clone();
            calls.sort();
            calls
        }

        async fn reply(&self, node: &str) -> Result<ShardResult, ClusterError> {
            self.calls.lock().push(node.to_string());
            match self.replies.get(node).cloned() {
                Some(Reply::Docs(docs)) => Ok(ShardResult::from_documents(docs)),
                Some(Reply::Slow(delay, docs)) => {
                    tokio::time::sleep(delay).await;
                    Ok(ShardResult::from_documents(docs))
                }
                Some(Reply::Fail) => Err(ClusterError::Network("connection refused".into())),
                None => Err(ClusterError::RemoteError(format!("unknown node {}", node))),
            }
        }
    }

    #[async_trait]
    impl ClusterClient for MockClient {
        async fn execute_local(&self, _statement: &Statement) -> Result<ShardResult, ClusterError> {
            self.reply(LOCAL).await
        }

        async fn execute_remote(
            &self,
            addr: &str,
            _statement: &Statement,
        ) -> Result<ShardResult, ClusterError> {
            self.reply(addr).await
        }

        fn local_addr(&self) -> &str {
            LOCAL
        }

        fn peers(&self) -> Vec<String> {
            self.peers.clone()
        }
    }

    fn docs(values: &[serde_json::Value]) -> Reply {
        Reply::Docs(values.to_vec())
    }

    fn statement() -> Statement {
        Statement::new("SELECT * FROM cpu")
    }

    #[tokio::test]
    async fn test_scatter_gather_merges_and_drops_failures() {
        let client = Arc::new(MockClient::new(&[
            (LOCAL, docs(&[json!({"v": 1}), json!({"v": 2})])),
            ("10.0.0.2:8086", docs(&[json!({"v": 3})])),
            ("10.0.0.3:8086", Reply::Fail),
        ]));
        let executor = PlanExecutor::new(client.clone());

        let result = executor.execute(&Plan::broadcast(statement())).await.unwrap();
        assert_eq!(result.count, 3);
        let mut values: Vec<i64> = result.documents.iter().map(|d| d["v"].as_i64().unwrap()).collect();
        values.sort();
        assert_eq!(values, vec![1, 2, 3]);
        assert_eq!(client.calls().len(), 3);
    }

    #[tokio::test]
    async fn test_wildcard_resolves_at_execution_time() {
        let client = Arc::new(MockClient::new(&[
            (LOCAL, docs(&[json!({})])),
            ("10.0.0.2:8086", docs(&[json!({})])),
        ]));
        let executor = PlanExecutor::new(client.clone());

        let plan = Plan::scatter_gather(
            vec![ALL_SHARDS.to_string(), "10.0.0.2:8086".to_string()],
            statement(),
        );
        let result = executor.execute(&plan).await.unwrap();
        assert_eq!(result.count, 3);
        assert_eq!(
            client.calls(),
            vec!["10.0.0.1:8086", "10.0.0.2:8086", "10.0.0.2:8086"]
        );
    }

    #[tokio::test]
    async fn test_point_lookup_routing() {
        let client = Arc::new(MockClient::new(&[
            (LOCAL, docs(&[json!({"node": "local"})])),
            ("10.0.0.2:8086", docs(&[json!({"node": "remote"})])),
        ]));
        let executor = PlanExecutor::new(client.clone());

        let local = executor
            .execute(&Plan::point_lookup("localhost", statement()))
            .await
            .unwrap();
        assert_eq!(local.documents[0]["node"], "local");

        let remote = executor
            .execute(&Plan::point_lookup("10.0.0.2:8086", statement()))
            .await
            .unwrap();
        assert_eq!(remote.documents[0]["node"], "remote");

        let failed = executor
            .execute(&Plan::point_lookup("10.0.0.9:8086", statement()))
            .await;
        assert!(matches!(failed, Err(ExecutorError::Cluster(ClusterError::RemoteError(_)))));
    }

    #[tokio::test]
    async fn test_point_lookup_needs_one_concrete_shard() {
        let client = Arc::new(MockClient::new(&[(LOCAL, docs(&[]))]));
        let executor = PlanExecutor::new(client.clone());

        let mut plan = Plan::point_lookup(ALL_SHARDS, statement());
        assert!(matches!(executor.execute(&plan).await, Err(ExecutorError::InvalidPlan(_))));

        plan.shards.clear();
        assert!(matches!(
            executor.execute(&plan).await,
            Err(ExecutorError::NoTarget(PlanType::PointLookup))
        ));
        assert!(client.calls().is_empty());
    }

    #[tokio::test]
    async fn test_aggregation_defaults_to_sum() {
        let client = Arc::new(MockClient::new(&[
            (LOCAL, docs(&[json!(10)])),
            ("10.0.0.2:8086", docs(&[json!(32)])),
        ]));
        let executor = PlanExecutor::new(client);

        let mut plan = Plan::broadcast(statement());
        plan.plan_type = PlanType::Aggregation;
        let result = executor.execute(&plan).await.unwrap();
        assert_eq!(result.count, 1);
        assert_eq!(result.documents, vec![json!({"result": 42})]);
    }

    #[tokio::test]
    async fn test_aggregation_avg_is_count_weighted() {
        let client = Arc::new(MockClient::new(&[
            (LOCAL, docs(&[json!({"partial": {"sum": 10, "count": 2}})])),
            ("10.0.0.2:8086", docs(&[json!({"partial": {"sum": 30, "count": 8}})])),
            ("10.0.0.3:8086", Reply::Fail),
        ]));
        let executor = PlanExecutor::new(client);

        let plan = Plan::aggregation(
            vec![ALL_SHARDS.to_string()],
            statement(),
            AggregateSpec {
                op: AggregateOp::Avg,
                field: Some("partial".into()),
            },
        );
        let result = executor.execute(&plan).await.unwrap();
        assert_eq!(result.documents[0]["result"], json!(4.0));
    }

    #[tokio::test]
    async fn test_aggregation_with_no_partials_fails() {
        let client = Arc::new(MockClient::new(&[(LOCAL, Reply::Fail)]));
        let executor = PlanExecutor::new(client);

        let plan = Plan::aggregation(
            vec![LOCAL.to_string()],
            statement(),
            AggregateSpec { op: AggregateOp::Max, field: None },
        );
        assert!(matches!(
            executor.execute(&plan).await,
            Err(ExecutorError::Merge(MergeError::NoValues))
        ));
    }

    #[tokio::test]
    async fn test_join_requires_two_sub_plans() {
        let client = Arc::new(MockClient::new(&[(LOCAL, docs(&[json!({"id": 1})]))]));
        let executor = PlanExecutor::new(client.clone());

        let mut plan = Plan::join(
            Plan::point_lookup(LOCAL, statement()),
            Plan::point_lookup(LOCAL, statement()),
            "id",
        );
        plan.sub_plans.pop();

        assert!(matches!(executor.execute(&plan).await, Err(ExecutorError::InvalidPlan(_))));
        assert!(client.calls().is_empty());
    }

    #[tokio::test]
    async fn test_join_uses_plan_key() {
        let client = Arc::new(MockClient::new(&[
            (LOCAL, docs(&[json!({"host": "a", "cpu": 0.5}), json!({"host": "b", "cpu": 0.9})])),
            ("10.0.0.2:8086", docs(&[json!({"host": "b", "region": "eu"})])),
        ]));
        let executor = PlanExecutor::new(client);

        let plan = Plan::join(
            Plan::point_lookup(LOCAL, statement()),
            Plan::point_lookup("10.0.0.2:8086", Statement::new("SELECT * FROM hosts")),
            "host",
        );
        let result = executor.execute(&plan).await.unwrap();
        assert_eq!(result.count, 1);
        assert_eq!(
            result.documents[0],
            json!({"left_host": "b", "left_cpu": 0.9, "right_host": "b", "right_region": "eu"})
        );
    }

    #[tokio::test]
    async fn test_join_propagates_first_error() {
        let client = Arc::new(MockClient::new(&[
            (LOCAL, Reply::Slow(Duration::from_secs(5), vec![json!({"id": 1})])),
            ("10.0.0.2:8086", Reply::Fail),
        ]));
        let executor = PlanExecutor::new(client);

        let plan = Plan::join(
            Plan::point_lookup(LOCAL, statement()),
            Plan::point_lookup("10.0.0.2:8086", statement()),
            "id",
        );
        let started = std::time::Instant::now();
        let result = executor.execute(&plan).await;
        assert!(matches!(result, Err(ExecutorError::Cluster(ClusterError::Network(_)))));
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_call_timeout_drops_slow_shard() {
        let client = Arc::new(MockClient::new(&[
            (LOCAL, docs(&[json!({"v": 1})])),
            ("10.0.0.2:8086", Reply::Slow(Duration::from_secs(5), vec![json!({"v": 2})])),
        ]));
        let executor = PlanExecutor::new(client).with_call_timeout(Duration::from_millis(50));

        let result = executor.execute(&Plan::broadcast(statement())).await.unwrap();
        assert_eq!(result.count, 1);
        assert_eq!(result.documents, vec![json!({"v": 1})]);
    }

    proptest! {
        #[test]
        fn prop_scatter_count_is_sum_of_shards(sizes in proptest::collection::vec(0usize..5, 1..6)) {
            let replies: Vec<(String, Reply)> = sizes
                .iter()
                .enumerate()
                .map(|(i, n)| (format!("10.1.0.{}:8086", i), Reply::Docs(vec![json!({"shard": i}); *n])))
                .collect();
            let borrowed: Vec<(&str, Reply)> = replies.iter().map(|(a, r)| (a.as_str(), r.clone())).collect();
            let executor = PlanExecutor::new(Arc::new(MockClient::new(&borrowed)));

            let result = tokio_test::block_on(executor.execute(&Plan::broadcast(statement()))).unwrap();
            prop_assert_eq!(result.count, sizes.iter().sum::<usize>());
            prop_assert_eq!(result.documents.len(), result.count);
        }
    }
}

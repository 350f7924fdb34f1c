//! Merge primitives applied to shard outputs

use serde_json::{Map, Number, Value};
use std::collections::HashMap;

use super::plan::AggregateOp;

/// Combines per-shard outputs into one result
pub trait MergePrimitives: Send + Sync {
    /// Fold per-shard partial values with an associative operator
    fn aggregate(&self, values: &[Value], op: AggregateOp) -> Result<Value, MergeError>;

    /// Inner equi-join on `key`; output columns carry `left_`/`right_` prefixes
    fn hash_join(&self, left: Vec<Value>, right: Vec<Value>, key: &str) -> Vec<Value>;
}

/// In-process merge over `serde_json` documents
#[derive(Debug, Clone, Copy, Default)]
pub struct NativeMerge;

impl MergePrimitives for NativeMerge {
    fn aggregate(&self, values: &[Value], op: AggregateOp) -> Result<Value, MergeError> {
        match op {
            AggregateOp::Sum | AggregateOp::Count => Ok(total(values)),
            AggregateOp::Min => extreme(values, |candidate, best| candidate < best),
            AggregateOp::Max => extreme(values, |candidate, best| candidate > best),
            AggregateOp::Avg => weighted_mean(values),
        }
    }

    fn hash_join(&self, left: Vec<Value>, right: Vec<Value>, key: &str) -> Vec<Value> {
        // Build on the left side
        let mut table: HashMap<String, Vec<&Map<String, Value>>> = HashMap::new();
        for row in &left {
            if let Some((join_value, map)) = keyed(row, key) {
                table.entry(join_value).or_default().push(map);
            }
        }

        let mut joined = Vec::new();
        for row in &right {
            let Some((join_value, right_map)) = keyed(row, key) else {
                continue;
            };
            let Some(matches) = table.get(&join_value) else {
                continue;
            };
            for left_map in matches {
                let mut merged = Map::with_capacity(left_map.len() + right_map.len());
                for (k, v) in left_map.iter() {
                    merged.insert(format!("left_{}", k), v.clone());
                }
                for (k, v) in right_map {
                    merged.insert(format!("right_{}", k), v.clone());
                }
                joined.push(Value::Object(merged));
            }
        }
        joined
    }
}

/// Object rows with a non-null join key
fn keyed<'a>(row: &'a Value, key: &str) -> Option<(String, &'a Map<String, Value>)> {
    let map = row.as_object()?;
    let join_value = match map.get(key)? {
        Value::Null => return None,
        Value::String(s) => s.clone(),
        other => other.to_string(),
    };
    Some((join_value, map))
}

fn numeric(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn float(x: f64) -> Value {
    Number::from_f64(x).map(Value::Number).unwrap_or(Value::Null)
}

/// Integers stay integers unless a float shows up or the sum overflows
fn total(values: &[Value]) -> Value {
    let ints: Option<Vec<i64>> = values.iter().filter(|v| !v.is_null()).map(Value::as_i64).collect();
    if let Some(sum) = ints.and_then(|ints| ints.into_iter().try_fold(0i64, i64::checked_add)) {
        return Value::from(sum);
    }
    float(values.iter().filter_map(numeric).sum())
}

fn extreme(values: &[Value], better: impl Fn(f64, f64) -> bool) -> Result<Value, MergeError> {
    values
        .iter()
        .filter_map(|v| numeric(v).map(|x| (x, v)))
        .fold(None, |best: Option<(f64, &Value)>, (x, v)| match best {
            Some((b, _)) if !better(x, b) => best,
            _ => Some((x, v)),
        })
        .map(|(x, v)| match v {
            Value::Number(n) => Value::Number(n.clone()),
            _ => float(x),
        })
        .ok_or(MergeError::NoValues)
}

/// `{sum, count}` partials are weighted by count; bare numbers count once
fn weighted_mean(values: &[Value]) -> Result<Value, MergeError> {
    let mut sum = 0.0;
    let mut count = 0.0;
    for value in values {
        let partial = match value {
            Value::Object(map) => map
                .get("sum")
                .and_then(numeric)
                .zip(map.get("count").and_then(numeric)),
            other => numeric(other).map(|x| (x, 1.0)),
        };
        if let Some((s, c)) = partial {
            sum += s;
            count += c;
        }
    }
    if count == 0.0 {
        return Err(MergeError::NoValues);
    }
    Ok(float(sum / count))
}

#[derive(Debug, thiserror::Error)]
pub enum MergeError {
    #[error("Unsupported merge operator: {0}")]
    UnsupportedOperator(String),

    #[error("No values to merge")]
    NoValues,
}

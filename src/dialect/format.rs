//! Response shaping shared by several dialects

use chrono::{SecondsFormat, TimeZone, Utc};
use serde_json::{json, Value as Json};
use std::collections::BTreeMap;

use super::HandlerError;
use crate::data::Value;
use crate::query::QueryResult;

/// Generic `{columns, rows, stats}` envelope
pub fn generic_json(result: &QueryResult) -> Json {
    json!({
        "columns": result.column_names(),
        "rows": rows_json(result),
        "stats": {
            "execution_time_ms": result.stats.execution_time_ms,
            "rows_scanned": result.stats.rows_scanned,
            "bytes_scanned": result.stats.bytes_scanned,
        }
    })
}

pub fn rows_json(result: &QueryResult) -> Vec<Vec<Json>> {
    result
        .rows
        .iter()
        .map(|row| row.iter().map(Value::to_json).collect())
        .collect()
}

/// CSV text with `\n` or `\r\n` record endings. `None` skips the header row.
pub fn write_csv(
    header: Option<&[String]>,
    rows: impl IntoIterator<Item = Vec<String>>,
    terminator: csv::Terminator,
) -> Result<String, HandlerError> {
    let mut writer = csv::WriterBuilder::new()
        .terminator(terminator)
        .flexible(true)
        .from_writer(Vec::new());

    if let Some(header) = header {
        writer.write_record(header).map_err(csv_error)?;
    }
    for row in rows {
        writer.write_record(&row).map_err(csv_error)?;
    }

    let bytes = writer
        .into_inner()
        .map_err(|e| HandlerError::Format(e.into_error().to_string()))?;
    String::from_utf8(bytes).map_err(|e| HandlerError::Format(e.to_string()))
}

fn csv_error(e: csv::Error) -> HandlerError {
    HandlerError::Format(e.to_string())
}

/// Tag columns of a row as an ordered label set
pub fn row_labels(result: &QueryResult, row: &[Value]) -> BTreeMap<String, String> {
    result
        .tag_indices()
        .into_iter()
        .filter_map(|i| {
            let value = row.get(i)?;
            if value.is_null() {
                None
            } else {
                Some((result.columns[i].name.clone(), value.to_string()))
            }
        })
        .collect()
}

/// Rows grouped by tag set, in first-seen order
pub fn group_series<'a>(result: &'a QueryResult) -> Vec<(BTreeMap<String, String>, Vec<&'a [Value]>)> {
    let mut groups: Vec<(BTreeMap<String, String>, Vec<&'a [Value]>)> = Vec::new();
    for row in &result.rows {
        let labels = row_labels(result, row);
        match groups.iter_mut().find(|(l, _)| *l == labels) {
            Some((_, rows)) => rows.push(row.as_slice()),
            None => groups.push((labels, vec![row.as_slice()])),
        }
    }
    groups
}

/// RFC 3339 rendering of an epoch-millisecond instant
pub fn rfc3339_millis(millis: i64) -> Option<String> {
    rfc3339(millis, SecondsFormat::AutoSi)
}

/// RFC 3339 with a fixed fractional-second precision
pub fn rfc3339(millis: i64, precision: SecondsFormat) -> Option<String> {
    Utc.timestamp_millis_opt(millis)
        .single()
        .map(|t| t.to_rfc3339_opts(precision, true))
}

/// Time cell of a row in epoch milliseconds
pub fn row_time_millis(result: &QueryResult, row: &[Value]) -> Option<i64> {
    result
        .time_index()
        .and_then(|i| row.get(i))
        .and_then(Value::as_epoch_millis)
}

/// Index of the first value column: neither tag nor time
pub fn first_field_index(result: &QueryResult) -> Option<usize> {
    result.field_indices().into_iter().next()
}

/// Render a sample value the way Prometheus does: as a string, with the
/// special float spellings
pub fn prometheus_sample(value: &Value) -> String {
    match value.as_f64() {
        Some(f) if f.is_nan() => "NaN".to_string(),
        Some(f) if f.is_infinite() && f > 0.0 => "+Inf".to_string(),
        Some(f) if f.is_infinite() => "-Inf".to_string(),
        Some(f) => f.to_string(),
        None => value.to_string(),
    }
}

#[cfg(test)]
pub(crate) mod fixtures {
    use crate::data::Value;
    use crate::query::{ColumnMeta, ExecutionStats, QueryResult};

    /// Two series (`host=a`, `host=b`) with two samples each
    pub fn host_series() -> QueryResult {
        QueryResult {
            columns: vec![
                ColumnMeta::time("time"),
                ColumnMeta::tag("host"),
                ColumnMeta::field("value", "float64"),
            ],
            rows: vec![
                vec![Value::Timestamp(1_700_000_000_000), Value::from("a"), Value::Float64(1.5)],
                vec![Value::Timestamp(1_700_000_060_000), Value::from("a"), Value::Float64(2.5)],
                vec![Value::Timestamp(1_700_000_000_000), Value::from("b"), Value::Float64(7.0)],
                vec![Value::Timestamp(1_700_000_060_000), Value::from("b"), Value::Float64(8.0)],
            ],
            stats: ExecutionStats {
                execution_time_ms: 5.2,
                rows_scanned: 100,
                bytes_scanned: 2048,
            },
        }
    }
}

//! Druid native JSON queries (`/druid/v2`)
//!
//! Native queries are structured documents, so unlike the text dialects they
//! are decoded with serde_json and walked field by field.

use chrono::{DateTime, NaiveDate, NaiveDateTime, SecondsFormat, Utc};
use serde_json::{json, Map, Value as Json};
use tracing::debug;

use super::duration;
use super::format::rfc3339;
use super::{Dialect, DialectHandler, FormattedResponse, HandlerError};
use crate::data::Value;
use crate::query::{
    Aggregation, DataSource, FilterOperator, OrderBy, ParsedQuery, QueryResult, TimeRange,
};

pub struct DruidHandler;

impl DialectHandler for DruidHandler {
    fn dialect(&self) -> Dialect {
        Dialect::DruidJSON
    }

    fn parse(&self, query: &str) -> Result<ParsedQuery, HandlerError> {
        let query = query.trim();
        let body: Json = serde_json::from_str(query)
            .map_err(|e| HandlerError::InvalidQuery(format!("malformed Druid query: {}", e)))?;
        let obj = body
            .as_object()
            .ok_or_else(|| HandlerError::InvalidQuery("Druid query must be a JSON object".into()))?;

        let mut parsed = ParsedQuery::new(Dialect::DruidJSON, query);

        if let Some(name) = obj.get("dataSource").and_then(data_source_name) {
            parsed.sources.push(DataSource::named(name));
        }

        if let Some((start, end)) = obj.get("intervals").and_then(first_interval) {
            parsed.time_range = Some(TimeRange::absolute(start, end));
        }

        if let Some(filter) = obj.get("filter") {
            collect_filters(filter, false, &mut parsed);
        }

        if let Some(aggs) = obj.get("aggregations").and_then(Json::as_array) {
            parsed.aggregations.extend(aggs.iter().filter_map(aggregation));
        }

        if let Some(bucket) = obj.get("granularity").and_then(granularity) {
            parsed.group_by.push(format!("time({})", duration::format_short(bucket)));
        }
        match obj.get("dimensions").or_else(|| obj.get("dimension")) {
            Some(Json::Array(dims)) => parsed.group_by.extend(dims.iter().filter_map(dimension_name)),
            Some(dim) => parsed.group_by.extend(dimension_name(dim)),
            None => {}
        }

        let limit_spec = obj.get("limitSpec");
        parsed.limit = obj
            .get("limit")
            .or_else(|| obj.get("threshold"))
            .or_else(|| limit_spec.and_then(|spec| spec.get("limit")))
            .and_then(Json::as_u64);

        if let Some(columns) = limit_spec
            .and_then(|spec| spec.get("columns"))
            .and_then(Json::as_array)
        {
            parsed.order_by.extend(columns.iter().filter_map(order_column));
        }
        if obj.get("descending").and_then(Json::as_bool) == Some(true) {
            parsed.order_by.push(OrderBy {
                column: "__time".to_string(),
                ascending: false,
            });
        }

        Ok(parsed)
    }

    /// Timeseries-style `[{timestamp, result}]` when the result carries a
    /// time column, otherwise groupBy-style `[{event}]`.
    fn format_response(
        &self,
        result: &QueryResult,
        _format: &str,
    ) -> Result<FormattedResponse, HandlerError> {
        let time_idx = result.time_index();
        let rows = result
            .rows
            .iter()
            .map(|row| {
                let fields: Map<String, Json> = result
                    .columns
                    .iter()
                    .zip(row.iter())
                    .enumerate()
                    .filter(|(i, _)| Some(*i) != time_idx)
                    .map(|(_, (col, v))| (col.name.clone(), v.to_json()))
                    .collect();

                match time_idx {
                    Some(i) => {
                        let timestamp = row
                            .get(i)
                            .and_then(Value::as_epoch_millis)
                            .and_then(|ms| rfc3339(ms, SecondsFormat::Millis))
                            .map_or(Json::Null, Json::String);
                        json!({ "timestamp": timestamp, "result": fields })
                    }
                    None => json!({ "event": fields }),
                }
            })
            .collect();

        Ok(FormattedResponse::Json(Json::Array(rows)))
    }
}

/// `"wiki"` or `{"type": "table", "name": "wiki"}`
fn data_source_name(source: &Json) -> Option<String> {
    match source {
        Json::String(name) => Some(name.clone()),
        Json::Object(obj) => obj.get("name").and_then(Json::as_str).map(str::to_string),
        _ => None,
    }
}

fn first_interval(intervals: &Json) -> Option<(DateTime<Utc>, DateTime<Utc>)> {
    let interval = match intervals {
        Json::String(s) => s.as_str(),
        Json::Array(items) => items.first()?.as_str()?,
        _ => return None,
    };
    let (start, end) = interval.split_once('/')?;
    Some((parse_instant(start)?, parse_instant(end)?))
}

/// Druid interval endpoints may be full RFC 3339, zone-less or date-only
fn parse_instant(s: &str) -> Option<DateTime<Utc>> {
    let s = s.trim();
    if let Ok(t) = DateTime::parse_from_rfc3339(s) {
        return Some(t.with_timezone(&Utc));
    }
    for fmt in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%dT%H:%M"] {
        if let Ok(t) = NaiveDateTime::parse_from_str(s, fmt) {
            return Some(t.and_utc());
        }
    }
    NaiveDate::parse_from_str(s, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|t| t.and_utc())
}

fn collect_filters(filter: &Json, negated: bool, parsed: &mut ParsedQuery) {
    let Some(kind) = filter.get("type").and_then(Json::as_str) else {
        return;
    };
    let dimension = filter.get("dimension").and_then(Json::as_str);

    match (kind, dimension) {
        ("selector", Some(dim)) => {
            let value = filter.get("value").map(Value::from_json).unwrap_or(Value::Null);
            let op = if negated { FilterOperator::NotEq } else { FilterOperator::Eq };
            parsed.add_filter(dim, op, value);
        }
        ("in", Some(dim)) => {
            let values: Vec<String> = filter
                .get("values")
                .and_then(Json::as_array)
                .map(|vs| vs.iter().map(|v| Value::from_json(v).to_string()).collect())
                .unwrap_or_default();
            match values.as_slice() {
                [] => {}
                [single] => {
                    let op = if negated { FilterOperator::NotEq } else { FilterOperator::Eq };
                    parsed.add_filter(dim, op, Value::String(single.clone()));
                }
                many => {
                    let alternation: Vec<String> = many.iter().map(|v| regex::escape(v)).collect();
                    let op = if negated {
                        FilterOperator::RegexNotMatch
                    } else {
                        FilterOperator::RegexMatch
                    };
                    parsed.add_filter(dim, op, Value::String(format!("^(?:{})$", alternation.join("|"))));
                }
            }
        }
        ("regex", Some(dim)) => {
            if let Some(pattern) = filter.get("pattern").and_then(Json::as_str) {
                let op = if negated {
                    FilterOperator::RegexNotMatch
                } else {
                    FilterOperator::RegexMatch
                };
                parsed.add_filter(dim, op, Value::String(pattern.to_string()));
            }
        }
        ("not", _) => {
            if let Some(inner) = filter.get("field") {
                collect_filters(inner, !negated, parsed);
            }
        }
        ("and", _) if !negated => {
            for inner in filter.get("fields").and_then(Json::as_array).into_iter().flatten() {
                collect_filters(inner, false, parsed);
            }
        }
        _ => debug!(filter_type = kind, negated, "Skipping Druid filter with no flat equivalent"),
    }
}

fn aggregation(agg: &Json) -> Option<Aggregation> {
    let kind = agg.get("type").and_then(Json::as_str)?;
    let function = match kind {
        "count" => "count",
        "longSum" | "doubleSum" | "floatSum" => "sum",
        "longMin" | "doubleMin" | "floatMin" => "min",
        "longMax" | "doubleMax" | "floatMax" => "max",
        "longFirst" | "doubleFirst" | "floatFirst" | "stringFirst" => "first",
        "longLast" | "doubleLast" | "floatLast" | "stringLast" => "last",
        "hyperUnique" | "cardinality" | "thetaSketch" | "HLLSketchBuild" => "count_distinct",
        other => other,
    };
    Some(Aggregation {
        function: function.to_string(),
        column: agg.get("fieldName").and_then(Json::as_str).map(str::to_string),
        alias: agg.get("name").and_then(Json::as_str).map(str::to_string),
    })
}

/// Bucket width for a granularity; `all` and `none` mean no bucketing
fn granularity(value: &Json) -> Option<std::time::Duration> {
    match value {
        Json::String(name) => named_granularity(name),
        Json::Object(obj) => match obj.get("type").and_then(Json::as_str) {
            Some("period") => obj.get("period").and_then(Json::as_str).and_then(duration::parse_iso8601),
            Some("duration") => obj
                .get("duration")
                .and_then(Json::as_u64)
                .filter(|ms| *ms > 0)
                .map(std::time::Duration::from_millis),
            Some(name) => named_granularity(name),
            None => None,
        },
        _ => None,
    }
}

fn named_granularity(name: &str) -> Option<std::time::Duration> {
    let period = match name.to_ascii_lowercase().as_str() {
        "second" => "PT1S",
        "minute" => "PT1M",
        "five_minute" => "PT5M",
        "ten_minute" => "PT10M",
        "fifteen_minute" => "PT15M",
        "thirty_minute" => "PT30M",
        "hour" => "PT1H",
        "six_hour" => "PT6H",
        "day" => "P1D",
        "week" => "P1W",
        _ => return None,
    };
    duration::parse_iso8601(period)
}

/// `"page"` or `{"dimension": "page", "outputName": "p"}`
fn dimension_name(dim: &Json) -> Option<String> {
    match dim {
        Json::String(name) => Some(name.clone()),
        Json::Object(obj) => obj.get("dimension").and_then(Json::as_str).map(str::to_string),
        _ => None,
    }
}

fn order_column(column: &Json) -> Option<OrderBy> {
    match column {
        Json::String(name) => Some(OrderBy {
            column: name.clone(),
            ascending: true,
        }),
        Json::Object(obj) => Some(OrderBy {
            column: obj.get("dimension").and_then(Json::as_str)?.to_string(),
            ascending: obj.get("direction").and_then(Json::as_str) != Some("descending"),
        }),
        _ => None,
    }
}

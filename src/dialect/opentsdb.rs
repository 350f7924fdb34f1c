//! OpenTSDB (`/api/query`)
//!
//! Accepts both the JSON body form and the URL form
//! (`start=1h-ago&m=sum:1m-avg:sys.cpu.user{host=web01}`).

use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::{json, Map, Value as Json};

use super::duration;
use super::format::{group_series, row_time_millis};
use super::{Dialect, DialectHandler, FormattedResponse, HandlerError};
use crate::data::Value;
use crate::query::{FilterOperator, ParsedQuery, QueryResult, TimeRange};

static RELATIVE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(\d+)(ms|s|m|h|d|w|y)-ago$").expect("valid relative time regex"));

static DOWNSAMPLE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(\d+)(ms|s|m|h|d|w|y)-(\w+)").expect("valid downsample regex"));

static FILTER_CALL: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(\w+)\((.*)\)$").expect("valid tag filter regex"));

pub struct OpenTSDBHandler;

impl DialectHandler for OpenTSDBHandler {
    fn dialect(&self) -> Dialect {
        Dialect::OpenTSDB
    }

    fn parse(&self, query: &str) -> Result<ParsedQuery, HandlerError> {
        let query = query.trim();
        if query.is_empty() {
            return Err(HandlerError::InvalidQuery("empty OpenTSDB query".into()));
        }
        let mut parsed = ParsedQuery::new(Dialect::OpenTSDB, query);

        if query.starts_with('{') {
            parse_json(query, &mut parsed)?;
        } else {
            parse_url_form(query, &mut parsed)?;
        }

        if parsed.sources.is_empty() {
            return Err(HandlerError::InvalidQuery("OpenTSDB query names no metric".into()));
        }
        Ok(parsed)
    }

    /// One `{metric, tags, aggregateTags, dps}` entry per tag set and value
    /// column; `dps` is keyed by epoch seconds.
    fn format_response(
        &self,
        result: &QueryResult,
        _format: &str,
    ) -> Result<FormattedResponse, HandlerError> {
        let fields = result.field_indices();
        let mut out = Vec::new();

        for (labels, rows) in group_series(result) {
            for &field in &fields {
                let dps: Map<String, Json> = rows
                    .iter()
                    .filter_map(|row| {
                        let ts = row_time_millis(result, row)?;
                        let value = row.get(field)?;
                        Some(((ts / 1000).to_string(), value.to_json()))
                    })
                    .collect();
                out.push(json!({
                    "metric": result.columns[field].name,
                    "tags": labels,
                    "aggregateTags": [],
                    "dps": dps,
                }));
            }
        }

        Ok(FormattedResponse::Json(Json::Array(out)))
    }
}

fn parse_json(query: &str, parsed: &mut ParsedQuery) -> Result<(), HandlerError> {
    let body: Json = serde_json::from_str(query)
        .map_err(|e| HandlerError::InvalidQuery(format!("malformed OpenTSDB query: {}", e)))?;

    let start = body.get("start").and_then(json_text);
    let end = body.get("end").and_then(json_text);
    parsed.time_range = time_range(start.as_deref(), end.as_deref())?;

    let queries = body
        .get("queries")
        .and_then(Json::as_array)
        .ok_or_else(|| HandlerError::InvalidQuery("OpenTSDB query has no 'queries' array".into()))?;

    for sub in queries {
        let Some(metric) = sub.get("metric").and_then(Json::as_str) else {
            continue;
        };
        parsed.add_source(metric);

        if let Some(agg) = sub.get("aggregator").and_then(Json::as_str) {
            add_aggregator(parsed, agg);
        }
        if let Some(ds) = sub.get("downsample").and_then(Json::as_str) {
            add_downsample(parsed, ds);
        }
        if sub.get("rate").and_then(Json::as_bool) == Some(true) {
            parsed.add_aggregation("rate", None);
        }

        if let Some(tags) = sub.get("tags").and_then(Json::as_object) {
            for (key, value) in tags {
                if let Some(value) = value.as_str() {
                    add_tag_filter(parsed, key, value, true);
                }
            }
        }
        for filter in sub.get("filters").and_then(Json::as_array).into_iter().flatten() {
            let (Some(kind), Some(tagk), Some(expr)) = (
                filter.get("type").and_then(Json::as_str),
                filter.get("tagk").and_then(Json::as_str),
                filter.get("filter").and_then(Json::as_str),
            ) else {
                continue;
            };
            let group_by = filter.get("groupBy").and_then(Json::as_bool).unwrap_or(false);
            add_typed_filter(parsed, tagk, kind, expr, group_by);
        }
    }
    Ok(())
}

/// `start=..&end=..&m=..` or a bare `m` expression
fn parse_url_form(query: &str, parsed: &mut ParsedQuery) -> Result<(), HandlerError> {
    let query = query.trim_start_matches('?');
    let is_form = query
        .split('&')
        .any(|kv| kv.starts_with("m=") || kv.starts_with("start="));
    if !is_form {
        return parse_metric_expr(query, parsed);
    }

    let mut start = None;
    let mut end = None;
    for (key, value) in url::form_urlencoded::parse(query.as_bytes()) {
        match key.as_ref() {
            "start" => start = Some(value.into_owned()),
            "end" => end = Some(value.into_owned()),
            "m" => parse_metric_expr(&value, parsed)?,
            _ => {}
        }
    }
    parsed.time_range = time_range(start.as_deref(), end.as_deref())?;
    Ok(())
}

/// `agg:[interval-agg:][rate:]metric{tag=value,...}{filter=value,...}`
fn parse_metric_expr(expr: &str, parsed: &mut ParsedQuery) -> Result<(), HandlerError> {
    let (head, tags) = match expr.find('{') {
        Some(i) => (&expr[..i], &expr[i..]),
        None => (expr, ""),
    };
    let parts: Vec<&str> = head.split(':').map(str::trim).collect();
    let (metric, modifiers) = match parts.split_last() {
        Some((metric, rest)) if !metric.is_empty() => (*metric, rest),
        _ => return Err(HandlerError::InvalidQuery(format!("bad metric expression '{}'", expr))),
    };
    parsed.add_source(metric);

    for (i, part) in modifiers.iter().enumerate() {
        if i == 0 {
            add_aggregator(parsed, part);
        } else if part.starts_with("rate") {
            parsed.add_aggregation("rate", None);
        } else if DOWNSAMPLE.is_match(part) {
            add_downsample(parsed, part);
        }
    }

    // First brace group groups by tag; the second filters without grouping
    for (group_idx, block) in tags.split('}').enumerate() {
        let block = block.trim().trim_start_matches('{');
        for pair in block.split(',').filter(|p| !p.trim().is_empty()) {
            if let Some((key, value)) = pair.split_once('=') {
                add_tag_filter(parsed, key.trim(), value.trim(), group_idx == 0);
            }
        }
    }
    Ok(())
}

fn add_aggregator(parsed: &mut ParsedQuery, agg: &str) {
    let function = match agg.to_ascii_lowercase().as_str() {
        "none" | "" => return,
        "zimsum" => "sum".to_string(),
        "mimmin" => "min".to_string(),
        "mimmax" => "max".to_string(),
        "dev" => "stddev".to_string(),
        other => other.to_string(),
    };
    parsed.add_aggregation(function, None);
}

/// `1h-avg` buckets become the leading `time(...)` group key
fn add_downsample(parsed: &mut ParsedQuery, spec: &str) {
    let Some(caps) = DOWNSAMPLE.captures(spec) else {
        return;
    };
    let bucket = caps[1]
        .parse()
        .ok()
        .and_then(|n| duration::from_extended_unit(n, &caps[2]));
    if let Some(bucket) = bucket {
        parsed.group_by.insert(0, format!("time({})", duration::format_short(bucket)));
    }
}

/// Tag value shorthand: `*` groups only, `a|b` is an alternation,
/// `fn(expr)` names a filter type
fn add_tag_filter(parsed: &mut ParsedQuery, key: &str, value: &str, group_by: bool) {
    if let Some(caps) = FILTER_CALL.captures(value) {
        add_typed_filter(parsed, key, &caps[1], &caps[2], group_by);
    } else if value == "*" {
        if group_by {
            parsed.group_by.push(key.to_string());
        }
    } else {
        add_typed_filter(parsed, key, "literal_or", value, group_by);
    }
}

fn add_typed_filter(parsed: &mut ParsedQuery, tagk: &str, kind: &str, expr: &str, group_by: bool) {
    let (operator, value) = match kind.to_ascii_lowercase().as_str() {
        "literal_or" => literal_or(expr, false),
        "iliteral_or" => (FilterOperator::RegexMatch, format!("(?i)^(?:{})$", escaped_alternation(expr))),
        "not_literal_or" => literal_or(expr, true),
        "not_iliteral_or" => (FilterOperator::RegexNotMatch, format!("(?i)^(?:{})$", escaped_alternation(expr))),
        "wildcard" | "iwildcard" => {
            let pattern = expr.split('*').map(regex::escape).collect::<Vec<_>>().join(".*");
            let flags = if kind.eq_ignore_ascii_case("iwildcard") { "(?i)" } else { "" };
            (FilterOperator::RegexMatch, format!("{}^{}$", flags, pattern))
        }
        "regexp" => (FilterOperator::RegexMatch, expr.to_string()),
        _ => return,
    };
    parsed.add_filter(tagk, operator, Value::String(value));
    if group_by && !parsed.group_by.iter().any(|g| g == tagk) {
        parsed.group_by.push(tagk.to_string());
    }
}

fn literal_or(expr: &str, negated: bool) -> (FilterOperator, String) {
    if expr.contains('|') {
        let op = if negated {
            FilterOperator::RegexNotMatch
        } else {
            FilterOperator::RegexMatch
        };
        (op, format!("^(?:{})$", escaped_alternation(expr)))
    } else {
        let op = if negated { FilterOperator::NotEq } else { FilterOperator::Eq };
        (op, expr.to_string())
    }
}

fn escaped_alternation(expr: &str) -> String {
    expr.split('|').map(regex::escape).collect::<Vec<_>>().join("|")
}

/// `start`/`end` may be numbers or strings in the JSON form
fn json_text(value: &Json) -> Option<String> {
    match value {
        Json::String(s) => Some(s.clone()),
        Json::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn time_range(start: Option<&str>, end: Option<&str>) -> Result<Option<TimeRange>, HandlerError> {
    let Some(start) = start.map(str::trim).filter(|s| !s.is_empty()) else {
        return Ok(None);
    };
    if let Some(caps) = RELATIVE.captures(start) {
        if end.is_none() {
            let window = caps[1]
                .parse()
                .ok()
                .and_then(|n| duration::from_extended_unit(n, &caps[2]));
            return Ok(window.map(TimeRange::relative));
        }
    }
    let now = Utc::now();
    let start = parse_instant(start, now)
        .ok_or_else(|| HandlerError::InvalidQuery(format!("bad start time '{}'", start)))?;
    let end = match end {
        Some(e) => parse_instant(e, now)
            .ok_or_else(|| HandlerError::InvalidQuery(format!("bad end time '{}'", e)))?,
        None => now,
    };
    Ok(Some(TimeRange::absolute(start, end)))
}

/// Epoch seconds, epoch milliseconds, `N<unit>-ago` or `yyyy/MM/dd-HH:mm:ss`
fn parse_instant(s: &str, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
    let s = s.trim();
    if let Some(caps) = RELATIVE.captures(s) {
        let ago = caps[1]
            .parse()
            .ok()
            .and_then(|n| duration::from_extended_unit(n, &caps[2]))?;
        return now.checked_sub_signed(chrono::Duration::from_std(ago).ok()?);
    }
    if let Ok(n) = s.parse::<i64>() {
        // Ten digits or fewer is seconds
        let millis = if n.abs() < 100_000_000_000 { n.checked_mul(1000)? } else { n };
        return Utc.timestamp_millis_opt(millis).single();
    }
    ["%Y/%m/%d-%H:%M:%S", "%Y/%m/%d %H:%M:%S", "%Y/%m/%d-%H:%M"]
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(s, fmt).ok())
        .map(|t| t.and_utc())
}

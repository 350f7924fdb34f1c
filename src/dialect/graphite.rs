//! Graphite render targets (`/render`)

use chrono::{TimeZone, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::{json, Value as Json};

use super::duration;
use super::format::{group_series, row_time_millis, write_csv};
use super::{Dialect, DialectHandler, FormattedResponse, HandlerError};
use crate::data::Value;
use crate::query::{FilterOperator, ParsedQuery, QueryResult};

static CALL: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?s)^(\w+)\s*\((.*)\)$").expect("valid function call regex"));

static INTERVAL: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(\d+)\s*([a-zA-Z]+)$").expect("valid interval regex")
});

/// Label that `grep`/`exclude` filter on: the series path itself
pub const SERIES_NAME: &str = "__name__";

const MAX_DEPTH: usize = 64;

pub struct GraphiteHandler;

impl DialectHandler for GraphiteHandler {
    fn dialect(&self) -> Dialect {
        Dialect::Graphite
    }

    fn parse(&self, query: &str) -> Result<ParsedQuery, HandlerError> {
        let target = query.trim();
        if target.is_empty() {
            return Err(HandlerError::InvalidQuery("empty Graphite target".into()));
        }
        let mut parsed = ParsedQuery::new(Dialect::Graphite, target);
        parse_target(target, &mut parsed, 0)?;
        if parsed.sources.is_empty() {
            return Err(HandlerError::InvalidQuery(format!(
                "Graphite target '{}' names no series",
                target
            )));
        }
        Ok(parsed)
    }

    /// Render API JSON, or the render API's headerless CSV for `format=csv`
    fn format_response(
        &self,
        result: &QueryResult,
        format: &str,
    ) -> Result<FormattedResponse, HandlerError> {
        let fields = result.field_indices();
        let mut series = Vec::new();
        for (labels, rows) in group_series(result) {
            for &field in &fields {
                let target = match labels.get(SERIES_NAME) {
                    Some(name) => name.clone(),
                    None => std::iter::once(result.columns[field].name.clone())
                        .chain(labels.iter().map(|(k, v)| format!("{}={}", k, v)))
                        .collect::<Vec<_>>()
                        .join(";"),
                };
                let points: Vec<(Json, i64)> = rows
                    .iter()
                    .filter_map(|row| {
                        let ts = row_time_millis(result, row)? / 1000;
                        let value = row.get(field).and_then(Value::as_f64).map_or(Json::Null, |v| json!(v));
                        Some((value, ts))
                    })
                    .collect();
                series.push((target, points));
            }
        }

        if format.eq_ignore_ascii_case("csv") {
            let rows = series.into_iter().flat_map(|(target, points)| {
                points.into_iter().map(move |(value, ts)| {
                    let when = Utc
                        .timestamp_opt(ts, 0)
                        .single()
                        .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
                        .unwrap_or_default();
                    let value = if value.is_null() { String::new() } else { value.to_string() };
                    vec![target.clone(), when, value]
                })
            });
            return write_csv(None, rows, csv::Terminator::Any(b'\n')).map(FormattedResponse::Text);
        }

        let out = series
            .into_iter()
            .map(|(target, points)| {
                let datapoints: Vec<Json> = points.into_iter().map(|(v, ts)| json!([v, ts])).collect();
                json!({ "target": target, "datapoints": datapoints })
            })
            .collect();
        Ok(FormattedResponse::Json(Json::Array(out)))
    }
}

fn parse_target(expr: &str, parsed: &mut ParsedQuery, depth: usize) -> Result<(), HandlerError> {
    if depth > MAX_DEPTH {
        return Err(HandlerError::InvalidQuery("Graphite target nests too deeply".into()));
    }
    let expr = expr.trim();

    let Some(caps) = CALL.captures(expr) else {
        if expr.contains(['(', ')']) {
            return Err(HandlerError::InvalidQuery(format!("unbalanced expression '{}'", expr)));
        }
        if !expr.is_empty() && !is_literal(expr) {
            parsed.add_source(expr);
        }
        return Ok(());
    };

    let function = caps[1].to_string();
    let args = split_args(&caps[2])?;
    let arg = |i: usize| args.get(i).map(|a| unquote(a));

    match function.to_ascii_lowercase().as_str() {
        "summarize" | "smartsummarize" => {
            let agg = arg(2).unwrap_or("sum").to_string();
            parse_target(args.first().copied().unwrap_or_default(), parsed, depth + 1)?;
            if let Some(bucket) = arg(1).and_then(parse_interval) {
                parsed.group_by.insert(0, format!("time({})", duration::format_short(bucket)));
            }
            parsed.add_aggregation(normalize_agg(&agg), None);
        }
        "alias" => {
            parse_target(args.first().copied().unwrap_or_default(), parsed, depth + 1)?;
            if let (Some(name), Some(source)) = (arg(1), parsed.sources.last_mut()) {
                source.alias = Some(name.to_string());
            }
        }
        "grep" | "exclude" => {
            parse_target(args.first().copied().unwrap_or_default(), parsed, depth + 1)?;
            if let Some(pattern) = arg(1) {
                let op = if function.eq_ignore_ascii_case("grep") {
                    FilterOperator::RegexMatch
                } else {
                    FilterOperator::RegexNotMatch
                };
                parsed.add_filter(SERIES_NAME, op, Value::String(pattern.to_string()));
            }
        }
        "limit" => {
            parse_target(args.first().copied().unwrap_or_default(), parsed, depth + 1)?;
            parsed.limit = arg(1).and_then(|n| n.parse().ok());
        }
        "highestcurrent" | "highestmax" | "highestaverage" | "lowestcurrent" | "lowestaverage" => {
            parse_target(args.first().copied().unwrap_or_default(), parsed, depth + 1)?;
            parsed.add_aggregation(function.to_ascii_lowercase(), None);
            parsed.limit = arg(1).and_then(|n| n.parse().ok());
        }
        "groupbynode" | "groupbynodes" => {
            parse_target(args.first().copied().unwrap_or_default(), parsed, depth + 1)?;
            let agg = args.last().filter(|_| args.len() > 2).map(|a| unquote(a)).unwrap_or("sum");
            parsed.add_aggregation(normalize_agg(agg), None);
        }
        "sumseries" | "sum" | "averageseries" | "avg" | "minseries" | "maxseries"
        | "countseries" | "stddevseries" | "multiplyseries" | "diffseries" => {
            for series in &args {
                parse_target(series, parsed, depth + 1)?;
            }
            let agg = function.to_ascii_lowercase();
            parsed.add_aggregation(normalize_agg(agg.trim_end_matches("series")), None);
        }
        // Transforms: derivative, scale, movingAverage, perSecond, ...
        other => {
            for series in &args {
                parse_target(series, parsed, depth + 1)?;
            }
            parsed.add_aggregation(other, None);
        }
    }
    Ok(())
}

fn normalize_agg(name: &str) -> String {
    match name.to_ascii_lowercase().as_str() {
        "average" | "avg" => "avg".to_string(),
        "total" | "sum" => "sum".to_string(),
        other => other.to_string(),
    }
}

/// Split on top-level commas, ignoring commas inside parentheses or quotes
fn split_args(args: &str) -> Result<Vec<&str>, HandlerError> {
    let mut parts = Vec::new();
    let mut depth = 0i32;
    let mut quote: Option<char> = None;
    let mut start = 0;

    for (i, c) in args.char_indices() {
        match (c, quote) {
            ('"' | '\'', None) => quote = Some(c),
            (c, Some(q)) if c == q => quote = None,
            (_, Some(_)) => {}
            ('(', None) => depth += 1,
            (')', None) => {
                depth -= 1;
                if depth < 0 {
                    return Err(HandlerError::InvalidQuery("unbalanced ')' in target".into()));
                }
            }
            (',', None) if depth == 0 => {
                parts.push(args[start..i].trim());
                start = i + 1;
            }
            _ => {}
        }
    }
    if depth != 0 || quote.is_some() {
        return Err(HandlerError::InvalidQuery("unterminated argument list in target".into()));
    }
    let tail = args[start..].trim();
    if !tail.is_empty() {
        parts.push(tail);
    }
    Ok(parts)
}

fn unquote(arg: &str) -> &str {
    arg.trim().trim_matches(|c| c == '"' || c == '\'')
}

/// Numbers, booleans and quoted strings are arguments, never series
fn is_literal(arg: &str) -> bool {
    arg.starts_with(['"', '\''])
        || arg.starts_with(|c: char| c.is_ascii_digit() || c == '-' || c == '.')
            && arg.parse::<f64>().is_ok()
        || arg.eq_ignore_ascii_case("true")
        || arg.eq_ignore_ascii_case("false")
}

/// `1h`, `10min`, `30s`, `2weeks`
fn parse_interval(s: &str) -> Option<std::time::Duration> {
    let caps = INTERVAL.captures(s.trim())?;
    duration::from_unit_word(caps[1].parse().ok()?, &caps[2])
}

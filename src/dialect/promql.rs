//! PromQL and MetricsQL (Prometheus HTTP API)
//!
//! MetricsQL is a superset of PromQL; the same handler serves both and only
//! widens the recognised function set for MetricsQL.

use chrono::Utc;
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::{json, Value as Json};

use super::duration;
use super::format::{first_field_index, group_series, prometheus_sample, row_time_millis};
use super::{Dialect, DialectHandler, FormattedResponse, HandlerError};
use crate::data::Value;
use crate::query::{FilterOperator, ParsedQuery, QueryResult, TimeRange};

const NAME_LABEL: &str = "__name__";

static SELECTOR: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"([a-zA-Z_:][a-zA-Z0-9_:]*)?\s*\{([^}]*)\}\s*(?:\[((?:\d+(?:ms|[smhdwy]))+)(?::[^\]]*)?\])?",
    )
    .expect("valid selector regex")
});

static LABEL_MATCHER: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(\w+)\s*(=~|!~|!=|=)\s*"((?:[^"\\]|\\.)*)""#).expect("valid matcher regex")
});

static IDENTIFIER: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"([a-zA-Z_:][a-zA-Z0-9_:]*)\s*(?:\[((?:\d+(?:ms|[smhdwy]))+)(?::[^\]]*)?\])?")
        .expect("valid identifier regex")
});

static GROUPING: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\b(by|without)\s*\(([^)]*)\)").expect("valid grouping regex")
});

static PROMQL_FUNCTIONS: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"\b(rate|irate|increase|delta|deriv|sum|avg|min|max|count|stddev|topk|bottomk|quantile)\s*(?:\(|by\b|without\b)",
    )
    .expect("valid function regex")
});

static METRICSQL_FUNCTIONS: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"\b(range_quantile|range_median|range_avg|range_first|range_last|topk_avg|topk_max|topk_min|bottomk_avg|rollup|rate|irate|increase|delta|deriv|sum|avg|min|max|count|stddev|topk|bottomk|quantile)\s*(?:\(|by\b|without\b)",
    )
    .expect("valid function regex")
});

static TOPK: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\b(?:topk|bottomk)(?:_\w+)?\s*\(\s*(\d+)\s*,").expect("valid topk regex")
});

/// Words that look like identifiers but never name a metric
const RESERVED: &[&str] = &[
    "by", "without", "on", "ignoring", "group_left", "group_right", "offset", "bool", "and",
    "or", "unless", "inf", "nan",
];

pub struct PromQLHandler {
    dialect: Dialect,
}

impl PromQLHandler {
    pub fn promql() -> Self {
        Self {
            dialect: Dialect::PromQL,
        }
    }

    pub fn metricsql() -> Self {
        Self {
            dialect: Dialect::MetricsQL,
        }
    }

    fn functions(&self) -> &'static Regex {
        match self.dialect {
            Dialect::MetricsQL => &METRICSQL_FUNCTIONS,
            _ => &PROMQL_FUNCTIONS,
        }
    }
}

impl DialectHandler for PromQLHandler {
    fn dialect(&self) -> Dialect {
        self.dialect
    }

    fn parse(&self, query: &str) -> Result<ParsedQuery, HandlerError> {
        let query = query.trim();
        if query.is_empty() {
            return Err(HandlerError::InvalidQuery("empty expression".into()));
        }
        let mut parsed = ParsedQuery::new(self.dialect, query);

        // Leftmost selector with labels first, then a bare metric name
        if let Some(caps) = SELECTOR.captures(query) {
            let mut name = caps.get(1).map(|m| m.as_str().to_string());
            for matcher in LABEL_MATCHER.captures_iter(&caps[2]) {
                let Some(operator) = FilterOperator::from_token(&matcher[2]) else {
                    continue;
                };
                if &matcher[1] == NAME_LABEL && operator == FilterOperator::Eq && name.is_none() {
                    name = Some(matcher[3].to_string());
                    continue;
                }
                parsed.add_filter(
                    &matcher[1],
                    operator,
                    Value::String(matcher[3].replace("\\\"", "\"")),
                );
            }
            if let Some(name) = name {
                parsed.add_source(name);
            }
            set_range(&mut parsed, caps.get(3).map(|m| m.as_str()));
        } else if let Some((name, range)) = bare_metric(query) {
            parsed.add_source(name);
            set_range(&mut parsed, range);
        }

        for caps in self.functions().captures_iter(query) {
            parsed.add_aggregation(&caps[1], None);
        }

        for caps in GROUPING.captures_iter(query) {
            if &caps[1] == "by" {
                parsed.group_by.extend(
                    caps[2]
                        .split(',')
                        .map(str::trim)
                        .filter(|l| !l.is_empty())
                        .map(String::from),
                );
            }
        }

        if let Some(caps) = TOPK.captures(query) {
            parsed.limit = caps[1].parse().ok();
        }

        Ok(parsed)
    }

    /// Instant vector by default; `matrix` renders every sample of each series
    fn format_response(
        &self,
        result: &QueryResult,
        format: &str,
    ) -> Result<FormattedResponse, HandlerError> {
        let matrix = format.eq_ignore_ascii_case("matrix");
        let value_index = first_field_index(result);
        let now_secs = Utc::now().timestamp_millis() as f64 / 1000.0;

        let sample = |row: &[Value]| -> Json {
            let ts = row_time_millis(result, row)
                .map(|ms| ms as f64 / 1000.0)
                .unwrap_or(now_secs);
            let value = value_index
                .and_then(|i| row.get(i))
                .map(prometheus_sample)
                .unwrap_or_else(|| "NaN".to_string());
            json!([ts, value])
        };

        let series: Vec<Json> = group_series(result)
            .into_iter()
            .map(|(labels, rows)| {
                if matrix {
                    let values: Vec<Json> = rows.iter().copied().map(&sample).collect();
                    json!({ "metric": labels, "values": values })
                } else {
                    let latest = rows.last().copied().map(&sample).unwrap_or(Json::Null);
                    json!({ "metric": labels, "value": latest })
                }
            })
            .collect();

        let result_type = if matrix { "matrix" } else { "vector" };
        Ok(FormattedResponse::Json(json!({
            "resultType": result_type,
            "result": series,
        })))
    }
}

fn set_range(parsed: &mut ParsedQuery, range: Option<&str>) {
    if let Some(d) = range.and_then(duration::parse_prometheus) {
        parsed.time_range = Some(TimeRange::relative(d));
    }
}

/// First identifier that is neither a function call, a reserved word, a
/// duration unit nor a grouping label
fn bare_metric(query: &str) -> Option<(String, Option<&str>)> {
    let stripped = GROUPING.replace_all(query, "");
    for caps in IDENTIFIER.captures_iter(&stripped) {
        let whole = caps.get(0)?;
        let ident = &caps[1];

        let mid_token = stripped[..whole.start()]
            .chars()
            .next_back()
            .is_some_and(|c| c.is_ascii_alphanumeric() || c == '.');
        let is_call = stripped[whole.end()..].trim_start().starts_with('(');
        if mid_token || is_call || RESERVED.contains(&ident.to_ascii_lowercase().as_str()) {
            continue;
        }

        // The range literal is re-found in the original text so the returned
        // slice borrows from `query`
        let range = caps.get(2).and_then(|r| {
            query
                .find(&format!("[{}", r.as_str()))
                .map(|pos| &query[pos + 1..pos + 1 + r.as_str().len()])
        });
        return Some((ident.to_string(), range));
    }
    None
}

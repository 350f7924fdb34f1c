//! InfluxQL (InfluxDB 1.x `/query`)

use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::{json, Value as Json};

use super::duration;
use super::format::{group_series, rfc3339_millis};
use super::{Dialect, DialectHandler, FormattedResponse, HandlerError};
use crate::data::Value;
use crate::query::{FilterOperator, OrderBy, ParsedQuery, QueryResult, TimeRange};

static FROM: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"(?i)\bFROM\s+([\w"'.]+)"#).expect("valid FROM regex"));

static RELATIVE_TIME: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)WHERE\s+.*time\s*([><]=?)\s*now\(\)\s*-\s*(\d+)([smhd])")
        .expect("valid time regex")
});

static AGGREGATE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r#"(?i)\b(mean|sum|count|min|max|first|last|median|stddev|spread)\s*\(\s*["']?(\w+)["']?\s*\)"#,
    )
    .expect("valid aggregate regex")
});

static WHERE_CLAUSE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?i)\bWHERE\s+(.+?)(?:\s+(?:GROUP\s+BY|ORDER\s+BY|LIMIT|OFFSET|SLIMIT|SOFFSET|FILL|TZ)\b|$)",
    )
    .expect("valid WHERE regex")
});

static TAG_PREDICATE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r#"(?:"([^"]+)"|(\w+))\s*(=~|!~|!=|<>|=)\s*(?:'((?:[^'\\]|\\.)*)'|/((?:[^/\\]|\\.)*)/|(-?\d+(?:\.\d+)?)\b|(true|false)\b)"#,
    )
    .expect("valid predicate regex")
});

static GROUP_BY: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?i)\bGROUP\s+BY\s+(.+?)(?:\s+(?:FILL|ORDER\s+BY|LIMIT|OFFSET|SLIMIT|SOFFSET|TZ)\b|$)",
    )
    .expect("valid GROUP BY regex")
});

static TIME_BUCKET: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)^time\s*\(\s*(\d+)([smhd])\s*\)$").expect("valid time bucket regex")
});

static LIMIT: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\bLIMIT\s+(\d+)").expect("valid LIMIT regex"));

static OFFSET: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\bOFFSET\s+(\d+)").expect("valid OFFSET regex"));

static ORDER_BY: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)ORDER\s+BY\s+(\w+)(?:\s+(ASC|DESC))?").expect("valid ORDER BY regex")
});

pub struct InfluxQLHandler;

impl DialectHandler for InfluxQLHandler {
    fn dialect(&self) -> Dialect {
        Dialect::InfluxQL
    }

    fn parse(&self, query: &str) -> Result<ParsedQuery, HandlerError> {
        if query.trim().is_empty() {
            return Err(HandlerError::InvalidQuery("empty InfluxQL statement".into()));
        }
        let mut parsed = ParsedQuery::new(Dialect::InfluxQL, query);

        // FROM [db.[rp].]measurement
        if let Some(caps) = FROM.captures(query) {
            let segments: Vec<&str> = caps[1]
                .split('.')
                .map(|s| s.trim_matches(|c| c == '"' || c == '\''))
                .collect();
            if let Some(measurement) = segments.last().filter(|m| !m.is_empty()) {
                parsed.add_source(*measurement);
            }
            if segments.len() == 3 && !segments[0].is_empty() {
                parsed.database = Some(segments[0].to_string());
            }
        }

        if let Some(caps) = RELATIVE_TIME.captures(query) {
            let window = caps[2]
                .parse::<u64>()
                .ok()
                .and_then(|n| duration::from_unit(n, &caps[3]));
            if let Some(window) = window {
                parsed.time_range = Some(if caps[1].starts_with('<') {
                    TimeRange::older_than(window)
                } else {
                    TimeRange::trailing(window)
                });
            }
        }

        for caps in AGGREGATE.captures_iter(query) {
            parsed.add_aggregation(caps[1].to_lowercase(), Some(caps[2].to_string()));
        }

        if let Some(clause) = WHERE_CLAUSE.captures(query) {
            extract_predicates(&mut parsed, &clause[1]);
        }

        if let Some(caps) = GROUP_BY.captures(query) {
            for key in caps[1].split(',').map(str::trim).filter(|k| !k.is_empty()) {
                match TIME_BUCKET.captures(key) {
                    Some(bucket) => parsed
                        .group_by
                        .push(format!("time({}{})", &bucket[1], &bucket[2])),
                    None => parsed.group_by.push(key.trim_matches('"').to_string()),
                }
            }
        }

        if let Some(caps) = LIMIT.captures(query) {
            parsed.limit = caps[1].parse().ok();
        }
        if let Some(caps) = OFFSET.captures(query) {
            parsed.offset = caps[1].parse().ok();
        }

        if let Some(caps) = ORDER_BY.captures(query) {
            let ascending = caps
                .get(2)
                .map_or(true, |dir| !dir.as_str().eq_ignore_ascii_case("DESC"));
            parsed.order_by.push(OrderBy {
                column: caps[1].to_string(),
                ascending,
            });
        }

        Ok(parsed)
    }

    fn format_response(
        &self,
        result: &QueryResult,
        format: &str,
    ) -> Result<FormattedResponse, HandlerError> {
        let epoch = format.eq_ignore_ascii_case("epoch");
        let mut statement = json!({ "statement_id": 0 });

        if !result.rows.is_empty() {
            let tag_indices = result.tag_indices();
            let columns: Vec<&str> = result
                .columns
                .iter()
                .enumerate()
                .filter(|(i, _)| !tag_indices.contains(i))
                .map(|(_, c)| c.name.as_str())
                .collect();

            let series: Vec<Json> = group_series(result)
                .into_iter()
                .map(|(tags, rows)| {
                    let values: Vec<Vec<Json>> = rows
                        .iter()
                        .map(|row| {
                            row.iter()
                                .enumerate()
                                .filter(|(i, _)| !tag_indices.contains(i))
                                .map(|(i, v)| cell(v, result.columns[i].is_time && !epoch))
                                .collect()
                        })
                        .collect();

                    let mut s = json!({
                        "name": "results",
                        "columns": columns,
                        "values": values,
                    });
                    if !tags.is_empty() {
                        s["tags"] = json!(tags);
                    }
                    s
                })
                .collect();
            statement["series"] = Json::Array(series);
        }

        Ok(FormattedResponse::Json(json!({ "results": [statement] })))
    }
}

fn cell(value: &Value, as_rfc3339: bool) -> Json {
    if as_rfc3339 {
        if let Some(text) = value.as_epoch_millis().and_then(rfc3339_millis) {
            return Json::String(text);
        }
    }
    value.to_json()
}

/// Equality and regex predicates on tags/fields. Comparisons on `time` are
/// handled as the time range.
fn extract_predicates(parsed: &mut ParsedQuery, clause: &str) {
    for caps in TAG_PREDICATE.captures_iter(clause) {
        let column = match caps.get(1).or_else(|| caps.get(2)) {
            Some(c) => c.as_str(),
            None => continue,
        };
        if column.eq_ignore_ascii_case("time") {
            continue;
        }
        let Some(operator) = FilterOperator::from_token(&caps[3]) else {
            continue;
        };

        let value = if let Some(s) = caps.get(4) {
            Value::String(s.as_str().replace("\\'", "'"))
        } else if let Some(re) = caps.get(5) {
            Value::String(re.as_str().replace("\\/", "/"))
        } else if let Some(num) = caps.get(6) {
            let text = num.as_str();
            text.parse::<i64>()
                .map(Value::Int64)
                .unwrap_or_else(|_| text.parse::<f64>().map(Value::Float64).unwrap_or(Value::Null))
        } else if let Some(b) = caps.get(7) {
            Value::Bool(b.as_str() == "true")
        } else {
            continue;
        };

        parsed.add_filter(column, operator, value);
    }
}

//! Generic SQL and the SQL-speaking time-series engines.
//!
//! One handler type serves the whole family. The generic clauses (FROM,
//! WHERE, GROUP BY, ORDER BY, LIMIT/OFFSET, aggregate calls, `now() - N`
//! windows) are matched for every dialect; each engine adds patterns for its
//! own bucketing syntax and renders results in its own REST envelope.

use chrono::{SecondsFormat, TimeZone, Utc};
use once_cell::sync::Lazy;
use regex::{Captures, Regex};
use serde_json::{json, Map, Value as Json};
use std::time::Duration;

use super::duration;
use super::format::{generic_json, rfc3339, write_csv};
use super::{Dialect, DialectHandler, FormattedResponse, HandlerError};
use crate::data::Value;
use crate::query::{FilterOperator, OrderBy, ParsedQuery, QueryResult, TimeRange};

const CLAUSE_END: &str = r"(?:\s+(?:WHERE|PREWHERE|GROUP\s+BY|ORDER\s+BY|LIMIT|OFFSET|SAMPLE\s+BY|LATEST\s+ON|PARTITION\s+BY|INTERVAL|FILL|SETTINGS|FORMAT|HAVING|WINDOW|SLIMIT|SOFFSET)\b|\s*;|$)";

static FROM: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(?i)\bFROM\s+((?:"[^"]+"|`[^`]+`|\w+)(?:\.(?:"[^"]+"|`[^`]+`|\w+))*)"#)
        .expect("valid FROM regex")
});

static WHERE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(&format!(r"(?i)\bWHERE\s+(.+?){}", CLAUSE_END)).expect("valid WHERE regex")
});

static PREWHERE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(&format!(r"(?i)\bPREWHERE\s+(.+?){}", CLAUSE_END)).expect("valid PREWHERE regex")
});

static PREDICATE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r#"(?i)(?:"([^"]+)"|`([^`]+)`|\b([a-z_][\w.]*))\s*(!~\*?|~\*?|!=|<>|=)\s*(?:'((?:[^']|'')*)'|(-?\d+(?:\.\d+)?)\b|(true|false)\b)"#,
    )
    .expect("valid predicate regex")
});

static RELATIVE_TIME: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?i)(?:now\(\)|\bNOW\b|\bCURRENT_TIMESTAMP\b)\s*-\s*(?:INTERVAL\s*'(\d+)\s*([a-z]+)'|INTERVAL\s*'(\d+)'\s*([a-z]+)|INTERVAL\s+(\d+)\s+([a-z]+)|(\d+)([smhdw])\b)",
    )
    .expect("valid relative time regex")
});

static AGGREGATE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r#"(?i)\b(count|sum|avg|min|max|first|last|last_row|mean|median|stddev|spread|twa|approx_count_distinct|uniq|percentile|quantile)\s*\(\s*(?:DISTINCT\s+)?([^()]*?)\s*\)(?:\s+AS\s+"?(\w+)"?)?"#,
    )
    .expect("valid aggregate regex")
});

static GROUP_BY: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\bGROUP\s+BY\s+(.+?)(?:\s+(?:HAVING|ORDER\s+BY|LIMIT|OFFSET|FILL|WITH|SETTINGS|FORMAT)\b|\s*;|$)")
        .expect("valid GROUP BY regex")
});

static ORDER_BY: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\bORDER\s+BY\s+(.+?)(?:\s+(?:LIMIT|OFFSET|FILL|SETTINGS|FORMAT)\b|\s*;|$)")
        .expect("valid ORDER BY regex")
});

static ORDER_KEY: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(?i)^"?([\w.]+)"?(?:\s+(ASC|DESC))?"#).expect("valid order key regex")
});

static LIMIT: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\bLIMIT\s+(\d+)(?:\s*,\s*(\d+))?").expect("valid LIMIT regex")
});

static OFFSET: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\bOFFSET\s+(\d+)").expect("valid OFFSET regex"));

// TDengine
static TD_INTERVAL: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\bINTERVAL\s*\(\s*(\d+)([smhdw])\s*[,)]").expect("valid INTERVAL regex")
});
static TD_PARTITION: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\bPARTITION\s+BY\s+([\w\s,]+?)(?:\s+(?:INTERVAL|ORDER|LIMIT|SLIMIT|FILL|STATE_WINDOW|SESSION|EVENT_WINDOW)\b|\s*;|$)")
        .expect("valid PARTITION BY regex")
});
static TD_STABLE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\bCREATE\s+STABLE\s+(?:IF\s+NOT\s+EXISTS\s+)?([\w.]+)").expect("valid STABLE regex")
});

// TimescaleDB
static TIME_BUCKET: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\btime_bucket(?:_gapfill)?\s*\(\s*(?:INTERVAL\s*)?'(\d+)\s*([a-z]+)'")
        .expect("valid time_bucket regex")
});

// QuestDB
static SAMPLE_BY: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\bSAMPLE\s+BY\s+(\d+)([smhdw])\b").expect("valid SAMPLE BY regex")
});
static LATEST_ON: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\bLATEST\s+ON\s+(\w+)\s+PARTITION\s+BY\s+([\w\s,]+?)(?:\s+(?:WHERE|ORDER|LIMIT)\b|\s*;|$)")
        .expect("valid LATEST ON regex")
});

// ClickHouse
static START_OF: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\btoStartOf(Minute|FiveMinutes?|FifteenMinutes|Hour|Day|Week)\s*\(").expect("valid toStartOf regex")
});
static START_OF_INTERVAL: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\btoStartOfInterval\s*\(\s*\w+\s*,\s*INTERVAL\s+(\d+)\s+([a-z]+)\s*\)")
        .expect("valid toStartOfInterval regex")
});

// Druid SQL
static TIME_FLOOR: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\bTIME_FLOOR\s*\(\s*__time\s*,\s*'([^']+)'").expect("valid TIME_FLOOR regex")
});
static FLOOR_TO: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\bFLOOR\s*\(\s*__time\s+TO\s+([a-z]+)\s*\)").expect("valid FLOOR regex")
});

/// Handler for generic SQL and the SQL-speaking engines
pub struct SqlHandler {
    dialect: Dialect,
}

impl SqlHandler {
    pub fn new(dialect: Dialect) -> Self {
        Self { dialect }
    }

    /// Engine-specific time bucket, rendered as `time(<duration>)`
    fn time_bucket(&self, query: &str) -> Option<Duration> {
        match self.dialect {
            Dialect::TDengine => TD_INTERVAL.captures(query).and_then(|c| unit_pair(&c, 1, 2)),
            Dialect::TimescaleDB => TIME_BUCKET.captures(query).and_then(|c| unit_pair(&c, 1, 2)),
            Dialect::QuestDB => SAMPLE_BY.captures(query).and_then(|c| unit_pair(&c, 1, 2)),
            Dialect::ClickHouse => START_OF_INTERVAL
                .captures(query)
                .and_then(|c| unit_pair(&c, 1, 2))
                .or_else(|| {
                    START_OF.captures(query).and_then(|c| {
                        match c[1].to_ascii_lowercase().as_str() {
                            "minute" => Some(Duration::from_secs(60)),
                            "fiveminute" | "fiveminutes" => Some(Duration::from_secs(300)),
                            "fifteenminutes" => Some(Duration::from_secs(900)),
                            "hour" => Some(Duration::from_secs(3600)),
                            "day" => Some(Duration::from_secs(86_400)),
                            "week" => Some(Duration::from_secs(604_800)),
                            _ => None,
                        }
                    })
                }),
            Dialect::DruidSQL => TIME_FLOOR
                .captures(query)
                .and_then(|c| duration::parse_iso8601(&c[1]))
                .or_else(|| {
                    FLOOR_TO
                        .captures(query)
                        .and_then(|c| duration::from_unit_word(1, &c[1]))
                }),
            _ => None,
        }
    }

    fn engine_extensions(&self, parsed: &mut ParsedQuery, query: &str) {
        match self.dialect {
            Dialect::TDengine => {
                if let Some(caps) = TD_PARTITION.captures(query) {
                    parsed.group_by.extend(split_list(&caps[1]));
                }
                if parsed.sources.is_empty() {
                    if let Some(caps) = TD_STABLE.captures(query) {
                        set_source(parsed, &caps[1]);
                    }
                }
            }
            Dialect::QuestDB => {
                if let Some(caps) = LATEST_ON.captures(query) {
                    parsed.group_by.extend(split_list(&caps[2]));
                    parsed.add_aggregation("latest", Some(caps[1].to_string()));
                }
            }
            Dialect::ClickHouse => {
                if let Some(caps) = PREWHERE.captures(query) {
                    extract_predicates(parsed, &caps[1]);
                }
            }
            _ => {}
        }
    }
}

impl DialectHandler for SqlHandler {
    fn dialect(&self) -> Dialect {
        self.dialect
    }

    fn parse(&self, query: &str) -> Result<ParsedQuery, HandlerError> {
        let query = query.trim();
        if query.is_empty() {
            return Err(HandlerError::InvalidQuery("empty SQL statement".into()));
        }
        let mut parsed = ParsedQuery::new(self.dialect, query);

        if let Some(caps) = FROM.captures(query) {
            set_source(&mut parsed, &caps[1]);
        }

        self.engine_extensions(&mut parsed, query);

        if let Some(caps) = WHERE.captures(query) {
            extract_predicates(&mut parsed, &caps[1]);
        }

        if let Some(caps) = RELATIVE_TIME.captures(query) {
            let window = [(1, 2), (3, 4), (5, 6), (7, 8)]
                .into_iter()
                .find_map(|(n, unit)| unit_pair(&caps, n, unit));
            if let Some(window) = window {
                parsed.time_range = Some(TimeRange::trailing(window));
            }
        }

        for caps in AGGREGATE.captures_iter(query) {
            let column = caps
                .get(2)
                .map(|m| m.as_str().trim_matches('"'))
                .filter(|c| !c.is_empty() && *c != "*")
                .map(String::from);
            parsed.add_aggregation(caps[1].to_lowercase(), column);
            if let (Some(alias), Some(agg)) = (caps.get(3), parsed.aggregations.last_mut()) {
                agg.alias = Some(alias.as_str().to_string());
            }
        }

        let bucket = self.time_bucket(query);
        if let Some(bucket) = bucket {
            parsed
                .group_by
                .insert(0, format!("time({})", duration::format_short(bucket)));
        }
        if let Some(caps) = GROUP_BY.captures(query) {
            for key in split_list(&caps[1]) {
                if bucket.is_some() && is_bucket_expression(&key) {
                    continue;
                }
                parsed.group_by.push(key);
            }
        }

        if let Some(caps) = ORDER_BY.captures(query) {
            for key in split_list(&caps[1]) {
                if let Some(k) = ORDER_KEY.captures(&key) {
                    parsed.order_by.push(OrderBy {
                        column: k[1].to_string(),
                        ascending: !k.get(2).is_some_and(|d| d.as_str().eq_ignore_ascii_case("DESC")),
                    });
                }
            }
        }

        if let Some(caps) = LIMIT.captures(query) {
            let first: Option<u64> = caps[1].parse().ok();
            match caps.get(2).and_then(|m| m.as_str().parse::<u64>().ok()) {
                // QuestDB reads `LIMIT lo, hi` as a row range
                Some(hi) if self.dialect == Dialect::QuestDB => {
                    let lo = first.unwrap_or(0);
                    parsed.offset = Some(lo);
                    parsed.limit = Some(hi.saturating_sub(lo));
                }
                Some(count) => {
                    parsed.offset = first;
                    parsed.limit = Some(count);
                }
                None => parsed.limit = first,
            }
        }
        if let Some(caps) = OFFSET.captures(query) {
            parsed.offset = caps[1].parse().ok();
        }

        Ok(parsed)
    }

    fn format_response(
        &self,
        result: &QueryResult,
        format: &str,
    ) -> Result<FormattedResponse, HandlerError> {
        if format.eq_ignore_ascii_case("csv") {
            let rows = result
                .rows
                .iter()
                .map(|row| row.iter().map(Value::to_string).collect());
            let header = result.column_names();
            return write_csv(Some(header.as_slice()), rows, csv::Terminator::Any(b'\n'))
                .map(FormattedResponse::Text);
        }

        let body = match self.dialect {
            Dialect::TDengine => tdengine_json(result),
            Dialect::QuestDB => questdb_json(result),
            Dialect::ClickHouse => clickhouse_json(result),
            Dialect::DruidSQL => Json::Array(
                result
                    .rows
                    .iter()
                    .map(|row| row_object(result, row, |ms| rfc3339(ms, SecondsFormat::Millis)))
                    .collect(),
            ),
            _ => generic_json(result),
        };
        Ok(FormattedResponse::Json(body))
    }
}

/// TDengine REST: `{code, column_meta: [[name, type, len]], data, rows}`
fn tdengine_json(result: &QueryResult) -> Json {
    let column_meta: Vec<Json> = result
        .columns
        .iter()
        .enumerate()
        .map(|(i, col)| {
            let (ty, len) = match col.data_type.as_str() {
                _ if col.is_time => ("TIMESTAMP", 8),
                "timestamp" => ("TIMESTAMP", 8),
                "float64" => ("DOUBLE", 8),
                "int64" => ("BIGINT", 8),
                "bool" => ("BOOL", 1),
                _ => {
                    let widest = result
                        .rows
                        .iter()
                        .filter_map(|row| row.get(i))
                        .map(|v| v.to_string().len())
                        .max()
                        .unwrap_or(0);
                    ("VARCHAR", widest.max(1))
                }
            };
            json!([col.name, ty, len])
        })
        .collect();

    json!({
        "code": 0,
        "column_meta": column_meta,
        "data": render_rows(result, |ms| rfc3339(ms, SecondsFormat::Millis)),
        "rows": result.row_count(),
    })
}

/// QuestDB `/exec`: `{columns: [{name, type}], timestamp, dataset, count}`
fn questdb_json(result: &QueryResult) -> Json {
    let columns: Vec<Json> = result
        .columns
        .iter()
        .map(|col| {
            let ty = match col.data_type.as_str() {
                _ if col.is_time => "TIMESTAMP",
                _ if col.is_tag => "SYMBOL",
                "timestamp" => "TIMESTAMP",
                "float64" => "DOUBLE",
                "int64" => "LONG",
                "bool" => "BOOLEAN",
                _ => "STRING",
            };
            json!({ "name": col.name, "type": ty })
        })
        .collect();

    let timestamp = result.time_index().map_or(-1, |i| i as i64);
    json!({
        "columns": columns,
        "timestamp": timestamp,
        "dataset": render_rows(result, |ms| rfc3339(ms, SecondsFormat::Micros)),
        "count": result.row_count(),
    })
}

/// ClickHouse `FORMAT JSON`: `{meta, data, rows, statistics}`
fn clickhouse_json(result: &QueryResult) -> Json {
    let meta: Vec<Json> = result
        .columns
        .iter()
        .map(|col| {
            let ty = match col.data_type.as_str() {
                _ if col.is_time => "DateTime64(3)",
                "timestamp" => "DateTime64(3)",
                "float64" => "Float64",
                "int64" => "Int64",
                "bool" => "Bool",
                _ => "String",
            };
            json!({ "name": col.name, "type": ty })
        })
        .collect();

    let clickhouse_time = |ms: i64| {
        Utc.timestamp_millis_opt(ms)
            .single()
            .map(|t| t.format("%Y-%m-%d %H:%M:%S%.3f").to_string())
    };
    let data: Vec<Json> = result
        .rows
        .iter()
        .map(|row| row_object(result, row, clickhouse_time))
        .collect();

    json!({
        "meta": meta,
        "data": data,
        "rows": result.row_count(),
        "statistics": {
            "elapsed": result.stats.execution_time_ms / 1000.0,
            "rows_read": result.stats.rows_scanned,
            "bytes_read": result.stats.bytes_scanned,
        }
    })
}

fn render_cell(result: &QueryResult, i: usize, value: &Value, time: &impl Fn(i64) -> Option<String>) -> Json {
    if result.columns.get(i).is_some_and(|c| c.is_time) {
        if let Some(text) = value.as_epoch_millis().and_then(time) {
            return Json::String(text);
        }
    }
    value.to_json()
}

fn render_rows(result: &QueryResult, time: impl Fn(i64) -> Option<String>) -> Vec<Vec<Json>> {
    result
        .rows
        .iter()
        .map(|row| {
            row.iter()
                .enumerate()
                .map(|(i, v)| render_cell(result, i, v, &time))
                .collect()
        })
        .collect()
}

fn row_object(result: &QueryResult, row: &[Value], time: impl Fn(i64) -> Option<String>) -> Json {
    let obj: Map<String, Json> = result
        .columns
        .iter()
        .enumerate()
        .zip(row.iter())
        .map(|((i, col), v)| (col.name.clone(), render_cell(result, i, v, &time)))
        .collect();
    Json::Object(obj)
}

/// `db.table` / `"db"."table"` / `` `db`.`table` ``
fn set_source(parsed: &mut ParsedQuery, qualified: &str) {
    let segments = split_qualified(qualified);
    let Some(name) = segments.last() else {
        return;
    };
    parsed.add_source(name.clone());
    if segments.len() >= 2 {
        let database = segments[segments.len() - 2].clone();
        if let Some(source) = parsed.sources.last_mut() {
            source.database = Some(database.clone());
        }
        parsed.database.get_or_insert(database);
    }
}

fn split_qualified(s: &str) -> Vec<String> {
    let mut segments = Vec::new();
    let mut current = String::new();
    let mut quote: Option<char> = None;
    for c in s.chars() {
        match (quote, c) {
            (Some(q), c) if c == q => quote = None,
            (Some(_), c) => current.push(c),
            (None, '"' | '`') => quote = Some(c),
            (None, '.') => segments.push(std::mem::take(&mut current)),
            (None, c) => current.push(c),
        }
    }
    segments.push(current);
    segments.retain(|s| !s.is_empty());
    segments
}

/// Comma-separated list, ignoring commas nested in parentheses
fn split_list(s: &str) -> Vec<String> {
    let mut items = Vec::new();
    let mut depth = 0usize;
    let mut current = String::new();
    for c in s.chars() {
        match c {
            '(' => depth += 1,
            ')' => depth = depth.saturating_sub(1),
            ',' if depth == 0 => {
                items.push(std::mem::take(&mut current));
                continue;
            }
            _ => {}
        }
        current.push(c);
    }
    items.push(current);
    items
        .into_iter()
        .map(|i| i.trim().trim_matches('"').to_string())
        .filter(|i| !i.is_empty())
        .collect()
}

fn is_bucket_expression(key: &str) -> bool {
    let lower = key.to_ascii_lowercase();
    ["time_bucket", "tostartof", "time_floor", "floor("]
        .iter()
        .any(|prefix| lower.starts_with(prefix))
}

fn unit_pair(caps: &Captures<'_>, value: usize, unit: usize) -> Option<Duration> {
    let n = caps.get(value)?.as_str().parse::<u64>().ok()?;
    duration::from_unit_word(n, caps.get(unit)?.as_str())
}

/// Equality, inequality and regex predicates of a WHERE-like clause
fn extract_predicates(parsed: &mut ParsedQuery, clause: &str) {
    for caps in PREDICATE.captures_iter(clause) {
        let Some(column) = caps.get(1).or_else(|| caps.get(2)).or_else(|| caps.get(3)) else {
            continue;
        };
        let column = column.as_str().rsplit('.').next().unwrap_or(column.as_str());
        let operator = match &caps[4] {
            "~" | "~*" => FilterOperator::RegexMatch,
            "!~" | "!~*" => FilterOperator::RegexNotMatch,
            token => match FilterOperator::from_token(token) {
                Some(op) => op,
                None => continue,
            },
        };
        let value = if let Some(s) = caps.get(5) {
            Value::String(s.as_str().replace("''", "'"))
        } else if let Some(num) = caps.get(6) {
            let text = num.as_str();
            text.parse::<i64>()
                .map(Value::Int64)
                .or_else(|_| text.parse::<f64>().map(Value::Float64))
                .unwrap_or(Value::Null)
        } else if let Some(b) = caps.get(7) {
            Value::Bool(b.as_str().eq_ignore_ascii_case("true"))
        } else {
            continue;
        };
        parsed.add_filter(column, operator, value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dialect::format::fixtures::host_series;
    use proptest::prelude::*;

    #[test]
    fn test_generic_sql_clauses() {
        let parsed = SqlHandler::new(Dialect::SQL)
            .parse("SELECT host, avg(usage) AS avg_usage FROM metrics.cpu WHERE host = 'web-1' AND region <> 'eu' GROUP BY host ORDER BY avg_usage DESC, host LIMIT 10 OFFSET 5")
            .unwrap();

        assert_eq!(parsed.primary_source(), Some("cpu"));
        assert_eq!(parsed.database.as_deref(), Some("metrics"));
        assert_eq!(parsed.filters.len(), 2);
        assert_eq!(parsed.filters[0].value, Value::from("web-1"));
        assert_eq!(parsed.filters[1].operator, FilterOperator::NotEq);
        assert_eq!(parsed.aggregations[0].function, "avg");
        assert_eq!(parsed.aggregations[0].column.as_deref(), Some("usage"));
        assert_eq!(parsed.aggregations[0].alias.as_deref(), Some("avg_usage"));
        assert_eq!(parsed.group_by, vec!["host"]);
        assert_eq!(parsed.order_by.len(), 2);
        assert!(!parsed.order_by[0].ascending);
        assert!(parsed.order_by[1].ascending);
        assert_eq!(parsed.limit, Some(10));
        assert_eq!(parsed.offset, Some(5));
    }

    #[test]
    fn test_tdengine_extensions() {
        let parsed = SqlHandler::new(Dialect::TDengine)
            .parse("SELECT _wstart, avg(current) FROM power.meters WHERE location = 'SF' AND ts > NOW - 1h PARTITION BY tbname INTERVAL(10m) FILL(PREV)")
            .unwrap();

        assert_eq!(parsed.primary_source(), Some("meters"));
        assert_eq!(parsed.database.as_deref(), Some("power"));
        assert_eq!(parsed.filters.len(), 1);
        assert_eq!(parsed.filters[0].column, "location");
        assert_eq!(
            parsed.time_range.unwrap().span(),
            Some(Duration::from_secs(3600))
        );
        assert_eq!(parsed.group_by, vec!["time(10m)", "tbname"]);

        let parsed = SqlHandler::new(Dialect::TDengine)
            .parse("CREATE STABLE meters (ts TIMESTAMP, value FLOAT) TAGS (location NCHAR(20))")
            .unwrap();
        assert_eq!(parsed.primary_source(), Some("meters"));
    }

    #[test]
    fn test_timescale_extensions() {
        let parsed = SqlHandler::new(Dialect::TimescaleDB)
            .parse("SELECT time_bucket('5 minutes', time) AS bucket, avg(temperature) FROM conditions WHERE device = 'd1' AND time > now() - interval '1 hour' GROUP BY bucket ORDER BY bucket")
            .unwrap();

        assert_eq!(parsed.primary_source(), Some("conditions"));
        assert_eq!(parsed.group_by, vec!["time(5m)", "bucket"]);
        assert_eq!(parsed.filters.len(), 1);
        assert_eq!(
            parsed.time_range.unwrap().span(),
            Some(Duration::from_secs(3600))
        );
        assert_eq!(parsed.order_by[0].column, "bucket");
    }

    #[test]
    fn test_questdb_extensions() {
        let handler = SqlHandler::new(Dialect::QuestDB);
        let parsed = handler
            .parse("SELECT ts, symbol, avg(price) FROM trades WHERE symbol = 'BTC-USD' SAMPLE BY 1h LIMIT 10, 30")
            .unwrap();
        assert_eq!(parsed.group_by, vec!["time(1h)"]);
        assert_eq!(parsed.filters[0].value, Value::from("BTC-USD"));
        assert_eq!(parsed.offset, Some(10));
        assert_eq!(parsed.limit, Some(20));

        let parsed = handler
            .parse("SELECT * FROM trades LATEST ON ts PARTITION BY symbol, side")
            .unwrap();
        assert_eq!(parsed.group_by, vec!["symbol", "side"]);
        assert_eq!(parsed.aggregations[0].function, "latest");
        assert_eq!(parsed.aggregations[0].column.as_deref(), Some("ts"));
    }

    #[test]
    fn test_clickhouse_extensions() {
        let parsed = SqlHandler::new(Dialect::ClickHouse)
            .parse("SELECT toStartOfHour(ts) AS hour, count() FROM logs.hits FINAL PREWHERE site_id = 42 WHERE status != 200 AND ts > now() - INTERVAL 1 DAY GROUP BY hour LIMIT 100")
            .unwrap();

        assert_eq!(parsed.primary_source(), Some("hits"));
        assert_eq!(parsed.database.as_deref(), Some("logs"));
        assert_eq!(parsed.filters.len(), 2);
        assert_eq!(parsed.filters[0].column, "site_id");
        assert_eq!(parsed.filters[0].value, Value::Int64(42));
        assert_eq!(parsed.filters[1].operator, FilterOperator::NotEq);
        assert_eq!(
            parsed.time_range.unwrap().span(),
            Some(Duration::from_secs(86_400))
        );
        assert_eq!(parsed.group_by, vec!["time(1h)", "hour"]);
        assert_eq!(parsed.aggregations[0].function, "count");
        assert!(parsed.aggregations[0].column.is_none());
        assert_eq!(parsed.limit, Some(100));
    }

    #[test]
    fn test_druid_sql_extensions() {
        let parsed = SqlHandler::new(Dialect::DruidSQL)
            .parse(r#"SELECT TIME_FLOOR(__time, 'PT1H') AS t, channel, COUNT(*) AS edits FROM "wikipedia" WHERE channel = '#en.wikipedia' AND __time >= CURRENT_TIMESTAMP - INTERVAL '1' DAY GROUP BY 1, 2 ORDER BY edits DESC LIMIT 5"#)
            .unwrap();

        assert_eq!(parsed.primary_source(), Some("wikipedia"));
        assert_eq!(parsed.filters[0].value, Value::from("#en.wikipedia"));
        assert_eq!(
            parsed.time_range.unwrap().span(),
            Some(Duration::from_secs(86_400))
        );
        assert_eq!(parsed.group_by, vec!["time(1h)", "1", "2"]);
        assert_eq!(parsed.aggregations[0].function, "count");
        assert_eq!(parsed.aggregations[0].alias.as_deref(), Some("edits"));
        assert_eq!(parsed.limit, Some(5));
    }

    #[test]
    fn test_druid_sql_oversized_time_floor() {
        let parsed = SqlHandler::new(Dialect::DruidSQL)
            .parse("SELECT TIME_FLOOR(__time, 'P99999999999999Y') AS t, COUNT(*) FROM events GROUP BY 1")
            .unwrap();
        assert_eq!(parsed.primary_source(), Some("events"));
        assert!(!parsed.group_by.iter().any(|g| g.starts_with("time(")));
    }

    #[test]
    fn test_native_envelopes() {
        let result = host_series();

        let out = SqlHandler::new(Dialect::SQL).format_response(&result, "json").unwrap();
        assert_eq!(out.as_json().unwrap()["columns"], json!(["time", "host", "value"]));

        let out = SqlHandler::new(Dialect::TDengine).format_response(&result, "").unwrap();
        let td = out.as_json().unwrap();
        assert_eq!(td["code"], 0);
        assert_eq!(td["rows"], 4);
        assert_eq!(td["column_meta"][0], json!(["time", "TIMESTAMP", 8]));
        assert_eq!(td["column_meta"][1], json!(["host", "VARCHAR", 1]));
        assert_eq!(td["data"][0][0], "2023-11-14T22:13:20.000Z");

        let out = SqlHandler::new(Dialect::QuestDB).format_response(&result, "").unwrap();
        let qdb = out.as_json().unwrap();
        assert_eq!(qdb["columns"][1], json!({"name": "host", "type": "SYMBOL"}));
        assert_eq!(qdb["timestamp"], 0);
        assert_eq!(qdb["count"], 4);
        assert_eq!(qdb["dataset"][0][0], "2023-11-14T22:13:20.000000Z");

        let out = SqlHandler::new(Dialect::ClickHouse).format_response(&result, "").unwrap();
        let ch = out.as_json().unwrap();
        assert_eq!(ch["meta"][2], json!({"name": "value", "type": "Float64"}));
        assert_eq!(ch["data"][0]["time"], "2023-11-14 22:13:20.000");
        assert_eq!(ch["statistics"]["rows_read"], 100);

        let out = SqlHandler::new(Dialect::DruidSQL).format_response(&result, "").unwrap();
        let druid = out.as_json().unwrap();
        assert_eq!(druid[3], json!({"time": "2023-11-14T22:14:20.000Z", "host": "b", "value": 8.0}));
    }

    #[test]
    fn test_csv_format() {
        let out = SqlHandler::new(Dialect::SQL)
            .format_response(&host_series(), "csv")
            .unwrap();
        assert!(out.as_text().unwrap().starts_with("time,host,value\n1700000000000,a,1.5\n"));
    }

    proptest! {
        #[test]
        fn prop_round_trip_source_filter_limit(
            dialect_idx in 0usize..6,
            source in "t_[a-z0-9_]{1,10}",
            column in "c_[a-z0-9_]{1,8}",
            value in "[a-zA-Z0-9_.:-]{0,16}",
            limit in 1u64..100_000,
        ) {
            let dialect = [
                Dialect::SQL,
                Dialect::TDengine,
                Dialect::TimescaleDB,
                Dialect::QuestDB,
                Dialect::ClickHouse,
                Dialect::DruidSQL,
            ][dialect_idx];
            let query = format!("SELECT * FROM {} WHERE {} = '{}' LIMIT {}", source, column, value, limit);
            let parsed = SqlHandler::new(dialect).parse(&query).unwrap();
            prop_assert_eq!(parsed.primary_source(), Some(source.as_str()));
            prop_assert_eq!(parsed.filters.len(), 1);
            prop_assert_eq!(&parsed.filters[0].column, &column);
            prop_assert_eq!(&parsed.filters[0].value, &Value::String(value));
            prop_assert_eq!(parsed.limit, Some(limit));
        }
    }
}

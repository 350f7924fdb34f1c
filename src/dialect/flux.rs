//! Flux (InfluxDB 2.x `/api/v2/query`)

use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;

use super::duration;
use super::format::{group_series, rfc3339_millis, write_csv};
use super::{Dialect, DialectHandler, FormattedResponse, HandlerError};
use crate::data::Value;
use crate::query::{DataSource, FilterOperator, OrderBy, ParsedQuery, QueryResult, TimeRange};

static BUCKET: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"from\s*\(\s*bucket\s*:\s*"([^"]+)"\s*\)"#).expect("valid bucket regex")
});

static RELATIVE_RANGE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\|>\s*range\s*\(\s*start\s*:\s*(-?\d+[smhd])").expect("valid range regex")
});

static ABSOLUTE_RANGE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"\|>\s*range\s*\(\s*start\s*:\s*(\d{4}-\d{2}-\d{2}T[^,\s)]+)(?:\s*,\s*stop\s*:\s*(\d{4}-\d{2}-\d{2}T[^,\s)]+))?",
    )
    .expect("valid absolute range regex")
});

static MEASUREMENT: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"r\._measurement\s*==\s*"([^"]+)""#).expect("valid measurement regex")
});

static PREDICATE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r#"\br(?:\.(\w+)|\["([^"]+)"\])\s*(==|!=|=~|!~)\s*(?:"((?:[^"\\]|\\.)*)"|/((?:[^/\\]|\\.)*)/|(-?\d+(?:\.\d+)?))"#,
    )
    .expect("valid predicate regex")
});

static AGGREGATE_WINDOW: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\|>\s*aggregateWindow\s*\(\s*every\s*:\s*(\d+)([smhd])\s*,\s*fn\s*:\s*(\w+)")
        .expect("valid aggregateWindow regex")
});

static BARE_AGGREGATE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\|>\s*(mean|sum|count|min|max|first|last|median|stddev|spread)\s*\(")
        .expect("valid aggregate regex")
});

static GROUP: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\|>\s*group\s*\(\s*columns\s*:\s*\[([^\]]*)\]").expect("valid group regex")
});

static SORT: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\|>\s*sort\s*\(\s*columns\s*:\s*\[([^\]]*)\](?:\s*,\s*desc\s*:\s*(true|false))?")
        .expect("valid sort regex")
});

static LIMIT: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\|>\s*limit\s*\(\s*n\s*:\s*(\d+)(?:\s*,\s*offset\s*:\s*(\d+))?\s*\)")
        .expect("valid limit regex")
});

pub struct FluxHandler;

impl DialectHandler for FluxHandler {
    fn dialect(&self) -> Dialect {
        Dialect::Flux
    }

    fn parse(&self, query: &str) -> Result<ParsedQuery, HandlerError> {
        let query = query.trim();
        if query.is_empty() {
            return Err(HandlerError::InvalidQuery("empty Flux script".into()));
        }
        let mut parsed = ParsedQuery::new(Dialect::Flux, query);

        let bucket = BUCKET.captures(query).map(|caps| caps[1].to_string());
        parsed.database = bucket.clone();

        if let Some(caps) = RELATIVE_RANGE.captures(query) {
            if let Some(d) = duration::parse_simple(&caps[1]).filter(|d| !d.is_zero()) {
                parsed.time_range = Some(TimeRange::relative(d));
            }
        } else if let Some(caps) = ABSOLUTE_RANGE.captures(query) {
            if let Some(start) = parse_instant(&caps[1]) {
                let end = caps.get(2).and_then(|m| parse_instant(m.as_str())).unwrap_or_else(Utc::now);
                parsed.time_range = Some(TimeRange::absolute(start, end));
            }
        }

        match MEASUREMENT.captures(query) {
            Some(caps) => parsed.add_source(&caps[1]),
            None => {
                if let Some(bucket) = bucket {
                    let mut source = DataSource::named(bucket.clone());
                    source.database = Some(bucket);
                    parsed.sources.push(source);
                }
            }
        }

        for caps in PREDICATE.captures_iter(query) {
            let Some(column) = caps.get(1).or_else(|| caps.get(2)).map(|m| m.as_str()) else {
                continue;
            };
            if column == "_measurement" {
                continue;
            }
            let Some(operator) = FilterOperator::from_token(&caps[3]) else {
                continue;
            };
            let value = if let Some(s) = caps.get(4) {
                Value::String(s.as_str().replace("\\\"", "\""))
            } else if let Some(re) = caps.get(5) {
                Value::String(re.as_str().to_string())
            } else if let Some(num) = caps.get(6) {
                Value::from_json(&serde_json::from_str(num.as_str()).unwrap_or_default())
            } else {
                continue;
            };
            parsed.add_filter(column, operator, value);
        }

        if let Some(caps) = AGGREGATE_WINDOW.captures(query) {
            parsed.group_by.push(format!("time({}{})", &caps[1], &caps[2]));
            parsed.add_aggregation(&caps[3], Some("_value".to_string()));
        }
        for caps in BARE_AGGREGATE.captures_iter(query) {
            parsed.add_aggregation(&caps[1], Some("_value".to_string()));
        }

        if let Some(caps) = GROUP.captures(query) {
            parsed.group_by.extend(string_list(&caps[1]));
        }

        if let Some(caps) = SORT.captures(query) {
            let ascending = caps.get(2).map_or(true, |d| d.as_str() != "true");
            for column in string_list(&caps[1]) {
                parsed.order_by.push(OrderBy { column, ascending });
            }
        }

        if let Some(caps) = LIMIT.captures(query) {
            parsed.limit = caps[1].parse().ok();
            parsed.offset = caps.get(2).and_then(|m| m.as_str().parse().ok());
        }

        Ok(parsed)
    }

    /// Annotated-CSV-style output: one table per tag set, CRLF line endings.
    /// The requested format is ignored; Flux clients only read CSV.
    fn format_response(
        &self,
        result: &QueryResult,
        _format: &str,
    ) -> Result<FormattedResponse, HandlerError> {
        let mut header = vec![String::new(), "result".to_string(), "table".to_string()];
        header.extend(result.column_names());

        let rows = group_series(result)
            .into_iter()
            .enumerate()
            .flat_map(|(table, (_, rows))| {
                rows.into_iter().map(move |row| {
                    let mut line = vec![String::new(), "_result".to_string(), table.to_string()];
                    line.extend(row.iter().enumerate().map(|(i, v)| {
                        let is_time = result.columns.get(i).is_some_and(|c| c.is_time);
                        render_cell(v, is_time)
                    }));
                    line
                })
            });

        write_csv(Some(header.as_slice()), rows, csv::Terminator::CRLF).map(FormattedResponse::Text)
    }
}

fn render_cell(value: &Value, is_time: bool) -> String {
    if is_time {
        if let Some(text) = value.as_epoch_millis().and_then(rfc3339_millis) {
            return text;
        }
    }
    value.to_string()
}

fn parse_instant(s: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .ok()
        .map(|t| t.with_timezone(&Utc))
}

/// `"a", "b"` → `[a, b]`
fn string_list(s: &str) -> Vec<String> {
    s.split(',')
        .map(|item| item.trim().trim_matches('"').to_string())
        .filter(|item| !item.is_empty())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dialect::format::fixtures::host_series;
    use proptest::prelude::*;
    use std::time::Duration;

    #[test]
    fn test_parse_documented_example() {
        let parsed = FluxHandler
            .parse(r#"from(bucket:"b") |> range(start: -1h) |> aggregateWindow(every: 5m, fn: mean) |> limit(n: 50)"#)
            .unwrap();

        assert_eq!(parsed.database.as_deref(), Some("b"));
        let range = parsed.time_range.as_ref().unwrap();
        assert_eq!(range.duration, Some(Duration::from_secs(3600)));
        assert!(range.start.is_none());
        assert_eq!(parsed.limit, Some(50));
        assert_eq!(parsed.group_by, vec!["time(5m)"]);
        assert_eq!(parsed.aggregations[0].function, "mean");
        assert_eq!(parsed.aggregations[0].column.as_deref(), Some("_value"));
        // No measurement predicate: the bucket stands in as the source
        assert_eq!(parsed.primary_source(), Some("b"));
    }

    #[test]
    fn test_parse_predicates_group_and_sort() {
        let parsed = FluxHandler
            .parse(
                r#"from(bucket: "telegraf")
                  |> range(start: 2024-01-01T00:00:00Z, stop: 2024-01-02T00:00:00Z)
                  |> filter(fn: (r) => r._measurement == "cpu" and r["host"] == "web-1" and r.region =~ /us-.*/)
                  |> group(columns: ["host"])
                  |> sort(columns: ["_time"], desc: true)
                  |> max()
                  |> limit(n: 10, offset: 5)"#,
            )
            .unwrap();

        assert_eq!(parsed.primary_source(), Some("cpu"));
        assert_eq!(parsed.database.as_deref(), Some("telegraf"));
        let range = parsed.time_range.as_ref().unwrap();
        assert_eq!(range.span(), Some(Duration::from_secs(86_400)));
        assert_eq!(parsed.filters.len(), 2);
        assert_eq!(parsed.filters[0].column, "host");
        assert_eq!(parsed.filters[1].operator, FilterOperator::RegexMatch);
        assert_eq!(parsed.group_by, vec!["host"]);
        assert_eq!(parsed.order_by[0].column, "_time");
        assert!(!parsed.order_by[0].ascending);
        assert_eq!(parsed.aggregations[0].function, "max");
        assert_eq!(parsed.limit, Some(10));
        assert_eq!(parsed.offset, Some(5));
    }

    #[test]
    fn test_format_is_always_csv() {
        let out = FluxHandler.format_response(&host_series(), "json").unwrap();
        let text = out.as_text().unwrap();
        let lines: Vec<&str> = text.split("\r\n").collect();

        assert_eq!(lines[0], ",result,table,time,host,value");
        assert_eq!(lines[1], ",_result,0,2023-11-14T22:13:20Z,a,1.5");
        assert_eq!(lines[3], ",_result,1,2023-11-14T22:13:20Z,b,7");
        assert!(text.ends_with("\r\n"));
    }

    proptest! {
        #[test]
        fn prop_round_trip_source_filter_limit(
            source in "[a-z][a-z0-9_]{0,10}",
            tag in "[a-z][a-z0-9_]{0,8}",
            value in "[a-zA-Z0-9 _.-]{0,12}",
            limit in 1u64..100_000,
        ) {
            let query = format!(
                r#"from(bucket: "db") |> range(start: -1h) |> filter(fn: (r) => r._measurement == "{}" and r.{} == "{}") |> limit(n: {})"#,
                source, tag, value, limit
            );
            let parsed = FluxHandler.parse(&query).unwrap();
            prop_assert_eq!(parsed.primary_source(), Some(source.as_str()));
            prop_assert_eq!(parsed.filters.len(), 1);
            prop_assert_eq!(&parsed.filters[0].column, &tag);
            prop_assert_eq!(&parsed.filters[0].value, &Value::String(value));
            prop_assert_eq!(parsed.limit, Some(limit));
        }
    }
}

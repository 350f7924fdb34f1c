use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::data::Value;
use crate::dialect::Dialect;

/// Dialect-neutral query representation.
///
/// Handlers fill in whichever clauses they recognise. Nothing here depends on
/// the dialect that produced it, so a planner can consume any `ParsedQuery`
/// the same way.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParsedQuery {
    pub dialect: Dialect,
    /// Verbatim input, kept for diagnostics and replay
    pub original_query: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub database: Option<String>,
    #[serde(default)]
    pub sources: Vec<DataSource>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time_range: Option<TimeRange>,
    #[serde(default)]
    pub filters: Vec<Filter>,
    #[serde(default)]
    pub aggregations: Vec<Aggregation>,
    #[serde(default)]
    pub group_by: Vec<String>,
    #[serde(default)]
    pub order_by: Vec<OrderBy>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub offset: Option<u64>,
}

impl ParsedQuery {
    pub fn new(dialect: Dialect, original_query: &str) -> Self {
        Self {
            dialect,
            original_query: original_query.to_string(),
            database: None,
            sources: Vec::new(),
            time_range: None,
            filters: Vec::new(),
            aggregations: Vec::new(),
            group_by: Vec::new(),
            order_by: Vec::new(),
            limit: None,
            offset: None,
        }
    }

    pub fn add_source(&mut self, name: impl Into<String>) {
        self.sources.push(DataSource::named(name));
    }

    pub fn add_filter(&mut self, column: impl Into<String>, operator: FilterOperator, value: Value) {
        self.filters.push(Filter {
            column: column.into(),
            operator,
            value,
        });
    }

    pub fn add_aggregation(&mut self, function: impl Into<String>, column: Option<String>) {
        self.aggregations.push(Aggregation {
            function: function.into(),
            column,
            alias: None,
        });
    }

    /// First referenced source, if any
    pub fn primary_source(&self) -> Option<&str> {
        self.sources.first().map(|s| s.name.as_str())
    }
}

/// Table, measurement or metric referenced by a query
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataSource {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub database: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alias: Option<String>,
}

impl DataSource {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            database: None,
            alias: None,
        }
    }
}

/// Query window.
///
/// A handler populates either the absolute bounds or the relative duration,
/// never both.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimeRange {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end: Option<DateTime<Utc>>,
    #[serde(
        default,
        rename = "duration_ms",
        with = "duration_ms",
        skip_serializing_if = "Option::is_none"
    )]
    pub duration: Option<Duration>,
}

impl TimeRange {
    pub fn relative(duration: Duration) -> Self {
        Self {
            start: None,
            end: None,
            duration: Some(duration),
        }
    }

    pub fn absolute(start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        Self {
            start: Some(start),
            end: Some(end),
            duration: None,
        }
    }

    /// Window ending now and reaching `duration` into the past
    pub fn trailing(duration: Duration) -> Self {
        let end = Utc::now();
        let start = chrono::Duration::from_std(duration)
            .ok()
            .and_then(|d| end.checked_sub_signed(d))
            .unwrap_or(DateTime::<Utc>::MIN_UTC);
        Self::absolute(start, end)
    }

    /// Open-ended window covering everything older than `duration` ago
    pub fn older_than(duration: Duration) -> Self {
        let end = chrono::Duration::from_std(duration)
            .ok()
            .and_then(|d| Utc::now().checked_sub_signed(d))
            .unwrap_or(DateTime::<Utc>::MIN_UTC);
        Self {
            start: None,
            end: Some(end),
            duration: None,
        }
    }

    /// Length of the window regardless of how it was expressed
    pub fn span(&self) -> Option<Duration> {
        if let Some(d) = self.duration {
            return Some(d);
        }
        match (self.start, self.end) {
            (Some(start), Some(end)) => (end - start).to_std().ok(),
            _ => None,
        }
    }
}

/// Comparison set shared by every dialect
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FilterOperator {
    #[serde(rename = "=")]
    Eq,
    #[serde(rename = "!=")]
    NotEq,
    #[serde(rename = "=~")]
    RegexMatch,
    #[serde(rename = "!~")]
    RegexNotMatch,
}

impl FilterOperator {
    pub fn as_str(&self) -> &'static str {
        match self {
            FilterOperator::Eq => "=",
            FilterOperator::NotEq => "!=",
            FilterOperator::RegexMatch => "=~",
            FilterOperator::RegexNotMatch => "!~",
        }
    }

    /// Map a dialect operator token onto the shared set.
    ///
    /// `==` (Flux) and `<>` (SQL) are accepted as spellings of equality and
    /// inequality.
    pub fn from_token(token: &str) -> Option<Self> {
        match token.trim() {
            "=" | "==" => Some(FilterOperator::Eq),
            "!=" | "<>" => Some(FilterOperator::NotEq),
            "=~" => Some(FilterOperator::RegexMatch),
            "!~" => Some(FilterOperator::RegexNotMatch),
            _ => None,
        }
    }
}

impl std::fmt::Display for FilterOperator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Filter {
    pub column: String,
    pub operator: FilterOperator,
    pub value: Value,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Aggregation {
    pub function: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub column: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alias: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderBy {
    pub column: String,
    pub ascending: bool,
}

mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Option<Duration>, s: S) -> Result<S::Ok, S::Error> {
        match value {
            Some(d) => s.serialize_u64(d.as_millis() as u64),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Duration>, D::Error> {
        Ok(Option::<u64>::deserialize(d)?.map(Duration::from_millis))
    }
}

//! Query text and option extraction for the wire-compatible endpoints

use axum::body::Bytes;
use axum::http::{header, HeaderMap, Method, Uri};
use chrono::{DateTime, NaiveDate, NaiveDateTime, TimeZone, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Deserialize;
use std::collections::HashMap;
use std::time::Duration;

use crate::dialect::duration;

static GRAPHITE_RELATIVE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^-(\d+)\s*([a-zA-Z]+)$").expect("valid relative time regex"));

/// A buffered request as seen by the dialect router
#[derive(Debug, Clone)]
pub struct RawRequest {
    pub method: Method,
    pub uri: Uri,
    pub headers: HeaderMap,
    pub body: Bytes,
    params: HashMap<String, String>,
    form: HashMap<String, String>,
}

/// JSON body accepted by `/dialect/auto`, and by the SQL-style endpoints
/// that take `{query}`
#[derive(Debug, Default, Deserialize)]
pub struct QueryBody {
    #[serde(default)]
    pub query: String,
    #[serde(default)]
    pub db: Option<String>,
    #[serde(default)]
    pub format: Option<String>,
    /// Seconds as a number, or a duration literal such as `"30s"`
    #[serde(default)]
    pub timeout: Option<serde_json::Value>,
}

impl RawRequest {
    pub fn new(method: Method, uri: Uri, headers: HeaderMap, body: Bytes) -> Self {
        let params = uri.query().map(parse_pairs).unwrap_or_default();
        let form = if method == Method::POST && is_form(&headers) {
            std::str::from_utf8(&body).map(parse_pairs).unwrap_or_default()
        } else {
            HashMap::new()
        };
        Self {
            method,
            uri,
            headers,
            body,
            params,
            form,
        }
    }

    pub fn path(&self) -> &str {
        self.uri.path()
    }

    /// Non-empty URL query parameter
    pub fn param(&self, name: &str) -> Option<&str> {
        self.params.get(name).map(String::as_str).filter(|v| !v.is_empty())
    }

    /// URL parameter, then urlencoded form field
    pub fn param_or_form(&self, name: &str) -> Option<&str> {
        self.param(name)
            .or_else(|| self.form.get(name).map(String::as_str).filter(|v| !v.is_empty()))
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .filter(|v| !v.is_empty())
    }

    /// Raw body as text, if any
    pub fn body_text(&self) -> Option<&str> {
        std::str::from_utf8(&self.body)
            .ok()
            .map(str::trim)
            .filter(|s| !s.is_empty())
    }

    /// `{"query": ...}` body, falling back to the raw body text
    pub fn body_query(&self) -> Option<String> {
        let text = self.body_text()?;
        match serde_json::from_str::<QueryBody>(text) {
            Ok(body) if !body.query.trim().is_empty() => Some(body.query),
            _ => Some(text.to_string()),
        }
    }

    pub fn query_body(&self) -> QueryBody {
        self.body_text()
            .and_then(|text| serde_json::from_str::<QueryBody>(text).ok())
            .unwrap_or_default()
    }
}

fn is_form(headers: &HeaderMap) -> bool {
    headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|ct| ct.starts_with("application/x-www-form-urlencoded"))
}

fn parse_pairs(s: &str) -> HashMap<String, String> {
    url::form_urlencoded::parse(s.as_bytes())
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect()
}

/// Prometheus API timestamp: RFC 3339 or (fractional) unix seconds
pub fn parse_prometheus_time(s: &str) -> Option<DateTime<Utc>> {
    let s = s.trim();
    if let Ok(t) = DateTime::parse_from_rfc3339(s) {
        return Some(t.with_timezone(&Utc));
    }
    let secs = s.parse::<f64>().ok().filter(|v| v.is_finite())?;
    Utc.timestamp_millis_opt((secs * 1000.0).round() as i64).single()
}

/// Graphite `from`/`until`: `now`, `-1h`, `-30min`, unix seconds,
/// `HH:MM_YYYYMMDD` or `YYYYMMDD`
pub fn parse_graphite_time(s: &str, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
    let s = s.trim();
    if s.eq_ignore_ascii_case("now") {
        return Some(now);
    }
    if let Some(caps) = GRAPHITE_RELATIVE.captures(s) {
        let ago = duration::from_unit_word(caps[1].parse().ok()?, &caps[2])?;
        return now.checked_sub_signed(chrono::Duration::from_std(ago).ok()?);
    }
    if let Ok(secs) = s.parse::<i64>() {
        return Utc.timestamp_opt(secs, 0).single();
    }
    if let Ok(t) = NaiveDateTime::parse_from_str(s, "%H:%M_%Y%m%d") {
        return Some(t.and_utc());
    }
    NaiveDate::parse_from_str(s, "%Y%m%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|t| t.and_utc())
}

/// JSON `timeout`: number of seconds or a duration literal
pub fn json_timeout(value: &serde_json::Value) -> Option<Duration> {
    match value {
        serde_json::Value::Number(n) => n
            .as_f64()
            .filter(|v| *v > 0.0)
            .and_then(|v| Duration::try_from_secs_f64(v).ok()),
        serde_json::Value::String(s) => duration::parse_param(s),
        _ => None,
    }
}

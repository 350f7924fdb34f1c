//! Duration literals used by the time-series dialects.
//!
//! Units map to fixed multipliers. `w` is seven days and `y` is 365 days;
//! neither is calendar-aware.

use once_cell::sync::Lazy;
use regex::Regex;
use std::time::Duration;

const SECOND: u64 = 1;
const MINUTE: u64 = 60 * SECOND;
const HOUR: u64 = 60 * MINUTE;
const DAY: u64 = 24 * HOUR;
const WEEK: u64 = 7 * DAY;
const YEAR: u64 = 365 * DAY;

static COMPOUND: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(\d+)(ms|[smhdwy])").expect("valid duration regex"));

/// `value` units of `unit` for the base `s m h d` set.
pub fn from_unit(value: u64, unit: &str) -> Option<Duration> {
    let secs = match unit {
        "s" => SECOND,
        "m" => MINUTE,
        "h" => HOUR,
        "d" => DAY,
        _ => return None,
    };
    Some(Duration::from_secs(value.saturating_mul(secs)))
}

/// Like [`from_unit`] but also accepting `ms`, `w` and `y`, as PromQL does
pub fn from_extended_unit(value: u64, unit: &str) -> Option<Duration> {
    match unit {
        "ms" => Some(Duration::from_millis(value)),
        "w" => Some(Duration::from_secs(value.saturating_mul(WEEK))),
        "y" => Some(Duration::from_secs(value.saturating_mul(YEAR))),
        other => from_unit(value, other),
    }
}

/// Unit spelled out the way SQL interval literals do (`'5 minutes'`, `1 HOUR`)
pub fn from_unit_word(value: u64, unit: &str) -> Option<Duration> {
    match unit.to_ascii_lowercase().as_str() {
        "ms" | "millisecond" | "milliseconds" => Some(Duration::from_millis(value)),
        "s" | "sec" | "secs" | "second" | "seconds" => from_unit(value, "s"),
        "m" | "min" | "mins" | "minute" | "minutes" => from_unit(value, "m"),
        "h" | "hr" | "hrs" | "hour" | "hours" => from_unit(value, "h"),
        "d" | "day" | "days" => from_unit(value, "d"),
        "w" | "week" | "weeks" => from_extended_unit(value, "w"),
        _ => None,
    }
}

/// Parse a single `N<unit>` literal such as `5m` or `-1h` (sign ignored)
pub fn parse_simple(s: &str) -> Option<Duration> {
    let s = s.trim().trim_start_matches('-');
    let split = s.find(|c: char| !c.is_ascii_digit())?;
    let (digits, unit) = s.split_at(split);
    let value = digits.parse::<u64>().ok()?;
    from_unit(value, unit)
}

/// Parse a PromQL duration, including compound forms like `1h30m`
pub fn parse_prometheus(s: &str) -> Option<Duration> {
    let s = s.trim();
    if s.is_empty() {
        return None;
    }

    let mut total = Duration::ZERO;
    let mut consumed = 0;
    for caps in COMPOUND.captures_iter(s) {
        let whole = caps.get(0)?;
        if whole.start() != consumed {
            return None;
        }
        consumed = whole.end();
        let value = caps[1].parse::<u64>().ok()?;
        total = total.checked_add(from_extended_unit(value, &caps[2])?)?;
    }

    if consumed == s.len() {
        Some(total)
    } else {
        None
    }
}

/// Parse an HTTP API duration parameter: a PromQL literal or float seconds
pub fn parse_param(s: &str) -> Option<Duration> {
    parse_prometheus(s).or_else(|| {
        s.trim()
            .parse::<f64>()
            .ok()
            .and_then(|v| Duration::try_from_secs_f64(v).ok())
    })
}

/// Parse an ISO-8601 period as used by Druid (`PT1H`, `P1D`, `PT15M`)
pub fn parse_iso8601(s: &str) -> Option<Duration> {
    let s = s.trim().to_ascii_uppercase();
    let body = s.strip_prefix('P')?;
    let (date_part, time_part) = match body.split_once('T') {
        Some((d, t)) => (d, t),
        None => (body, ""),
    };

    let mut secs = 0u64;
    let mut acc = String::new();
    for (part, in_time) in [(date_part, false), (time_part, true)] {
        for c in part.chars() {
            if c.is_ascii_digit() {
                acc.push(c);
                continue;
            }
            let n: u64 = acc.parse().ok()?;
            acc.clear();
            let unit = match (in_time, c) {
                (false, 'Y') => YEAR,
                (false, 'M') => 30 * DAY,
                (false, 'W') => WEEK,
                (false, 'D') => DAY,
                (true, 'H') => HOUR,
                (true, 'M') => MINUTE,
                (true, 'S') => SECOND,
                _ => return None,
            };
            secs = secs.checked_add(n.checked_mul(unit)?)?;
        }
    }

    if acc.is_empty() && secs > 0 {
        Some(Duration::from_secs(secs))
    } else {
        None
    }
}

/// Render a duration back into the shortest `N<unit>` literal
pub fn format_short(d: Duration) -> String {
    let secs = d.as_secs();
    if secs == 0 {
        return format!("{}ms", d.as_millis());
    }
    for (unit, size) in [("w", WEEK), ("d", DAY), ("h", HOUR), ("m", MINUTE)] {
        if secs % size == 0 {
            return format!("{}{}", secs / size, unit);
        }
    }
    format!("{}s", secs)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_simple_units() {
        assert_eq!(parse_simple("5m"), Some(Duration::from_secs(300)));
        assert_eq!(parse_simple("-1h"), Some(Duration::from_secs(3600)));
        assert_eq!(parse_simple("2d"), Some(Duration::from_secs(172_800)));
        assert_eq!(parse_simple("3w"), None);
    }

    #[test]
    fn test_unit_words() {
        assert_eq!(from_unit_word(5, "minutes"), Some(Duration::from_secs(300)));
        assert_eq!(from_unit_word(1, "HOUR"), Some(Duration::from_secs(3600)));
        assert_eq!(from_unit_word(2, "weeks"), Some(Duration::from_secs(1_209_600)));
        assert_eq!(from_unit_word(1, "fortnight"), None);
    }

    #[test]
    fn test_prometheus_units() {
        assert_eq!(parse_prometheus("1w"), Some(Duration::from_secs(604_800)));
        assert_eq!(parse_prometheus("1y"), Some(Duration::from_secs(31_536_000)));
        assert_eq!(parse_prometheus("1h30m"), Some(Duration::from_secs(5400)));
        assert_eq!(parse_prometheus("250ms"), Some(Duration::from_millis(250)));
        assert_eq!(parse_prometheus("5x"), None);
        assert_eq!(parse_param("15"), Some(Duration::from_secs(15)));
        assert_eq!(parse_param("0.5"), Some(Duration::from_millis(500)));
    }

    #[test]
    fn test_iso8601() {
        assert_eq!(parse_iso8601("PT1H"), Some(Duration::from_secs(3600)));
        assert_eq!(parse_iso8601("P1D"), Some(Duration::from_secs(86_400)));
        assert_eq!(parse_iso8601("PT15M"), Some(Duration::from_secs(900)));
        assert_eq!(parse_iso8601("1H"), None);
    }

    #[test]
    fn test_oversized_values_are_rejected() {
        assert_eq!(parse_prometheus("18446744073709551615s1s"), None);
        assert_eq!(parse_prometheus("18446744073709551615s"), Some(Duration::from_secs(u64::MAX)));
        assert_eq!(parse_param("1e300"), None);
        assert_eq!(parse_param("-1"), None);
        assert_eq!(parse_param("NaN"), None);
        assert_eq!(parse_iso8601("P99999999999999Y"), None);
        assert_eq!(parse_iso8601("P1DT18446744073709551615S"), None);
        assert_eq!(parse_iso8601("P1DT1H"), Some(Duration::from_secs(90_000)));
    }

    #[test]
    fn test_format_short() {
        assert_eq!(format_short(Duration::from_secs(300)), "5m");
        assert_eq!(format_short(Duration::from_secs(7200)), "2h");
        assert_eq!(format_short(Duration::from_secs(90)), "90s");
    }
}

//! Heuristic dialect classification.
//!
//! Each dialect carries a list of structural patterns (+10 per match) and a
//! list of keywords (+5 per case-insensitive substring hit). The highest
//! score wins; confidence is its share of the total. JSON bodies are checked
//! for Druid native and OpenTSDB before any scoring happens.

use regex::Regex;
use tracing::debug;

use super::Dialect;

const PATTERN_SCORE: u32 = 10;
const KEYWORD_SCORE: u32 = 5;
const MIN_SCORE: u32 = 5;

const JSON_CONFIDENCE: f64 = 0.9;
const SQL_PREFIX_CONFIDENCE: f64 = 0.3;
const BARE_SELECTOR_CONFIDENCE: f64 = 0.5;
const DEFAULT_CONFIDENCE: f64 = 0.1;

fn pattern_sources(dialect: Dialect) -> &'static [&'static str] {
    match dialect {
        Dialect::InfluxQL => &[
            r#"(?i)SELECT\s+.+\s+FROM\s+["\w]+\s+(WHERE|GROUP BY|LIMIT|ORDER BY|FILL|TZ)"#,
            r"(?i)\s+GROUP\s+BY\s+time\s*\(",
            r"(?i)SHOW\s+(MEASUREMENTS|TAG\s+KEYS|TAG\s+VALUES|FIELD\s+KEYS|DATABASES|RETENTION\s+POLICIES|SERIES)",
            r"(?i)CREATE\s+(DATABASE|RETENTION\s+POLICY|CONTINUOUS\s+QUERY)",
        ],
        Dialect::Flux => &[
            r"from\s*\(\s*bucket\s*:",
            r"\|>\s*range\s*\(",
            r"\|>\s*filter\s*\(",
            r"\|>\s*aggregateWindow\s*\(",
            r"\|>\s*yield\s*\(",
            r"\|>\s*map\s*\(",
        ],
        Dialect::PromQL => &[
            r"\w+\s*\{[^}]*\}\s*(\[[\w]+\])?",
            r"(rate|irate|increase|delta|deriv|predict_linear|histogram_quantile)\s*\(",
            r"(sum|avg|min|max|count|stddev|topk|bottomk|quantile)\s*(by|without)\s*\(",
            r"\s+offset\s+\d+[smhdwy]",
            r"\[\d+[smhdwy]\]",
        ],
        Dialect::MetricsQL => &[
            r"(range_quantile|range_median|range_avg|range_first|range_last)\s*\(",
            r"(topk_avg|topk_max|topk_min|bottomk_avg)\s*\(",
        ],
        Dialect::TDengine => &[
            r"(?i)CREATE\s+STABLE",
            r"(?i)USING\s+\w+\s+TAGS\s*\(",
            r"(?i)INTERVAL\s*\(\s*\d+[smhd]\s*\)",
            r"(?i)PARTITION\s+BY\s+TBNAME",
            r"(?i)(STATE_WINDOW|SESSION|EVENT_WINDOW|COUNT_WINDOW)\s*\(",
            r"(?i)LAST_ROW\s*\(",
        ],
        Dialect::TimescaleDB => &[
            r"(?i)time_bucket\s*\(",
            r"(?i)time_bucket_gapfill\s*\(",
            r"(?i)CREATE\s+HYPERTABLE",
            r"(?i)(locf|interpolate)\s*\(",
        ],
        Dialect::QuestDB => &[
            r"(?i)SAMPLE\s+BY",
            r"(?i)LATEST\s+ON",
            r"(?i)ASOF\s+JOIN",
            r"(?i)(LT|SPLICE)\s+JOIN",
        ],
        Dialect::ClickHouse => &[
            r"(?i)ENGINE\s*=\s*(MergeTree|ReplacingMergeTree|SummingMergeTree|AggregatingMergeTree)",
            r"(?i)(toDateTime|toDate|toStartOfHour|toStartOfDay)\s*\(",
            r"(?i)arrayJoin\s*\(",
            r"(?i)WITH\s+TOTALS",
            r"(?i)PREWHERE",
            r"(?i)GLOBAL\s+(IN|JOIN)",
        ],
        Dialect::DruidSQL => &[
            r"(?i)__time",
            r"(?i)FLOOR\s*\(\s*__time",
            r"(?i)TIME_FLOOR\s*\(",
            r"(?i)APPROX_COUNT_DISTINCT\s*\(",
        ],
        Dialect::DruidJSON => &[
            r#""queryType"\s*:\s*"(timeseries|topN|groupBy|scan|search)""#,
            r#""dataSource"\s*:"#,
            r#""granularity"\s*:"#,
        ],
        Dialect::OpenTSDB => &[
            r#""queries"\s*:\s*\["#,
            r#""metric"\s*:\s*""#,
            r#""aggregator"\s*:\s*"(sum|avg|min|max|count)""#,
        ],
        Dialect::Graphite => &[
            r"(summarize|derivative|integral|movingAverage|alias)\s*\(",
            r"\*\.\*\.",
        ],
        Dialect::SQL => &[],
    }
}

fn keywords(dialect: Dialect) -> &'static [&'static str] {
    match dialect {
        Dialect::InfluxQL => &[
            "FILL(", "SLIMIT", "SOFFSET", "TZ(", "INTO",
            "SHOW MEASUREMENTS", "SHOW TAG", "SHOW FIELD",
            "GROUP BY time(",
        ],
        Dialect::Flux => &[
            "|>", "from(bucket:", "range(", "filter(fn:",
            "aggregateWindow(", "map(fn:", "pivot(",
        ],
        Dialect::PromQL => &[
            "rate(", "irate(", "increase(", "histogram_quantile(",
            "sum by", "sum without", "avg by", "count by",
            "__name__", "job=", "instance=",
        ],
        Dialect::TDengine => &[
            "CREATE STABLE", "USING", "TAGS(", "INTERVAL(",
            "PARTITION BY", "STATE_WINDOW", "SESSION(",
            "LAST_ROW(", "TWA(", "SPREAD(", "_wstart", "_wend",
            "FILL(PREV)", "FILL(LINEAR)", "TBNAME",
        ],
        Dialect::TimescaleDB => &[
            "time_bucket(", "time_bucket_gapfill(",
            "CREATE HYPERTABLE", "locf(", "interpolate(",
            "add_retention_policy", "add_compression_policy",
        ],
        Dialect::QuestDB => &[
            "SAMPLE BY", "LATEST ON", "ASOF JOIN",
            "LT JOIN", "SPLICE JOIN", "designated timestamp",
        ],
        Dialect::ClickHouse => &[
            "MergeTree", "ReplacingMergeTree", "ENGINE=",
            "toDateTime(", "toStartOfHour(", "arrayJoin(",
            "PREWHERE", "GLOBAL IN", "WITH TOTALS", "FINAL",
        ],
        Dialect::DruidSQL => &[
            "__time", "TIME_FLOOR(", "TIME_SHIFT(",
            "APPROX_COUNT_DISTINCT(", "DS_HLL", "DS_THETA",
        ],
        Dialect::Graphite => &[
            "summarize(", "alias(", "scale(", "offset(",
            "derivative(", "integral(", "movingAverage(",
        ],
        Dialect::MetricsQL | Dialect::DruidJSON | Dialect::OpenTSDB | Dialect::SQL => &[],
    }
}

struct DialectRules {
    dialect: Dialect,
    patterns: Vec<Regex>,
    /// Stored upper-cased for case-insensitive matching
    keywords: Vec<String>,
}

impl DialectRules {
    fn score(&self, query: &str, query_upper: &str) -> u32 {
        let pattern_hits = self.patterns.iter().filter(|p| p.is_match(query)).count() as u32;
        let keyword_hits = self
            .keywords
            .iter()
            .filter(|k| query_upper.contains(k.as_str()))
            .count() as u32;
        pattern_hits * PATTERN_SCORE + keyword_hits * KEYWORD_SCORE
    }

    fn matches_any(&self, query: &str) -> bool {
        self.patterns.iter().any(|p| p.is_match(query))
    }
}

/// Classifies query text into a [`Dialect`] with a confidence in `[0, 1]`.
///
/// All regexes are compiled once in [`DialectDetector::new`]; detection itself
/// is pure and allocation-light.
pub struct DialectDetector {
    rules: Vec<DialectRules>,
    bare_selector: Regex,
}

impl DialectDetector {
    pub fn new() -> Self {
        let rules = Dialect::ALL
            .iter()
            .map(|&dialect| DialectRules {
                dialect,
                patterns: pattern_sources(dialect)
                    .iter()
                    .map(|src| Regex::new(src).expect("valid detector pattern"))
                    .collect(),
                keywords: keywords(dialect)
                    .iter()
                    .map(|k| k.to_uppercase())
                    .collect(),
            })
            .collect();

        Self {
            rules,
            bare_selector: Regex::new(r"^[a-zA-Z_:][a-zA-Z0-9_:]*(\{.*\})?(\[.*\])?$")
                .expect("valid selector pattern"),
        }
    }

    /// Detect the dialect of `query`. Never fails; unrecognisable input
    /// degrades to low-confidence SQL.
    pub fn detect(&self, query: &str) -> (Dialect, f64) {
        let query = query.trim();

        if query.starts_with('{') || query.starts_with('[') {
            for json_dialect in [Dialect::DruidJSON, Dialect::OpenTSDB] {
                if self.rules_for(json_dialect).is_some_and(|r| r.matches_any(query)) {
                    debug!(dialect = %json_dialect, "Detected structured JSON query");
                    return (json_dialect, JSON_CONFIDENCE);
                }
            }
        }

        let query_upper = query.to_uppercase();
        let mut best = Dialect::SQL;
        let mut best_score = 0u32;
        let mut total = 0u32;

        for rules in &self.rules {
            let score = rules.score(query, &query_upper);
            total += score;
            if score > best_score {
                best_score = score;
                best = rules.dialect;
            }
        }

        if best_score < MIN_SCORE {
            return self.fallback(query, &query_upper);
        }

        let confidence = f64::from(best_score) / f64::from(total);
        debug!(dialect = %best, score = best_score, total, confidence, "Detected dialect");
        (best, confidence)
    }

    fn fallback(&self, query: &str, query_upper: &str) -> (Dialect, f64) {
        if query_upper.starts_with("SELECT") || query_upper.starts_with("SHOW") {
            return (Dialect::SQL, SQL_PREFIX_CONFIDENCE);
        }
        if self.bare_selector.is_match(query) {
            return (Dialect::PromQL, BARE_SELECTOR_CONFIDENCE);
        }
        (Dialect::SQL, DEFAULT_CONFIDENCE)
    }

    fn rules_for(&self, dialect: Dialect) -> Option<&DialectRules> {
        self.rules.iter().find(|r| r.dialect == dialect)
    }
}

impl Default for DialectDetector {
    fn default() -> Self {
        Self::new()
    }
}

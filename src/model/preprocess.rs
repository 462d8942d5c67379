//! Per-record caches computed once after deserialization.
//!
//! Everything here is derivable from the record itself; evaluation falls
//! back to parsing on the fly when a cache is absent, so skipping
//! preprocessing changes performance, never results.

use crate::model::flag::Operator;
use chrono::{DateTime, TimeZone, Utc};
use regex::Regex;
use semver::Version;
use serde_json::Value;
use std::collections::HashSet;

/// Below this many values a linear scan beats the lookup table.
const MIN_LOOKUP_SIZE: usize = 2;

/// Pre-parsed clause values, one arm per operator family.
///
/// A value that fails to parse is cached as `None` and never matches; the
/// clause stays usable with its remaining values.
#[derive(Clone, Debug)]
pub(crate) enum ClauseValues {
    Lookup(HashSet<String>),
    Regexes(Vec<Option<Regex>>),
    Versions(Vec<Option<Version>>),
    Dates(Vec<Option<DateTime<Utc>>>),
}

pub(crate) fn clause_values(op: Operator, values: &[Value]) -> Option<ClauseValues> {
    match op {
        Operator::Matches => Some(ClauseValues::Regexes(
            values
                .iter()
                .map(|v| v.as_str().and_then(|s| Regex::new(s).ok()))
                .collect(),
        )),
        Operator::SemVerEqual | Operator::SemVerLessThan | Operator::SemVerGreaterThan => {
            Some(ClauseValues::Versions(
                values
                    .iter()
                    .map(|v| v.as_str().and_then(parse_semver))
                    .collect(),
            ))
        }
        Operator::Before | Operator::After => {
            Some(ClauseValues::Dates(values.iter().map(parse_date).collect()))
        }
        Operator::In if values.len() >= MIN_LOOKUP_SIZE => Some(ClauseValues::Lookup(
            values.iter().map(canonical_json_key).collect(),
        )),
        _ => None,
    }
}

/// Canonical string form of a JSON value for set membership.
///
/// Numbers compare through f64 so `2` and `2.0` collide; other values use
/// the compact serialization (object keys are already sorted by the map
/// representation).
pub(crate) fn canonical_json_key(value: &Value) -> String {
    match value {
        Value::Number(n) => format!("n:{}", n.as_f64().unwrap_or(f64::NAN)),
        other => format!("j:{}", other),
    }
}

/// Semantic version parse, tolerating missing minor/patch components
/// (`"2"` and `"2.1"` are read as `2.0.0` / `2.1.0`).
pub(crate) fn parse_semver(s: &str) -> Option<Version> {
    if let Ok(version) = Version::parse(s) {
        return Some(version);
    }
    let numeric_end = s
        .char_indices()
        .find(|(_, c)| !c.is_ascii_digit() && *c != '.')
        .map(|(i, _)| i)
        .unwrap_or_else(|| s.len());
    let (numeric, suffix) = s.split_at(numeric_end);
    if numeric.is_empty() || (!suffix.is_empty() && !suffix.starts_with('-') && !suffix.starts_with('+'))
    {
        return None;
    }
    let padding = match numeric.matches('.').count() {
        0 => ".0.0",
        1 => ".0",
        _ => return None,
    };
    Version::parse(&format!("{}{}{}", numeric, padding, suffix)).ok()
}

/// Timestamps are either epoch millis or an RFC 3339 string.
pub(crate) fn parse_date(value: &Value) -> Option<DateTime<Utc>> {
    match value {
        Value::Number(n) => Utc.timestamp_millis_opt(n.as_f64()? as i64).single(),
        Value::String(s) => DateTime::parse_from_rfc3339(s)
            .ok()
            .map(|dt| dt.with_timezone(&Utc)),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn pads_partial_semver() {
        assert_eq!(Version::new(2, 0, 0), parse_semver("2").unwrap());
        assert_eq!(Version::new(2, 1, 0), parse_semver("2.1").unwrap());
        assert_eq!(Version::new(2, 1, 3), parse_semver("2.1.3").unwrap());
        let pre = parse_semver("2.3-beta.1").unwrap();
        assert_eq!((2, 3, 0), (pre.major, pre.minor, pre.patch));
        assert_eq!("beta.1", pre.pre.as_str());
    }

    #[test]
    fn rejects_bad_semver() {
        for s in &["", "x2", "2..1", "2.1.2.3", "2abc"] {
            assert_eq!(None, parse_semver(s), "{:?}", s);
        }
    }

    #[test]
    fn parses_dates_from_millis_and_strings() {
        let from_millis = parse_date(&json!(1_600_000_000_000u64)).unwrap();
        let from_string = parse_date(&json!("2020-09-13T12:26:40Z")).unwrap();
        assert_eq!(from_millis, from_string);
        assert_eq!(None, parse_date(&json!(true)));
        assert_eq!(None, parse_date(&json!("not a date")));
    }

    #[test]
    fn bad_regex_is_cached_as_never_matching() {
        let values = vec![json!("["), json!("^a+$")];
        match clause_values(Operator::Matches, &values) {
            Some(ClauseValues::Regexes(regexes)) => {
                assert!(regexes[0].is_none());
                assert!(regexes[1].is_some());
            }
            other => panic!("unexpected cache: {:?}", other),
        }
    }

    #[test]
    fn numbers_normalize_across_int_and_float() {
        assert_eq!(canonical_json_key(&json!(2)), canonical_json_key(&json!(2.0)));
        assert_ne!(canonical_json_key(&json!(2)), canonical_json_key(&json!("2")));
    }

    #[test]
    fn lookup_built_only_for_in_with_enough_values() {
        assert!(clause_values(Operator::In, &[json!("a")]).is_none());
        assert!(matches!(
            clause_values(Operator::In, &[json!("a"), json!("b")]),
            Some(ClauseValues::Lookup(_))
        ));
        assert!(clause_values(Operator::Contains, &[json!("a"), json!("b")]).is_none());
    }
}

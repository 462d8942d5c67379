//! Clause operator matching.
//!
//! `segmentMatch` clauses are routed by the evaluator itself; everything
//! else lands here. Matching prefers the preprocessed caches on the clause
//! and falls back to parsing values on the fly when they are absent.

use crate::{
    context::{Context, Kind},
    model::{
        preprocess::{self, ClauseValues},
        Clause, Operator,
    },
};
use chrono::{DateTime, Utc};
use semver::Version;
use serde_json::Value;
use std::cmp::Ordering;

/// Evaluate a non-segment clause against the full context.
///
/// A missing context kind or unresolvable attribute is a non-match that
/// negation does not invert.
pub(crate) fn matches_context(clause: &Clause, context: &Context) -> bool {
    let user_kind = Kind::user();
    let kind = clause.context_kind.as_ref().unwrap_or(&user_kind);
    let actual = match context.as_kind(kind) {
        Some(c) => c,
        None => return false,
    };
    let attr_value = match actual.get_value(&clause.attribute) {
        Some(v) => v,
        None => return false,
    };
    let matched = match &attr_value {
        // an array attribute matches if any element does
        Value::Array(elements) => elements.iter().any(|v| match_any_value(clause, v)),
        single => match_any_value(clause, single),
    };
    matched != clause.negate
}

fn match_any_value(clause: &Clause, context_value: &Value) -> bool {
    match clause.op {
        Operator::In => match &clause.preprocessed {
            Some(ClauseValues::Lookup(set)) => {
                set.contains(&preprocess::canonical_json_key(context_value))
            }
            _ => clause
                .values
                .iter()
                .any(|cv| values_equal(cv, context_value)),
        },
        Operator::StartsWith => string_op(clause, context_value, |a, b| a.starts_with(b)),
        Operator::EndsWith => string_op(clause, context_value, |a, b| a.ends_with(b)),
        Operator::Contains => string_op(clause, context_value, |a, b| a.contains(b)),
        Operator::Matches => match_regex(clause, context_value),
        Operator::LessThan => numeric_op(clause, context_value, |o| o == Ordering::Less),
        Operator::LessThanOrEqual => numeric_op(clause, context_value, |o| o != Ordering::Greater),
        Operator::GreaterThan => numeric_op(clause, context_value, |o| o == Ordering::Greater),
        Operator::GreaterThanOrEqual => numeric_op(clause, context_value, |o| o != Ordering::Less),
        Operator::Before => date_op(clause, context_value, |o| o == Ordering::Less),
        Operator::After => date_op(clause, context_value, |o| o == Ordering::Greater),
        Operator::SemVerEqual => semver_op(clause, context_value, |o| o == Ordering::Equal),
        Operator::SemVerLessThan => semver_op(clause, context_value, |o| o == Ordering::Less),
        Operator::SemVerGreaterThan => semver_op(clause, context_value, |o| o == Ordering::Greater),
        // handled by the evaluator; reaching here means a segment rule
        // nested another segmentMatch, which never matches
        Operator::SegmentMatch => false,
        Operator::Unrecognized => false,
    }
}

/// Equality where ints and floats compare numerically (`2 == 2.0`).
fn values_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64() == y.as_f64(),
        _ => a == b,
    }
}

fn string_op(clause: &Clause, context_value: &Value, f: impl Fn(&str, &str) -> bool) -> bool {
    let s = match context_value.as_str() {
        Some(s) => s,
        None => return false,
    };
    clause
        .values
        .iter()
        .any(|cv| cv.as_str().map_or(false, |cs| f(s, cs)))
}

fn match_regex(clause: &Clause, context_value: &Value) -> bool {
    let s = match context_value.as_str() {
        Some(s) => s,
        None => return false,
    };
    match &clause.preprocessed {
        Some(ClauseValues::Regexes(regexes)) => regexes
            .iter()
            .any(|re| re.as_ref().map_or(false, |re| re.is_match(s))),
        _ => clause.values.iter().any(|cv| {
            cv.as_str()
                .and_then(|pattern| regex::Regex::new(pattern).ok())
                .map_or(false, |re| re.is_match(s))
        }),
    }
}

fn numeric_op(clause: &Clause, context_value: &Value, f: impl Fn(Ordering) -> bool) -> bool {
    let n = match context_value.as_f64() {
        Some(n) => n,
        None => return false,
    };
    clause.values.iter().any(|cv| {
        cv.as_f64()
            .and_then(|cn| n.partial_cmp(&cn))
            .map_or(false, &f)
    })
}

fn date_op(clause: &Clause, context_value: &Value, f: impl Fn(Ordering) -> bool) -> bool {
    let t = match preprocess::parse_date(context_value) {
        Some(t) => t,
        None => return false,
    };
    let check = |cv: Option<DateTime<Utc>>| cv.map_or(false, |ct| f(t.cmp(&ct)));
    match &clause.preprocessed {
        Some(ClauseValues::Dates(dates)) => dates.iter().any(|cv| check(*cv)),
        _ => clause
            .values
            .iter()
            .any(|cv| check(preprocess::parse_date(cv))),
    }
}

fn semver_op(clause: &Clause, context_value: &Value, f: impl Fn(Ordering) -> bool) -> bool {
    let v: Version = match context_value.as_str().and_then(preprocess::parse_semver) {
        Some(v) => v,
        None => return false,
    };
    let check = |cv: Option<&Version>| cv.map_or(false, |cv| f(v.cmp(cv)));
    match &clause.preprocessed {
        Some(ClauseValues::Versions(versions)) => versions.iter().any(|cv| check(cv.as_ref())),
        _ => clause.values.iter().any(|cv| {
            check(
                cv.as_str()
                    .and_then(preprocess::parse_semver)
                    .as_ref(),
            )
        }),
    }
}

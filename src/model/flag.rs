use crate::{
    context::{AttributeRef, Kind},
    eval::Reason,
    model::preprocess::{self, ClauseValues},
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashSet;

/// A named switch with variations, targeting and rollouts.
///
/// Deserialized from the `put`/`patch` wire payloads. All fields default so
/// a minimal payload still parses; semantic problems (out-of-range indices,
/// empty rollouts) surface as `MALFORMED_FLAG` at evaluation time instead.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Flag {
    pub key: String,
    pub version: u64,
    pub on: bool,
    pub variations: Vec<Value>,
    pub off_variation: Option<usize>,
    pub fallthrough: VariationOrRollout,
    pub targets: Vec<Target>,
    pub context_targets: Vec<Target>,
    pub rules: Vec<FlagRule>,
    pub prerequisites: Vec<Prerequisite>,
    pub salt: String,
    pub track_events: bool,
    pub track_events_fallthrough: bool,
    pub debug_events_until_date: Option<u64>,
    pub client_side: bool,
    pub client_side_availability: Option<ClientSideAvailability>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ClientSideAvailability {
    pub using_environment_id: bool,
    pub using_mobile_key: bool,
}

impl Flag {
    pub fn variation_value(&self, index: usize) -> Option<&Value> {
        self.variations.get(index)
    }

    /// Whether the flag is exposed to client-side environment-keyed SDKs.
    pub fn is_client_side(&self) -> bool {
        match &self.client_side_availability {
            Some(availability) => availability.using_environment_id,
            None => self.client_side,
        }
    }

    /// Compute the per-record caches. Idempotent; safe to skip entirely.
    pub fn preprocess(&mut self) {
        for (index, rule) in self.rules.iter_mut().enumerate() {
            rule.preprocess(index);
        }
        for prerequisite in &mut self.prerequisites {
            prerequisite.preprocess();
        }
        for target in self.targets.iter_mut().chain(self.context_targets.iter_mut()) {
            target.preprocess();
        }
    }
}

/// Either a fixed variation index or a percentage rollout.
///
/// The `Malformed` arm absorbs payloads carrying neither field so that one
/// bad flag cannot poison a whole dataset; evaluating it yields
/// `MALFORMED_FLAG`.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(untagged)]
pub enum VariationOrRollout {
    Variation { variation: usize },
    Rollout { rollout: Rollout },
    Malformed(Value),
}

impl Default for VariationOrRollout {
    fn default() -> Self {
        VariationOrRollout::Malformed(Value::Null)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum RolloutKind {
    /// Plain percentage rollout.
    Rollout,
    /// Rollout participating in an experiment; selection is tracked.
    Experiment,
}

impl Default for RolloutKind {
    fn default() -> Self {
        RolloutKind::Rollout
    }
}

#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Rollout {
    pub kind: RolloutKind,
    pub context_kind: Option<Kind>,
    pub bucket_by: Option<AttributeRef>,
    pub variations: Vec<WeightedVariation>,
    pub seed: Option<i64>,
}

impl Rollout {
    pub fn is_experiment(&self) -> bool {
        self.kind == RolloutKind::Experiment
    }
}

#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase", default)]
pub struct WeightedVariation {
    pub variation: usize,
    /// Integer weight out of 100000.
    pub weight: u32,
    pub untracked: bool,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Target {
    pub context_kind: Option<Kind>,
    pub values: Vec<String>,
    pub variation: usize,
    #[serde(skip)]
    pub(crate) preprocessed: Option<HashSet<String>>,
}

impl Target {
    pub(crate) fn preprocess(&mut self) {
        if self.preprocessed.is_none() {
            self.preprocessed = Some(self.values.iter().cloned().collect());
        }
    }

    pub(crate) fn contains(&self, key: &str) -> bool {
        match &self.preprocessed {
            Some(set) => set.contains(key),
            None => self.values.iter().any(|v| v == key),
        }
    }
}

#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Prerequisite {
    pub key: String,
    pub variation: usize,
    #[serde(skip)]
    pub(crate) cached_failed_reason: Option<Reason>,
}

impl Prerequisite {
    pub(crate) fn preprocess(&mut self) {
        if self.cached_failed_reason.is_none() {
            self.cached_failed_reason = Some(Reason::PrerequisiteFailed {
                prerequisite_key: self.key.clone(),
            });
        }
    }

    pub(crate) fn failed_reason(&self) -> Reason {
        match &self.cached_failed_reason {
            Some(reason) => reason.clone(),
            None => Reason::PrerequisiteFailed {
                prerequisite_key: self.key.clone(),
            },
        }
    }
}

/// Targeting rule: all clauses must match for the rule to select.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FlagRule {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub clauses: Vec<Clause>,
    #[serde(flatten)]
    pub variation_or_rollout: VariationOrRollout,
    #[serde(default)]
    pub track_events: bool,
    #[serde(skip)]
    pub(crate) cached_match_reasons: Option<(Reason, Reason)>,
}

impl FlagRule {
    pub(crate) fn preprocess(&mut self, index: usize) {
        for clause in &mut self.clauses {
            clause.preprocess();
        }
        if self.cached_match_reasons.is_none() {
            self.cached_match_reasons = Some((
                Reason::RuleMatch {
                    rule_index: index,
                    rule_id: self.id.clone(),
                    in_experiment: false,
                },
                Reason::RuleMatch {
                    rule_index: index,
                    rule_id: self.id.clone(),
                    in_experiment: true,
                },
            ));
        }
    }

    pub(crate) fn match_reason(&self, index: usize, in_experiment: bool) -> Reason {
        match (&self.cached_match_reasons, in_experiment) {
            (Some((plain, _)), false) => plain.clone(),
            (Some((_, experiment)), true) => experiment.clone(),
            (None, in_experiment) => Reason::RuleMatch {
                rule_index: index,
                rule_id: self.id.clone(),
                in_experiment,
            },
        }
    }
}

/// Closed set of clause operators.
///
/// Operators added server-side before this SDK learns about them parse as
/// `Unrecognized` and simply never match.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum Operator {
    In,
    EndsWith,
    StartsWith,
    Matches,
    Contains,
    LessThan,
    LessThanOrEqual,
    GreaterThan,
    GreaterThanOrEqual,
    Before,
    After,
    SemVerEqual,
    SemVerLessThan,
    SemVerGreaterThan,
    SegmentMatch,
    Unrecognized,
}

impl<'de> Deserialize<'de> for Operator {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Ok(match raw.as_str() {
            "in" => Operator::In,
            "endsWith" => Operator::EndsWith,
            "startsWith" => Operator::StartsWith,
            "matches" => Operator::Matches,
            "contains" => Operator::Contains,
            "lessThan" => Operator::LessThan,
            "lessThanOrEqual" => Operator::LessThanOrEqual,
            "greaterThan" => Operator::GreaterThan,
            "greaterThanOrEqual" => Operator::GreaterThanOrEqual,
            "before" => Operator::Before,
            "after" => Operator::After,
            "semVerEqual" => Operator::SemVerEqual,
            "semVerLessThan" => Operator::SemVerLessThan,
            "semVerGreaterThan" => Operator::SemVerGreaterThan,
            "segmentMatch" => Operator::SegmentMatch,
            _ => Operator::Unrecognized,
        })
    }
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Clause {
    #[serde(default)]
    pub context_kind: Option<Kind>,
    pub attribute: AttributeRef,
    pub op: Operator,
    #[serde(default)]
    pub values: Vec<Value>,
    #[serde(default)]
    pub negate: bool,
    #[serde(skip)]
    pub(crate) preprocessed: Option<ClauseValues>,
}

impl Clause {
    pub(crate) fn preprocess(&mut self) {
        if self.preprocessed.is_none() {
            self.preprocessed = preprocess::clause_values(self.op, &self.values);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_minimal_flag() {
        let flag: Flag = serde_json::from_value(json!({
            "key": "minimal",
            "version": 3,
        }))
        .unwrap();
        assert_eq!("minimal", flag.key);
        assert_eq!(3, flag.version);
        assert!(!flag.on);
        assert!(flag.off_variation.is_none());
        assert!(matches!(
            flag.fallthrough,
            VariationOrRollout::Malformed(Value::Null)
        ));
    }

    #[test]
    fn parses_fallthrough_forms() {
        let fixed: VariationOrRollout = serde_json::from_value(json!({"variation": 2})).unwrap();
        assert!(matches!(fixed, VariationOrRollout::Variation { variation: 2 }));

        let rollout: VariationOrRollout = serde_json::from_value(json!({
            "rollout": {
                "kind": "experiment",
                "seed": 61,
                "variations": [{"variation": 0, "weight": 10000}, {"variation": 1, "weight": 90000, "untracked": true}],
            }
        }))
        .unwrap();
        match rollout {
            VariationOrRollout::Rollout { rollout } => {
                assert!(rollout.is_experiment());
                assert_eq!(Some(61), rollout.seed);
                assert_eq!(2, rollout.variations.len());
                assert!(rollout.variations[1].untracked);
            }
            other => panic!("unexpected parse: {:?}", other),
        }

        let malformed: VariationOrRollout = serde_json::from_value(json!({})).unwrap();
        assert!(matches!(malformed, VariationOrRollout::Malformed(_)));
    }

    #[test]
    fn parses_rule_with_flattened_variation() {
        let rule: FlagRule = serde_json::from_value(json!({
            "id": "rule-1",
            "variation": 1,
            "trackEvents": true,
            "clauses": [
                {"attribute": "tier", "op": "in", "values": ["gold"]}
            ]
        }))
        .unwrap();
        assert_eq!("rule-1", rule.id);
        assert!(rule.track_events);
        assert!(matches!(
            rule.variation_or_rollout,
            VariationOrRollout::Variation { variation: 1 }
        ));
        assert_eq!(Operator::In, rule.clauses[0].op);
    }

    #[test]
    fn unknown_operator_parses_as_unrecognized() {
        let clause: Clause = serde_json::from_value(json!({
            "attribute": "tier",
            "op": "someFutureOp",
            "values": []
        }))
        .unwrap();
        assert_eq!(Operator::Unrecognized, clause.op);
    }

    #[test]
    fn client_side_availability_preferred_over_legacy_bool() {
        let legacy: Flag =
            serde_json::from_value(json!({"key": "a", "clientSide": true})).unwrap();
        assert!(legacy.is_client_side());

        let new: Flag = serde_json::from_value(json!({
            "key": "b",
            "clientSide": true,
            "clientSideAvailability": {"usingEnvironmentId": false, "usingMobileKey": true}
        }))
        .unwrap();
        assert!(!new.is_client_side());
    }

    #[test]
    fn preprocess_is_idempotent() {
        let mut flag: Flag = serde_json::from_value(json!({
            "key": "pre",
            "targets": [{"values": ["a", "b"], "variation": 0}],
            "prerequisites": [{"key": "other", "variation": 1}],
            "rules": [{"id": "r", "variation": 0, "clauses": []}],
        }))
        .unwrap();
        flag.preprocess();
        flag.preprocess();
        assert!(flag.targets[0].contains("a"));
        assert!(!flag.targets[0].contains("c"));
        assert_eq!(
            Reason::PrerequisiteFailed {
                prerequisite_key: "other".into()
            },
            flag.prerequisites[0].failed_reason()
        );
        assert_eq!(
            Reason::RuleMatch {
                rule_index: 0,
                rule_id: "r".into(),
                in_experiment: false
            },
            flag.rules[0].match_reason(0, false)
        );
    }
}

//! Flag evaluation.
//!
//! Evaluation is a pure function over the store snapshot: for a fixed flag,
//! context and dataset it always produces the same value, variation index
//! and reason. Errors never propagate to callers; they reduce to an error
//! reason and the caller's default value.

pub(crate) mod bucket;
pub(crate) mod clause;
mod reason;

pub use reason::{BigSegmentsStatus, Detail, ErrorKind, EvalResult, Reason};

use crate::{
    bigsegments::{BigSegmentResolver, Membership},
    context::{Context, Kind},
    model::{Clause, Flag, Operator, Segment, VariationOrRollout},
    store::DataStore,
};
use bucket::BucketPrefix;
use std::{collections::HashMap, sync::Arc};
use tracing::warn;

/// One prerequisite evaluation, reported for analytics whether it passed
/// or failed.
#[derive(Clone, Debug)]
pub struct PrerequisiteEvaluation {
    /// The prerequisite flag that was evaluated.
    pub flag: Arc<Flag>,
    /// Key of the flag whose prerequisite list triggered the evaluation.
    pub prereq_of_key: String,
    pub result: EvalResult,
}

/// Callback receiving every prerequisite evaluation in depth-first order.
pub type PrerequisiteSink<'a> = &'a mut dyn FnMut(PrerequisiteEvaluation);

/// Evaluates flags against a [DataStore], running the targeting algorithm:
/// off check, prerequisites, individual targets, rules, fallthrough.
pub struct Evaluator<S> {
    store: S,
    big_segments: Option<Arc<dyn BigSegmentResolver>>,
}

impl<S: DataStore> Evaluator<S> {
    pub fn new(store: S) -> Self {
        Self {
            store,
            big_segments: None,
        }
    }

    pub fn with_big_segments(mut self, resolver: Arc<dyn BigSegmentResolver>) -> Self {
        self.big_segments = Some(resolver);
        self
    }

    /// Evaluate a flag for a context.
    ///
    /// `sink` observes every prerequisite evaluation; pass `None` when the
    /// caller does not record analytics.
    pub fn evaluate(
        &self,
        flag: &Flag,
        context: &Context,
        sink: Option<PrerequisiteSink<'_>>,
    ) -> EvalResult {
        // contexts parsed off the wire can carry an empty key
        if !context.is_valid() {
            return EvalResult::err(ErrorKind::UserNotSpecified);
        }
        let mut state = EvalState {
            prereq_chain: Vec::new(),
            big_segments_status: None,
            memberships: HashMap::new(),
            sink,
        };
        let mut result = match self.evaluate_internal(flag, context, &mut state) {
            Ok(result) => result,
            Err(kind) => EvalResult::err(kind),
        };
        result.big_segments_status = state.big_segments_status;
        result
    }

    fn evaluate_internal(
        &self,
        flag: &Flag,
        context: &Context,
        state: &mut EvalState<'_>,
    ) -> Result<EvalResult, ErrorKind> {
        if !flag.on {
            return Ok(self.off_result(flag, Reason::Off));
        }

        if let Some(failed_reason) = self.check_prerequisites(flag, context, state)? {
            return Ok(self.off_result(flag, failed_reason));
        }

        // context targets first, then the legacy user-kind lists
        let user_kind = Kind::user();
        for target in &flag.context_targets {
            let kind = target.context_kind.as_ref().unwrap_or(&user_kind);
            if let Some(selected) = context.as_kind(kind) {
                if target.contains(selected.key()) {
                    return Ok(self.variation_result(flag, target.variation, Reason::TargetMatch));
                }
            }
        }
        for target in &flag.targets {
            if let Some(selected) = context.as_kind(&user_kind) {
                if target.contains(selected.key()) {
                    return Ok(self.variation_result(flag, target.variation, Reason::TargetMatch));
                }
            }
        }

        for (index, rule) in flag.rules.iter().enumerate() {
            if self.rule_matches(&rule.clauses, context, state)? {
                let (variation, in_experiment) =
                    self.resolve(&rule.variation_or_rollout, flag, context)?;
                let mut result = self.variation_result(
                    flag,
                    variation,
                    rule.match_reason(index, in_experiment),
                );
                result.force_reason_tracking = rule.track_events || in_experiment;
                return Ok(result);
            }
        }

        let (variation, in_experiment) = self.resolve(&flag.fallthrough, flag, context)?;
        let mut result =
            self.variation_result(flag, variation, Reason::Fallthrough { in_experiment });
        result.force_reason_tracking = flag.track_events_fallthrough || in_experiment;
        Ok(result)
    }

    /// Depth-first prerequisite walk. `Some(reason)` means this flag fails
    /// with that reason; cycles and store failures are hard errors.
    fn check_prerequisites(
        &self,
        flag: &Flag,
        context: &Context,
        state: &mut EvalState<'_>,
    ) -> Result<Option<Reason>, ErrorKind> {
        if flag.prerequisites.is_empty() {
            return Ok(None);
        }
        state.prereq_chain.push(flag.key.clone());
        let outcome = self.check_prerequisites_inner(flag, context, state);
        state.prereq_chain.pop();
        outcome
    }

    fn check_prerequisites_inner(
        &self,
        flag: &Flag,
        context: &Context,
        state: &mut EvalState<'_>,
    ) -> Result<Option<Reason>, ErrorKind> {
        for prereq in &flag.prerequisites {
            if state.prereq_chain.iter().any(|key| key == &prereq.key) {
                warn!(
                    flag_key = %flag.key,
                    prerequisite_key = %prereq.key,
                    "prerequisite cycle detected"
                );
                return Err(ErrorKind::MalformedFlag);
            }
            let prereq_flag = match self.store.flag(&prereq.key) {
                Ok(Some(found)) => found,
                Ok(None) => return Ok(Some(prereq.failed_reason())),
                Err(error) => {
                    warn!(%error, prerequisite_key = %prereq.key, "store read failed");
                    return Err(ErrorKind::Exception);
                }
            };
            let result = self.evaluate_internal(&prereq_flag, context, state)?;
            let passed =
                prereq_flag.on && result.detail.variation_index == Some(prereq.variation);
            if let Some(sink) = state.sink.as_mut() {
                sink(PrerequisiteEvaluation {
                    flag: Arc::clone(&prereq_flag),
                    prereq_of_key: flag.key.clone(),
                    result: result.clone(),
                });
            }
            if !passed {
                return Ok(Some(prereq.failed_reason()));
            }
        }
        Ok(None)
    }

    /// All clauses must match; `segmentMatch` routes through the segment
    /// evaluator, everything else through the operator matcher.
    fn rule_matches(
        &self,
        clauses: &[Clause],
        context: &Context,
        state: &mut EvalState<'_>,
    ) -> Result<bool, ErrorKind> {
        for clause in clauses {
            let matched = if clause.op == Operator::SegmentMatch {
                self.segment_match_clause(clause, context, state)?
            } else {
                clause::matches_context(clause, context)
            };
            if !matched {
                return Ok(false);
            }
        }
        Ok(true)
    }

    fn segment_match_clause(
        &self,
        clause: &Clause,
        context: &Context,
        state: &mut EvalState<'_>,
    ) -> Result<bool, ErrorKind> {
        let mut matched = false;
        for value in &clause.values {
            let key = match value.as_str() {
                Some(key) => key,
                None => continue,
            };
            let segment = match self.store.segment(key) {
                Ok(Some(segment)) => segment,
                Ok(None) => continue,
                Err(error) => {
                    warn!(%error, segment_key = %key, "store read failed");
                    return Err(ErrorKind::Exception);
                }
            };
            if self.segment_contains(&segment, context, state)? {
                matched = true;
                break;
            }
        }
        Ok(matched != clause.negate)
    }

    /// `include -> exclude -> rules`, with unbounded segments deferring the
    /// include/exclude part to the external membership oracle.
    fn segment_contains(
        &self,
        segment: &Segment,
        context: &Context,
        state: &mut EvalState<'_>,
    ) -> Result<bool, ErrorKind> {
        if segment.unbounded {
            if let Some(decided) = self.unbounded_membership(segment, context, state) {
                return Ok(decided);
            }
        } else {
            let user_kind = Kind::user();
            for target in &segment.included_contexts {
                let kind = target.context_kind.as_ref().unwrap_or(&user_kind);
                if let Some(selected) = context.as_kind(kind) {
                    if target.contains(selected.key()) {
                        return Ok(true);
                    }
                }
            }
            if let Some(user) = context.as_kind(&user_kind) {
                if segment.key_included(user.key()) {
                    return Ok(true);
                }
            }
            for target in &segment.excluded_contexts {
                let kind = target.context_kind.as_ref().unwrap_or(&user_kind);
                if let Some(selected) = context.as_kind(kind) {
                    if target.contains(selected.key()) {
                        return Ok(false);
                    }
                }
            }
            if let Some(user) = context.as_kind(&user_kind) {
                if segment.key_excluded(user.key()) {
                    return Ok(false);
                }
            }
        }

        // segment rules cannot nest segmentMatch, so clause matching here
        // never re-enters the segment evaluator (no recursion possible)
        for rule in &segment.rules {
            if !rule
                .clauses
                .iter()
                .all(|clause| clause::matches_context(clause, context))
            {
                continue;
            }
            let weight = match rule.weight {
                None => return Ok(true),
                Some(weight) => weight,
            };
            let n = bucket::bucket(
                BucketPrefix::KeyAndSalt(&segment.key, &segment.salt),
                context,
                rule.rollout_context_kind.as_ref(),
                rule.bucket_by.as_ref(),
            )
            .unwrap_or(0);
            return Ok(bucket::within_weight(weight, n));
        }
        Ok(false)
    }

    /// Consult the big-segment oracle. `Some` short-circuits the decision,
    /// `None` falls through to the segment's rules.
    fn unbounded_membership(
        &self,
        segment: &Segment,
        context: &Context,
        state: &mut EvalState<'_>,
    ) -> Option<bool> {
        let segment_ref = match segment.unbounded_segment_ref() {
            Some(r) => r,
            None => {
                warn!(segment_key = %segment.key, "unbounded segment has no generation");
                state.note_big_segments(BigSegmentsStatus::NotConfigured);
                return Some(false);
            }
        };
        let resolver = match &self.big_segments {
            Some(resolver) => resolver,
            None => {
                state.note_big_segments(BigSegmentsStatus::NotConfigured);
                return Some(false);
            }
        };
        let user_kind = Kind::user();
        let kind = segment.unbounded_context_kind.as_ref().unwrap_or(&user_kind);
        let selected = match context.as_kind(kind) {
            Some(selected) => selected,
            None => return Some(false),
        };
        let key = selected.key().to_owned();
        let (membership, status) = match state.memberships.get(&key) {
            Some(cached) => cached.clone(),
            None => {
                let queried = resolver.query(&key);
                state.memberships.insert(key.clone(), queried.clone());
                queried
            }
        };
        state.note_big_segments(status);
        match membership.and_then(|m| m.check(&segment_ref)) {
            Some(included) => Some(included),
            None => None,
        }
    }

    fn resolve(
        &self,
        variation_or_rollout: &VariationOrRollout,
        flag: &Flag,
        context: &Context,
    ) -> Result<(usize, bool), ErrorKind> {
        match variation_or_rollout {
            VariationOrRollout::Variation { variation } => Ok((*variation, false)),
            VariationOrRollout::Rollout { rollout } => {
                if rollout.variations.is_empty() {
                    return Err(ErrorKind::MalformedFlag);
                }
                let is_experiment = rollout.is_experiment();
                // experiments always bucket by key for reproducibility
                let bucket_by = if is_experiment {
                    None
                } else {
                    rollout.bucket_by.as_ref()
                };
                let prefix = match rollout.seed {
                    Some(seed) => BucketPrefix::Seed(seed),
                    None => BucketPrefix::KeyAndSalt(&flag.key, &flag.salt),
                };
                let maybe_n =
                    bucket::bucket(prefix, context, rollout.context_kind.as_ref(), bucket_by);
                let in_context = maybe_n.is_some();
                let n = maybe_n.unwrap_or(0);
                let selected = bucket::select_weighted(&rollout.variations, n)
                    .ok_or(ErrorKind::MalformedFlag)?;
                let in_experiment = is_experiment && in_context && !selected.untracked;
                Ok((selected.variation, in_experiment))
            }
            VariationOrRollout::Malformed(_) => Err(ErrorKind::MalformedFlag),
        }
    }

    fn off_result(&self, flag: &Flag, reason: Reason) -> EvalResult {
        match flag.off_variation {
            Some(index) => self.variation_result(flag, index, reason),
            None => EvalResult::new(Detail::empty(reason)),
        }
    }

    fn variation_result(&self, flag: &Flag, index: usize, reason: Reason) -> EvalResult {
        match flag.variation_value(index) {
            Some(value) => EvalResult::new(Detail {
                value: Some(value.clone()),
                variation_index: Some(index),
                reason,
            }),
            None => {
                warn!(flag_key = %flag.key, index, "variation index out of range");
                EvalResult::err(ErrorKind::MalformedFlag)
            }
        }
    }
}

struct EvalState<'a> {
    /// Flag keys currently on the prerequisite recursion stack.
    prereq_chain: Vec<String>,
    big_segments_status: Option<BigSegmentsStatus>,
    /// Oracle answers per context key, reused across segments in one
    /// evaluation.
    memberships: HashMap<String, (Option<Membership>, BigSegmentsStatus)>,
    sink: Option<PrerequisiteSink<'a>>,
}

impl EvalState<'_> {
    fn note_big_segments(&mut self, status: BigSegmentsStatus) {
        let rank = |s: BigSegmentsStatus| match s {
            BigSegmentsStatus::Healthy => 0,
            BigSegmentsStatus::Stale => 1,
            BigSegmentsStatus::StoreError => 2,
            BigSegmentsStatus::NotConfigured => 3,
        };
        match self.big_segments_status {
            Some(current) if rank(current) >= rank(status) => {}
            _ => self.big_segments_status = Some(status),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{FlagBuilder, SegmentBuilder, TestStore};
    use serde_json::json;

    fn user(key: &str) -> Context {
        Context::builder(key).build().unwrap()
    }

    fn evaluator(store: TestStore) -> Evaluator<TestStore> {
        Evaluator::new(store)
    }

    #[test]
    fn off_flag_returns_off_variation() {
        let flag = FlagBuilder::new("f")
            .variations(vec![json!("fall"), json!("off"), json!("on")])
            .off_variation(1)
            .into_flag();
        let result = evaluator(TestStore::new()).evaluate(&flag, &user("x"), None);
        assert_eq!(Some(json!("off")), result.detail.value);
        assert_eq!(Some(1), result.detail.variation_index);
        assert_eq!(Reason::Off, result.detail.reason);
        assert!(!result.force_reason_tracking);
    }

    #[test]
    fn invalid_context_is_user_not_specified() {
        // the builders refuse empty keys, but wire-parsed contexts keep
        // them for the evaluator to reject
        let context: Context =
            serde_json::from_value(json!({"kind": "user", "key": ""})).unwrap();
        assert!(!context.is_valid());
        let flag = FlagBuilder::new("f")
            .on(true)
            .fallthrough_variation(0)
            .into_flag();
        let result = evaluator(TestStore::new()).evaluate(&flag, &context, None);
        assert_eq!(
            Reason::Error {
                error_kind: ErrorKind::UserNotSpecified
            },
            result.detail.reason
        );
        assert_eq!(None, result.detail.variation_index);
        assert_eq!(None, result.detail.value);
    }

    #[test]
    fn off_flag_without_off_variation_returns_none() {
        let flag = FlagBuilder::new("f").into_flag();
        let result = evaluator(TestStore::new()).evaluate(&flag, &user("x"), None);
        assert_eq!(None, result.detail.value);
        assert_eq!(None, result.detail.variation_index);
        assert_eq!(Reason::Off, result.detail.reason);
    }

    #[test]
    fn fallthrough_with_out_of_range_variation_is_malformed() {
        let flag = FlagBuilder::new("f")
            .on(true)
            .variations(vec![json!("a"), json!("b"), json!("c")])
            .fallthrough_variation(999)
            .into_flag();
        let result = evaluator(TestStore::new()).evaluate(&flag, &user("x"), None);
        assert_eq!(None, result.detail.variation_index);
        assert_eq!(
            Reason::Error {
                error_kind: ErrorKind::MalformedFlag
            },
            result.detail.reason
        );
    }

    #[test]
    fn prerequisite_failure_returns_off_variation_and_reports_child() {
        let child = FlagBuilder::new("child")
            .variations(vec![json!(false), json!(true)])
            .off_variation(1)
            .into_flag();
        let parent = FlagBuilder::new("parent")
            .on(true)
            .variations(vec![json!("no"), json!("yes")])
            .off_variation(0)
            .fallthrough_variation(1)
            .prerequisite("child", 1)
            .into_flag();
        let store = TestStore::new().with_flag(child);

        let mut recorded = Vec::new();
        let mut sink = |evaluation: PrerequisiteEvaluation| recorded.push(evaluation);
        let result = evaluator(store).evaluate(&parent, &user("x"), Some(&mut sink));

        assert_eq!(
            Reason::PrerequisiteFailed {
                prerequisite_key: "child".into()
            },
            result.detail.reason
        );
        assert_eq!(Some(json!("no")), result.detail.value);

        assert_eq!(1, recorded.len());
        assert_eq!("child", recorded[0].flag.key);
        assert_eq!("parent", recorded[0].prereq_of_key);
        assert_eq!(Some(1), recorded[0].result.detail.variation_index);
    }

    #[test]
    fn passing_prerequisite_falls_through() {
        let child = FlagBuilder::new("child")
            .on(true)
            .variations(vec![json!(false), json!(true)])
            .fallthrough_variation(1)
            .into_flag();
        let parent = FlagBuilder::new("parent")
            .on(true)
            .variations(vec![json!("no"), json!("yes")])
            .fallthrough_variation(1)
            .prerequisite("child", 1)
            .into_flag();
        let store = TestStore::new().with_flag(child);

        let mut recorded = Vec::new();
        let mut sink = |evaluation: PrerequisiteEvaluation| recorded.push(evaluation);
        let result = evaluator(store).evaluate(&parent, &user("x"), Some(&mut sink));
        assert_eq!(
            Reason::Fallthrough {
                in_experiment: false
            },
            result.detail.reason
        );
        assert_eq!(Some(json!("yes")), result.detail.value);
        assert_eq!(1, recorded.len());
    }

    #[test]
    fn missing_prerequisite_fails_without_reporting() {
        let parent = FlagBuilder::new("parent")
            .on(true)
            .variations(vec![json!("no"), json!("yes")])
            .off_variation(0)
            .prerequisite("ghost", 0)
            .into_flag();
        let mut recorded = Vec::new();
        let mut sink = |evaluation: PrerequisiteEvaluation| recorded.push(evaluation);
        let result = evaluator(TestStore::new()).evaluate(&parent, &user("x"), Some(&mut sink));
        assert_eq!(
            Reason::PrerequisiteFailed {
                prerequisite_key: "ghost".into()
            },
            result.detail.reason
        );
        assert!(recorded.is_empty());
    }

    #[test]
    fn prerequisite_cycle_is_malformed_at_any_depth() {
        // a -> b -> c -> a
        let a = FlagBuilder::new("a")
            .on(true)
            .fallthrough_variation(0)
            .prerequisite("b", 0)
            .into_flag();
        let b = FlagBuilder::new("b")
            .on(true)
            .fallthrough_variation(0)
            .prerequisite("c", 0)
            .into_flag();
        let c = FlagBuilder::new("c")
            .on(true)
            .fallthrough_variation(0)
            .prerequisite("a", 0)
            .into_flag();
        let store = TestStore::new()
            .with_flag(a.clone())
            .with_flag(b)
            .with_flag(c);
        let result = evaluator(store).evaluate(&a, &user("x"), None);
        assert_eq!(
            Reason::Error {
                error_kind: ErrorKind::MalformedFlag
            },
            result.detail.reason
        );
    }

    #[test]
    fn self_prerequisite_is_malformed() {
        let flag = FlagBuilder::new("selfish")
            .on(true)
            .fallthrough_variation(0)
            .prerequisite("selfish", 0)
            .into_flag();
        let store = TestStore::new().with_flag(flag.clone());
        let result = evaluator(store).evaluate(&flag, &user("x"), None);
        assert_eq!(
            Reason::Error {
                error_kind: ErrorKind::MalformedFlag
            },
            result.detail.reason
        );
    }

    #[test]
    fn context_target_matches_named_kind() {
        let flag = FlagBuilder::new("f")
            .on(true)
            .variations(vec![json!("a"), json!("b")])
            .fallthrough_variation(0)
            .context_target("org", 1, vec!["acme"])
            .into_flag();
        let org = Context::builder("acme").kind("org").build().unwrap();
        let result = evaluator(TestStore::new()).evaluate(&flag, &org, None);
        assert_eq!(Reason::TargetMatch, result.detail.reason);
        assert_eq!(Some(1), result.detail.variation_index);

        // a user-kind context does not hit the org target
        let result = evaluator(TestStore::new()).evaluate(&flag, &user("acme"), None);
        assert_eq!(
            Reason::Fallthrough {
                in_experiment: false
            },
            result.detail.reason
        );
    }

    #[test]
    fn legacy_target_matches_user_key() {
        let flag = FlagBuilder::new("f")
            .on(true)
            .variations(vec![json!(false), json!(true)])
            .fallthrough_variation(0)
            .target(1, vec!["alice"])
            .into_flag();
        let result = evaluator(TestStore::new()).evaluate(&flag, &user("alice"), None);
        assert_eq!(Some(json!(true)), result.detail.value);
        assert_eq!(Reason::TargetMatch, result.detail.reason);
    }

    #[test]
    fn first_matching_rule_wins() {
        let flag = FlagBuilder::new("f")
            .on(true)
            .variations(vec![json!("a"), json!("b"), json!("c")])
            .fallthrough_variation(0)
            .rule_in("r1", "tier", vec![json!("gold")], 1)
            .rule_in("r2", "tier", vec![json!("gold"), json!("silver")], 2)
            .into_flag();
        let gold = Context::builder("x").set("tier", "gold").build().unwrap();
        let result = evaluator(TestStore::new()).evaluate(&flag, &gold, None);
        assert_eq!(
            Reason::RuleMatch {
                rule_index: 0,
                rule_id: "r1".into(),
                in_experiment: false
            },
            result.detail.reason
        );
        let silver = Context::builder("x").set("tier", "silver").build().unwrap();
        let result = evaluator(TestStore::new()).evaluate(&flag, &silver, None);
        assert_eq!(Some(2), result.detail.variation_index);
    }

    #[test]
    fn rule_with_track_events_forces_reason_tracking() {
        let flag = FlagBuilder::new("f")
            .on(true)
            .variations(vec![json!("a"), json!("b")])
            .fallthrough_variation(0)
            .rule_in_tracked("r1", "tier", vec![json!("gold")], 1)
            .into_flag();
        let gold = Context::builder("x").set("tier", "gold").build().unwrap();
        let result = evaluator(TestStore::new()).evaluate(&flag, &gold, None);
        assert!(result.force_reason_tracking);
    }

    #[test]
    fn fallthrough_track_events_forces_reason_tracking() {
        let flag = FlagBuilder::new("f")
            .on(true)
            .variations(vec![json!("a")])
            .fallthrough_variation(0)
            .track_events_fallthrough(true)
            .into_flag();
        let result = evaluator(TestStore::new()).evaluate(&flag, &user("x"), None);
        assert!(result.force_reason_tracking);
    }

    #[test]
    fn experiment_rollout_reports_in_experiment() {
        // seed 61: alice buckets to ~0.686 -> second bucket of a 50/50 split
        let flag = FlagBuilder::new("f")
            .on(true)
            .variations(vec![json!("a"), json!("b")])
            .fallthrough_experiment(61, vec![(0, 50_000, false), (1, 50_000, false)])
            .into_flag();
        let result = evaluator(TestStore::new()).evaluate(&flag, &user("alice"), None);
        assert_eq!(Some(1), result.detail.variation_index);
        assert_eq!(
            Reason::Fallthrough {
                in_experiment: true
            },
            result.detail.reason
        );
        assert!(result.force_reason_tracking);
    }

    #[test]
    fn untracked_experiment_bucket_is_not_in_experiment() {
        let flag = FlagBuilder::new("f")
            .on(true)
            .variations(vec![json!("a"), json!("b")])
            .fallthrough_experiment(61, vec![(0, 50_000, false), (1, 50_000, true)])
            .into_flag();
        let result = evaluator(TestStore::new()).evaluate(&flag, &user("alice"), None);
        assert_eq!(
            Reason::Fallthrough {
                in_experiment: false
            },
            result.detail.reason
        );
        assert!(!result.force_reason_tracking);
    }

    #[test]
    fn rollout_with_missing_context_kind_is_not_in_experiment() {
        let flag = FlagBuilder::new("f")
            .on(true)
            .variations(vec![json!("a"), json!("b")])
            .fallthrough_experiment_for_kind("org", 61, vec![(0, 50_000, false), (1, 50_000, false)])
            .into_flag();
        let result = evaluator(TestStore::new()).evaluate(&flag, &user("alice"), None);
        // bucket 0 -> first variation, not in experiment
        assert_eq!(Some(0), result.detail.variation_index);
        assert_eq!(
            Reason::Fallthrough {
                in_experiment: false
            },
            result.detail.reason
        );
    }

    #[test]
    fn empty_rollout_is_malformed() {
        let flag = FlagBuilder::new("f")
            .on(true)
            .variations(vec![json!("a")])
            .fallthrough_rollout(vec![])
            .into_flag();
        let result = evaluator(TestStore::new()).evaluate(&flag, &user("x"), None);
        assert_eq!(
            Reason::Error {
                error_kind: ErrorKind::MalformedFlag
            },
            result.detail.reason
        );
    }

    #[test]
    fn segment_match_include_and_fallthrough() {
        let segment = SegmentBuilder::new("s1").included(vec!["x"]).into_segment();
        let flag = FlagBuilder::new("f")
            .on(true)
            .variations(vec![json!("fall"), json!("seg")])
            .fallthrough_variation(0)
            .rule_segment_match("r0", vec!["s1"], 1)
            .into_flag();
        let store = TestStore::new().with_segment(segment);
        let evaluator = evaluator(store);

        let result = evaluator.evaluate(&flag, &user("x"), None);
        assert_eq!(Some(1), result.detail.variation_index);
        assert_eq!(
            Reason::RuleMatch {
                rule_index: 0,
                rule_id: "r0".into(),
                in_experiment: false
            },
            result.detail.reason
        );

        let result = evaluator.evaluate(&flag, &user("y"), None);
        assert_eq!(
            Reason::Fallthrough {
                in_experiment: false
            },
            result.detail.reason
        );
    }

    #[test]
    fn segment_exclude_beats_rules() {
        let segment = SegmentBuilder::new("s1")
            .excluded(vec!["x"])
            .rule_match_all()
            .into_segment();
        let flag = FlagBuilder::new("f")
            .on(true)
            .variations(vec![json!("fall"), json!("seg")])
            .fallthrough_variation(0)
            .rule_segment_match("r0", vec!["s1"], 1)
            .into_flag();
        let store = TestStore::new().with_segment(segment);
        let evaluator = evaluator(store);
        let result = evaluator.evaluate(&flag, &user("x"), None);
        assert_eq!(Some(0), result.detail.variation_index);
        let result = evaluator.evaluate(&flag, &user("y"), None);
        assert_eq!(Some(1), result.detail.variation_index);
    }

    #[test]
    fn segment_rule_weight_buckets_membership() {
        // seg1/sasa: alice ~0.374, dan ~0.605; 50% weight
        let segment = SegmentBuilder::new("seg1")
            .salt("sasa")
            .rule_weighted(50_000)
            .into_segment();
        let flag = FlagBuilder::new("f")
            .on(true)
            .variations(vec![json!("out"), json!("in")])
            .fallthrough_variation(0)
            .rule_segment_match("r0", vec!["seg1"], 1)
            .into_flag();
        let store = TestStore::new().with_segment(segment);
        let evaluator = evaluator(store);
        assert_eq!(
            Some(1),
            evaluator
                .evaluate(&flag, &user("alice"), None)
                .detail
                .variation_index
        );
        assert_eq!(
            Some(0),
            evaluator
                .evaluate(&flag, &user("dan"), None)
                .detail
                .variation_index
        );
    }

    #[test]
    fn missing_segment_does_not_match() {
        let flag = FlagBuilder::new("f")
            .on(true)
            .variations(vec![json!("fall"), json!("seg")])
            .fallthrough_variation(0)
            .rule_segment_match("r0", vec!["ghost"], 1)
            .into_flag();
        let result = evaluator(TestStore::new()).evaluate(&flag, &user("x"), None);
        assert_eq!(Some(0), result.detail.variation_index);
    }

    #[test]
    fn unbounded_segment_without_resolver_reports_not_configured() {
        let segment = SegmentBuilder::new("big")
            .unbounded(2)
            .into_segment();
        let flag = FlagBuilder::new("f")
            .on(true)
            .variations(vec![json!("fall"), json!("seg")])
            .fallthrough_variation(0)
            .rule_segment_match("r0", vec!["big"], 1)
            .into_flag();
        let store = TestStore::new().with_segment(segment);
        let result = evaluator(store).evaluate(&flag, &user("x"), None);
        assert_eq!(Some(0), result.detail.variation_index);
        assert_eq!(
            Some(BigSegmentsStatus::NotConfigured),
            result.big_segments_status
        );
    }

    #[test]
    fn unbounded_segment_uses_membership_oracle() {
        use crate::bigsegments::{BigSegmentResolver, Membership};

        struct FixedResolver(Membership);
        impl BigSegmentResolver for FixedResolver {
            fn query(&self, _key: &str) -> (Option<Membership>, BigSegmentsStatus) {
                (Some(self.0.clone()), BigSegmentsStatus::Healthy)
            }
        }

        let segment = SegmentBuilder::new("big").unbounded(2).into_segment();
        let flag = FlagBuilder::new("f")
            .on(true)
            .variations(vec![json!("fall"), json!("seg")])
            .fallthrough_variation(0)
            .rule_segment_match("r0", vec!["big"], 1)
            .into_flag();
        let store = TestStore::new().with_segment(segment);
        let resolver = Arc::new(FixedResolver(Membership::new(
            vec!["big.g2".to_string()],
            vec![],
        )));
        let evaluator = Evaluator::new(store).with_big_segments(resolver);

        let result = evaluator.evaluate(&flag, &user("x"), None);
        assert_eq!(Some(1), result.detail.variation_index);
        assert_eq!(Some(BigSegmentsStatus::Healthy), result.big_segments_status);
    }

    #[test]
    fn evaluation_is_pure() {
        let segment = SegmentBuilder::new("s1").included(vec!["x"]).into_segment();
        let flag = FlagBuilder::new("f")
            .on(true)
            .variations(vec![json!("fall"), json!("seg")])
            .fallthrough_variation(0)
            .rule_segment_match("r0", vec!["s1"], 1)
            .into_flag();
        let store = TestStore::new().with_segment(segment);
        let evaluator = evaluator(store);
        let context = user("x");
        let first = evaluator.evaluate(&flag, &context, None);
        for _ in 0..10 {
            let again = evaluator.evaluate(&flag, &context, None);
            assert_eq!(first, again);
        }
    }

    #[test]
    fn store_error_surfaces_as_exception() {
        let flag = FlagBuilder::new("f")
            .on(true)
            .variations(vec![json!("a")])
            .fallthrough_variation(0)
            .prerequisite("child", 0)
            .into_flag();
        let store = TestStore::new().failing();
        let result = evaluator(store).evaluate(&flag, &user("x"), None);
        assert_eq!(
            Reason::Error {
                error_kind: ErrorKind::Exception
            },
            result.detail.reason
        );
    }
}

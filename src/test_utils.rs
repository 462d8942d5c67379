use crate::{
    context::{AttributeRef, Kind},
    model::{
        Clause, Flag, FlagRule, Operator, Prerequisite, Rollout, RolloutKind, Segment,
        SegmentRule, Target, VariationOrRollout, WeightedVariation,
    },
    store::{AllData, DataStore, PatchTarget, StoreError},
};
use serde_json::{json, Value};
use std::{collections::HashMap, sync::Arc};

/// Read-only store fixture for evaluator and event tests.
pub struct TestStore {
    flags: HashMap<String, Arc<Flag>>,
    segments: HashMap<String, Arc<Segment>>,
    fail_reads: bool,
}

impl TestStore {
    pub fn new() -> Self {
        Self {
            flags: HashMap::new(),
            segments: HashMap::new(),
            fail_reads: false,
        }
    }

    pub fn with_flag(mut self, flag: Flag) -> Self {
        self.flags.insert(flag.key.clone(), Arc::new(flag));
        self
    }

    pub fn with_segment(mut self, segment: Segment) -> Self {
        self.segments.insert(segment.key.clone(), Arc::new(segment));
        self
    }

    /// Every read fails, for exercising `EXCEPTION` paths.
    pub fn failing(mut self) -> Self {
        self.fail_reads = true;
        self
    }

    fn check(&self) -> Result<(), StoreError> {
        if self.fail_reads {
            Err(StoreError::Unavailable("test store failure".into()))
        } else {
            Ok(())
        }
    }
}

impl DataStore for TestStore {
    fn init(&self, _data: AllData) -> Result<(), StoreError> {
        Ok(())
    }

    fn flag(&self, key: &str) -> Result<Option<Arc<Flag>>, StoreError> {
        self.check()?;
        Ok(self.flags.get(key).cloned())
    }

    fn segment(&self, key: &str) -> Result<Option<Arc<Segment>>, StoreError> {
        self.check()?;
        Ok(self.segments.get(key).cloned())
    }

    fn all_flags(&self) -> Result<HashMap<String, Arc<Flag>>, StoreError> {
        self.check()?;
        Ok(self.flags.clone())
    }

    fn upsert(&self, _key: &str, _item: PatchTarget) -> Result<bool, StoreError> {
        Ok(false)
    }

    fn is_initialized(&self) -> bool {
        true
    }
}

/// Fixture builder for flags, mirroring the wire shapes.
pub struct FlagBuilder(Flag);

impl FlagBuilder {
    pub fn new<K: Into<String>>(key: K) -> Self {
        Self(Flag {
            key: key.into(),
            version: 1,
            variations: vec![json!(false), json!(true)],
            salt: "salt".into(),
            ..Flag::default()
        })
    }

    pub fn version(mut self, version: u64) -> Self {
        self.0.version = version;
        self
    }

    pub fn on(mut self, on: bool) -> Self {
        self.0.on = on;
        self
    }

    pub fn salt<S: Into<String>>(mut self, salt: S) -> Self {
        self.0.salt = salt.into();
        self
    }

    pub fn variations(mut self, variations: Vec<Value>) -> Self {
        self.0.variations = variations;
        self
    }

    pub fn off_variation(mut self, index: usize) -> Self {
        self.0.off_variation = Some(index);
        self
    }

    pub fn fallthrough_variation(mut self, index: usize) -> Self {
        self.0.fallthrough = VariationOrRollout::Variation { variation: index };
        self
    }

    pub fn fallthrough_rollout(mut self, variations: Vec<(usize, u32)>) -> Self {
        self.0.fallthrough = VariationOrRollout::Rollout {
            rollout: Rollout {
                variations: variations
                    .into_iter()
                    .map(|(variation, weight)| WeightedVariation {
                        variation,
                        weight,
                        untracked: false,
                    })
                    .collect(),
                ..Rollout::default()
            },
        };
        self
    }

    pub fn fallthrough_experiment(self, seed: i64, variations: Vec<(usize, u32, bool)>) -> Self {
        self.experiment_internal(None, seed, variations)
    }

    pub fn fallthrough_experiment_for_kind(
        self,
        kind: &str,
        seed: i64,
        variations: Vec<(usize, u32, bool)>,
    ) -> Self {
        self.experiment_internal(Some(kind), seed, variations)
    }

    fn experiment_internal(
        mut self,
        kind: Option<&str>,
        seed: i64,
        variations: Vec<(usize, u32, bool)>,
    ) -> Self {
        self.0.fallthrough = VariationOrRollout::Rollout {
            rollout: Rollout {
                kind: RolloutKind::Experiment,
                context_kind: kind.map(|k| Kind::try_parse(k).unwrap()),
                seed: Some(seed),
                variations: variations
                    .into_iter()
                    .map(|(variation, weight, untracked)| WeightedVariation {
                        variation,
                        weight,
                        untracked,
                    })
                    .collect(),
                ..Rollout::default()
            },
        };
        self
    }

    pub fn prerequisite<K: Into<String>>(mut self, key: K, variation: usize) -> Self {
        self.0.prerequisites.push(Prerequisite {
            key: key.into(),
            variation,
            cached_failed_reason: None,
        });
        self
    }

    pub fn target(mut self, variation: usize, values: Vec<&str>) -> Self {
        self.0.targets.push(Target {
            context_kind: None,
            values: values.into_iter().map(str::to_owned).collect(),
            variation,
            preprocessed: None,
        });
        self
    }

    pub fn context_target(mut self, kind: &str, variation: usize, values: Vec<&str>) -> Self {
        self.0.context_targets.push(Target {
            context_kind: Some(Kind::try_parse(kind).unwrap()),
            values: values.into_iter().map(str::to_owned).collect(),
            variation,
            preprocessed: None,
        });
        self
    }

    pub fn rule_in(self, id: &str, attribute: &str, values: Vec<Value>, variation: usize) -> Self {
        self.rule_internal(id, attribute, values, variation, false)
    }

    pub fn rule_in_tracked(
        self,
        id: &str,
        attribute: &str,
        values: Vec<Value>,
        variation: usize,
    ) -> Self {
        self.rule_internal(id, attribute, values, variation, true)
    }

    fn rule_internal(
        mut self,
        id: &str,
        attribute: &str,
        values: Vec<Value>,
        variation: usize,
        track_events: bool,
    ) -> Self {
        self.0.rules.push(FlagRule {
            id: id.into(),
            clauses: vec![Clause {
                context_kind: None,
                attribute: AttributeRef::new(attribute),
                op: Operator::In,
                values,
                negate: false,
                preprocessed: None,
            }],
            variation_or_rollout: VariationOrRollout::Variation { variation },
            track_events,
            cached_match_reasons: None,
        });
        self
    }

    pub fn rule_segment_match(mut self, id: &str, segments: Vec<&str>, variation: usize) -> Self {
        self.0.rules.push(FlagRule {
            id: id.into(),
            clauses: vec![Clause {
                context_kind: None,
                attribute: AttributeRef::new("key"),
                op: Operator::SegmentMatch,
                values: segments.into_iter().map(|s| json!(s)).collect(),
                negate: false,
                preprocessed: None,
            }],
            variation_or_rollout: VariationOrRollout::Variation { variation },
            track_events: false,
            cached_match_reasons: None,
        });
        self
    }

    pub fn track_events(mut self, track: bool) -> Self {
        self.0.track_events = track;
        self
    }

    pub fn track_events_fallthrough(mut self, track: bool) -> Self {
        self.0.track_events_fallthrough = track;
        self
    }

    pub fn debug_events_until(mut self, date: u64) -> Self {
        self.0.debug_events_until_date = Some(date);
        self
    }

    pub fn into_flag(mut self) -> Flag {
        self.0.preprocess();
        self.0
    }
}

/// Fixture builder for segments.
pub struct SegmentBuilder(Segment);

impl SegmentBuilder {
    pub fn new<K: Into<String>>(key: K) -> Self {
        Self(Segment {
            key: key.into(),
            version: 1,
            salt: "salty".into(),
            ..Segment::default()
        })
    }

    pub fn salt<S: Into<String>>(mut self, salt: S) -> Self {
        self.0.salt = salt.into();
        self
    }

    pub fn included(mut self, keys: Vec<&str>) -> Self {
        self.0.included = keys.into_iter().map(str::to_owned).collect();
        self
    }

    pub fn excluded(mut self, keys: Vec<&str>) -> Self {
        self.0.excluded = keys.into_iter().map(str::to_owned).collect();
        self
    }

    /// A clause-less rule, so every context matches.
    pub fn rule_match_all(mut self) -> Self {
        self.0.rules.push(SegmentRule::default());
        self
    }

    pub fn rule_weighted(mut self, weight: u32) -> Self {
        self.0.rules.push(SegmentRule {
            weight: Some(weight),
            ..SegmentRule::default()
        });
        self
    }

    pub fn unbounded(mut self, generation: i64) -> Self {
        self.0.unbounded = true;
        self.0.generation = Some(generation);
        self
    }

    pub fn into_segment(mut self) -> Segment {
        self.0.preprocess();
        self.0
    }
}

use crate::{
    context::{AttributeRef, Kind},
    model::flag::Clause,
};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// A named set of contexts matchable via `segmentMatch` clauses.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Segment {
    pub key: String,
    pub version: u64,
    pub included: Vec<String>,
    pub excluded: Vec<String>,
    pub included_contexts: Vec<SegmentTarget>,
    pub excluded_contexts: Vec<SegmentTarget>,
    pub rules: Vec<SegmentRule>,
    pub salt: String,
    /// Membership is held externally (big segment) rather than inline.
    pub unbounded: bool,
    pub unbounded_context_kind: Option<Kind>,
    pub generation: Option<i64>,
    #[serde(skip)]
    pub(crate) included_set: Option<HashSet<String>>,
    #[serde(skip)]
    pub(crate) excluded_set: Option<HashSet<String>>,
}

impl Segment {
    /// Reference used to look this segment up in a big-segment membership
    /// oracle; the generation distinguishes rewrites of the same segment.
    pub fn unbounded_segment_ref(&self) -> Option<String> {
        let generation = self.generation?;
        Some(format!("{}.g{}", self.key, generation))
    }

    pub fn preprocess(&mut self) {
        if self.included_set.is_none() {
            self.included_set = Some(self.included.iter().cloned().collect());
        }
        if self.excluded_set.is_none() {
            self.excluded_set = Some(self.excluded.iter().cloned().collect());
        }
        for rule in &mut self.rules {
            for clause in &mut rule.clauses {
                clause.preprocess();
            }
        }
        for target in self
            .included_contexts
            .iter_mut()
            .chain(self.excluded_contexts.iter_mut())
        {
            target.preprocess();
        }
    }

    pub(crate) fn key_included(&self, key: &str) -> bool {
        match &self.included_set {
            Some(set) => set.contains(key),
            None => self.included.iter().any(|k| k == key),
        }
    }

    pub(crate) fn key_excluded(&self, key: &str) -> bool {
        match &self.excluded_set {
            Some(set) => set.contains(key),
            None => self.excluded.iter().any(|k| k == key),
        }
    }
}

/// Inclusion/exclusion list scoped to one context kind.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SegmentTarget {
    pub context_kind: Option<Kind>,
    pub values: Vec<String>,
    #[serde(skip)]
    pub(crate) preprocessed: Option<HashSet<String>>,
}

impl SegmentTarget {
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

/// Segment rule: all clauses match, then an optional percentage weight
/// narrows membership further.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SegmentRule {
    pub id: String,
    pub clauses: Vec<Clause>,
    /// Weight out of 100000; absent means the rule matches outright.
    pub weight: Option<u32>,
    pub bucket_by: Option<AttributeRef>,
    pub rollout_context_kind: Option<Kind>,
}

//! Roll-up of feature evaluations into per-flush-window counters.

use crate::events::event::FeatureRequestEvent;
use serde_json::{json, Map, Value};
use std::collections::{HashMap, HashSet};

/// Counter key: which variation of which flag version was served.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
struct CounterKey {
    variation: Option<usize>,
    version: Option<u64>,
}

#[derive(Clone, Debug)]
struct Counter {
    value: Value,
    count: u64,
}

#[derive(Clone, Debug)]
struct FlagSummary {
    default: Value,
    context_kinds: HashSet<String>,
    counters: HashMap<CounterKey, Counter>,
}

/// Owned by the event dispatcher; no other thread touches it.
#[derive(Default)]
pub(crate) struct EventSummarizer {
    start_date: u64,
    end_date: u64,
    features: HashMap<String, FlagSummary>,
}

impl EventSummarizer {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Every feature evaluation is recorded, whether or not it also emits
    /// a full event.
    pub(crate) fn add(&mut self, event: &FeatureRequestEvent) {
        let summary = self
            .features
            .entry(event.key.clone())
            .or_insert_with(|| FlagSummary {
                default: event.default.clone(),
                context_kinds: HashSet::new(),
                counters: HashMap::new(),
            });
        for kind in event.base.context.kinds() {
            summary.context_kinds.insert(kind.as_str().to_owned());
        }
        let key = CounterKey {
            variation: event.variation,
            version: event.version,
        };
        summary
            .counters
            .entry(key)
            .or_insert_with(|| Counter {
                value: event.value.clone(),
                count: 0,
            })
            .count += 1;

        let date = event.base.creation_date;
        if self.start_date == 0 || date < self.start_date {
            self.start_date = date;
        }
        if date > self.end_date {
            self.end_date = date;
        }
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.features.is_empty()
    }

    /// Hand the window to a payload builder and start a fresh one.
    pub(crate) fn snapshot_and_reset(&mut self) -> Option<SummarySnapshot> {
        if self.is_empty() {
            return None;
        }
        let taken = std::mem::take(self);
        Some(SummarySnapshot {
            start_date: taken.start_date,
            end_date: taken.end_date,
            features: taken.features,
        })
    }
}

/// Immutable summary of one flush window.
#[derive(Clone, Debug)]
pub(crate) struct SummarySnapshot {
    start_date: u64,
    end_date: u64,
    features: HashMap<String, FlagSummary>,
}

impl SummarySnapshot {
    pub(crate) fn to_json(&self) -> Value {
        let mut features = Map::new();
        for (flag_key, summary) in &self.features {
            let mut counters: Vec<Value> = Vec::with_capacity(summary.counters.len());
            for (key, counter) in &summary.counters {
                let mut entry = Map::new();
                match key.variation {
                    Some(variation) => {
                        entry.insert("variation".into(), json!(variation));
                    }
                    None => {}
                }
                match key.version {
                    Some(version) => {
                        entry.insert("version".into(), json!(version));
                    }
                    // the flag was unknown at evaluation time
                    None => {
                        entry.insert("unknown".into(), json!(true));
                    }
                }
                entry.insert("value".into(), counter.value.clone());
                entry.insert("count".into(), json!(counter.count));
                counters.push(Value::Object(entry));
            }
            let mut kinds: Vec<&str> =
                summary.context_kinds.iter().map(String::as_str).collect();
            kinds.sort_unstable();
            features.insert(
                flag_key.clone(),
                json!({
                    "default": summary.default,
                    "contextKinds": kinds,
                    "counters": counters,
                }),
            );
        }
        json!({
            "kind": "summary",
            "startDate": self.start_date,
            "endDate": self.end_date,
            "features": features,
        })
    }
}

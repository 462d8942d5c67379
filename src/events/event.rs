//! Analytics event types and their wire serialization (schema version 4).

use crate::{
    context::Context,
    events::context_filter::ContextFilter,
    events::summary::SummarySnapshot,
};
use serde_json::{json, Map, Value};

/// Fields shared by every context-carrying event.
#[derive(Clone, Debug)]
pub struct BaseEvent {
    /// Epoch millis at the time the event was created.
    pub creation_date: u64,
    pub context: Context,
}

#[derive(Clone, Debug)]
pub struct FeatureRequestEvent {
    pub base: BaseEvent,
    pub key: String,
    pub value: Value,
    pub variation: Option<usize>,
    pub default: Value,
    pub version: Option<u64>,
    /// Pre-serialized reason; present when the caller asked for detail or
    /// the evaluation forced reason tracking.
    pub reason: Option<Value>,
    /// Set on prerequisite evaluations: the key of the flag that required
    /// this one.
    pub prereq_of: Option<String>,
    pub track_events: bool,
    pub debug_events_until_date: Option<u64>,
}

#[derive(Clone, Debug)]
pub struct IdentifyEvent {
    pub base: BaseEvent,
}

#[derive(Clone, Debug)]
pub struct CustomEvent {
    pub base: BaseEvent,
    pub key: String,
    pub data: Value,
    pub metric_value: Option<f64>,
}

/// Outcome of one migration-guarded operation.
#[derive(Clone, Debug)]
pub struct MigrationOpEvent {
    pub base: BaseEvent,
    pub operation: String,
    pub key: String,
    pub evaluation: Value,
    pub measurements: Vec<Value>,
}

/// Legacy linkage between two context keys.
#[derive(Clone, Debug)]
pub struct AliasEvent {
    pub creation_date: u64,
    pub key: String,
    pub kind: String,
    pub previous_key: String,
    pub previous_kind: String,
}

/// What callers feed into the processor inbox.
#[allow(clippy::large_enum_variant)]
#[derive(Clone, Debug)]
pub enum InputEvent {
    FeatureRequest(FeatureRequestEvent),
    Identify(IdentifyEvent),
    Custom(CustomEvent),
    MigrationOp(MigrationOpEvent),
    Alias(AliasEvent),
}

impl InputEvent {
    pub(crate) fn context(&self) -> Option<&Context> {
        match self {
            InputEvent::FeatureRequest(e) => Some(&e.base.context),
            InputEvent::Identify(e) => Some(&e.base.context),
            InputEvent::Custom(e) => Some(&e.base.context),
            InputEvent::MigrationOp(e) => Some(&e.base.context),
            InputEvent::Alias(_) => None,
        }
    }
}

/// What the dispatcher queues for delivery.
#[allow(clippy::large_enum_variant)]
#[derive(Clone, Debug)]
pub(crate) enum OutputEvent {
    Feature(FeatureRequestEvent),
    Debug(FeatureRequestEvent),
    Index(BaseEvent),
    Identify(IdentifyEvent),
    Custom(CustomEvent),
    MigrationOp(MigrationOpEvent),
    Alias(AliasEvent),
    Summary(SummarySnapshot),
}

/// Serializes output events, applying the redaction policy wherever a
/// context is inlined.
pub(crate) struct EventFormatter {
    filter: ContextFilter,
}

impl EventFormatter {
    pub(crate) fn new(filter: ContextFilter) -> Self {
        Self { filter }
    }

    pub(crate) fn format(&self, event: &OutputEvent) -> Value {
        match event {
            OutputEvent::Feature(e) => self.format_feature(e, "feature"),
            OutputEvent::Debug(e) => self.format_feature(e, "debug"),
            OutputEvent::Index(base) => json!({
                "kind": "index",
                "creationDate": base.creation_date,
                "context": self.filter.filter(&base.context),
            }),
            OutputEvent::Identify(e) => json!({
                "kind": "identify",
                "creationDate": e.base.creation_date,
                "context": self.filter.filter(&e.base.context),
            }),
            OutputEvent::Custom(e) => {
                let mut obj = match json!({
                    "kind": "custom",
                    "creationDate": e.base.creation_date,
                    "key": e.key,
                    "contextKeys": ContextFilter::context_keys(&e.base.context),
                }) {
                    Value::Object(obj) => obj,
                    _ => unreachable!(),
                };
                if !e.data.is_null() {
                    obj.insert("data".into(), e.data.clone());
                }
                if let Some(metric) = e.metric_value {
                    obj.insert("metricValue".into(), json!(metric));
                }
                Value::Object(obj)
            }
            OutputEvent::MigrationOp(e) => json!({
                "kind": "migration_op",
                "creationDate": e.base.creation_date,
                "operation": e.operation,
                "key": e.key,
                "contextKeys": ContextFilter::context_keys(&e.base.context),
                "evaluation": e.evaluation,
                "measurements": e.measurements,
            }),
            OutputEvent::Alias(e) => json!({
                "kind": "alias",
                "creationDate": e.creation_date,
                "key": e.key,
                "contextKind": e.kind,
                "previousKey": e.previous_key,
                "previousContextKind": e.previous_kind,
            }),
            OutputEvent::Summary(snapshot) => snapshot.to_json(),
        }
    }

    /// `feature` events carry context keys only; `debug` events inline the
    /// full (filtered) context.
    fn format_feature(&self, e: &FeatureRequestEvent, kind: &str) -> Value {
        let mut obj = Map::new();
        obj.insert("kind".into(), json!(kind));
        obj.insert("creationDate".into(), json!(e.base.creation_date));
        obj.insert("key".into(), json!(e.key));
        if let Some(version) = e.version {
            obj.insert("version".into(), json!(version));
        }
        if let Some(variation) = e.variation {
            obj.insert("variation".into(), json!(variation));
        }
        obj.insert("value".into(), e.value.clone());
        obj.insert("default".into(), e.default.clone());
        if let Some(reason) = &e.reason {
            obj.insert("reason".into(), reason.clone());
        }
        if let Some(prereq_of) = &e.prereq_of {
            obj.insert("prereqOf".into(), json!(prereq_of));
        }
        if kind == "debug" {
            obj.insert("context".into(), self.filter.filter(&e.base.context));
        } else {
            obj.insert(
                "contextKeys".into(),
                ContextFilter::context_keys(&e.base.context),
            );
        }
        Value::Object(obj)
    }
}

//! Diagnostic payloads describing the SDK's own behavior.
//!
//! One init payload at startup enumerates the configuration shape (never
//! secret values); periodic stats cover the event pipeline and stream
//! startup history. Both share the event HTTP surface but use a separate
//! endpoint path, no idempotence key and no retries.

use crate::config::{Config, ConnectionMode, ServiceEndpoints, SDK_NAME, SDK_VERSION};
use chrono::Utc;
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::{json, Value};
use std::time::Duration;
use uuid::Uuid;

/// One attempt to establish the stream, kept for the next stats payload.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamInit {
    pub timestamp: u64,
    pub failed: bool,
    pub duration_millis: u64,
}

#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct DiagnosticId {
    diagnostic_id: String,
    sdk_key_suffix: String,
}

struct PeriodicState {
    data_since: u64,
    stream_inits: Vec<StreamInit>,
}

/// Builds diagnostic payloads and accumulates stream-init records.
pub struct DiagnosticsManager {
    id: DiagnosticId,
    init_payload: Value,
    state: Mutex<PeriodicState>,
}

impl DiagnosticsManager {
    pub fn new(config: &Config) -> Self {
        let id = DiagnosticId {
            diagnostic_id: Uuid::new_v4().to_string(),
            sdk_key_suffix: key_suffix(&config.sdk_key),
        };
        let now = now_millis();
        let init_payload = json!({
            "kind": "diagnostic-init",
            "id": serde_json::to_value(&id).unwrap_or(Value::Null),
            "creationDate": now,
            "sdk": sdk_section(config),
            "configuration": configuration_section(config),
            "platform": {
                "name": "rust",
                "osName": std::env::consts::OS,
                "osArch": std::env::consts::ARCH,
            },
        });
        Self {
            id,
            init_payload,
            state: Mutex::new(PeriodicState {
                data_since: now,
                stream_inits: Vec::new(),
            }),
        }
    }

    pub fn init_payload(&self) -> Value {
        self.init_payload.clone()
    }

    pub fn record_stream_init(&self, timestamp: u64, failed: bool, duration: Duration) {
        self.state.lock().stream_inits.push(StreamInit {
            timestamp,
            failed,
            duration_millis: duration.as_millis() as u64,
        });
    }

    /// Build the periodic payload and reset the accumulation window.
    pub fn stats_payload(
        &self,
        dropped_events: u64,
        deduplicated_contexts: u64,
        events_in_last_batch: u64,
    ) -> Value {
        let now = now_millis();
        let mut state = self.state.lock();
        let payload = json!({
            "kind": "diagnostic",
            "id": serde_json::to_value(&self.id).unwrap_or(Value::Null),
            "creationDate": now,
            "dataSinceDate": state.data_since,
            "droppedEvents": dropped_events,
            "deduplicatedUsers": deduplicated_contexts,
            "eventsInLastBatch": events_in_last_batch,
            "streamInits": serde_json::to_value(&state.stream_inits).unwrap_or(Value::Null),
        });
        state.data_since = now;
        state.stream_inits.clear();
        payload
    }
}

fn now_millis() -> u64 {
    Utc::now().timestamp_millis().max(0) as u64
}

fn key_suffix(sdk_key: &str) -> String {
    let chars: Vec<char> = sdk_key.chars().collect();
    let start = chars.len().saturating_sub(6);
    chars[start..].iter().collect()
}

fn sdk_section(config: &Config) -> Value {
    let mut sdk = json!({
        "name": SDK_NAME,
        "version": SDK_VERSION,
    });
    if let Some(name) = &config.wrapper_name {
        sdk["wrapperName"] = json!(name);
    }
    if let Some(version) = &config.wrapper_version {
        sdk["wrapperVersion"] = json!(version);
    }
    sdk
}

fn configuration_section(config: &Config) -> Value {
    let defaults = ServiceEndpoints::default();
    json!({
        "customStreamURI": config.service_endpoints.streaming_base != defaults.streaming_base,
        "customBaseURI": config.service_endpoints.polling_base != defaults.polling_base,
        "customEventsURI": config.service_endpoints.events_base != defaults.events_base,
        "streamingDisabled": config.connection_mode == ConnectionMode::Polling,
        "offline": config.offline,
        "allAttributesPrivate": config.all_attributes_private,
        "eventsCapacity": config.event_capacity,
        "eventsFlushIntervalMillis": config.event_flush_interval.as_millis() as u64,
        "contextKeysCapacity": config.context_keys_capacity,
        "contextKeysFlushIntervalMillis": config.context_keys_flush_interval.as_millis() as u64,
        "connectTimeoutMillis": config.http.connect_timeout.as_millis() as u64,
        "socketTimeoutMillis": config.http.socket_timeout.as_millis() as u64,
        "pollingIntervalMillis": config.poll_interval.as_millis() as u64,
        "reconnectTimeMillis": config.stream_initial_reconnect_delay.as_millis() as u64,
        "startWaitMillis": config.start_wait.as_millis() as u64,
        "diagnosticRecordingIntervalMillis": config.diagnostic_recording_interval.as_millis() as u64,
    })
}

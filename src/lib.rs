//! Server-side feature flagging SDK core.
//!
//! Keeps a local replica of flag/segment configuration via a streaming or
//! polling data source, evaluates variations in-process against that
//! replica, and batches analytics events back to the control plane.

use crate::{
    bigsegments::{BigSegmentResolver, BigSegmentStore, BigSegmentStoreWrapper},
    datasource::{
        DataSource, DataSourceUpdates, NullDataSource, PollingDataSource, StartError,
        StreamingDataSource,
    },
    diagnostics::DiagnosticsManager,
    eval::{Detail, ErrorKind, Evaluator, PrerequisiteEvaluation},
    events::{
        now_millis, AliasEvent, BaseEvent, CustomEvent, EventProcessor, EventSender,
        EventsConfiguration, FeatureRequestEvent, HyperEventSender, IdentifyEvent, InputEvent,
    },
    status::{DataSourceStatus, DataSourceStatusProvider, DataStoreStatusProvider},
    store::{
        CacheMode, DataStore, InMemoryDataStore, PersistentDataStore, PersistentDataStoreWrapper,
    },
};
use serde_json::{json, Value};
use std::{collections::HashMap, sync::Arc, time::Duration};
use tokio::sync::mpsc;
use tracing::warn;

pub mod bigsegments;
pub mod config;
pub mod context;
pub mod datasource;
pub mod diagnostics;
pub mod eval;
pub mod events;
pub mod model;
pub mod status;
pub mod store;
#[cfg(test)]
mod test_utils;

pub use config::{Config, ConfigBuilder, ConnectionMode, HttpConfig, ServiceEndpoints};
pub use context::{
    AttributeRef, Context, ContextBuilder, ContextError, Kind, MultiContextBuilder,
};
pub use eval::{BigSegmentsStatus, Reason};

/// How long `close` waits for the final event flush.
const CLOSE_FLUSH_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    #[error("An SDK key is required unless the client is offline")]
    EmptySdkKey,
}

/// Optional component overrides for [Client::build_with].
///
/// Everything left `None` gets the default wiring for the configuration.
#[derive(Default)]
pub struct ClientComponents {
    pub persistent_store: Option<(Arc<dyn PersistentDataStore>, CacheMode)>,
    pub big_segment_store: Option<Arc<dyn BigSegmentStore>>,
    pub data_source: Option<Arc<dyn DataSource>>,
    pub event_sender: Option<Arc<dyn EventSender>>,
}

/// The SDK client: glue over the store, evaluator, data source and event
/// pipeline.
pub struct Client {
    config: Config,
    store: Arc<dyn DataStore>,
    evaluator: Evaluator<Arc<dyn DataStore>>,
    updates: Arc<DataSourceUpdates>,
    source_status: Arc<DataSourceStatusProvider>,
    source: Arc<dyn DataSource>,
    start_handle: parking_lot::Mutex<Option<Arc<dyn DataSource>>>,
    events: Option<EventProcessor>,
}

impl Client {
    /// Build a client with default components. Must be called within a
    /// tokio runtime; background tasks are spawned here and by [Client::start].
    pub fn build(config: Config) -> Result<Self, BuildError> {
        Self::build_with(config, ClientComponents::default())
    }

    pub fn build_with(config: Config, components: ClientComponents) -> Result<Self, BuildError> {
        if config.sdk_key.is_empty() && !config.offline {
            return Err(BuildError::EmptySdkKey);
        }

        let (store, store_status): (Arc<dyn DataStore>, Option<Arc<DataStoreStatusProvider>>) =
            match components.persistent_store {
                Some((core, mode)) => {
                    let wrapper = Arc::new(PersistentDataStoreWrapper::new(core, mode, 1000));
                    let status = wrapper.status_provider();
                    tokio::spawn(Arc::clone(&wrapper).run_availability_monitor());
                    (wrapper, Some(status))
                }
                None => (Arc::new(InMemoryDataStore::new()), None),
            };

        let diagnostics = if config.offline || config.diagnostic_opt_out {
            None
        } else {
            Some(Arc::new(DiagnosticsManager::new(&config)))
        };

        let source_status = Arc::new(DataSourceStatusProvider::new());
        let updates = Arc::new(DataSourceUpdates::new(
            Arc::clone(&store),
            Arc::clone(&source_status),
            store_status,
            diagnostics.clone(),
        ));

        let source: Arc<dyn DataSource> = match components.data_source {
            Some(source) => source,
            None if config.offline => Arc::new(NullDataSource),
            None => match config.connection_mode {
                ConnectionMode::Streaming => Arc::new(StreamingDataSource::new(&config)),
                ConnectionMode::Polling => Arc::new(PollingDataSource::new(&config)),
            },
        };

        let events = if config.offline {
            None
        } else {
            let sender: Arc<dyn EventSender> = match components.event_sender {
                Some(sender) => sender,
                None => Arc::new(HyperEventSender::new(&config)),
            };
            Some(EventProcessor::new(
                EventsConfiguration::from_config(&config),
                sender,
                diagnostics,
            ))
        };

        let mut evaluator = Evaluator::new(Arc::clone(&store));
        if let Some(big_segments) = components.big_segment_store {
            let wrapper: Arc<dyn BigSegmentResolver> = Arc::new(BigSegmentStoreWrapper::new(
                big_segments,
                config.big_segments_stale_after,
                config.context_keys_capacity,
                Duration::from_secs(5),
            ));
            evaluator = evaluator.with_big_segments(wrapper);
        }

        Ok(Self {
            evaluator,
            store,
            source: Arc::clone(&source),
            start_handle: parking_lot::Mutex::new(Some(source)),
            updates,
            source_status,
            events,
            config,
        })
    }

    /// Start consuming data.
    ///
    /// The future resolves once the initial dataset has been stored.
    /// Dropping it does not cancel the background ingestion.
    pub async fn start(&self) -> Result<(), StartError> {
        let source = self
            .start_handle
            .lock()
            .take()
            .ok_or(StartError::AlreadyStarted)?;
        source.start(Arc::clone(&self.updates)).await
    }

    /// [Client::start], bounded by the configured start-wait window. `None`
    /// means the window elapsed; the client keeps initializing in the
    /// background.
    pub async fn wait_for_initialization(&self) -> Option<Result<(), StartError>> {
        match tokio::time::timeout(self.config.start_wait, self.start()).await {
            Ok(result) => Some(result),
            Err(_) => {
                warn!("client did not initialize within the start-wait window");
                None
            }
        }
    }

    pub fn is_initialized(&self) -> bool {
        self.store.is_initialized()
    }

    pub fn data_source_status(&self) -> DataSourceStatus {
        self.source_status.status()
    }

    pub fn subscribe_data_source_status(&self) -> mpsc::UnboundedReceiver<DataSourceStatus> {
        self.source_status.subscribe()
    }

    pub fn bool_variation(&self, context: &Context, key: &str, default: bool) -> bool {
        self.bool_variation_detail_internal(context, key, default, false)
            .value
            .unwrap_or(default)
    }

    pub fn bool_variation_detail(
        &self,
        context: &Context,
        key: &str,
        default: bool,
    ) -> Detail<bool> {
        self.bool_variation_detail_internal(context, key, default, true)
    }

    pub fn int_variation(&self, context: &Context, key: &str, default: i64) -> i64 {
        self.int_variation_detail_internal(context, key, default, false)
            .value
            .unwrap_or(default)
    }

    pub fn int_variation_detail(&self, context: &Context, key: &str, default: i64) -> Detail<i64> {
        self.int_variation_detail_internal(context, key, default, true)
    }

    pub fn float_variation(&self, context: &Context, key: &str, default: f64) -> f64 {
        self.float_variation_detail_internal(context, key, default, false)
            .value
            .unwrap_or(default)
    }

    pub fn float_variation_detail(
        &self,
        context: &Context,
        key: &str,
        default: f64,
    ) -> Detail<f64> {
        self.float_variation_detail_internal(context, key, default, true)
    }

    pub fn string_variation(&self, context: &Context, key: &str, default: &str) -> String {
        self.string_variation_detail_internal(context, key, default, false)
            .value
            .unwrap_or_else(|| default.to_owned())
    }

    pub fn string_variation_detail(
        &self,
        context: &Context,
        key: &str,
        default: &str,
    ) -> Detail<String> {
        self.string_variation_detail_internal(context, key, default, true)
    }

    pub fn json_variation(&self, context: &Context, key: &str, default: Value) -> Value {
        self.evaluate_and_record(context, key, default.clone(), false)
            .value
            .unwrap_or(default)
    }

    pub fn json_variation_detail(
        &self,
        context: &Context,
        key: &str,
        default: Value,
    ) -> Detail<Value> {
        self.evaluate_and_record(context, key, default, true)
    }

    fn bool_variation_detail_internal(
        &self,
        context: &Context,
        key: &str,
        default: bool,
        include_reason: bool,
    ) -> Detail<bool> {
        let detail = self.evaluate_and_record(context, key, json!(default), include_reason);
        coerce(detail, |value| value.as_bool()).or(default)
    }

    fn int_variation_detail_internal(
        &self,
        context: &Context,
        key: &str,
        default: i64,
        include_reason: bool,
    ) -> Detail<i64> {
        let detail = self.evaluate_and_record(context, key, json!(default), include_reason);
        // numeric widening is allowed, rounding toward zero
        coerce(detail, |value| match value {
            Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64)),
            _ => None,
        })
        .or(default)
    }

    fn float_variation_detail_internal(
        &self,
        context: &Context,
        key: &str,
        default: f64,
        include_reason: bool,
    ) -> Detail<f64> {
        let detail = self.evaluate_and_record(context, key, json!(default), include_reason);
        coerce(detail, |value| value.as_f64()).or(default)
    }

    fn string_variation_detail_internal(
        &self,
        context: &Context,
        key: &str,
        default: &str,
        include_reason: bool,
    ) -> Detail<String> {
        let detail = self.evaluate_and_record(context, key, json!(default), include_reason);
        coerce(detail, |value| value.as_str().map(str::to_owned)).or(default.to_owned())
    }

    /// Evaluate a flag, emit the feature-request event (and one event per
    /// prerequisite evaluation) and substitute the default on no-value.
    fn evaluate_and_record(
        &self,
        context: &Context,
        key: &str,
        default: Value,
        include_reason: bool,
    ) -> Detail<Value> {
        let flag = match self.store.flag(key) {
            Ok(Some(flag)) => flag,
            Ok(None) => {
                let kind = if self.store.is_initialized() {
                    ErrorKind::FlagNotFound
                } else {
                    ErrorKind::ClientNotReady
                };
                warn!(flag_key = key, ?kind, "flag evaluation failed");
                self.record_unknown_flag(context, key, &default, kind, include_reason);
                return Detail::err(kind).or(default);
            }
            Err(error) => {
                warn!(flag_key = key, %error, "store read failed during evaluation");
                self.record_unknown_flag(
                    context,
                    key,
                    &default,
                    ErrorKind::Exception,
                    include_reason,
                );
                return Detail::err(ErrorKind::Exception).or(default);
            }
        };

        let mut prerequisites: Vec<PrerequisiteEvaluation> = Vec::new();
        let result = {
            let mut sink = |evaluation: PrerequisiteEvaluation| prerequisites.push(evaluation);
            self.evaluator.evaluate(&flag, context, Some(&mut sink))
        };

        if let Some(events) = &self.events {
            for prereq in prerequisites {
                events.send_event(InputEvent::FeatureRequest(prerequisite_event(
                    context, prereq,
                )));
            }
            let force = result.force_reason_tracking;
            let value = result
                .detail
                .value
                .clone()
                .unwrap_or_else(|| default.clone());
            events.send_event(InputEvent::FeatureRequest(FeatureRequestEvent {
                base: BaseEvent {
                    creation_date: now_millis(),
                    context: context.clone(),
                },
                key: key.to_owned(),
                value,
                variation: result.detail.variation_index,
                default: default.clone(),
                version: Some(flag.version),
                reason: if include_reason || force {
                    Some(result.reason_json())
                } else {
                    None
                },
                prereq_of: None,
                track_events: flag.track_events || force,
                debug_events_until_date: flag.debug_events_until_date,
            }));
        }

        result.detail.or(default)
    }

    fn record_unknown_flag(
        &self,
        context: &Context,
        key: &str,
        default: &Value,
        kind: ErrorKind,
        include_reason: bool,
    ) {
        if let Some(events) = &self.events {
            let reason = if include_reason {
                Some(
                    serde_json::to_value(Reason::Error { error_kind: kind })
                        .unwrap_or(Value::Null),
                )
            } else {
                None
            };
            events.send_event(InputEvent::FeatureRequest(FeatureRequestEvent {
                base: BaseEvent {
                    creation_date: now_millis(),
                    context: context.clone(),
                },
                key: key.to_owned(),
                value: default.clone(),
                variation: None,
                default: default.clone(),
                version: None,
                reason,
                prereq_of: None,
                track_events: false,
                debug_events_until_date: None,
            }));
        }
    }

    /// Evaluate every live flag for a context. No analytics are emitted.
    pub fn all_flags_state(&self, context: &Context) -> HashMap<String, Value> {
        let flags = match self.store.all_flags() {
            Ok(flags) => flags,
            Err(error) => {
                warn!(%error, "store read failed during bulk evaluation");
                return HashMap::new();
            }
        };
        flags
            .iter()
            .map(|(key, flag)| {
                let result = self.evaluator.evaluate(flag, context, None);
                (key.clone(), result.detail.value.unwrap_or(Value::Null))
            })
            .collect()
    }

    /// Register a context without evaluating anything.
    pub fn identify(&self, context: Context) {
        if let Some(events) = &self.events {
            events.send_event(InputEvent::Identify(IdentifyEvent {
                base: BaseEvent {
                    creation_date: now_millis(),
                    context,
                },
            }));
        }
    }

    pub fn track(&self, context: Context, key: impl Into<String>) {
        self.track_event(context, key, Value::Null, None);
    }

    pub fn track_data(&self, context: Context, key: impl Into<String>, data: Value) {
        self.track_event(context, key, data, None);
    }

    pub fn track_metric(
        &self,
        context: Context,
        key: impl Into<String>,
        metric_value: f64,
        data: Value,
    ) {
        self.track_event(context, key, data, Some(metric_value));
    }

    fn track_event(
        &self,
        context: Context,
        key: impl Into<String>,
        data: Value,
        metric_value: Option<f64>,
    ) {
        if let Some(events) = &self.events {
            events.send_event(InputEvent::Custom(CustomEvent {
                base: BaseEvent {
                    creation_date: now_millis(),
                    context,
                },
                key: key.into(),
                data,
                metric_value,
            }));
        }
    }

    /// Link a context to the one it was previously known as.
    pub fn alias(&self, context: &Context, previous: &Context) {
        if let Some(events) = &self.events {
            events.send_event(InputEvent::Alias(AliasEvent {
                creation_date: now_millis(),
                key: context.key().to_owned(),
                kind: context.kind_str().to_owned(),
                previous_key: previous.key().to_owned(),
                previous_kind: previous.kind_str().to_owned(),
            }));
        }
    }

    /// Ask for an asynchronous event flush.
    pub fn flush(&self) {
        if let Some(events) = &self.events {
            events.flush();
        }
    }

    /// Shut down: stop ingestion, deliver the final event batch within a
    /// bounded window, release the store. Events sent afterwards are
    /// no-ops.
    pub async fn close(&self) {
        self.source.stop();
        if let Some(events) = &self.events {
            events.close(CLOSE_FLUSH_TIMEOUT).await;
        }
        self.store.close();
    }
}

fn prerequisite_event(
    context: &Context,
    evaluation: PrerequisiteEvaluation,
) -> FeatureRequestEvent {
    let PrerequisiteEvaluation {
        flag,
        prereq_of_key,
        result,
    } = evaluation;
    let force = result.force_reason_tracking;
    FeatureRequestEvent {
        base: BaseEvent {
            creation_date: now_millis(),
            context: context.clone(),
        },
        key: flag.key.clone(),
        value: result.detail.value.clone().unwrap_or(Value::Null),
        variation: result.detail.variation_index,
        default: Value::Null,
        version: Some(flag.version),
        reason: if force {
            Some(result.reason_json())
        } else {
            None
        },
        prereq_of: Some(prereq_of_key),
        track_events: flag.track_events || force,
        debug_events_until_date: flag.debug_events_until_date,
    }
}

/// Apply the requested-type conversion to a resolved value, reducing a
/// mismatch (including JSON null) to `WRONG_TYPE`.
fn coerce<T, F: FnOnce(&Value) -> Option<T>>(detail: Detail<Value>, convert: F) -> Detail<T> {
    match &detail.value {
        Some(value) => match convert(value) {
            Some(converted) => Detail {
                value: Some(converted),
                variation_index: detail.variation_index,
                reason: detail.reason,
            },
            None => Detail::err(ErrorKind::WrongType),
        },
        None => Detail {
            value: None,
            variation_index: detail.variation_index,
            reason: detail.reason,
        },
    }
}

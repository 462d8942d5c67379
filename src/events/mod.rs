//! Analytics event pipeline.
//!
//! Producers push [InputEvent]s onto a bounded inbox and never block; a
//! single dispatcher task (see [dispatcher]) owns the summarizer, the
//! context-dedup cache and the outbox, and a small worker pool delivers
//! payload batches with at-most-once-per-event semantics.

pub(crate) mod context_filter;
pub(crate) mod dedup;
pub(crate) mod dispatcher;
pub mod event;
pub mod sender;
pub(crate) mod summary;

pub use event::{
    AliasEvent, BaseEvent, CustomEvent, FeatureRequestEvent, IdentifyEvent, InputEvent,
    MigrationOpEvent,
};
pub use sender::{EventSender, HyperEventSender, SenderResult};

use crate::{
    config::Config, context::AttributeRef, diagnostics::DiagnosticsManager,
    events::context_filter::ContextFilter, events::dispatcher::{EventDispatcher, InboxMessage},
};
use chrono::Utc;
use std::{
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

/// Epoch millis for event creation dates.
pub(crate) fn now_millis() -> u64 {
    Utc::now().timestamp_millis().max(0) as u64
}

/// The slice of [Config] the event pipeline needs.
#[derive(Clone, Debug)]
pub struct EventsConfiguration {
    pub capacity: usize,
    pub flush_interval: Duration,
    pub context_keys_capacity: usize,
    pub context_keys_flush_interval: Duration,
    pub all_attributes_private: bool,
    pub private_attributes: Vec<AttributeRef>,
    pub diagnostic_recording_interval: Duration,
    pub flush_workers: usize,
}

impl EventsConfiguration {
    pub fn from_config(config: &Config) -> Self {
        Self {
            capacity: config.event_capacity,
            flush_interval: config.event_flush_interval,
            context_keys_capacity: config.context_keys_capacity,
            context_keys_flush_interval: config.context_keys_flush_interval,
            all_attributes_private: config.all_attributes_private,
            private_attributes: config.private_attributes.clone(),
            diagnostic_recording_interval: config.diagnostic_recording_interval,
            flush_workers: 5,
        }
    }

    pub(crate) fn context_filter(&self) -> ContextFilter {
        ContextFilter::new(self.all_attributes_private, self.private_attributes.clone())
    }
}

/// Producer-side handle to the event pipeline.
///
/// Cheap to share; all methods are non-blocking except [close]. When the
/// inbox is full, events are dropped and counted, never queued on the
/// caller.
pub struct EventProcessor {
    inbox_tx: mpsc::Sender<InboxMessage>,
    dropped_events: Arc<AtomicU64>,
}

impl EventProcessor {
    /// Spawn the dispatcher. Must be called within a tokio runtime.
    pub fn new(
        config: EventsConfiguration,
        sender: Arc<dyn EventSender>,
        diagnostics: Option<Arc<DiagnosticsManager>>,
    ) -> Self {
        let (inbox_tx, inbox_rx) = mpsc::channel(config.capacity.max(1));
        let dropped_events = Arc::new(AtomicU64::new(0));
        let dispatcher = EventDispatcher::new(
            config,
            sender,
            Arc::clone(&dropped_events),
            diagnostics,
        );
        tokio::spawn(dispatcher.run(inbox_rx));
        Self {
            inbox_tx,
            dropped_events,
        }
    }

    pub fn send_event(&self, event: InputEvent) {
        match self.inbox_tx.try_send(InboxMessage::Event(event)) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                self.dropped_events.fetch_add(1, Ordering::Relaxed);
            }
            // processor already closed
            Err(mpsc::error::TrySendError::Closed(_)) => {}
        }
    }

    /// Ask for an asynchronous flush of everything queued so far.
    pub fn flush(&self) {
        if self.inbox_tx.try_send(InboxMessage::Flush).is_err() {
            debug!("flush request dropped, inbox full or closed");
        }
    }

    /// Final flush and shutdown, bounded by `timeout`.
    pub async fn close(&self, timeout: Duration) {
        let (barrier_tx, barrier_rx) = oneshot::channel();
        if self
            .inbox_tx
            .send(InboxMessage::SyncFlush(barrier_tx))
            .await
            .is_ok()
        {
            if tokio::time::timeout(timeout, barrier_rx).await.is_err() {
                warn!("final event flush did not finish within the close window");
            }
        }
        let _ = self.inbox_tx.send(InboxMessage::Shutdown).await;
    }
}

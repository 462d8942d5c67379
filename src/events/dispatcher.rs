//! The event dispatcher: a single task owning all mutable event state.
//!
//! Callers only ever touch the inbox channel. The dispatcher owns the
//! summarizer, the dedup cache and the outbox; flush workers get detached
//! payload copies and report back over an internal channel, so nothing
//! here needs a lock.

use crate::{
    diagnostics::DiagnosticsManager,
    events::{
        dedup::ContextKeyDedup,
        event::{BaseEvent, EventFormatter, InputEvent, OutputEvent},
        sender::{EventSender, SenderResult},
        summary::EventSummarizer,
        EventsConfiguration,
    },
};
use chrono::Utc;
use serde_json::Value;
use std::{
    collections::VecDeque,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};
use tokio::sync::{mpsc, oneshot, Semaphore};
use tracing::{debug, warn};
use uuid::Uuid;

/// Payloads parked while every flush worker is busy.
const MAX_BUFFERED_PAYLOADS: usize = 10;

#[derive(Debug)]
pub(crate) enum InboxMessage {
    Event(InputEvent),
    Flush,
    /// Rotate the context-dedup cache.
    FlushContexts,
    /// Emit a periodic diagnostics payload now.
    DiagnosticTick,
    /// Flush and resolve the barrier once that payload has been delivered
    /// (or discarded).
    SyncFlush(oneshot::Sender<()>),
    Shutdown,
}

type Barriers = Vec<oneshot::Sender<()>>;

pub(crate) struct EventDispatcher {
    config: EventsConfiguration,
    sender: Arc<dyn EventSender>,
    formatter: EventFormatter,
    summarizer: EventSummarizer,
    dedup: ContextKeyDedup,
    outbox: Vec<OutputEvent>,
    outbox_full_logged: bool,
    /// Shared with the inbox handle, which counts its own drops.
    dropped_events: Arc<AtomicU64>,
    deduplicated_contexts: u64,
    events_in_last_batch: u64,
    last_known_server_time: u64,
    must_shutdown: bool,
    diagnostics: Option<Arc<DiagnosticsManager>>,
    workers: Arc<Semaphore>,
    buffered: VecDeque<(Vec<Value>, Barriers)>,
    worker_tx: mpsc::UnboundedSender<(SenderResult, Barriers)>,
    worker_rx: Option<mpsc::UnboundedReceiver<(SenderResult, Barriers)>>,
}

impl EventDispatcher {
    pub(crate) fn new(
        config: EventsConfiguration,
        sender: Arc<dyn EventSender>,
        dropped_events: Arc<AtomicU64>,
        diagnostics: Option<Arc<DiagnosticsManager>>,
    ) -> Self {
        let (worker_tx, worker_rx) = mpsc::unbounded_channel();
        Self {
            formatter: EventFormatter::new(config.context_filter()),
            dedup: ContextKeyDedup::new(config.context_keys_capacity),
            workers: Arc::new(Semaphore::new(config.flush_workers)),
            summarizer: EventSummarizer::new(),
            outbox: Vec::new(),
            outbox_full_logged: false,
            dropped_events,
            deduplicated_contexts: 0,
            events_in_last_batch: 0,
            last_known_server_time: 0,
            must_shutdown: false,
            diagnostics,
            buffered: VecDeque::new(),
            worker_tx,
            worker_rx: Some(worker_rx),
            sender,
            config,
        }
    }

    pub(crate) async fn run(mut self, mut inbox_rx: mpsc::Receiver<InboxMessage>) {
        let mut worker_rx = self.worker_rx.take().expect("run called twice");

        if let Some(diagnostics) = &self.diagnostics {
            tokio::spawn(self.sender.send_diagnostic(diagnostics.init_payload()));
        }

        let start = tokio::time::Instant::now();
        let mut flush_timer =
            tokio::time::interval_at(start + self.config.flush_interval, self.config.flush_interval);
        let mut contexts_timer = tokio::time::interval_at(
            start + self.config.context_keys_flush_interval,
            self.config.context_keys_flush_interval,
        );
        let mut diagnostics_timer = tokio::time::interval_at(
            start + self.config.diagnostic_recording_interval,
            self.config.diagnostic_recording_interval,
        );

        loop {
            tokio::select! {
                message = inbox_rx.recv() => match message {
                    Some(InboxMessage::Shutdown) | None => break,
                    Some(message) => self.handle(message),
                },
                Some((result, barriers)) = worker_rx.recv() => {
                    self.handle_worker_result(result, barriers)
                }
                _ = flush_timer.tick() => self.trigger_flush(Vec::new()),
                _ = contexts_timer.tick() => self.dedup.clear(),
                _ = diagnostics_timer.tick() => self.send_diagnostics(),
            }
        }
        debug!("event dispatcher stopped");
    }

    fn handle(&mut self, message: InboxMessage) {
        match message {
            InboxMessage::Event(event) => {
                if self.must_shutdown {
                    return;
                }
                self.process_event(event);
            }
            InboxMessage::Flush => self.trigger_flush(Vec::new()),
            InboxMessage::FlushContexts => self.dedup.clear(),
            InboxMessage::DiagnosticTick => self.send_diagnostics(),
            InboxMessage::SyncFlush(barrier) => self.trigger_flush(vec![barrier]),
            InboxMessage::Shutdown => unreachable!("handled by the run loop"),
        }
    }

    fn process_event(&mut self, event: InputEvent) {
        // index synthesis: the first event for a context in this window
        // carries the full context payload on its behalf
        if let Some(context) = event.context() {
            let seen = self.dedup.notice(context.canonical_key());
            let is_identify = matches!(event, InputEvent::Identify(_));
            if !seen && !is_identify {
                let index = BaseEvent {
                    creation_date: creation_date_of(&event),
                    context: context.clone(),
                };
                self.push_output(OutputEvent::Index(index));
            } else if seen && !is_identify {
                self.deduplicated_contexts += 1;
            }
        }

        match event {
            InputEvent::FeatureRequest(event) => {
                self.summarizer.add(&event);
                if event.track_events {
                    self.push_output(OutputEvent::Feature(event.clone()));
                }
                if self.should_debug(&event) {
                    self.push_output(OutputEvent::Debug(event));
                }
            }
            InputEvent::Identify(event) => self.push_output(OutputEvent::Identify(event)),
            InputEvent::Custom(event) => self.push_output(OutputEvent::Custom(event)),
            InputEvent::MigrationOp(event) => self.push_output(OutputEvent::MigrationOp(event)),
            InputEvent::Alias(event) => self.push_output(OutputEvent::Alias(event)),
        }

        if self.outbox.len() >= self.config.capacity {
            self.trigger_flush(Vec::new());
        }
    }

    /// Debug windows close at the greater of the local clock and the last
    /// observed server clock, so a slow local clock cannot stretch them.
    fn should_debug(&self, event: &crate::events::event::FeatureRequestEvent) -> bool {
        match event.debug_events_until_date {
            Some(until) => {
                let now = Utc::now().timestamp_millis().max(0) as u64;
                until > now && until > self.last_known_server_time
            }
            None => false,
        }
    }

    fn push_output(&mut self, event: OutputEvent) {
        if self.outbox.len() >= self.config.capacity {
            self.dropped_events.fetch_add(1, Ordering::Relaxed);
            if !self.outbox_full_logged {
                warn!("event buffer is full, dropping events until next flush");
                self.outbox_full_logged = true;
            }
            return;
        }
        self.outbox.push(event);
    }

    fn trigger_flush(&mut self, mut barriers: Barriers) {
        if self.must_shutdown {
            complete(&mut barriers);
            return;
        }
        let events = std::mem::take(&mut self.outbox);
        self.outbox_full_logged = false;
        let summary = self.summarizer.snapshot_and_reset();
        if events.is_empty() && summary.is_none() {
            complete(&mut barriers);
            return;
        }

        let mut payload: Vec<Value> =
            events.iter().map(|event| self.formatter.format(event)).collect();
        if let Some(summary) = summary {
            payload.push(self.formatter.format(&OutputEvent::Summary(summary)));
        }
        self.events_in_last_batch = payload.len() as u64;
        self.submit(payload, barriers);
    }

    fn submit(&mut self, payload: Vec<Value>, barriers: Barriers) {
        match Arc::clone(&self.workers).try_acquire_owned() {
            Ok(permit) => {
                let sender = Arc::clone(&self.sender);
                let worker_tx = self.worker_tx.clone();
                tokio::spawn(async move {
                    let result = sender.send(payload, Uuid::new_v4()).await;
                    drop(permit);
                    // barriers resolve on the dispatcher side, after the
                    // outcome (server clock, shutdown flag) is absorbed
                    let _ = worker_tx.send((result, barriers));
                });
            }
            Err(_) => {
                self.buffered.push_back((payload, barriers));
                if self.buffered.len() > MAX_BUFFERED_PAYLOADS {
                    // oldest parked payload gives way
                    if let Some((dropped, mut dropped_barriers)) = self.buffered.pop_front() {
                        self.dropped_events
                            .fetch_add(dropped.len() as u64, Ordering::Relaxed);
                        complete(&mut dropped_barriers);
                        warn!("flush buffer saturated, dropped oldest payload");
                    }
                }
            }
        }
    }

    fn handle_worker_result(&mut self, result: SenderResult, mut barriers: Barriers) {
        if let Some(server_time) = result.server_time {
            self.last_known_server_time = self.last_known_server_time.max(server_time);
        }
        complete(&mut barriers);
        if result.must_shutdown {
            warn!("event delivery rejected permanently, discarding future events");
            self.must_shutdown = true;
            for (_, mut barriers) in self.buffered.drain(..) {
                complete(&mut barriers);
            }
            return;
        }
        // a worker slot freed up; drain parked payloads
        while !self.buffered.is_empty() && self.workers.available_permits() > 0 {
            if let Some((payload, barriers)) = self.buffered.pop_front() {
                self.submit(payload, barriers);
            }
        }
    }

    fn send_diagnostics(&mut self) {
        if let Some(diagnostics) = &self.diagnostics {
            let payload = diagnostics.stats_payload(
                self.dropped_events.swap(0, Ordering::Relaxed),
                std::mem::take(&mut self.deduplicated_contexts),
                self.events_in_last_batch,
            );
            tokio::spawn(self.sender.send_diagnostic(payload));
        }
    }
}

fn complete(barriers: &mut Barriers) {
    for barrier in barriers.drain(..) {
        let _ = barrier.send(());
    }
}

fn creation_date_of(event: &InputEvent) -> u64 {
    match event {
        InputEvent::FeatureRequest(e) => e.base.creation_date,
        InputEvent::Identify(e) => e.base.creation_date,
        InputEvent::Custom(e) => e.base.creation_date,
        InputEvent::MigrationOp(e) => e.base.creation_date,
        InputEvent::Alias(e) => e.creation_date,
    }
}

//! Status state machines and listener fan-out.
//!
//! Producers post status changes through the providers here; listeners get
//! their own unbounded channel so one slow consumer never blocks a producer
//! or another listener.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::time::Duration;
use tokio::sync::mpsc;

/// Fan-out of cloneable events to any number of listeners.
///
/// Each subscription is its own channel; senders that have gone away are
/// dropped on the next broadcast.
pub struct Broadcaster<T> {
    listeners: Mutex<Vec<mpsc::UnboundedSender<T>>>,
}

impl<T: Clone> Broadcaster<T> {
    pub fn new() -> Self {
        Self {
            listeners: Mutex::new(Vec::new()),
        }
    }

    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<T> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.listeners.lock().push(tx);
        rx
    }

    pub fn broadcast(&self, event: T) {
        self.listeners
            .lock()
            .retain(|listener| listener.send(event.clone()).is_ok());
    }

    pub fn has_listeners(&self) -> bool {
        !self.listeners.lock().is_empty()
    }
}

impl<T: Clone> Default for Broadcaster<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// Lifecycle state of the data source.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DataSourceState {
    /// Starting up; no full dataset received yet.
    Initializing,
    /// Connected and current.
    Valid,
    /// Connection lost after having been valid; retrying.
    Interrupted,
    /// Permanently stopped.
    Off,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DataSourceErrorKind {
    /// The service returned an HTTP error status.
    ErrorResponse,
    NetworkError,
    InvalidData,
    StoreError,
}

#[derive(Clone, Debug, PartialEq)]
pub struct DataSourceError {
    pub kind: DataSourceErrorKind,
    pub status_code: Option<u16>,
    pub message: String,
    pub time: DateTime<Utc>,
}

impl DataSourceError {
    pub fn new(kind: DataSourceErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            status_code: None,
            message: message.into(),
            time: Utc::now(),
        }
    }

    pub fn http(status_code: u16) -> Self {
        Self {
            kind: DataSourceErrorKind::ErrorResponse,
            status_code: Some(status_code),
            message: format!("HTTP error {}", status_code),
            time: Utc::now(),
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct DataSourceStatus {
    pub state: DataSourceState,
    pub state_since: DateTime<Utc>,
    pub last_error: Option<DataSourceError>,
}

/// Owns the data-source status and broadcasts every change.
pub struct DataSourceStatusProvider {
    current: Mutex<DataSourceStatus>,
    broadcaster: Broadcaster<DataSourceStatus>,
}

impl DataSourceStatusProvider {
    pub fn new() -> Self {
        Self {
            current: Mutex::new(DataSourceStatus {
                state: DataSourceState::Initializing,
                state_since: Utc::now(),
                last_error: None,
            }),
            broadcaster: Broadcaster::new(),
        }
    }

    pub fn status(&self) -> DataSourceStatus {
        self.current.lock().clone()
    }

    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<DataSourceStatus> {
        self.broadcaster.subscribe()
    }

    /// Apply a transition. `Off` is absorbing, and an interruption before
    /// the first valid dataset keeps reporting `Initializing`.
    pub fn update(&self, state: DataSourceState, error: Option<DataSourceError>) {
        let snapshot = {
            let mut current = self.current.lock();
            if current.state == DataSourceState::Off {
                return;
            }
            let state = if state == DataSourceState::Interrupted
                && current.state == DataSourceState::Initializing
            {
                DataSourceState::Initializing
            } else {
                state
            };
            let changed_state = current.state != state;
            if changed_state {
                current.state = state;
                current.state_since = Utc::now();
            }
            if let Some(error) = error {
                current.last_error = Some(error);
            } else if !changed_state {
                // nothing observable happened
                return;
            }
            current.clone()
        };
        self.broadcaster.broadcast(snapshot);
    }

    /// Wait until the source reaches `state`, with a deadline. Returns
    /// whether the state was reached.
    pub async fn wait_for(&self, state: DataSourceState, timeout: Duration) -> bool {
        let mut rx = self.subscribe();
        if self.status().state == state {
            return true;
        }
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            match tokio::time::timeout_at(deadline, rx.recv()).await {
                Ok(Some(status)) if status.state == state => return true,
                Ok(Some(_)) => continue,
                // channel closed or deadline hit
                Ok(None) | Err(_) => return false,
            }
        }
    }
}

impl Default for DataSourceStatusProvider {
    fn default() -> Self {
        Self::new()
    }
}

/// Health of the data store, driven by the persistent wrapper's probe.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DataStoreStatus {
    pub available: bool,
    /// Set on recovery when cached data may not reflect the backing store;
    /// the data source observes this and re-requests a full sync.
    pub refresh_needed: bool,
}

pub struct DataStoreStatusProvider {
    current: Mutex<DataStoreStatus>,
    broadcaster: Broadcaster<DataStoreStatus>,
}

impl DataStoreStatusProvider {
    pub fn new() -> Self {
        Self {
            current: Mutex::new(DataStoreStatus {
                available: true,
                refresh_needed: false,
            }),
            broadcaster: Broadcaster::new(),
        }
    }

    pub fn status(&self) -> DataStoreStatus {
        *self.current.lock()
    }

    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<DataStoreStatus> {
        self.broadcaster.subscribe()
    }

    pub fn update(&self, status: DataStoreStatus) {
        {
            let mut current = self.current.lock();
            if *current == status {
                return;
            }
            *current = status;
        }
        self.broadcaster.broadcast(status);
    }
}

impl Default for DataStoreStatusProvider {
    fn default() -> Self {
        Self::new()
    }
}

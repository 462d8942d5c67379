//! Data ingestion: keeping the local replica in sync with the control plane.
//!
//! Both source variants produce the same mutation shape (full init, single
//! upsert, delete tombstone) and write through [DataSourceUpdates], which
//! owns the store handle, the status machine and the stream-init recorder.

pub(crate) mod error;
pub mod message;
pub mod polling;
pub mod streaming;

pub use polling::PollingDataSource;
pub use streaming::StreamingDataSource;

use crate::{
    diagnostics::DiagnosticsManager,
    status::{
        DataSourceError, DataSourceErrorKind, DataSourceState, DataSourceStatusProvider,
        DataStoreStatus, DataStoreStatusProvider,
    },
    store::{AllData, DataStore, PatchTarget, StoreError},
};
use futures::future::BoxFuture;
use std::{sync::Arc, time::Duration};
use tokio::sync::mpsc;
use tracing::{debug, warn};

#[derive(Clone, Debug, thiserror::Error)]
pub enum StartError {
    #[error("Data source shut down permanently: {0}")]
    Unrecoverable(String),

    #[error("Background task stopped before sending a result")]
    TaskDropped,

    #[error("Already started, can't start multiple times")]
    AlreadyStarted,
}

/// A running ingester. `start` spawns the background work and returns a
/// future resolving once the first full dataset has been stored (or the
/// source has failed permanently); dropping that future does not stop the
/// ingestion.
pub trait DataSource: Send + Sync {
    fn start(
        self: Arc<Self>,
        updates: Arc<DataSourceUpdates>,
    ) -> BoxFuture<'static, Result<(), StartError>>;

    /// Stop all background work within a bounded window.
    fn stop(&self);
}

/// Write-side façade handed to data sources.
pub struct DataSourceUpdates {
    store: Arc<dyn DataStore>,
    status: Arc<DataSourceStatusProvider>,
    store_status: Option<Arc<DataStoreStatusProvider>>,
    diagnostics: Option<Arc<DiagnosticsManager>>,
}

impl DataSourceUpdates {
    pub fn new(
        store: Arc<dyn DataStore>,
        status: Arc<DataSourceStatusProvider>,
        store_status: Option<Arc<DataStoreStatusProvider>>,
        diagnostics: Option<Arc<DiagnosticsManager>>,
    ) -> Self {
        Self {
            store,
            status,
            store_status,
            diagnostics,
        }
    }

    pub fn init(&self, data: AllData) -> Result<(), StoreError> {
        self.store.init(data).map_err(|error| {
            self.report_store_error(&error);
            error
        })
    }

    pub fn upsert(&self, key: &str, item: PatchTarget) -> Result<(), StoreError> {
        match self.store.upsert(key, item) {
            Ok(applied) => {
                if !applied {
                    debug!(key, "update was older than stored version, ignored");
                }
                Ok(())
            }
            Err(error) => {
                self.report_store_error(&error);
                Err(error)
            }
        }
    }

    pub fn update_status(&self, state: DataSourceState, error: Option<DataSourceError>) {
        self.status.update(state, error);
    }

    pub fn status_provider(&self) -> Arc<DataSourceStatusProvider> {
        Arc::clone(&self.status)
    }

    /// Channel of store-status changes, when a persistent store is in play.
    /// Sources watch it and trigger a full re-sync on `refresh_needed`.
    pub fn store_status_events(&self) -> Option<mpsc::UnboundedReceiver<DataStoreStatus>> {
        self.store_status.as_ref().map(|provider| provider.subscribe())
    }

    pub fn record_stream_init(&self, timestamp: u64, failed: bool, duration: Duration) {
        if let Some(diagnostics) = &self.diagnostics {
            diagnostics.record_stream_init(timestamp, failed, duration);
        }
    }

    fn report_store_error(&self, error: &StoreError) {
        warn!(%error, "data store rejected update from data source");
        self.status.update(
            DataSourceState::Interrupted,
            Some(DataSourceError::new(
                DataSourceErrorKind::StoreError,
                error.to_string(),
            )),
        );
    }
}

/// Source used in offline mode: reports itself valid and stores nothing.
pub struct NullDataSource;

impl DataSource for NullDataSource {
    fn start(
        self: Arc<Self>,
        updates: Arc<DataSourceUpdates>,
    ) -> BoxFuture<'static, Result<(), StartError>> {
        Box::pin(async move {
            updates.update_status(DataSourceState::Valid, None);
            Ok(())
        })
    }

    fn stop(&self) {}
}

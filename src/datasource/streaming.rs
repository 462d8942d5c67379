//! Streaming data source: a long-lived SSE connection delivering `put`,
//! `patch` and `delete` events.
//!
//! Transport-level reconnects are handled inside the SSE client; this
//! module owns the semantic restarts (malformed payloads, store write
//! failures, store recovery) and the status transitions.

use crate::{
    config::Config,
    datasource::{
        error::{is_http_error_recoverable, RetryDelay},
        message::{Message, MessageParseError},
        DataSource, DataSourceUpdates, StartError,
    },
    status::{DataSourceError, DataSourceErrorKind, DataSourceState, DataStoreStatus},
};
use chrono::Utc;
use eventsource_client as es;
use es::Client as _;
use futures::{future::BoxFuture, stream::BoxStream, FutureExt, StreamExt};
use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};
use tokio::sync::{mpsc, watch};
use tracing::{info, warn};

/// One event off the wire, reduced to what the parser needs.
#[derive(Clone, Debug)]
pub struct StreamingEvent {
    pub event_type: String,
    pub data: String,
}

#[derive(Clone, Debug, thiserror::Error)]
pub enum StreamingError {
    #[error("HTTP error {0} from streaming endpoint")]
    Http(u16),

    #[error("Stream failure: {0}")]
    Network(String),
}

/// Seam between the run loop and the transport. Every call opens a fresh
/// connection.
pub trait EventSource: Send + Sync {
    fn connect(
        &self,
    ) -> Result<BoxStream<'static, Result<StreamingEvent, StreamingError>>, String>;
}

/// [EventSource] backed by the SSE client, with the identity headers and
/// transport-level reconnect options applied.
pub struct SseConnector {
    url: String,
    headers: Vec<(String, String)>,
    initial_reconnect_delay: Duration,
    connect_timeout: Duration,
    read_timeout: Duration,
}

impl SseConnector {
    fn new(config: &Config) -> Self {
        let mut headers = vec![
            ("Authorization".to_owned(), config.sdk_key.clone()),
            ("User-Agent".to_owned(), config.user_agent()),
        ];
        if let Some(wrapper) = config.wrapper_header_value() {
            headers.push(("X-LaunchDarkly-Wrapper".to_owned(), wrapper));
        }
        headers.extend(config.http.custom_headers.iter().cloned());
        Self {
            url: format!("{}/all", config.service_endpoints.streaming_base),
            headers,
            initial_reconnect_delay: config.stream_initial_reconnect_delay,
            connect_timeout: config.http.connect_timeout,
            read_timeout: config.http.socket_timeout,
        }
    }
}

impl EventSource for SseConnector {
    fn connect(
        &self,
    ) -> Result<BoxStream<'static, Result<StreamingEvent, StreamingError>>, String> {
        let mut builder = es::ClientBuilder::for_url(&self.url).map_err(|e| e.to_string())?;
        for (name, value) in &self.headers {
            builder = builder.header(name, value).map_err(|e| e.to_string())?;
        }
        let client = builder
            .reconnect(
                es::ReconnectOptions::reconnect(true)
                    .retry_initial(true)
                    .delay(self.initial_reconnect_delay)
                    .backoff_factor(2)
                    .delay_max(Duration::from_secs(30))
                    .build(),
            )
            .read_timeout(self.read_timeout)
            .build();
        Ok(client
            .stream()
            .filter_map(|item| async move {
                match item {
                    Ok(es::SSE::Event(event)) => Some(Ok(StreamingEvent {
                        event_type: event.event_type,
                        data: event.data,
                    })),
                    // heartbeats keep the connection warm, nothing to do
                    Ok(es::SSE::Comment(_)) => None,
                    Err(error) => Some(Err(convert_error(error))),
                }
            })
            .boxed())
    }
}

fn convert_error(error: es::Error) -> StreamingError {
    match &error {
        es::Error::UnexpectedResponse(response) => StreamingError::Http(response.as_u16()),
        other => StreamingError::Network(other.to_string()),
    }
}

pub struct StreamingDataSource {
    connector: Box<dyn EventSource>,
    initial_reconnect_delay: Duration,
    started: AtomicBool,
    shutdown_tx: watch::Sender<bool>,
}

impl StreamingDataSource {
    pub fn new(config: &Config) -> Self {
        Self::with_connector(
            Box::new(SseConnector::new(config)),
            config.stream_initial_reconnect_delay,
        )
    }

    /// Custom transport; also the test seam.
    pub fn with_connector(connector: Box<dyn EventSource>, reconnect_delay: Duration) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            connector,
            initial_reconnect_delay: reconnect_delay,
            started: AtomicBool::new(false),
            shutdown_tx,
        }
    }

    async fn run(
        self: Arc<Self>,
        updates: Arc<DataSourceUpdates>,
        init_tx: watch::Sender<Option<Result<(), StartError>>>,
    ) {
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let mut store_status_rx = updates.store_status_events();
        let mut retry = RetryDelay::new(self.initial_reconnect_delay);
        let mut initialized = false;

        'connect: loop {
            let attempt_timestamp = Utc::now().timestamp_millis().max(0) as u64;
            let attempt_started = Instant::now();
            let mut stream = match self.connector.connect() {
                Ok(stream) => stream,
                Err(message) => {
                    // a connector that cannot even be built will never work
                    warn!(%message, "failed to create stream connection");
                    updates.update_status(
                        DataSourceState::Off,
                        Some(DataSourceError::new(
                            DataSourceErrorKind::NetworkError,
                            message.clone(),
                        )),
                    );
                    let _ = init_tx.send(Some(Err(StartError::Unrecoverable(message))));
                    return;
                }
            };

            loop {
                tokio::select! {
                    _ = shutdown_rx.changed() => return,
                    status = next_store_status(&mut store_status_rx) => {
                        if status.available && status.refresh_needed {
                            info!("data store wants a refresh, restarting stream");
                            continue 'connect;
                        }
                    }
                    item = stream.next() => match item {
                        Some(Ok(event)) => match Message::parse(&event.event_type, &event.data) {
                            Ok(Message::Put(data)) => {
                                if updates.init(data).is_err() {
                                    tokio::time::sleep(retry.next()).await;
                                    continue 'connect;
                                }
                                retry.reset();
                                if !initialized {
                                    initialized = true;
                                    updates.record_stream_init(
                                        attempt_timestamp,
                                        false,
                                        attempt_started.elapsed(),
                                    );
                                    let _ = init_tx.send(Some(Ok(())));
                                }
                                updates.update_status(DataSourceState::Valid, None);
                            }
                            Ok(Message::Patch { key, item }) | Ok(Message::Delete { key, item }) => {
                                if updates.upsert(&key, item).is_err() {
                                    tokio::time::sleep(retry.next()).await;
                                    continue 'connect;
                                }
                            }
                            Ok(Message::Unknown) => {}
                            Err(error) => {
                                self.note_parse_failure(
                                    &updates,
                                    &error,
                                    initialized,
                                    attempt_timestamp,
                                    attempt_started,
                                );
                                tokio::time::sleep(retry.next()).await;
                                continue 'connect;
                            }
                        },
                        Some(Err(StreamingError::Http(status)))
                            if !is_http_error_recoverable(status) =>
                        {
                            warn!(status, "unrecoverable HTTP error, shutting stream down");
                            updates.update_status(
                                DataSourceState::Off,
                                Some(DataSourceError::http(status)),
                            );
                            if !initialized {
                                updates.record_stream_init(
                                    attempt_timestamp,
                                    true,
                                    attempt_started.elapsed(),
                                );
                                let _ = init_tx.send(Some(Err(StartError::Unrecoverable(
                                    format!("HTTP error {}", status),
                                ))));
                            }
                            return;
                        }
                        Some(Err(error)) => {
                            // the transport retries on its own; just track it
                            warn!(%error, "stream interrupted, will reconnect");
                            let source_error = match error {
                                StreamingError::Http(status) => DataSourceError::http(status),
                                StreamingError::Network(message) => DataSourceError::new(
                                    DataSourceErrorKind::NetworkError,
                                    message,
                                ),
                            };
                            updates.update_status(
                                DataSourceState::Interrupted,
                                Some(source_error),
                            );
                            if !initialized {
                                updates.record_stream_init(
                                    attempt_timestamp,
                                    true,
                                    attempt_started.elapsed(),
                                );
                            }
                        }
                        None => {
                            warn!("stream ended, reconnecting");
                            updates.update_status(
                                DataSourceState::Interrupted,
                                Some(DataSourceError::new(
                                    DataSourceErrorKind::NetworkError,
                                    "stream closed",
                                )),
                            );
                            tokio::time::sleep(retry.next()).await;
                            continue 'connect;
                        }
                    },
                }
            }
        }
    }

    fn note_parse_failure(
        &self,
        updates: &DataSourceUpdates,
        error: &MessageParseError,
        initialized: bool,
        attempt_timestamp: u64,
        attempt_started: Instant,
    ) {
        warn!(%error, "malformed stream event, restarting stream");
        updates.update_status(
            DataSourceState::Interrupted,
            Some(DataSourceError::new(
                DataSourceErrorKind::InvalidData,
                error.to_string(),
            )),
        );
        if !initialized {
            updates.record_stream_init(attempt_timestamp, true, attempt_started.elapsed());
        }
    }
}

/// Pending forever when there is no store-status channel, so `select!`
/// never takes the arm.
async fn next_store_status(
    rx: &mut Option<mpsc::UnboundedReceiver<DataStoreStatus>>,
) -> DataStoreStatus {
    match rx {
        Some(rx) => match rx.recv().await {
            Some(status) => status,
            None => futures::future::pending().await,
        },
        None => futures::future::pending().await,
    }
}

impl DataSource for StreamingDataSource {
    fn start(
        self: Arc<Self>,
        updates: Arc<DataSourceUpdates>,
    ) -> BoxFuture<'static, Result<(), StartError>> {
        if self.started.swap(true, Ordering::SeqCst) {
            return futures::future::ready(Err(StartError::AlreadyStarted)).boxed();
        }
        let (init_tx, mut init_rx) = watch::channel::<Option<Result<(), StartError>>>(None);
        tokio::spawn(Arc::clone(&self).run(updates, init_tx));

        async move {
            if init_rx.borrow().is_none() {
                init_rx
                    .changed()
                    .await
                    .map_err(|_| StartError::TaskDropped)?;
            }
            let result = init_rx.borrow().as_ref().cloned();
            result.unwrap_or(Err(StartError::TaskDropped))
        }
        .boxed()
    }

    fn stop(&self) {
        let _ = self.shutdown_tx.send(true);
    }
}

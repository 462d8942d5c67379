//! Polling data source: periodic full-dataset fetches for environments
//! where a streaming connection is not possible.

use crate::{
    config::Config,
    datasource::{
        error::is_http_error_recoverable, message::RawDataSet, DataSource, DataSourceUpdates,
        StartError,
    },
    status::{DataSourceError, DataSourceErrorKind, DataSourceState, DataStoreStatus},
};
use bytes::Bytes;
use futures::{future::BoxFuture, FutureExt};
use http::{header, Request};
use hyper::{body::to_bytes, Body};
use hyper_rustls::HttpsConnector;
use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};
use tokio::sync::{mpsc, watch};
use tracing::{debug, warn};

#[derive(Clone, Debug, thiserror::Error)]
pub enum PollError {
    #[error("HTTP error {0} from polling endpoint")]
    Http(u16),

    #[error("Poll request failed: {0}")]
    Network(String),
}

/// Transport seam: one full-dataset fetch per call.
pub trait PollRequester: Send + Sync {
    fn request(&self) -> BoxFuture<'static, Result<Bytes, PollError>>;
}

/// [PollRequester] over the shared HTTP client stack.
pub struct HttpPollRequester {
    client: hyper::Client<HttpsConnector<hyper::client::HttpConnector>>,
    uri: String,
    headers: Vec<(String, String)>,
    request_timeout: Duration,
}

impl HttpPollRequester {
    fn new(config: &Config) -> Self {
        let connector = HttpsConnector::with_native_roots();
        let mut headers = vec![
            (header::AUTHORIZATION.to_string(), config.sdk_key.clone()),
            (header::USER_AGENT.to_string(), config.user_agent()),
        ];
        if let Some(wrapper) = config.wrapper_header_value() {
            headers.push(("X-LaunchDarkly-Wrapper".to_owned(), wrapper));
        }
        headers.extend(config.http.custom_headers.iter().cloned());
        Self {
            client: hyper::Client::builder().build(connector),
            uri: format!("{}/sdk/latest-all", config.service_endpoints.polling_base),
            headers,
            request_timeout: config.http.connect_timeout + config.http.socket_timeout,
        }
    }
}

impl PollRequester for HttpPollRequester {
    fn request(&self) -> BoxFuture<'static, Result<Bytes, PollError>> {
        let client = self.client.clone();
        let uri = self.uri.clone();
        let headers = self.headers.clone();
        let request_timeout = self.request_timeout;
        async move {
            let mut builder = Request::get(&uri);
            for (name, value) in &headers {
                builder = builder.header(name.as_str(), value.as_str());
            }
            let request = builder
                .body(Body::empty())
                .map_err(|e| PollError::Network(e.to_string()))?;
            let response = tokio::time::timeout(request_timeout, client.request(request))
                .await
                .map_err(|_| PollError::Network("poll request timed out".into()))?
                .map_err(|e| PollError::Network(e.to_string()))?;
            if !response.status().is_success() {
                return Err(PollError::Http(response.status().as_u16()));
            }
            to_bytes(response.into_body())
                .await
                .map_err(|e| PollError::Network(e.to_string()))
        }
        .boxed()
    }
}

pub struct PollingDataSource {
    requester: Box<dyn PollRequester>,
    poll_interval: Duration,
    started: AtomicBool,
    shutdown_tx: watch::Sender<bool>,
}

impl PollingDataSource {
    pub fn new(config: &Config) -> Self {
        Self::with_requester(Box::new(HttpPollRequester::new(config)), config.poll_interval)
    }

    /// Custom transport; also the test seam. The interval floor is applied
    /// at configuration time.
    pub fn with_requester(requester: Box<dyn PollRequester>, poll_interval: Duration) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            requester,
            poll_interval,
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
        let mut initialized = false;

        loop {
            match self.requester.request().await {
                Ok(body) => match serde_json::from_slice::<RawDataSet>(&body) {
                    Ok(data) => {
                        if updates.init(data.into_all_data()).is_ok() {
                            if !initialized {
                                initialized = true;
                                let _ = init_tx.send(Some(Ok(())));
                            }
                            updates.update_status(DataSourceState::Valid, None);
                            debug!("poll applied full dataset");
                        }
                    }
                    Err(error) => {
                        warn!(%error, "malformed polling response");
                        updates.update_status(
                            DataSourceState::Interrupted,
                            Some(DataSourceError::new(
                                DataSourceErrorKind::InvalidData,
                                error.to_string(),
                            )),
                        );
                    }
                },
                Err(PollError::Http(status)) if !is_http_error_recoverable(status) => {
                    warn!(status, "unrecoverable HTTP error, stopping polling");
                    updates.update_status(
                        DataSourceState::Off,
                        Some(DataSourceError::http(status)),
                    );
                    if !initialized {
                        let _ = init_tx.send(Some(Err(StartError::Unrecoverable(format!(
                            "HTTP error {}",
                            status
                        )))));
                    }
                    return;
                }
                Err(error) => {
                    warn!(%error, "poll failed, will retry on next interval");
                    let source_error = match error {
                        PollError::Http(status) => DataSourceError::http(status),
                        PollError::Network(message) => {
                            DataSourceError::new(DataSourceErrorKind::NetworkError, message)
                        }
                    };
                    updates.update_status(DataSourceState::Interrupted, Some(source_error));
                }
            }

            tokio::select! {
                _ = shutdown_rx.changed() => return,
                _ = tokio::time::sleep(self.poll_interval) => {}
                status = next_store_status(&mut store_status_rx) => {
                    if status.available && status.refresh_needed {
                        debug!("data store wants a refresh, polling immediately");
                    }
                }
            }
        }
    }
}

async fn next_store_status(
    rx: &mut Option<mpsc::UnboundedReceiver<DataStoreStatus>>,
) -> DataStoreStatus {
    loop {
        match rx {
            Some(receiver) => match receiver.recv().await {
                // only a refresh request should cut the sleep short
                Some(status) if status.available && status.refresh_needed => return status,
                Some(_) => continue,
                None => futures::future::pending().await,
            },
            None => futures::future::pending().await,
        }
    }
}

impl DataSource for PollingDataSource {
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

//! Delivery of event payloads to the control plane.

use crate::config::Config;
use chrono::DateTime;
use futures::{future::BoxFuture, FutureExt};
use http::{header, Request};
use hyper::Body;
use hyper_rustls::HttpsConnector;
use serde_json::Value;
use std::time::Duration;
use tracing::{debug, warn};
use uuid::Uuid;

const EVENT_SCHEMA_VERSION: &str = "4";
const RETRY_BACKOFF: Duration = Duration::from_secs(1);

/// Recoverability partition for event delivery, distinct from the data
/// source's. Only a rejected credential or a missing endpoint is
/// permanent; any other failing status gets one retry and then costs the
/// batch, not the pipeline.
fn is_event_error_recoverable(status: u16) -> bool {
    !matches!(status, 401 | 403 | 404)
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SenderResult {
    pub success: bool,
    /// The service rejected us permanently; stop sending analytics.
    pub must_shutdown: bool,
    /// Epoch millis from the response `Date` header.
    pub server_time: Option<u64>,
}

/// Transport seam for the flush workers.
pub trait EventSender: Send + Sync {
    /// Deliver one batch. The payload ID is stable across the internal
    /// retry so the service can deduplicate.
    fn send(&self, events: Vec<Value>, payload_id: Uuid) -> BoxFuture<'static, SenderResult>;

    /// Diagnostics share the HTTP surface but get no retry and no
    /// idempotence key.
    fn send_diagnostic(&self, payload: Value) -> BoxFuture<'static, ()>;
}

pub struct HyperEventSender {
    client: hyper::Client<HttpsConnector<hyper::client::HttpConnector>>,
    bulk_uri: String,
    diagnostic_uri: String,
    headers: Vec<(String, String)>,
    request_timeout: Duration,
}

impl HyperEventSender {
    pub fn new(config: &Config) -> Self {
        let connector = HttpsConnector::with_native_roots();
        let mut headers = vec![
            (header::AUTHORIZATION.to_string(), config.sdk_key.clone()),
            (header::USER_AGENT.to_string(), config.user_agent()),
            (header::CONTENT_TYPE.to_string(), "application/json".into()),
        ];
        if let Some(wrapper) = config.wrapper_header_value() {
            headers.push(("X-LaunchDarkly-Wrapper".to_owned(), wrapper));
        }
        headers.extend(config.http.custom_headers.iter().cloned());
        Self {
            client: hyper::Client::builder().build(connector),
            bulk_uri: format!("{}/bulk", config.service_endpoints.events_base),
            diagnostic_uri: format!("{}/diagnostic", config.service_endpoints.events_base),
            headers,
            request_timeout: config.http.connect_timeout + config.http.socket_timeout,
        }
    }

    async fn post(
        client: hyper::Client<HttpsConnector<hyper::client::HttpConnector>>,
        uri: String,
        headers: Vec<(String, String)>,
        body: String,
        timeout: Duration,
    ) -> Result<(u16, Option<u64>), String> {
        let mut builder = Request::post(&uri);
        for (name, value) in &headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        let request = builder
            .body(Body::from(body))
            .map_err(|e| e.to_string())?;
        let response = tokio::time::timeout(timeout, client.request(request))
            .await
            .map_err(|_| "event post timed out".to_owned())?
            .map_err(|e| e.to_string())?;
        let server_time = response
            .headers()
            .get(header::DATE)
            .and_then(|value| value.to_str().ok())
            .and_then(parse_date_header);
        Ok((response.status().as_u16(), server_time))
    }
}

impl EventSender for HyperEventSender {
    fn send(&self, events: Vec<Value>, payload_id: Uuid) -> BoxFuture<'static, SenderResult> {
        let client = self.client.clone();
        let uri = self.bulk_uri.clone();
        let mut headers = self.headers.clone();
        headers.push((
            "X-LaunchDarkly-Event-Schema".to_owned(),
            EVENT_SCHEMA_VERSION.to_owned(),
        ));
        headers.push((
            "X-LaunchDarkly-Payload-ID".to_owned(),
            payload_id.to_string(),
        ));
        let timeout = self.request_timeout;
        let body = serde_json::to_string(&events).unwrap_or_else(|_| "[]".into());

        async move {
            for attempt in 0..2 {
                if attempt > 0 {
                    tokio::time::sleep(RETRY_BACKOFF).await;
                }
                match Self::post(
                    client.clone(),
                    uri.clone(),
                    headers.clone(),
                    body.clone(),
                    timeout,
                )
                .await
                {
                    Ok((status, server_time)) if (200..300).contains(&status) => {
                        debug!(count = events.len(), "event batch delivered");
                        return SenderResult {
                            success: true,
                            must_shutdown: false,
                            server_time,
                        };
                    }
                    Ok((status, _)) if !is_event_error_recoverable(status) => {
                        warn!(status, "event delivery rejected permanently");
                        return SenderResult {
                            success: false,
                            must_shutdown: true,
                            server_time: None,
                        };
                    }
                    Ok((status, _)) => {
                        warn!(status, attempt, "event delivery failed, may retry");
                    }
                    Err(error) => {
                        warn!(%error, attempt, "event delivery failed, may retry");
                    }
                }
            }
            // both attempts failed; the batch is discarded
            SenderResult::default()
        }
        .boxed()
    }

    fn send_diagnostic(&self, payload: Value) -> BoxFuture<'static, ()> {
        let client = self.client.clone();
        let uri = self.diagnostic_uri.clone();
        let headers = self.headers.clone();
        let timeout = self.request_timeout;
        let body = payload.to_string();

        async move {
            match Self::post(client, uri, headers, body, timeout).await {
                Ok((status, _)) if (200..300).contains(&status) => {}
                Ok((status, _)) => warn!(status, "diagnostic delivery failed"),
                Err(error) => warn!(%error, "diagnostic delivery failed"),
            }
        }
        .boxed()
    }
}

/// RFC 2822 `Date` header to epoch millis.
fn parse_date_header(value: &str) -> Option<u64> {
    DateTime::parse_from_rfc2822(value)
        .ok()
        .map(|dt| dt.timestamp_millis().max(0) as u64)
}

//! Client configuration.
//!
//! A [ConfigBuilder] collects knobs and `build()` applies the documented
//! defaults and floors, so the rest of the crate never re-validates them.

use crate::context::AttributeRef;
use std::time::Duration;

pub(crate) const SDK_NAME: &str = "flagship-server-sdk";
pub(crate) const SDK_VERSION: &str = env!("CARGO_PKG_VERSION");

const DEFAULT_STREAM_BASE: &str = "https://stream.launchdarkly.com";
const DEFAULT_POLL_BASE: &str = "https://sdk.launchdarkly.com";
const DEFAULT_EVENTS_BASE: &str = "https://events.launchdarkly.com";

/// Floor on the polling interval; user-supplied values are clamped up.
const MIN_POLL_INTERVAL: Duration = Duration::from_secs(30);
/// Floor on the diagnostic recording interval.
const MIN_DIAGNOSTIC_RECORDING_INTERVAL: Duration = Duration::from_secs(60);

/// Base URIs of the three service surfaces.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ServiceEndpoints {
    pub streaming_base: String,
    pub polling_base: String,
    pub events_base: String,
}

impl Default for ServiceEndpoints {
    fn default() -> Self {
        Self {
            streaming_base: DEFAULT_STREAM_BASE.into(),
            polling_base: DEFAULT_POLL_BASE.into(),
            events_base: DEFAULT_EVENTS_BASE.into(),
        }
    }
}

/// How the local replica is kept in sync.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionMode {
    /// Long-lived SSE connection (the default).
    Streaming,
    /// Periodic full-dataset fetches.
    Polling,
}

/// HTTP behavior shared by the streaming, polling and event transports.
#[derive(Clone, Debug)]
pub struct HttpConfig {
    pub connect_timeout: Duration,
    /// Read timeout on an established connection.
    pub socket_timeout: Duration,
    /// Extra headers attached to every request (name, value).
    pub custom_headers: Vec<(String, String)>,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(3),
            socket_timeout: Duration::from_secs(3),
            custom_headers: Vec::new(),
        }
    }
}

#[derive(Clone, Debug)]
pub struct Config {
    pub sdk_key: String,
    pub offline: bool,
    pub service_endpoints: ServiceEndpoints,
    pub connection_mode: ConnectionMode,
    pub stream_initial_reconnect_delay: Duration,
    pub poll_interval: Duration,
    pub start_wait: Duration,
    pub all_attributes_private: bool,
    pub private_attributes: Vec<AttributeRef>,
    pub event_capacity: usize,
    pub event_flush_interval: Duration,
    pub context_keys_capacity: usize,
    pub context_keys_flush_interval: Duration,
    pub diagnostic_opt_out: bool,
    pub diagnostic_recording_interval: Duration,
    pub big_segments_stale_after: Duration,
    pub wrapper_name: Option<String>,
    pub wrapper_version: Option<String>,
    pub http: HttpConfig,
}

impl Config {
    pub fn builder<K: Into<String>>(sdk_key: K) -> ConfigBuilder {
        ConfigBuilder::new(sdk_key)
    }

    /// `name/version` value for the wrapper identity header, when set.
    pub(crate) fn wrapper_header_value(&self) -> Option<String> {
        let name = self.wrapper_name.as_ref()?;
        Some(match &self.wrapper_version {
            Some(version) => format!("{}/{}", name, version),
            None => name.clone(),
        })
    }

    pub(crate) fn user_agent(&self) -> String {
        format!("{}/{}", SDK_NAME, SDK_VERSION)
    }
}

pub struct ConfigBuilder {
    config: Config,
}

impl ConfigBuilder {
    pub fn new<K: Into<String>>(sdk_key: K) -> Self {
        Self {
            config: Config {
                sdk_key: sdk_key.into(),
                offline: false,
                service_endpoints: ServiceEndpoints::default(),
                connection_mode: ConnectionMode::Streaming,
                stream_initial_reconnect_delay: Duration::from_secs(1),
                poll_interval: MIN_POLL_INTERVAL,
                start_wait: Duration::from_secs(5),
                all_attributes_private: false,
                private_attributes: Vec::new(),
                event_capacity: 1000,
                event_flush_interval: Duration::from_secs(5),
                context_keys_capacity: 1000,
                context_keys_flush_interval: Duration::from_secs(300),
                diagnostic_opt_out: false,
                diagnostic_recording_interval: Duration::from_secs(900),
                big_segments_stale_after: Duration::from_secs(120),
                wrapper_name: None,
                wrapper_version: None,
                http: HttpConfig::default(),
            },
        }
    }

    pub fn offline(mut self, offline: bool) -> Self {
        self.config.offline = offline;
        self
    }

    pub fn service_endpoints(mut self, endpoints: ServiceEndpoints) -> Self {
        self.config.service_endpoints = endpoints;
        self
    }

    pub fn connection_mode(mut self, mode: ConnectionMode) -> Self {
        self.config.connection_mode = mode;
        self
    }

    pub fn stream_initial_reconnect_delay(mut self, delay: Duration) -> Self {
        self.config.stream_initial_reconnect_delay = delay;
        self
    }

    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.config.poll_interval = interval;
        self
    }

    pub fn start_wait(mut self, wait: Duration) -> Self {
        self.config.start_wait = wait;
        self
    }

    pub fn all_attributes_private(mut self, private: bool) -> Self {
        self.config.all_attributes_private = private;
        self
    }

    pub fn private_attribute<S: Into<String>>(mut self, reference: S) -> Self {
        self.config
            .private_attributes
            .push(AttributeRef::new(reference));
        self
    }

    pub fn event_capacity(mut self, capacity: usize) -> Self {
        self.config.event_capacity = capacity;
        self
    }

    pub fn event_flush_interval(mut self, interval: Duration) -> Self {
        self.config.event_flush_interval = interval;
        self
    }

    pub fn context_keys_capacity(mut self, capacity: usize) -> Self {
        self.config.context_keys_capacity = capacity;
        self
    }

    pub fn context_keys_flush_interval(mut self, interval: Duration) -> Self {
        self.config.context_keys_flush_interval = interval;
        self
    }

    pub fn diagnostic_opt_out(mut self, opt_out: bool) -> Self {
        self.config.diagnostic_opt_out = opt_out;
        self
    }

    pub fn diagnostic_recording_interval(mut self, interval: Duration) -> Self {
        self.config.diagnostic_recording_interval = interval;
        self
    }

    pub fn big_segments_stale_after(mut self, stale_after: Duration) -> Self {
        self.config.big_segments_stale_after = stale_after;
        self
    }

    pub fn wrapper<N: Into<String>, V: Into<String>>(mut self, name: N, version: V) -> Self {
        self.config.wrapper_name = Some(name.into());
        self.config.wrapper_version = Some(version.into());
        self
    }

    pub fn http(mut self, http: HttpConfig) -> Self {
        self.config.http = http;
        self
    }

    pub fn build(mut self) -> Config {
        if self.config.poll_interval < MIN_POLL_INTERVAL {
            self.config.poll_interval = MIN_POLL_INTERVAL;
        }
        if self.config.diagnostic_recording_interval < MIN_DIAGNOSTIC_RECORDING_INTERVAL {
            self.config.diagnostic_recording_interval = MIN_DIAGNOSTIC_RECORDING_INTERVAL;
        }
        self.config
    }
}

use std::time::Duration;

use anyhow::bail;

pub const DEFAULT_REALTIME_HOST: &str = "realtime.pubsub.example.com";
pub const DEFAULT_REST_HOST: &str = "rest.pubsub.example.com";
pub const PROTOCOL_VERSION: &str = "2";

pub fn default_fallback_hosts() -> Vec<String> {
    ["a", "b", "c", "d", "e"].iter()
        .map(|s| format!("{}.fallback.pubsub.example.com", s))
        .collect()
}

/// Wire encoding used for realtime frames; REST bodies are always JSON
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum CodecKind {
    Json,
    Binary,
}
impl CodecKind {
    pub fn format_param(&self) -> &'static str {
        match self {
            CodecKind::Json => "json",
            CodecKind::Binary => "binary",
        }
    }
}

/// What happens when a message is queued while the outbound queue is at `max_queued_messages`
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum QueueOverflowPolicy {
    /// the new message is rejected with `Error::QueueOverflow`
    RejectNewest,
    /// the oldest queued message is failed with `Error::QueueOverflow` to make room
    DropOldest,
    /// the connection transitions to `failed`
    FailConnection,
}

#[derive(Debug, Clone)]
pub struct ClientOptions {
    /// API key in the form `key_name:key_secret`. Not needed if an explicit `Authenticator` is
    ///  passed to the client.
    pub key: Option<String>,
    pub client_id: Option<String>,
    /// connect as soon as the client is created, rather than on the first `connect()`
    pub auto_connect: bool,

    pub realtime_host: String,
    pub rest_host: String,
    /// Hosts tried in turn when the primary host is unreachable or returns a server error
    pub fallback_hosts: Vec<String>,
    pub shuffle_fallback_hosts: bool,

    pub codec: CodecKind,
    pub protocol_version: String,
    /// whether messages published by this connection are delivered back to it
    pub echo_messages: bool,
    /// recovery key from `Connection::recovery_key()` of a previous client instance
    pub recover: Option<String>,

    /// queue publishes while not connected rather than failing them immediately
    pub queue_messages: bool,
    /// `None` means unbounded
    pub max_queued_messages: Option<usize>,
    pub queue_overflow_policy: QueueOverflowPolicy,

    /// base delay before reconnecting from `disconnected`
    pub disconnected_retry_timeout: Duration,
    pub backoff_multiplier: f64,
    pub backoff_max: Duration,
    /// jitter as a fraction of the computed delay, between 0.0 and 1.0; the actual delay is
    ///  reduced by a random amount up to this fraction
    pub backoff_jitter: f64,
    /// number of reconnect attempts from `disconnected` before moving to `suspended`, in
    ///  addition to the `connection_state_ttl` time limit
    pub max_reconnect_attempts: Option<u32>,
    /// how long the connection stays `disconnected` before moving to `suspended`. May be
    ///  overridden by the service in the connection details.
    pub connection_state_ttl: Duration,
    pub suspended_retry_timeout: Duration,

    /// timeout for the handshake, attach / detach acknowledgement, close acknowledgement and ping
    pub realtime_request_timeout: Duration,
    pub channel_retry_timeout: Duration,

    pub http_request_timeout: Duration,
    /// number of retries after the first attempt, i.e. `http_max_retry_count + 1` attempts in total
    pub http_max_retry_count: u32,
    /// window during which a successful fallback host is preferred, and a failed host is skipped
    pub fallback_retry_timeout: Duration,
}

impl ClientOptions {
    pub fn new(key: impl Into<String>) -> ClientOptions {
        ClientOptions {
            key: Some(key.into()),
            ..ClientOptions::default()
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.realtime_host.is_empty() || self.rest_host.is_empty() {
            bail!("hosts must not be empty");
        }
        if let Some(key) = &self.key {
            if !key.contains(':') {
                bail!("API key must have the form 'key_name:key_secret'");
            }
        }
        if self.client_id.as_deref() == Some("*") {
            bail!("the wildcard client id is reserved");
        }
        if self.backoff_multiplier < 1.0 {
            bail!("backoff multiplier must be at least 1.0");
        }
        if !(0.0..=1.0).contains(&self.backoff_jitter) {
            bail!("backoff jitter must be between 0.0 and 1.0");
        }
        if self.backoff_max < self.disconnected_retry_timeout {
            bail!("backoff cap must not be smaller than the base retry delay");
        }
        if self.max_queued_messages == Some(0) {
            bail!("max_queued_messages must be positive - use queue_messages=false to disable queueing");
        }
        if self.realtime_request_timeout.is_zero() || self.http_request_timeout.is_zero() {
            bail!("timeouts must be positive");
        }
        Ok(())
    }

    /// primary host first, then the fallback hosts
    pub fn realtime_hosts(&self) -> Vec<String> {
        let mut result = vec![self.realtime_host.clone()];
        result.extend(self.fallback_hosts.iter().cloned());
        result
    }
}

impl Default for ClientOptions {
    fn default() -> Self {
        ClientOptions {
            key: None,
            client_id: None,
            auto_connect: true,
            realtime_host: DEFAULT_REALTIME_HOST.to_string(),
            rest_host: DEFAULT_REST_HOST.to_string(),
            fallback_hosts: default_fallback_hosts(),
            shuffle_fallback_hosts: true,
            codec: CodecKind::Binary,
            protocol_version: PROTOCOL_VERSION.to_string(),
            echo_messages: true,
            recover: None,
            queue_messages: true,
            max_queued_messages: Some(1000),
            queue_overflow_policy: QueueOverflowPolicy::RejectNewest,
            disconnected_retry_timeout: Duration::from_secs(15),
            backoff_multiplier: 2.0,
            backoff_max: Duration::from_secs(60),
            backoff_jitter: 0.2,
            max_reconnect_attempts: None,
            connection_state_ttl: Duration::from_secs(120),
            suspended_retry_timeout: Duration::from_secs(30),
            realtime_request_timeout: Duration::from_secs(10),
            channel_retry_timeout: Duration::from_secs(15),
            http_request_timeout: Duration::from_secs(10),
            http_max_retry_count: 3,
            fallback_retry_timeout: Duration::from_secs(600),
        }
    }
}

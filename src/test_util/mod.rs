//! Utilities for testing code built on the client: an in-memory transport driven by the test,
//!  and client options suitable for it.
//!
//! They are part of the crate's regular (non-#[cfg(test)]) code so that applications can use
//!  them in their own tests.

pub mod transport;

use std::time::Duration;

use crate::config::{ClientOptions, CodecKind};

/// Options with short, deterministic timings: no jitter, no host shuffling, JSON frames. The
///  primary host is `primary.test`, fallbacks are `fallback1.test` and `fallback2.test`.
pub fn test_options() -> ClientOptions {
    ClientOptions {
        realtime_host: "primary.test".to_string(),
        rest_host: "rest.test".to_string(),
        fallback_hosts: vec!["fallback1.test".to_string(), "fallback2.test".to_string()],
        shuffle_fallback_hosts: false,
        codec: CodecKind::Json,
        disconnected_retry_timeout: Duration::from_secs(1),
        backoff_jitter: 0.0,
        realtime_request_timeout: Duration::from_secs(5),
        channel_retry_timeout: Duration::from_secs(5),
        http_request_timeout: Duration::from_secs(5),
        ..ClientOptions::new("app.key:secret")
    }
}

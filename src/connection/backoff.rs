use std::marker::PhantomData;
use std::time::Duration;

use crate::config::ClientOptions;
use crate::util::random::Random;

/// Reconnect delays growing geometrically from a base delay up to a cap, each reduced by a random
///  jitter so that many clients losing their connections at the same time do not reconnect in
///  lockstep.
pub struct ReconnectBackoff<R: Random> {
    attempts: u32,

    config_base: Duration,
    config_max: Duration,
    config_multiplier: f64,
    config_jitter: f64,

    _random: PhantomData<R>,
}

impl <R: Random> ReconnectBackoff<R> {
    pub fn new(options: &ClientOptions) -> ReconnectBackoff<R> {
        ReconnectBackoff {
            attempts: 0,
            config_base: options.disconnected_retry_timeout,
            config_max: options.backoff_max,
            config_multiplier: options.backoff_multiplier,
            config_jitter: options.backoff_jitter,
            _random: Default::default(),
        }
    }

    /// number of delays handed out since the last reset
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn reset(&mut self) {
        self.attempts = 0;
    }

    #[must_use]
    pub fn next_delay(&mut self) -> Duration {
        let exponent = self.attempts.min(64) as i32;
        self.attempts = self.attempts.saturating_add(1);

        let raw = self.config_base.as_secs_f64() * self.config_multiplier.powi(exponent);
        let capped = raw.min(self.config_max.as_secs_f64());

        let jitter = R::gen_f64_range(0.0..self.config_jitter);
        Duration::from_secs_f64(capped * (1.0 - jitter))
    }
}

use std::marker::PhantomData;
use std::time::Duration;

use rustc_hash::FxHashMap;
use tokio::time::Instant;
use tracing::debug;

use crate::config::ClientOptions;
use crate::util::random::{shuffle, Random};

/// Decides the order in which hosts are tried for a request.
///
/// A fallback host that served a request successfully is tried first for the following requests
///  until `fallback_retry_timeout` after it was first chosen, so that requests do not keep
///  hitting an unavailable primary host. A host that failed is put last for the same period.
pub struct HostSelector<R: Random> {
    primary: String,
    fallbacks: Vec<String>,
    shuffle_fallbacks: bool,
    retry_window: Duration,

    preferred: Option<(String, Instant)>,
    unhealthy: FxHashMap<String, Instant>,

    _random: PhantomData<R>,
}

impl <R: Random> HostSelector<R> {
    pub fn new(options: &ClientOptions) -> HostSelector<R> {
        HostSelector {
            primary: options.rest_host.clone(),
            fallbacks: options.fallback_hosts.clone(),
            shuffle_fallbacks: options.shuffle_fallback_hosts,
            retry_window: options.fallback_retry_timeout,
            preferred: None,
            unhealthy: Default::default(),
            _random: Default::default(),
        }
    }

    /// All hosts in the order they should be tried: the preferred host, the primary host, the
    ///  fallback hosts, and finally hosts that failed recently
    pub fn candidates(&mut self, now: Instant) -> Vec<String> {
        self.unhealthy.retain(|_, until| *until > now);
        if matches!(&self.preferred, Some((_, expires)) if *expires <= now) {
            debug!("preferred fallback host expired, returning to the primary host");
            self.preferred = None;
        }

        let mut fallbacks = self.fallbacks.clone();
        if self.shuffle_fallbacks {
            shuffle::<R, _>(&mut fallbacks);
        }

        let mut ordered: Vec<String> = Vec::new();
        let all = self.preferred.iter()
            .map(|(host, _)| host.clone())
            .chain(std::iter::once(self.primary.clone()))
            .chain(fallbacks);
        for host in all {
            if !ordered.contains(&host) {
                ordered.push(host);
            }
        }

        let (mut healthy, unhealthy): (Vec<_>, Vec<_>) = ordered.into_iter()
            .partition(|host| !self.unhealthy.contains_key(host));
        healthy.extend(unhealthy);
        healthy
    }

    pub fn on_success(&mut self, host: &str, now: Instant) {
        self.unhealthy.remove(host);
        if host == self.primary {
            self.preferred = None;
            return;
        }
        match &self.preferred {
            Some((preferred, _)) if preferred == host => {}
            _ => {
                debug!("preferring fallback host {} for {:?}", host, self.retry_window);
                self.preferred = Some((host.to_string(), now + self.retry_window));
            }
        }
    }

    /// The host answered with an error that is not the host's fault. It is healthy, but does
    ///  not become the preferred host.
    pub fn on_reachable(&mut self, host: &str) {
        self.unhealthy.remove(host);
    }

    pub fn on_failure(&mut self, host: &str, now: Instant) {
        self.unhealthy.insert(host.to_string(), now + self.retry_window);
        if matches!(&self.preferred, Some((preferred, _)) if preferred == host) {
            self.preferred = None;
        }
    }
}

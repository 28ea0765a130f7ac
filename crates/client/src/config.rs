//! Sync engine configuration and backoff policies.
//!
//! Every bound here is explicit; nothing retries forever.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Backoff for transient mutation failures.
///
/// The delay after the `n`-th failure is `base_delay * growth_factor^n`,
/// capped at `max_delay`. After more than `max_retries` failures the mutation
/// is failed for good.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
    pub growth_factor: f64,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 5,
            base_delay: Duration::from_millis(500),
            growth_factor: 2.0,
            max_delay: Duration::from_secs(60),
        }
    }
}

impl RetryPolicy {
    pub fn new(max_retries: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_retries,
            base_delay,
            max_delay,
            ..Default::default()
        }
    }

    /// Retry immediately (next drain), up to `max_retries` times.
    pub fn immediate(max_retries: u32) -> Self {
        Self::new(max_retries, Duration::ZERO, Duration::ZERO)
    }

    /// Delay before the next attempt, given the retry count *after* the
    /// failure was recorded.
    pub fn delay_for_retry(&self, retries: u32) -> Duration {
        capped_exponential(self.base_delay, self.growth_factor, retries, self.max_delay)
    }

    pub fn is_exhausted(&self, retries: u32) -> bool {
        retries > self.max_retries
    }
}

/// Backoff for realtime feed reconnects.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReconnectPolicy {
    pub base_delay: Duration,
    pub growth_factor: f64,
    pub max_delay: Duration,
    pub max_attempts: u32,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(1),
            growth_factor: 2.0,
            max_delay: Duration::from_secs(30),
            max_attempts: 10,
        }
    }
}

fn capped_exponential(base: Duration, factor: f64, exponent: u32, cap: Duration) -> Duration {
    let factor = if factor.is_finite() && factor >= 1.0 { factor } else { 1.0 };
    let exp = i32::try_from(exponent).unwrap_or(i32::MAX);
    let millis = base.as_millis() as f64 * factor.powi(exp);
    let cap_ms = cap.as_millis() as f64;
    if !millis.is_finite() || millis >= cap_ms {
        cap
    } else {
        Duration::from_millis(millis as u64)
    }
}

/// Stateful reconnect backoff: attempt counter plus the policy.
#[derive(Debug, Clone)]
pub struct ReconnectBackoff {
    policy: ReconnectPolicy,
    attempts: u32,
}

impl ReconnectBackoff {
    pub fn new(policy: ReconnectPolicy) -> Self {
        Self { policy, attempts: 0 }
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Delay before the next reconnect attempt, or `None` once the attempt
    /// budget is spent.
    pub fn next_delay(&mut self) -> Option<Duration> {
        if self.attempts >= self.policy.max_attempts {
            return None;
        }
        let delay = capped_exponential(
            self.policy.base_delay,
            self.policy.growth_factor,
            self.attempts,
            self.policy.max_delay,
        );
        self.attempts += 1;
        Some(delay)
    }

    /// Back to the initial delay (manual reconnect or successful connect).
    pub fn reset(&mut self) {
        self.attempts = 0;
    }
}

/// Configuration of one tenant's sync engine.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Backend base URL, used by the HTTP transport and the SSE feed.
    pub api_url: String,
    pub retry: RetryPolicy,
    pub reconnect: ReconnectPolicy,
    /// Per network call; a timeout is always a transient failure.
    pub request_timeout: Duration,
    /// Upper bound on concurrent requests across independent entity chains.
    pub max_in_flight: usize,
    /// Periodic drain interval while mutations are pending.
    pub poll_interval: Duration,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            api_url: "http://localhost:7745/api/v1".to_string(),
            retry: RetryPolicy::default(),
            reconnect: ReconnectPolicy::default(),
            request_timeout: Duration::from_secs(15),
            max_in_flight: 4,
            poll_interval: Duration::from_secs(30),
        }
    }
}

impl SyncConfig {
    /// Defaults overridden by `STOWAGE_*` environment variables.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Ok(url) = std::env::var("STOWAGE_API_URL") {
            config.api_url = url;
        }
        if let Some(n) = env_parse::<u32>("STOWAGE_MAX_RETRIES") {
            config.retry.max_retries = n;
        }
        if let Some(ms) = env_parse::<u64>("STOWAGE_REQUEST_TIMEOUT_MS") {
            config.request_timeout = Duration::from_millis(ms);
        }
        if let Some(n) = env_parse::<usize>("STOWAGE_MAX_IN_FLIGHT") {
            config.max_in_flight = n;
        }
        if let Some(secs) = env_parse::<u64>("STOWAGE_POLL_INTERVAL_SECS") {
            config.poll_interval = Duration::from_secs(secs);
        }
        config
    }

    pub fn with_api_url(mut self, url: impl Into<String>) -> Self {
        self.api_url = url.into();
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_reconnect(mut self, reconnect: ReconnectPolicy) -> Self {
        self.reconnect = reconnect;
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn with_max_in_flight(mut self, max: usize) -> Self {
        self.max_in_flight = max.max(1);
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    let raw = std::env::var(name).ok()?;
    match raw.trim().parse() {
        Ok(v) => Some(v),
        Err(_) => {
            tracing::warn!(var = name, value = %raw, "ignoring unparsable config value");
            None
        }
    }
}

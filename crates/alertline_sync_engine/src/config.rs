//! Configuration for the sync engine.

use crate::error::{SyncError, SyncResult};
use alertline_protocol::Filter;
use rand::Rng;
use std::time::Duration;

/// Configuration for a sync client.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Client identity sent with subscriptions and acks.
    pub client_id: String,
    /// Server URL.
    pub server_url: String,
    /// Channels subscribed at startup.
    pub filters: Vec<Filter>,
    /// Ask the server to replay from scratch on the first subscription.
    pub reset_consumers: bool,
    /// Catch-up ends after this long without an accepted event.
    pub inactivity_timeout: Duration,
    /// Catch-up ends after this long regardless of activity.
    pub catch_up_timeout: Duration,
    /// How often channels in catch-up are checked for completion.
    pub completion_check_interval: Duration,
    /// Debounce interval for persisting sync state.
    pub state_flush_interval: Duration,
    /// Acknowledgment batching.
    pub ack: AckConfig,
    /// Reconnect backoff.
    pub backoff: BackoffConfig,
}

impl SyncConfig {
    /// Creates a new sync configuration.
    pub fn new(client_id: impl Into<String>, server_url: impl Into<String>) -> Self {
        Self {
            client_id: client_id.into(),
            server_url: server_url.into(),
            filters: Vec::new(),
            reset_consumers: false,
            inactivity_timeout: Duration::from_secs(30),
            catch_up_timeout: Duration::from_secs(60),
            completion_check_interval: Duration::from_secs(2),
            state_flush_interval: Duration::from_secs(1),
            ack: AckConfig::default(),
            backoff: BackoffConfig::default(),
        }
    }

    /// Adds a subscription filter.
    pub fn with_filter(mut self, filter: Filter) -> Self {
        if !self.filters.contains(&filter) {
            self.filters.push(filter);
        }
        self
    }

    /// Adds several subscription filters.
    pub fn with_filters(self, filters: impl IntoIterator<Item = Filter>) -> Self {
        filters.into_iter().fold(self, Self::with_filter)
    }

    /// Requests a consumer reset on the first subscription.
    pub fn with_reset_consumers(mut self, reset: bool) -> Self {
        self.reset_consumers = reset;
        self
    }

    /// Sets the catch-up inactivity window.
    pub fn with_inactivity_timeout(mut self, timeout: Duration) -> Self {
        self.inactivity_timeout = timeout;
        self
    }

    /// Sets the hard catch-up timeout.
    pub fn with_catch_up_timeout(mut self, timeout: Duration) -> Self {
        self.catch_up_timeout = timeout;
        self
    }

    /// Sets the completion check interval.
    pub fn with_completion_check_interval(mut self, interval: Duration) -> Self {
        self.completion_check_interval = interval;
        self
    }

    /// Sets the state flush debounce interval.
    pub fn with_state_flush_interval(mut self, interval: Duration) -> Self {
        self.state_flush_interval = interval;
        self
    }

    /// Sets the acknowledgment configuration.
    pub fn with_ack(mut self, ack: AckConfig) -> Self {
        self.ack = ack;
        self
    }

    /// Sets the backoff configuration.
    pub fn with_backoff(mut self, backoff: BackoffConfig) -> Self {
        self.backoff = backoff;
        self
    }

    /// Checks that the configuration is usable.
    pub fn validate(&self) -> SyncResult<()> {
        if self.client_id.trim().is_empty() {
            return Err(SyncError::InvalidConfig("client id must not be empty".into()));
        }
        if self.inactivity_timeout.is_zero() || self.catch_up_timeout.is_zero() {
            return Err(SyncError::InvalidConfig(
                "catch-up timeouts must be non-zero".into(),
            ));
        }
        if self.completion_check_interval.is_zero()
            || self.completion_check_interval >= self.inactivity_timeout
        {
            return Err(SyncError::InvalidConfig(format!(
                "completion check interval {:?} must be non-zero and shorter than the inactivity window {:?}",
                self.completion_check_interval, self.inactivity_timeout
            )));
        }
        if self.ack.batch_size == 0 {
            return Err(SyncError::InvalidConfig("ack batch size must be non-zero".into()));
        }
        if self.ack.flush_interval.is_zero() || self.state_flush_interval.is_zero() {
            return Err(SyncError::InvalidConfig("flush intervals must be non-zero".into()));
        }
        Ok(())
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self::new("", "")
    }
}

/// Configuration for acknowledgment batching.
#[derive(Debug, Clone)]
pub struct AckConfig {
    /// Maximum ids per ack frame.
    pub batch_size: usize,
    /// How often partially filled batches are flushed.
    pub flush_interval: Duration,
    /// While no channel is catching up, flush immediately when at most
    /// this many ids are pending.
    pub immediate_threshold: usize,
}

impl AckConfig {
    /// Sets the batch size.
    pub fn with_batch_size(mut self, size: usize) -> Self {
        self.batch_size = size;
        self
    }

    /// Sets the flush interval.
    pub fn with_flush_interval(mut self, interval: Duration) -> Self {
        self.flush_interval = interval;
        self
    }

    /// Sets the immediate flush threshold.
    pub fn with_immediate_threshold(mut self, threshold: usize) -> Self {
        self.immediate_threshold = threshold;
        self
    }
}

impl Default for AckConfig {
    fn default() -> Self {
        Self {
            batch_size: 50,
            flush_interval: Duration::from_millis(250),
            immediate_threshold: 8,
        }
    }
}

/// Configuration for reconnect backoff.
#[derive(Debug, Clone)]
pub struct BackoffConfig {
    /// Delay before the first reconnect attempt.
    pub initial_delay: Duration,
    /// Maximum delay between attempts.
    pub max_delay: Duration,
    /// Multiplier for exponential backoff.
    pub multiplier: f64,
    /// Whether to add up to 25% jitter to delays.
    pub add_jitter: bool,
    /// A connection open at least this long resets the attempt counter.
    pub stable_after: Duration,
    /// Give up after this many consecutive attempts. `None` retries forever.
    pub max_attempts: Option<u32>,
}

impl BackoffConfig {
    /// Creates a configuration with the given delay bounds.
    pub fn new(initial_delay: Duration, max_delay: Duration) -> Self {
        Self {
            initial_delay,
            max_delay,
            ..Self::default()
        }
    }

    /// Sets the backoff multiplier.
    pub fn with_multiplier(mut self, multiplier: f64) -> Self {
        self.multiplier = multiplier;
        self
    }

    /// Enables or disables jitter.
    pub fn with_jitter(mut self, add_jitter: bool) -> Self {
        self.add_jitter = add_jitter;
        self
    }

    /// Sets the sustained-open period that resets the backoff.
    pub fn with_stable_after(mut self, period: Duration) -> Self {
        self.stable_after = period;
        self
    }

    /// Sets the maximum number of consecutive attempts.
    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = Some(attempts);
        self
    }

    /// Calculates the delay before a given attempt (1-indexed).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }

        let exponent = i32::try_from(attempt - 1).unwrap_or(i32::MAX);
        let base = self.initial_delay.as_nanos() as f64 * self.multiplier.powi(exponent);
        let capped = base.min(self.max_delay.as_nanos() as f64);

        let nanos = if self.add_jitter {
            capped + capped * 0.25 * rand::thread_rng().gen_range(0.0..1.0)
        } else {
            capped
        };
        Duration::from_nanos(nanos.round() as u64)
    }
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            multiplier: 2.0,
            add_jitter: true,
            stable_after: Duration::from_secs(10),
            max_attempts: None,
        }
    }
}

/// Reconnect attempt counter.
#[derive(Debug, Clone)]
pub struct Backoff {
    config: BackoffConfig,
    attempt: u32,
}

impl Backoff {
    /// Creates a fresh counter.
    pub fn new(config: BackoffConfig) -> Self {
        Self { config, attempt: 0 }
    }

    /// Number of attempts scheduled since the last reset.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Schedules the next attempt, or returns `None` when attempts are exhausted.
    pub fn next_delay(&mut self) -> Option<Duration> {
        if self
            .config
            .max_attempts
            .is_some_and(|max| self.attempt >= max)
        {
            return None;
        }
        self.attempt = self.attempt.saturating_add(1);
        Some(self.config.delay_for_attempt(self.attempt))
    }

    /// Resets after a sustained open period.
    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    /// Returns true if a connection open for `open_for` counts as stable.
    pub fn is_stable(&self, open_for: Duration) -> bool {
        open_for >= self.config.stable_after
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid() -> SyncConfig {
        SyncConfig::new("client-1", "ws://localhost:9000/events")
    }

    #[test]
    fn sync_config_defaults() {
        let config = valid();
        assert_eq!(config.inactivity_timeout, Duration::from_secs(30));
        assert_eq!(config.catch_up_timeout, Duration::from_secs(60));
        assert_eq!(config.completion_check_interval, Duration::from_secs(2));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn sync_config_builder() {
        let config = valid()
            .with_filter(Filter::new("giridih", "id"))
            .with_filter(Filter::new("giridih", "id"))
            .with_filters([Filter::new("north", "motion")])
            .with_inactivity_timeout(Duration::from_secs(5))
            .with_catch_up_timeout(Duration::from_secs(10))
            .with_completion_check_interval(Duration::from_millis(500))
            .with_reset_consumers(true);

        assert_eq!(config.filters.len(), 2);
        assert!(config.reset_consumers);
        assert_eq!(config.inactivity_timeout, Duration::from_secs(5));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn validate_rejects_bad_values() {
        assert!(SyncConfig::new("", "ws://x").validate().is_err());
        assert!(valid()
            .with_completion_check_interval(Duration::from_secs(30))
            .validate()
            .is_err());
        assert!(valid()
            .with_inactivity_timeout(Duration::ZERO)
            .validate()
            .is_err());
        assert!(valid()
            .with_ack(AckConfig::default().with_batch_size(0))
            .validate()
            .is_err());
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let config = BackoffConfig::new(Duration::from_millis(100), Duration::from_millis(500))
            .with_jitter(false);

        assert_eq!(config.delay_for_attempt(0), Duration::ZERO);
        assert_eq!(config.delay_for_attempt(1), Duration::from_millis(100));
        assert_eq!(config.delay_for_attempt(2), Duration::from_millis(200));
        assert_eq!(config.delay_for_attempt(3), Duration::from_millis(400));
        assert_eq!(config.delay_for_attempt(4), Duration::from_millis(500));
        assert_eq!(config.delay_for_attempt(40), Duration::from_millis(500));
    }

    #[test]
    fn backoff_jitter_bounds() {
        let config = BackoffConfig::new(Duration::from_millis(100), Duration::from_secs(5));
        let delay = config.delay_for_attempt(1);
        assert!(delay >= Duration::from_millis(100));
        assert!(delay <= Duration::from_millis(125));
    }

    #[test]
    fn backoff_counter_resets_and_exhausts() {
        let config = BackoffConfig::new(Duration::from_millis(10), Duration::from_millis(80))
            .with_jitter(false)
            .with_max_attempts(2)
            .with_stable_after(Duration::from_secs(1));
        let mut backoff = Backoff::new(config);

        assert_eq!(backoff.next_delay(), Some(Duration::from_millis(10)));
        assert_eq!(backoff.next_delay(), Some(Duration::from_millis(20)));
        assert_eq!(backoff.next_delay(), None);

        assert!(backoff.is_stable(Duration::from_secs(2)));
        assert!(!backoff.is_stable(Duration::from_millis(10)));

        backoff.reset();
        assert_eq!(backoff.attempt(), 0);
        assert_eq!(backoff.next_delay(), Some(Duration::from_millis(10)));
    }
}

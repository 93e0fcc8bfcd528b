//! Exponential backoff shared by the outbound transport retry, the store's
//! connect loop and the per-record retry schedule.

use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryConfig {
    /// Retry attempts after the initial one.
    pub max_retries: u32,
    pub initial_delay: Duration,
    /// Cap for exponential growth.
    pub max_delay: Duration,
    pub backoff_multiplier: f64,
}

impl RetryConfig {
    /// In-call retries of a send that got no response at all.
    pub const TRANSPORT: Self = Self {
        max_retries: 2,
        initial_delay: Duration::from_millis(500),
        max_delay: Duration::from_secs(4),
        backoff_multiplier: 2.0,
    };

    /// Connecting to the pending store at startup.
    ///
    /// - 5 retries with 1s base, 30s cap
    /// - Total max wait: ~31 seconds (1+2+4+8+16)
    pub const STORE_CONNECT: Self = Self {
        max_retries: 5,
        initial_delay: Duration::from_secs(1),
        max_delay: Duration::from_secs(30),
        backoff_multiplier: 2.0,
    };

    /// Retry every pending record on every tick.
    pub const NO_DELAY: Self = Self {
        max_retries: u32::MAX,
        initial_delay: Duration::ZERO,
        max_delay: Duration::ZERO,
        backoff_multiplier: 2.0,
    };

    pub fn new(
        max_retries: u32,
        initial_delay: Duration,
        max_delay: Duration,
        backoff_multiplier: f64,
    ) -> Self {
        Self {
            max_retries,
            initial_delay,
            max_delay,
            backoff_multiplier,
        }
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// `initial_delay * backoff_multiplier^attempt`, capped at `max_delay`.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = attempt.min(i32::MAX as u32) as i32;
        let multiplier = self.backoff_multiplier.powi(exponent);
        let delay_secs = self.initial_delay.as_secs_f64() * multiplier;
        let capped_secs = delay_secs.min(self.max_delay.as_secs_f64());
        if !capped_secs.is_finite() || capped_secs <= 0.0 {
            return Duration::ZERO;
        }
        Duration::from_secs_f64(capped_secs)
    }
}

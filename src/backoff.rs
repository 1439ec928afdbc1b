use crate::config::RetryConfig;
use std::time::Duration;

/// Exponential backoff with optional jitter and a bounded number of attempts.
///
/// `next_delay` returns `None` once `max_retries` consecutive failures have been
/// recorded; `reset` starts a fresh budget after a success.
#[derive(Debug, Clone)]
pub struct Backoff {
    config: RetryConfig,
    attempts: usize,
    delay: Duration,
}

impl Backoff {
    pub fn new(config: &RetryConfig) -> Self {
        Self {
            config: config.clone(),
            attempts: 0,
            delay: config.base_delay(),
        }
    }

    /// Consecutive failures recorded since the last reset
    pub fn attempts(&self) -> usize {
        self.attempts
    }

    pub fn reset(&mut self) {
        self.attempts = 0;
        self.delay = self.config.base_delay();
    }

    /// Record a failure and return how long to wait before retrying.
    pub fn next_delay(&mut self) -> Option<Duration> {
        if self.attempts >= self.config.max_retries {
            return None;
        }
        self.attempts += 1;

        let max_delay = self.config.max_delay();
        let actual_delay = if self.config.jitter {
            let jitter = (self.delay.as_millis() as f64 * 0.1 * simple_rand()) as u64;
            std::cmp::min(self.delay + Duration::from_millis(jitter), max_delay)
        } else {
            self.delay
        };

        self.delay = std::cmp::min(
            Duration::from_millis((self.delay.as_millis() as f64 * self.config.multiplier) as u64),
            max_delay,
        );

        Some(actual_delay)
    }
}

/// Cheap pseudo-random value in [0, 1) for jitter
fn simple_rand() -> f64 {
    use std::time::{SystemTime, UNIX_EPOCH};

    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.subsec_nanos())
        .unwrap_or(0);
    (nanos % 1000) as f64 / 1000.0
}

//! Retry with exponential backoff.
//!
//! One policy is injected everywhere a collaborator is called, instead of each call
//! site carrying its own sleep constants.

use crate::error::Retryable;
use serde::Deserialize;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct RetryPolicy {
    /// Total number of attempts, including the first one.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_initial_delay", with = "humantime_serde")]
    pub initial_delay: Duration,
    #[serde(default = "default_factor")]
    pub factor: f64,
    #[serde(default = "default_max_delay", with = "humantime_serde")]
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_delay: default_initial_delay(),
            factor: default_factor(),
            max_delay: default_max_delay(),
        }
    }
}

impl RetryPolicy {
    /// A single attempt, no retries.
    pub fn once() -> Self {
        Self {
            max_attempts: 1,
            ..Default::default()
        }
    }

    /// Fast retries for tests.
    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            initial_delay: Duration::ZERO,
            factor: 1.0,
            max_delay: Duration::ZERO,
        }
    }

    /// Delay before attempt number `attempt` (the first retry is attempt 1).
    pub fn delay_before(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }
        let scale = self.factor.powi(attempt.saturating_sub(1) as i32);
        let secs = self.initial_delay.as_secs_f64() * scale;
        if secs.is_finite() && secs < self.max_delay.as_secs_f64() {
            Duration::from_secs_f64(secs)
        } else {
            self.max_delay
        }
    }

    /// Call `operation` until it succeeds, fails with a non-transient error, or
    /// attempts run out. `operation` receives the attempt number, starting at 0.
    pub fn run<T, E, F>(&self, operation_name: &str, mut operation: F) -> Result<T, E>
    where
        F: FnMut(u32) -> Result<T, E>,
        E: Retryable + std::fmt::Display,
    {
        let mut attempt = 0;
        loop {
            std::thread::sleep(self.delay_before(attempt));
            match operation(attempt) {
                Ok(value) => {
                    if attempt > 0 {
                        tracing::info!(operation = operation_name, attempt, "succeeded after retry");
                    }
                    return Ok(value);
                }
                Err(e) if !e.is_transient() => return Err(e),
                Err(e) => {
                    attempt += 1;
                    if attempt >= self.max_attempts {
                        tracing::error!(
                            operation = operation_name,
                            attempt,
                            error = e.to_string(),
                            "giving up"
                        );
                        return Err(e);
                    }
                    tracing::warn!(
                        operation = operation_name,
                        attempt,
                        error = e.to_string(),
                        "transient failure, will retry"
                    );
                }
            }
        }
    }
}

fn default_max_attempts() -> u32 {
    5
}

fn default_initial_delay() -> Duration {
    Duration::from_secs(1)
}

fn default_factor() -> f64 {
    2.0
}

fn default_max_delay() -> Duration {
    Duration::from_secs(60)
}

use crate::config::TransferConfig;
use crate::error::{BackupError, Result};
use std::time::Duration;

/// Bounded retry with exponential backoff for remote calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first. Zero is treated as one.
    pub attempts: u32,
    /// Delay before the second attempt; doubled for each later one.
    pub backoff: Duration,
}

impl RetryPolicy {
    pub fn new(attempts: u32, backoff: Duration) -> Self {
        Self { attempts, backoff }
    }

    pub fn from_config(cfg: &TransferConfig) -> Self {
        Self::new(cfg.attempts, Duration::from_secs(cfg.backoff_secs))
    }

    /// Delay after failed attempt number `attempt` (1-indexed).
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let factor = 1u32 << attempt.saturating_sub(1).min(16);
        self.backoff.saturating_mul(factor)
    }

    /// Run `op` until it succeeds, fails with a non-transient error, or the
    /// attempt budget runs out. Exhaustion is reported as
    /// [`BackupError::Transfer`] with the last failure as the reason.
    pub fn run<T>(&self, label: &str, mut op: impl FnMut() -> Result<T>) -> Result<T> {
        let attempts = self.attempts.max(1);
        let mut attempt = 1;
        loop {
            match op() {
                Ok(value) => return Ok(value),
                Err(e) if !e.is_transient() => return Err(e),
                Err(e) if attempt >= attempts => {
                    return Err(BackupError::Transfer {
                        attempts,
                        reason: format!("{label}: {e}"),
                    });
                }
                Err(e) => {
                    let delay = self.delay_after(attempt);
                    tracing::warn!(
                        %label,
                        attempt,
                        of = attempts,
                        retry_in_ms = delay.as_millis() as u64,
                        error = %e,
                        "remote call failed, retrying"
                    );
                    std::thread::sleep(delay);
                    attempt += 1;
                }
            }
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&TransferConfig::default())
    }
}

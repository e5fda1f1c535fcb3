//! Retry executor with exponential backoff and jitter.
//!
//! [`RetryPolicy::execute`] runs a fallible operation up to `max_attempts` times. Between attempts
//! it sleeps for `min(initial_backoff * 2^(attempt - 1), max_backoff)` plus a uniformly random
//! jitter in `[0, backoff / 2)`. Sleeps block the calling thread and cannot be cancelled.

use std::{fmt::Display, thread, time::Duration};

use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::error::{BoxError, QuoteStoreError, Result};

const DEFAULT_MAX_ATTEMPTS: u32 = 5;
const DEFAULT_INITIAL_BACKOFF_MS: u64 = 500;
const DEFAULT_MAX_BACKOFF_MS: u64 = 5_000;

fn default_max_attempts() -> u32 {
    DEFAULT_MAX_ATTEMPTS
}

fn default_initial_backoff() -> Duration {
    Duration::from_millis(DEFAULT_INITIAL_BACKOFF_MS)
}

fn default_max_backoff() -> Duration {
    Duration::from_millis(DEFAULT_MAX_BACKOFF_MS)
}

/// Retry policy: attempt budget and backoff bounds.
///
/// The default (5 attempts, 500ms initial, 5s max) is the policy used for opening the store and
/// creating namespaces. Durations are (de)serialized as whole milliseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(
        rename = "initial_backoff_ms",
        default = "default_initial_backoff",
        with = "duration_ms"
    )]
    pub initial_backoff: Duration,
    #[serde(
        rename = "max_backoff_ms",
        default = "default_max_backoff",
        with = "duration_ms"
    )]
    pub max_backoff: Duration,
}

impl RetryPolicy {
    /// Creates a policy. `max_attempts` is clamped to at least one.
    pub fn new(max_attempts: u32, initial_backoff: Duration, max_backoff: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            initial_backoff,
            max_backoff,
        }
    }

    /// Policy used for the network fetch: 3 attempts, 50ms initial, 2s max.
    pub fn network() -> Self {
        Self::new(3, Duration::from_millis(50), Duration::from_secs(2))
    }

    /// Rejects a policy that would never attempt the operation.
    pub fn validate(&self) -> Result<()> {
        if self.max_attempts == 0 {
            return Err(QuoteStoreError::InvalidRetryPolicy(
                "max_attempts must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    /// Backoff before the attempt following `attempt` (1-based), without jitter.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u32
            .checked_shl(attempt.saturating_sub(1))
            .unwrap_or(u32::MAX);
        self.initial_backoff
            .saturating_mul(factor)
            .min(self.max_backoff)
    }

    /// Backoff plus jitter drawn uniformly from `[0, backoff / 2)`.
    pub fn delay(&self, attempt: u32) -> Duration {
        let backoff = self.backoff(attempt);
        let spread = u64::try_from((backoff / 2).as_nanos()).unwrap_or(u64::MAX);
        if spread == 0 {
            return backoff;
        }
        let jitter = rand::thread_rng().gen_range(0..spread);
        backoff.saturating_add(Duration::from_nanos(jitter))
    }

    /// Runs `operation` until it succeeds or the attempt budget is spent.
    ///
    /// `operation` receives the attempt number, starting at 1, and is re-invoked in full on every
    /// attempt. `on_failure` is called with every error for reporting only. Once all attempts
    /// have failed, the last error is returned wrapped in
    /// [`QuoteStoreError::RetriesExhausted`].
    pub fn execute<T, E, F, H>(&self, label: &str, mut operation: F, mut on_failure: H) -> Result<T>
    where
        F: FnMut(u32) -> std::result::Result<T, E>,
        E: Display + Into<BoxError>,
        H: FnMut(&E, &str),
    {
        let max_attempts = self.max_attempts.max(1);
        let mut attempt = 1;
        loop {
            debug!(label, attempt, max_attempts, "Attempting operation");
            match operation(attempt) {
                Ok(value) => {
                    if attempt > 1 {
                        info!("'{}' succeeded on attempt {}/{}", label, attempt, max_attempts);
                    } else {
                        debug!(label, "Operation succeeded on first attempt");
                    }
                    return Ok(value);
                }
                Err(err) => {
                    let message =
                        format!("Attempt {attempt}/{max_attempts} of '{label}' failed");
                    on_failure(&err, &message);

                    if attempt >= max_attempts {
                        error!(
                            "'{}' exhausted {} attempts, giving up: {}",
                            label, max_attempts, err
                        );
                        return Err(QuoteStoreError::RetriesExhausted {
                            label: label.to_string(),
                            attempts: attempt,
                            source: err.into(),
                        });
                    }

                    let delay = self.delay(attempt);
                    debug!(
                        label,
                        next_attempt = attempt + 1,
                        delay_ms = delay.as_millis() as u64,
                        "Backing off before retry"
                    );
                    thread::sleep(delay);
                    attempt += 1;
                }
            }
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(
            DEFAULT_MAX_ATTEMPTS,
            default_initial_backoff(),
            default_max_backoff(),
        )
    }
}

/// Positional form of [`RetryPolicy::execute`]. Rejects `max_attempts == 0`.
pub fn execute_with_retries<T, E, F, H>(
    operation: F,
    on_failure: H,
    max_attempts: u32,
    initial_backoff: Duration,
    max_backoff: Duration,
    label: &str,
) -> Result<T>
where
    F: FnMut(u32) -> std::result::Result<T, E>,
    E: Display + Into<BoxError>,
    H: FnMut(&E, &str),
{
    if max_attempts == 0 {
        return Err(QuoteStoreError::InvalidRetryPolicy(format!(
            "max_attempts must be at least 1 for '{label}'"
        )));
    }
    RetryPolicy::new(max_attempts, initial_backoff, max_backoff).execute(
        label,
        operation,
        on_failure,
    )
}

/// Default failure reporter: logs the error at `warn`.
pub fn log_failure<E: Display>(err: &E, message: &str) {
    warn!("{}: {}", message, err);
}

// Durations as integer milliseconds in config files.
pub(crate) mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(u64::try_from(duration.as_millis()).unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}

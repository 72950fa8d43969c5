//! # Retry Counter
//!
//! Bounds the number of attempts made by a connect or send operation and
//! computes the reconnect backoff from shared [`FailoverSettings`].
//!
//! Two counters are kept: the per-call attempt count, reset at the start of
//! every operation, and the cumulative attempt count which never resets and
//! drives failover host rotation.

use crate::settings::FailoverSettings;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Attempt counter with exponential backoff and failover host selection
///
/// # Examples
///
/// ```rust
/// use mq_relay::{FailoverSettings, RetryCounter};
/// use std::sync::Arc;
///
/// let settings = FailoverSettings::with_broker_uris(["tcp://a:61616", "tcp://b:61616"]);
/// let counter = RetryCounter::new(Arc::new(settings));
///
/// assert_eq!(counter.next_failover_host(), Some("tcp://a:61616"));
/// ```
#[derive(Debug)]
pub struct RetryCounter {
    settings: Arc<FailoverSettings>,
    attempts: AtomicU32,
    total_attempts: AtomicU32,
    last_delay: Mutex<Duration>,
}

impl RetryCounter {
    pub fn new(settings: Arc<FailoverSettings>) -> Self {
        Self {
            settings,
            attempts: AtomicU32::new(0),
            total_attempts: AtomicU32::new(0),
            last_delay: Mutex::new(Duration::ZERO),
        }
    }

    pub fn settings(&self) -> &FailoverSettings {
        &self.settings
    }

    /// Start a new operation: zero the per-call count and the backoff.
    ///
    /// The cumulative count is kept.
    pub fn reset(&self) {
        self.attempts.store(0, Ordering::SeqCst);
        *self.lock_delay() = Duration::ZERO;
    }

    /// Retries made by the current operation
    pub fn attempts(&self) -> u32 {
        self.attempts.load(Ordering::SeqCst)
    }

    /// Retries made over the lifetime of this counter
    pub fn total_attempts(&self) -> u32 {
        self.total_attempts.load(Ordering::SeqCst)
    }

    /// Delay used by the most recent retry
    pub fn last_delay(&self) -> Duration {
        *self.lock_delay()
    }

    /// Record a failed attempt and wait before the next one.
    ///
    /// Returns `false` once the per-call count reaches the configured maximum;
    /// the caller must then abandon the operation. Otherwise sleeps for the
    /// backoff delay and returns `true`.
    pub async fn retry(&self) -> bool {
        let attempts = self.attempts.fetch_add(1, Ordering::SeqCst) + 1;
        self.total_attempts.fetch_add(1, Ordering::SeqCst);

        if attempts >= self.settings.max_reconnect_attempts {
            return false;
        }

        let delay = self.next_delay();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        true
    }

    /// Compute and remember the next backoff delay.
    ///
    /// The first delay after a reset is the configured baseline; with
    /// exponential backoff each later delay is
    /// `min(previous * multiplier, max_reconnect_delay)`. A product that is
    /// not a representable duration saturates at `max_reconnect_delay`.
    pub fn next_delay(&self) -> Duration {
        let settings = &self.settings;
        let mut last = self.lock_delay();

        let next = if last.is_zero() || !settings.use_exponential_back_off {
            settings.initial_reconnect_delay
        } else {
            Duration::try_from_secs_f64(last.as_secs_f64() * settings.back_off_multiplier)
                .unwrap_or(settings.max_reconnect_delay)
        };

        *last = next.min(settings.max_reconnect_delay);
        *last
    }

    /// Broker host for the next connection attempt.
    ///
    /// Index is the cumulative attempt count modulo the number of broker
    /// hosts, so rotation continues across operations. `None` when no
    /// failover hosts are configured.
    pub fn next_failover_host(&self) -> Option<&str> {
        let uris = &self.settings.broker_uris;
        if uris.is_empty() {
            return None;
        }

        let index = self.total_attempts() as usize % uris.len();
        Some(uris[index].as_str())
    }

    fn lock_delay(&self) -> std::sync::MutexGuard<'_, Duration> {
        // A poisoned delay is still a valid duration
        self.last_delay
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[cfg(test)]
#[path = "retry_tests.rs"]
mod tests;

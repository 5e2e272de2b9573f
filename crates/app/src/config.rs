//! Engine configuration

use std::time::Duration;

use jiff::SignedDuration;
use passbook::bookings::CancellationDelays;

use crate::retry::RetryPolicy;

/// Tunables passed to every service at construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EngineConfig {
    /// Longest wait for a single row lock before the attempt is abandoned.
    pub lock_timeout: Duration,

    /// Backoff for transactions that time out on a lock.
    pub retry: RetryPolicy,

    /// Beneficiary cancellation window.
    pub cancellation: CancellationDelays,

    /// How long after an event confirmed bookings are marked used.
    pub auto_use_delay: SignedDuration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            lock_timeout: Duration::from_secs(2),
            retry: RetryPolicy::default(),
            cancellation: CancellationDelays::default(),
            auto_use_delay: SignedDuration::from_hours(48),
        }
    }
}

//! Engine Config

use std::time::Duration;

use clap::Args;
use jiff::SignedDuration;
use passbook::bookings::CancellationDelays;
use passbook_app::{config::EngineConfig, retry::RetryPolicy};

/// Engine tunables, in the units an operator types.
#[derive(Debug, Args)]
pub struct EngineArgs {
    /// Longest wait for a single row lock, in milliseconds
    #[arg(long, env = "PASSBOOK_LOCK_TIMEOUT_MS", default_value_t = 2_000_u64)]
    pub lock_timeout_ms: u64,

    /// Attempts per transaction, the first one included
    #[arg(long, env = "PASSBOOK_RETRY_MAX_ATTEMPTS", default_value_t = 3_u32)]
    pub retry_max_attempts: u32,

    /// Delay before the first retry, in milliseconds
    #[arg(long, env = "PASSBOOK_RETRY_BASE_DELAY_MS", default_value_t = 10_u64)]
    pub retry_base_delay_ms: u64,

    /// Upper bound of a retry delay, in milliseconds
    #[arg(long, env = "PASSBOOK_RETRY_MAX_DELAY_MS", default_value_t = 200_u64)]
    pub retry_max_delay_ms: u64,

    /// Retry jitter as a percentage of the delay
    #[arg(
        long,
        env = "PASSBOOK_RETRY_JITTER_PCT",
        default_value_t = 20_u32,
        value_parser = clap::value_parser!(u32).range(0..=100)
    )]
    pub retry_jitter_pct: u32,

    /// Hours before an event when beneficiary cancellation closes
    #[arg(long, env = "PASSBOOK_CANCEL_BEFORE_EVENT_HOURS", default_value_t = 48_u32)]
    pub cancel_before_event_hours: u32,

    /// Hours after booking during which beneficiary cancellation stays open
    #[arg(long, env = "PASSBOOK_CANCEL_AFTER_BOOKING_HOURS", default_value_t = 48_u32)]
    pub cancel_after_booking_hours: u32,

    /// Hours after an event when confirmed bookings are marked used
    #[arg(long, env = "PASSBOOK_AUTO_USE_DELAY_HOURS", default_value_t = 48_u32)]
    pub auto_use_delay_hours: u32,
}

impl EngineArgs {
    /// Configuration handed to the services.
    #[must_use]
    pub fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            lock_timeout: Duration::from_millis(self.lock_timeout_ms),
            retry: RetryPolicy::new(
                self.retry_max_attempts,
                Duration::from_millis(self.retry_base_delay_ms),
                Duration::from_millis(self.retry_max_delay_ms),
                self.retry_jitter_pct,
            ),
            cancellation: CancellationDelays {
                before_event: hours(self.cancel_before_event_hours),
                after_booking: hours(self.cancel_after_booking_hours),
            },
            auto_use_delay: hours(self.auto_use_delay_hours),
        }
    }
}

fn hours(hours: u32) -> SignedDuration {
    SignedDuration::from_hours(i64::from(hours))
}

//! Retry and pacing helpers.

pub mod eventually;
pub mod ratchet;

use std::time::Duration;
use tokio::time::Instant;

pub use eventually::{Eventually, PollError, TIMEOUT_CEILING};
pub use ratchet::{new_schedule, Ratchet, Schedule};

/// Cap on any single deadline offset (about thirty years).
pub const FAR_FUTURE: Duration = Duration::from_secs(86_400 * 365 * 30);

/// `now + after`, capped at [`FAR_FUTURE`] so it never overflows.
pub fn deadline(now: Instant, after: Duration) -> Instant {
    now.checked_add(after.min(FAR_FUTURE)).unwrap_or(now)
}

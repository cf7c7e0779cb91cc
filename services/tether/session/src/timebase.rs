//! Coarse monotonic timebase.
//!
//! Every session deadline (retry window, idle timeout, expiry) is measured
//! in whole seconds from a process-local monotonic epoch, so wall-clock
//! jumps never shorten or extend a session.

use std::time::{Duration, Instant};

use once_cell::sync::Lazy;

static EPOCH: Lazy<Instant> = Lazy::new(Instant::now);

/// Monotonic now, in whole seconds
pub fn now_secs() -> u64 {
    EPOCH.elapsed().as_secs()
}

/// Sleep for a whole number of seconds
pub async fn sleep_secs(secs: u64) {
    tokio::time::sleep(Duration::from_secs(secs)).await;
}

//! Lightweight metrics helpers.

use chrono::NaiveDateTime;
use std::time::Duration;

/// Base of the bundle window containing `block_num`.
pub fn window_base(block_num: u64, bundle_size: u64) -> u64 {
    if bundle_size == 0 {
        return block_num;
    }
    block_num - block_num % bundle_size
}

/// Seconds between a block's production time and `now`, clamped at zero.
pub fn drift_seconds(block_time: NaiveDateTime, now: NaiveDateTime) -> i64 {
    now.signed_duration_since(block_time).num_seconds().max(0)
}

#[allow(dead_code)]
pub fn rate_per_sec(count: u64, elapsed: Duration) -> Option<f64> {
    let secs = elapsed.as_secs_f64();
    if secs > 0.0 {
        Some(count as f64 / secs)
    } else {
        None
    }
}

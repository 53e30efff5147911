//! Chain epoch arithmetic.

use chrono::{DateTime, Utc};

/// Unix timestamp of epoch zero on mainnet.
pub const GENESIS_TIMESTAMP: i64 = 1_598_306_400;
pub const EPOCH_DURATION_SECONDS: i64 = 30;
pub const EPOCHS_PER_DAY: i64 = 24 * 60 * 60 / EPOCH_DURATION_SECONDS;

pub fn height_at(timestamp: i64) -> i64 {
    (timestamp - GENESIS_TIMESTAMP) / EPOCH_DURATION_SECONDS
}

pub fn height_at_time(time: DateTime<Utc>) -> i64 {
    height_at(time.timestamp())
}

pub fn current_height() -> i64 {
    height_at_time(Utc::now())
}

/// First epoch a deal may start in when proposed `offset_days` ahead.
pub fn start_epoch(current_height: i64, offset_days: i64) -> i64 {
    current_height + offset_days * EPOCHS_PER_DAY
}

use std::time::{Duration, SystemTime};

pub fn get_epoch_time_in_ms() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Epoch milliseconds `timeout` from now.
pub fn deadline_after(timeout: Duration) -> u64 {
    get_epoch_time_in_ms() + timeout.as_millis() as u64
}

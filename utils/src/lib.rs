use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Get the elapsed system time since the Unix Epoch in Milliseconds
pub fn get_epoch_time_in_ms() -> u64 {
    get_epoch_time().as_millis() as u64
}

fn get_epoch_time() -> Duration {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
}

/// Seconds elapsed since `at_ms` (epoch milliseconds). Timestamps in the
/// future yield 0.
pub fn get_elapsed_secs(at_ms: u64) -> f64 {
    let now = get_epoch_time_in_ms();
    if now < at_ms {
        return 0.0;
    }
    (now - at_ms) as f64 / 1000.0
}

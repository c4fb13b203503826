pub mod defer;

use std::time::{SystemTime, UNIX_EPOCH};

/// Milliseconds since the Unix epoch.
pub type Timestamp = u64;

/// Converts a [`SystemTime`] into a [`Timestamp`], saturating for times before the epoch.
pub fn unix_millis(time: SystemTime) -> Timestamp {
    time.duration_since(UNIX_EPOCH)
        .map(|d| Timestamp::try_from(d.as_millis()).unwrap_or(Timestamp::MAX))
        .unwrap_or_default()
}

/// The current wall clock time as a [`Timestamp`].
pub fn now_millis() -> Timestamp {
    unix_millis(SystemTime::now())
}

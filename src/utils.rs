/// Utility functions for time handling and formatting
use time::macros::format_description;
use time::{Duration, OffsetDateTime};

/// Format a timestamp for human-readable logging
///
/// Converts an OffsetDateTime to DD.MM.YYYY - HH:MM:SS format
/// Falls back to default string representation if formatting fails.
pub fn format_datetime(dt: &OffsetDateTime) -> String {
    let format = format_description!("[day].[month].[year] - [hour]:[minute]:[second]");
    dt.format(&format).unwrap_or_else(|_| dt.to_string())
}

/// Convert a time::Duration to whole seconds, clamping negatives to zero
pub fn duration_to_seconds(duration: Duration) -> u64 {
    duration.whole_seconds().max(0) as u64
}

/// Convert a time::Duration into a std::time::Duration for tokio timers
pub fn to_std(duration: Duration) -> std::time::Duration {
    std::time::Duration::from_secs(duration_to_seconds(duration))
}

/// Current wall-clock time truncated to whole seconds
pub fn now_utc_secs() -> OffsetDateTime {
    let now = OffsetDateTime::now_utc();
    now.replace_nanosecond(0).unwrap_or(now)
}

/// Unix seconds of `t`, rounded up to the next whole second
///
/// Stored samples sit on whole seconds, so this is the first storable
/// time at or after `t`.
pub fn ceil_unix_seconds(t: OffsetDateTime) -> i64 {
    let secs = t.unix_timestamp();
    if t.nanosecond() > 0 {
        secs + 1
    } else {
        secs
    }
}

/// Treat the Unix epoch as an unconstrained bound
pub fn bound(t: Option<OffsetDateTime>) -> Option<OffsetDateTime> {
    t.filter(|t| *t != OffsetDateTime::UNIX_EPOCH)
}

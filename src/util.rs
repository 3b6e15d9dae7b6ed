//! Small helpers shared across the crate.

/// Current wall-clock time as milliseconds since the Unix epoch.
///
/// Envelope timestamps and TTL arithmetic all use this clock.
pub fn now_millis() -> u64 {
    let ms = chrono::Utc::now().timestamp_millis();
    u64::try_from(ms).unwrap_or(0)
}

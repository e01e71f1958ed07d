//! Wall-clock helpers.
//!
//! Epoch timestamps are used for wire payloads and log correlation;
//! elapsed-time checks inside the engine use `tokio::time::Instant`.

use std::time::{SystemTime, UNIX_EPOCH};

use chrono::{DateTime, Utc};

/// Current time as **milliseconds** since Unix epoch.
#[inline]
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

/// Current time as **microseconds** since Unix epoch.
#[inline]
pub fn now_us() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_micros() as u64)
        .unwrap_or_default()
}

/// Current UTC time for persisted records.
#[inline]
pub fn utc_now() -> DateTime<Utc> {
    Utc::now()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ms_and_us_agree() {
        let ms = now_ms();
        let us = now_us();
        assert!(us / 1_000 >= ms);
        assert!(us / 1_000 - ms < 1_000);
    }
}

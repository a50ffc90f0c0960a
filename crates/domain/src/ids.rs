//! Identifier generation matching the documented wire formats:
//! `err_YYYYMMDD_HHMMSS_xxxxxx`, `msg-<nanoseconds>`, and a generic
//! timestamp+hex-tail scheme for sessions and queue messages when the
//! caller doesn't supply its own id.

use chrono::Utc;
use rand::distributions::Alphanumeric;
use rand::Rng;

fn hex_tail(len: usize) -> String {
    let mut rng = rand::thread_rng();
    (0..len)
        .map(|_| {
            let n: u8 = rng.sample(Alphanumeric) as u8;
            // Re-map alphanumeric bytes onto hex digits so the tail always
            // looks like the documented `xxxxxx` hex suffix.
            let hex_digits = b"0123456789abcdef";
            hex_digits[(n as usize) % 16] as char
        })
        .collect()
}

/// `msg-<nanoseconds since epoch>`, used for queue message ids.
pub fn generate_message_id() -> String {
    format!("msg-{}", Utc::now().timestamp_nanos_opt().unwrap_or(0))
}

/// `err_YYYYMMDD_HHMMSS_xxxxxx`, used for tool-error log entries.
pub fn generate_error_id() -> String {
    let now = Utc::now();
    format!("err_{}_{}", now.format("%Y%m%d_%H%M%S"), hex_tail(6))
}

/// Generic `<prefix>_<timestamp>_<6-hex-char-tail>` id for sessions and
/// other caller-creatable entities that don't supply their own id.
pub fn generate_id(prefix: &str) -> String {
    let now = Utc::now();
    format!("{prefix}_{}_{}", now.timestamp_millis(), hex_tail(6))
}

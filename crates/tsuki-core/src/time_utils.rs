use chrono::{Local, SecondsFormat};

const LOG_TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Returns the current Unix timestamp in milliseconds.
pub fn current_unix_timestamp_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis()
        .try_into()
        .unwrap_or(u64::MAX)
}

/// Local wall-clock time as `YYYY-MM-DD HH:MM:SS`, the log line prefix format.
pub fn local_log_timestamp() -> String {
    Local::now().format(LOG_TIMESTAMP_FORMAT).to_string()
}

/// Local wall-clock time as RFC 3339 with second precision.
pub fn local_rfc3339_timestamp() -> String {
    Local::now().to_rfc3339_opts(SecondsFormat::Secs, false)
}

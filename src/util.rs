//! Small helpers shared across the codebase.

use chrono::{TimeZone, Utc};

/// Current wall-clock time as epoch milliseconds. Stored timestamps
/// (`updatedAt`, lock `startedAt`) all use this unit.
pub fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

/// Generate a fresh session id.
pub fn new_session_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// Render an epoch-millisecond timestamp as RFC 3339, for log lines and the
/// `sessions list` output. Out-of-range values fall back to the raw number.
pub fn format_ms(ms: i64) -> String {
    match Utc.timestamp_millis_opt(ms) {
        chrono::LocalResult::Single(dt) => dt.to_rfc3339(),
        _ => ms.to_string(),
    }
}

/// Truncate a string to at most `max_chars` characters, appending "..." if
/// truncated. Safe on multi-byte UTF-8 (uses character boundaries, not bytes).
pub fn truncate_with_ellipsis(s: &str, max_chars: usize) -> String {
    match s.char_indices().nth(max_chars) {
        Some((idx, _)) => {
            let truncated = &s[..idx];
            format!("{}...", truncated.trim_end())
        }
        None => s.to_string(),
    }
}

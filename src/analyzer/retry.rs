// Backoff hints buried in provider error text.
//
// Anthropic sends `retry-after`, Gemini sends a `retryDelay` inside the
// error details, and both sometimes just say "N seconds" in prose. The
// patterns are tried in order and the first hit wins.

use std::sync::LazyLock;
use std::time::Duration;

use regex::Regex;

pub const DEFAULT_RETRY_SECS: u64 = 30;
pub const MIN_RETRY_SECS: u64 = 5;
pub const MAX_RETRY_SECS: u64 = 60;
/// Added on top of whatever the provider asks for.
const SLACK_SECS: u64 = 2;

static RETRY_PATTERNS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    [
        r#"(?i)retry.?after['"]?\s*[:=]\s*['"]?(\d+(?:\.\d+)?)"#,
        r#"(?i)(\d+(?:\.\d+)?)\s*second"#,
        r#"(?i)retryDelay['"]?\s*[:=]\s*['"]?(\d+(?:\.\d+)?)"#,
    ]
    .iter()
    .filter_map(|p| Regex::new(p).ok())
    .collect()
});

/// How long to sleep before retrying a rate-limited call.
pub fn parse_retry_delay(message: &str) -> Duration {
    let secs = RETRY_PATTERNS
        .iter()
        .find_map(|re| {
            re.captures(message)
                .and_then(|c| c.get(1))
                .and_then(|m| m.as_str().parse::<f64>().ok())
        })
        .map(|delay| (delay as u64 + SLACK_SECS).clamp(MIN_RETRY_SECS, MAX_RETRY_SECS))
        .unwrap_or(DEFAULT_RETRY_SECS);
    Duration::from_secs(secs)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gemini_retry_delay() {
        let body = r#"{"error": {"code": 429, "status": "RESOURCE_EXHAUSTED", "details": [{"retryDelay": "23s"}]}}"#;
        assert_eq!(parse_retry_delay(body), Duration::from_secs(25));
    }

    #[test]
    fn test_retry_after_header_style() {
        assert_eq!(parse_retry_delay("retry-after: 10"), Duration::from_secs(12));
        assert_eq!(parse_retry_delay("Retry_After='1.5'"), Duration::from_secs(5));
    }

    #[test]
    fn test_prose_seconds_are_clamped() {
        assert_eq!(parse_retry_delay("please wait 300 seconds"), Duration::from_secs(60));
        assert_eq!(parse_retry_delay("try again in 1 second"), Duration::from_secs(5));
    }

    #[test]
    fn test_unrecognised_message_defaults_to_thirty() {
        assert_eq!(parse_retry_delay("rate_limit_error: slow down"), Duration::from_secs(30));
        assert_eq!(parse_retry_delay(""), Duration::from_secs(30));
    }
}

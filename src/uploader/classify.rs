/// Error-text fragments that mark a failure as transient. Anything not
/// matching is permanent and goes straight to the dead-letter log.
const TRANSIENT_PATTERNS: &[&str] = &[
    "timeout",
    "timed out",
    "deadline exceeded",
    "connection reset",
    "econnreset",
    "connection closed",
    "broken pipe",
    "dns",
    "name resolution",
    "eai_again",
    "socket hang up",
    "rate limit",
    "retryable",
    "too many requests",
    "429",
    "500",
    "502",
    "503",
    "service unavailable",
    "internal server error",
    "bad gateway",
];

pub fn is_transient(error_text: &str) -> bool {
    let lowered = error_text.to_lowercase();
    TRANSIENT_PATTERNS.iter().any(|p| lowered.contains(p))
}

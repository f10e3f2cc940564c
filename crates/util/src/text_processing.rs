//! # Text Processing Utilities
//!
//! Redaction of secret-looking values before log text leaves the process.

use once_cell::sync::Lazy;
use regex::Regex;

/// Redacts values that look like secrets in a string.
///
/// Key names are preserved so the redacted line is still useful for
/// debugging.
///
/// # Example
/// ```rust
/// use polystep_util::redact_sensitive;
///
/// let redacted = redact_sensitive("API_KEY=abc123 TOKEN=xyz789");
/// assert_eq!(redacted, "API_KEY=[REDACTED] TOKEN=[REDACTED]");
///
/// let redacted = redact_sensitive("Authorization: Bearer secret123");
/// assert_eq!(redacted, "Authorization: [REDACTED]");
/// ```
pub fn redact_sensitive(input: &str) -> String {
    redact_sensitive_with(input, "[REDACTED]")
}

/// Redacts sensitive-looking values, using a custom replacement token.
pub fn redact_sensitive_with(input: &str, replacement: &str) -> String {
    let mut redacted = input.to_string();

    for pattern in REDACT_PATTERNS.iter() {
        redacted = pattern
            .replace_all(&redacted, |captures: &regex::Captures| {
                let prefix = captures.get(1).map(|m| m.as_str()).unwrap_or("");
                format!("{prefix}{replacement}")
            })
            .to_string();
    }

    redacted
}

/// Compiled patterns, most specific first. Group 1 is the preserved prefix.
static REDACT_PATTERNS: Lazy<Vec<Regex>> = Lazy::new(|| {
    [
        r"(?i)(authorization:\s*)(?:bearer\s+|basic\s+)?[\w\-\.=:/+]+",
        r"(?i)(\b[A-Z0-9_]*(?:KEY|TOKEN|SECRET|PASSWORD)\s*[=:]\s*)[^\s,]+",
        r"(?i)(\bDATABASE_URL\s*=\s*)[^\s]+",
        r"(?i)(\b(?:api[_-]?key|token|secret|password)\s*:\s*)[^\s,]+",
    ]
    .iter()
    .filter_map(|pattern| Regex::new(pattern).ok())
    .collect()
});

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn redacts_env_style_assignments() {
        assert_eq!(
            redact_sensitive("STRIPE_SECRET=sk_live_123 region=us"),
            "STRIPE_SECRET=[REDACTED] region=us"
        );
        assert_eq!(redact_sensitive("DATABASE_URL=postgres://u:p@h/db"), "DATABASE_URL=[REDACTED]");
    }

    #[test]
    fn redacts_inline_keys_with_custom_token() {
        assert_eq!(redact_sensitive_with("API key: abc123def456", "***"), "API key: ***");
    }

    #[test]
    fn leaves_plain_text_alone() {
        let text = "order o1 placed for pet 7";
        assert_eq!(redact_sensitive(text), text);
    }
}

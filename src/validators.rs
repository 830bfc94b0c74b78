//! Input validation and sanitization functions for SBS
//!
//! Everything that reaches nft arguments or nft element comments passes
//! through here first.

use crate::core::error::Error;

/// Longest ticket accepted, in seconds.
pub const MAX_TICKET_DURATION_SECS: u64 = u32::MAX as u64;

/// Maximum comment length stored with a ticket and pushed to nftables.
pub const MAX_COMMENT_LEN: usize = 64;

/// Sanitizes a ticket comment for safe use in nftables element comments.
///
/// Removes control characters, quotes, and shell metacharacters.
/// Limits length to 64 bytes (ASCII characters only).
///
/// # Examples
///
/// ```
/// use sbs::validators::sanitize_comment;
///
/// assert_eq!(sanitize_comment("guest laptop"), "guest laptop");
///
/// let safe = sanitize_comment("Test\nNewline\"Quote");
/// assert!(!safe.contains('\n'));
/// assert!(!safe.contains('"'));
/// ```
pub fn sanitize_comment(input: &str) -> String {
    input
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || matches!(c, ' ' | '-' | '_' | '.' | ':' | '@'))
        .take(MAX_COMMENT_LEN)
        .collect::<String>()
        .trim()
        .to_string()
}

/// Validates a requested ticket duration.
///
/// # Errors
///
/// Returns [`Error::InvalidDuration`] if the duration is not positive or
/// exceeds [`MAX_TICKET_DURATION_SECS`].
pub fn validate_duration(secs: i64) -> Result<u64, Error> {
    if secs <= 0 {
        return Err(Error::InvalidDuration(format!(
            "duration must be greater than 0 seconds (got {secs})"
        )));
    }

    let secs = secs as u64;
    if secs > MAX_TICKET_DURATION_SECS {
        return Err(Error::InvalidDuration(format!(
            "duration exceeds maximum of {MAX_TICKET_DURATION_SECS} seconds"
        )));
    }

    Ok(secs)
}

/// Validates a domain name from the remote allowlist.
///
/// Hostname rules:
/// - Total length at most 253 characters (a trailing dot is ignored)
/// - Labels 1-63 characters, ASCII alphanumeric or `-`
/// - Labels cannot start or end with `-`
/// - At least two labels
///
/// # Errors
///
/// Returns a description of the first rule violated.
pub fn validate_domain(name: &str) -> Result<String, String> {
    let name = name.strip_suffix('.').unwrap_or(name).to_ascii_lowercase();

    if name.is_empty() {
        return Err("Domain is empty".to_string());
    }

    if name.len() > 253 {
        return Err("Domain too long (max 253 characters)".to_string());
    }

    let labels: Vec<&str> = name.split('.').collect();
    if labels.len() < 2 {
        return Err("Domain must contain at least two labels".to_string());
    }

    for label in &labels {
        if label.is_empty() || label.len() > 63 {
            return Err("Domain label must be 1-63 characters".to_string());
        }
        if !label.chars().all(|c| c.is_ascii_alphanumeric() || c == '-') {
            return Err("Domain contains invalid characters".to_string());
        }
        if label.starts_with('-') || label.ends_with('-') {
            return Err("Domain label cannot start or end with '-'".to_string());
        }
    }

    Ok(name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sanitize_comment_keeps_plain_text() {
        assert_eq!(sanitize_comment("guest"), "guest");
        assert_eq!(sanitize_comment("room 12 - tv"), "room 12 - tv");
    }

    #[test]
    fn test_sanitize_comment_strips_quotes_and_control() {
        let out = sanitize_comment("a\"b'c\nd;e$f`g");
        assert_eq!(out, "abcdefg");
    }

    #[test]
    fn test_sanitize_comment_truncates() {
        let long = "x".repeat(200);
        assert_eq!(sanitize_comment(&long).len(), MAX_COMMENT_LEN);
    }

    #[test]
    fn test_validate_duration_bounds() {
        assert!(validate_duration(0).is_err());
        assert!(validate_duration(-5).is_err());
        assert_eq!(validate_duration(60).unwrap(), 60);
        assert!(validate_duration(i64::from(u32::MAX)).is_ok());
        assert!(validate_duration(i64::from(u32::MAX) + 1).is_err());
    }

    #[test]
    fn test_validate_duration_error_kind() {
        assert!(matches!(validate_duration(0), Err(Error::InvalidDuration(_))));
    }

    #[test]
    fn test_validate_domain_accepts_common_names() {
        assert_eq!(validate_domain("Example.COM").unwrap(), "example.com");
        assert_eq!(validate_domain("login.example.org.").unwrap(), "login.example.org");
        assert!(validate_domain("a-b.example.net").is_ok());
    }

    #[test]
    fn test_validate_domain_rejects_bad_names() {
        assert!(validate_domain("").is_err());
        assert!(validate_domain("localhost").is_err());
        assert!(validate_domain("bad..example.com").is_err());
        assert!(validate_domain("-bad.example.com").is_err());
        assert!(validate_domain("under_score.example.com").is_err());
        assert!(validate_domain(&format!("{}.com", "a".repeat(64))).is_err());
    }
}

#[cfg(test)]
mod property_tests {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        #[test]
        fn test_sanitize_comment_never_exceeds_limit(input in "\\PC*") {
            let sanitized = sanitize_comment(&input);
            prop_assert!(sanitized.len() <= MAX_COMMENT_LEN);
        }

        #[test]
        fn test_sanitize_comment_no_dangerous_chars(input in "\\PC*") {
            let sanitized = sanitize_comment(&input);
            prop_assert!(!sanitized.chars().any(char::is_control));
            prop_assert!(!sanitized.contains('"'));
            prop_assert!(!sanitized.contains('\''));
            prop_assert!(!sanitized.contains('$'));
            prop_assert!(!sanitized.contains(';'));
        }

        #[test]
        fn test_validate_duration_positive_range(secs in 1i64..=i64::from(u32::MAX)) {
            prop_assert_eq!(validate_duration(secs).unwrap(), secs as u64);
        }

        #[test]
        fn test_validate_domain_char_constraint(
            prefix in "[a-z0-9]{1,10}",
            invalid_char in "[^a-zA-Z0-9.-]"
        ) {
            let name = format!("{prefix}{invalid_char}.example.com");
            prop_assert!(validate_domain(&name).is_err());
        }
    }
}

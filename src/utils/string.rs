//! String utilities
//!
//! Helpers for safe truncation and credential redaction.

/// Safely truncate a string at a character boundary
pub fn truncate_str(s: &str, max_chars: usize) -> &str {
    match s.char_indices().nth(max_chars) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

/// Redact a credential for logs and snapshots.
///
/// Keeps a short head and tail so operators can tell tokens apart, never
/// the full value. Short tokens are fully masked.
pub fn mask_token(token: &str) -> String {
    let chars: Vec<char> = token.chars().collect();
    if chars.len() <= 12 {
        return "***".to_string();
    }
    let head: String = chars[..6].iter().collect();
    let tail: String = chars[chars.len() - 4..].iter().collect();
    format!("{}…{}", head, tail)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_truncate_str_ascii() {
        assert_eq!(truncate_str("hello world", 5), "hello");
        assert_eq!(truncate_str("hi", 5), "hi");
    }

    #[test]
    fn test_truncate_str_multibyte() {
        assert_eq!(truncate_str("héllo", 2), "hé");
    }

    #[test]
    fn test_mask_token_keeps_head_and_tail() {
        let masked = mask_token("sso-rw-0123456789abcdef");
        assert_eq!(masked, "sso-rw…cdef");
        assert!(!masked.contains("0123456789"));
    }

    #[test]
    fn test_mask_token_short_values_fully_hidden() {
        assert_eq!(mask_token("short"), "***");
        assert_eq!(mask_token(""), "***");
    }
}

//! Input validation helpers

/// Trim surrounding whitespace and cap the content at `max_chars` characters
/// (not bytes, so multi-byte text is never split mid-scalar).
pub fn trim_and_limit(input: &str, max_chars: usize) -> String {
    let trimmed = input.trim();
    if trimmed.chars().count() <= max_chars {
        return trimmed.to_string();
    }
    trimmed.chars().take(max_chars).collect()
}

/// Canonical handle form: trimmed, lowercased, leading `@` stripped.
pub fn normalize_handle(raw: &str) -> String {
    raw.trim().trim_start_matches('@').to_lowercase()
}

/// Public group handles: 3-32 chars, lowercase alphanumerics and underscores,
/// must start with a letter.
pub fn valid_group_handle(handle: &str) -> bool {
    let len = handle.chars().count();
    if !(3..=32).contains(&len) {
        return false;
    }
    let mut chars = handle.chars();
    match chars.next() {
        Some(c) if c.is_ascii_lowercase() => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trims_and_caps() {
        assert_eq!(trim_and_limit("  hi  ", 10), "hi");
        assert_eq!(trim_and_limit("abcdef", 3), "abc");
        // multi-byte safety
        assert_eq!(trim_and_limit("héllo", 2), "hé");
    }

    #[test]
    fn handle_normalisation() {
        assert_eq!(normalize_handle("  @Rustaceans "), "rustaceans");
        assert_eq!(normalize_handle("team_42"), "team_42");
        assert_eq!(normalize_handle("@"), "");
    }

    #[test]
    fn handle_rules() {
        assert!(valid_group_handle("rustaceans"));
        assert!(valid_group_handle("team_42"));
        assert!(!valid_group_handle("ab"));
        assert!(!valid_group_handle("1team"));
        assert!(!valid_group_handle("Team"));
        assert!(!valid_group_handle("has space"));
    }
}

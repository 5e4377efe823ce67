//! Email address extraction from container labels

/// Characters that may not appear unquoted in an address
const SPECIALS: &[char] = &['<', '>', '(', ')', '[', ']', ',', ';', ':', '\\', '"', '@'];

/// Parse a label value as an email address
///
/// Accepts `user@domain` and `Display Name <user@domain>`; returns the bare
/// address.
pub fn parse_address(value: &str) -> Option<String> {
    let value = value.trim();

    let candidate = match (value.rfind('<'), value.ends_with('>')) {
        (Some(start), true) => &value[start + 1..value.len() - 1],
        (None, false) => value,
        _ => return None,
    };

    let (local, domain) = candidate.trim().split_once('@')?;

    if !valid_local_part(local) || !valid_domain(domain) {
        return None;
    }

    Some(format!("{}@{}", local, domain))
}

fn valid_local_part(local: &str) -> bool {
    !local.is_empty()
        && !local.starts_with('.')
        && !local.ends_with('.')
        && !local.contains("..")
        && local
            .chars()
            .all(|c| c.is_ascii_graphic() && !SPECIALS.contains(&c))
}

fn valid_domain(domain: &str) -> bool {
    !domain.is_empty()
        && domain.split('.').all(|label| {
            !label.is_empty()
                && !label.starts_with('-')
                && !label.ends_with('-')
                && label.chars().all(|c| c.is_ascii_alphanumeric() || c == '-')
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plain_address() {
        assert_eq!(
            parse_address("alice@example.com").as_deref(),
            Some("alice@example.com")
        );
        assert_eq!(
            parse_address("  bob.smith+gpu@lab.example.org ").as_deref(),
            Some("bob.smith+gpu@lab.example.org")
        );
        assert_eq!(parse_address("root@localhost").as_deref(), Some("root@localhost"));
    }

    #[test]
    fn test_display_name_address() {
        assert_eq!(
            parse_address("Alice Liddell <alice@example.com>").as_deref(),
            Some("alice@example.com")
        );
    }

    #[test]
    fn test_rejects_non_addresses() {
        assert!(parse_address("").is_none());
        assert!(parse_address("alice").is_none());
        assert!(parse_address("alice@").is_none());
        assert!(parse_address("@example.com").is_none());
        assert!(parse_address("alice smith@example.com").is_none());
        assert!(parse_address("alice@exa mple.com").is_none());
        assert!(parse_address("alice@@example.com").is_none());
        assert!(parse_address("Alice <alice@example.com").is_none());
        assert!(parse_address("alice@example..com").is_none());
    }
}

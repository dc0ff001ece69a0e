//! Mailbox extraction, normalisation and validation.
//!
//! Extraction is deliberately forgiving (angle brackets, display
//! names, stray quotes) and preserves case. Normalisation lowercases
//! only the domain. Validation is stricter about the local part when
//! SMTPUTF8 was not negotiated: it must then be plain ASCII.

const MAX_LOCAL_LEN: usize = 64;
const MAX_DOMAIN_LEN: usize = 255;
const MAX_LABEL_LEN: usize = 63;

/// Pull the mailbox out of a MAIL/RCPT argument: strips a leading
/// `FROM:` / `TO:` (any case), then angle brackets or a display-name
/// wrapper. Returns `None` when no plausible mailbox is present.
pub fn extract_mailbox(arg: &str) -> Option<String> {
    let mut rest = arg.trim();
    if let Some(stripped) = strip_prefix_ignore_case(rest, "FROM:") {
        rest = stripped.trim_start();
    } else if let Some(stripped) = strip_prefix_ignore_case(rest, "TO:") {
        rest = stripped.trim_start();
    }

    // Angle-bracket form wins: "Display Name <user@host>" or "<user@host>".
    if let Some(open) = rest.find('<') {
        if let Some(close) = rest[open + 1..].find('>') {
            let inner = rest[open + 1..open + 1 + close].trim();
            if !inner.is_empty() {
                return Some(inner.to_string());
            }
            return None;
        }
    }

    // Otherwise take the first whitespace token containing an '@',
    // shedding the punctuation that tends to cling to addresses.
    for token in rest.split_whitespace() {
        let token = token.trim_matches(|c| matches!(c, '<' | '>' | ',' | '\'' | '"'));
        if token.contains('@') {
            return Some(token.to_string());
        }
    }

    // A bare local part ("MAIL FROM:admin") still extracts; validation
    // will reject it later.
    let bare = rest.trim_matches(|c| matches!(c, '<' | '>' | ',' | '\'' | '"'));
    if bare.is_empty() {
        None
    } else {
        Some(bare.to_string())
    }
}

/// Canonical form used for equality, storage and logging: local part
/// untouched, domain lowercased. Splits on the *last* `@` so quoted
/// local parts containing `@` survive. Returns `None` without a domain.
pub fn normalise(mailbox: &str) -> Option<String> {
    let mailbox = mailbox.trim();
    let at = mailbox.rfind('@')?;
    let (local, domain) = (&mailbox[..at], &mailbox[at + 1..]);
    if local.is_empty() || domain.is_empty() {
        return None;
    }
    Some(format!("{local}@{}", domain.to_lowercase()))
}

/// Validate a domain: dot-separated labels of 1..=63 letters or digits
/// (Unicode accepted, so IDN forms pass), hyphens only in the interior,
/// at most 255 bytes overall.
pub fn validate_domain(domain: &str) -> bool {
    if domain.is_empty() || domain.len() > MAX_DOMAIN_LEN {
        return false;
    }
    domain.split('.').all(valid_label)
}

fn valid_label(label: &str) -> bool {
    let chars: Vec<char> = label.chars().collect();
    if chars.is_empty() || chars.len() > MAX_LABEL_LEN {
        return false;
    }
    if chars[0] == '-' || chars[chars.len() - 1] == '-' {
        return false;
    }
    chars.iter().all(|&c| c.is_alphanumeric() || c == '-')
}

fn is_ascii_local_char(c: char) -> bool {
    c.is_ascii_alphanumeric()
        || matches!(
            c,
            '.' | '!'
                | '#'
                | '$'
                | '%'
                | '&'
                | '\''
                | '*'
                | '+'
                | '/'
                | '='
                | '?'
                | '^'
                | '_'
                | '`'
                | '{'
                | '|'
                | '}'
                | '~'
                | '-'
        )
}

fn valid_local_part(local: &str, allow_utf8: bool) -> bool {
    // Quoted local parts are accepted as-is.
    if local.len() >= 2 && local.starts_with('"') && local.ends_with('"') {
        return true;
    }
    if local.is_empty() || local.len() > MAX_LOCAL_LEN {
        return false;
    }
    if allow_utf8 {
        local
            .chars()
            .all(|c| c.is_alphanumeric() || is_ascii_local_char(c))
    } else {
        local.chars().all(is_ascii_local_char)
    }
}

/// Full mailbox validation. `allow_utf8_local` tracks whether the
/// session negotiated SMTPUTF8.
pub fn is_valid_mailbox(mailbox: &str, allow_utf8_local: bool) -> bool {
    let mailbox = mailbox.trim();
    let Some(at) = mailbox.rfind('@') else {
        return false;
    };
    let (local, domain) = (&mailbox[..at], &mailbox[at + 1..]);
    valid_local_part(local, allow_utf8_local) && validate_domain(domain)
}

fn strip_prefix_ignore_case<'a>(text: &'a str, prefix: &str) -> Option<&'a str> {
    if text.len() >= prefix.len() && text[..prefix.len()].eq_ignore_ascii_case(prefix) {
        Some(&text[prefix.len()..])
    } else {
        None
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn extracted(arg: &str) -> String {
        extract_mailbox(arg).unwrap_or_default()
    }

    #[test]
    fn extraction_forms() {
        assert_eq!(extracted("FROM:<user@example.com>"), "user@example.com");
        assert_eq!(extracted("from:<user@example.com>"), "user@example.com");
        assert_eq!(extracted("TO:<b@y>"), "b@y");
        assert_eq!(extracted("FROM:user@example.com"), "user@example.com");
        assert_eq!(
            extracted("TO:Jane Doe <jane@example.com>"),
            "jane@example.com"
        );
        assert_eq!(extracted("FROM:<>"), "");
        assert_eq!(extract_mailbox("FROM:"), None);
    }

    #[test]
    fn extraction_preserves_case() {
        assert_eq!(extracted("FROM:<MixedCase@Example.COM>"), "MixedCase@Example.COM");
    }

    #[test]
    fn normalisation_lowercases_domain_only() {
        assert_eq!(
            normalise("MixedCase@Example.COM").as_deref(),
            Some("MixedCase@example.com")
        );
        assert_eq!(
            normalise("\"odd@local\"@Example.COM").as_deref(),
            Some("\"odd@local\"@example.com")
        );
        assert_eq!(normalise("nodomain"), None);
        assert_eq!(normalise("@nolocal.example"), None);
    }

    #[test]
    fn domain_validation() {
        assert!(validate_domain("example.com"));
        assert!(validate_domain("a.b.c.d"));
        assert!(validate_domain("xn--idn.example"));
        assert!(validate_domain("例え.jp"));
        assert!(!validate_domain(""));
        assert!(!validate_domain("-leading.example"));
        assert!(!validate_domain("trailing-.example"));
        assert!(!validate_domain("double..dot"));
        assert!(!validate_domain(&"a".repeat(64)));
        assert!(validate_domain(&"a".repeat(63)));
    }

    #[test]
    fn local_part_ascii_versus_utf8() {
        assert!(is_valid_mailbox("user.name+tag@example.com", false));
        assert!(is_valid_mailbox("user!#$%&@example.com", false));
        assert!(!is_valid_mailbox("ünïcode@example.com", false));
        assert!(is_valid_mailbox("ünïcode@example.com", true));
        assert!(is_valid_mailbox("日本語@example.jp", true));
        assert!(is_valid_mailbox("\"quoted local\"@example.com", false));
        assert!(!is_valid_mailbox("no-at-sign", false));
        assert!(!is_valid_mailbox("@example.com", false));
        assert!(!is_valid_mailbox("user@", false));
        assert!(!is_valid_mailbox(&format!("{}@example.com", "x".repeat(65)), false));
    }
}

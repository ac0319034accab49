//! Email address parsing (RFC 5322 §3.4) and mailbox-name normalization.

use crate::error::{MailError, Result};

/// An address from a `From:` or `To:` header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EmailAddress {
    /// Display name, unquoted. Empty when the header had none.
    pub display_name: String,
    /// The bare `local@domain`.
    pub address: String,
}

impl EmailAddress {
    /// Parse `addr`, `<addr>`, `Name <addr>` or `"Quoted, Name" <addr>`.
    ///
    /// `None` when the text is not recognizable address syntax.
    pub fn try_parse(raw: &str) -> Option<Self> {
        let raw = raw.trim();
        let Some(open) = raw.rfind('<') else {
            return is_addr_spec(raw).then(|| Self {
                display_name: String::new(),
                address: raw.to_string(),
            });
        };

        let inner = raw[open + 1..].strip_suffix('>')?.trim();
        is_addr_spec(inner).then(|| Self {
            display_name: strip_quotes(&raw[..open]),
            address: inner.to_string(),
        })
    }

    /// Parse a comma-separated list, honoring commas inside quotes.
    ///
    /// `None` if the list is empty or any element fails to parse.
    pub fn try_parse_list(raw: &str) -> Option<Vec<Self>> {
        let list = split_address_list(raw)
            .iter()
            .filter(|segment| !segment.trim().is_empty())
            .map(|segment| Self::try_parse(segment))
            .collect::<Option<Vec<_>>>()?;
        (!list.is_empty()).then_some(list)
    }

    /// `Name <address>`, or the bare address when there is no name.
    pub fn display(&self) -> String {
        if self.display_name.is_empty() {
            self.address.clone()
        } else {
            format!("{} <{}>", self.display_name, self.address)
        }
    }
}

/// Split on commas that are outside quotes and angle brackets.
fn split_address_list(raw: &str) -> Vec<String> {
    let mut segments = Vec::new();
    let mut current = String::new();
    let mut in_quotes = false;
    let mut in_angle = false;

    for ch in raw.chars() {
        match ch {
            '"' => {
                in_quotes = !in_quotes;
                current.push(ch);
            }
            '<' if !in_quotes => {
                in_angle = true;
                current.push(ch);
            }
            '>' if !in_quotes => {
                in_angle = false;
                current.push(ch);
            }
            ',' if !in_quotes && !in_angle => segments.push(std::mem::take(&mut current)),
            _ => current.push(ch),
        }
    }
    segments.push(current);
    segments
}

/// Loose `local@domain` check used for header parsing.
fn is_addr_spec(s: &str) -> bool {
    match s.rsplit_once('@') {
        Some((local, domain)) => {
            !local.is_empty()
                && !domain.is_empty()
                && !s.chars().any(|c| c.is_whitespace() || c == '<' || c == '>')
        }
        None => false,
    }
}

/// Trim, then drop one pair of surrounding double quotes.
fn strip_quotes(s: &str) -> String {
    let s = s.trim();
    s.strip_prefix('"')
        .and_then(|inner| inner.strip_suffix('"'))
        .unwrap_or(s)
        .trim()
        .to_string()
}

// ── Mailbox names ───────────────────────────────────────────────

/// Map a recipient address to the name of the mailbox that stores it.
///
/// `"User+tag@Example.com"` → `"user"`. The domain (when present) must be a
/// valid host name and the local part must satisfy RFC 3696.
pub fn parse_mailbox_name(address: &str) -> Result<String> {
    let trimmed = address.trim().trim_start_matches('<').trim_end_matches('>');
    let (local, domain) = match trimmed.rsplit_once('@') {
        Some((local, domain)) => (local, Some(domain)),
        None => (trimmed, None),
    };

    if let Some(domain) = domain {
        if !validate_domain_part(domain) {
            return Err(MailError::invalid_address(address, "malformed domain"));
        }
    }
    if !validate_local_part(local) {
        return Err(MailError::invalid_address(address, "malformed local part"));
    }

    let mut name = local.to_lowercase();
    if let Some(plus) = name.find('+') {
        name.truncate(plus);
    }
    if name.is_empty() {
        return Err(MailError::invalid_address(address, "empty mailbox name"));
    }
    Ok(name)
}

/// Returns true if the domain complies with RFC 3696 / RFC 1035.
pub fn validate_domain_part(domain: &str) -> bool {
    if domain.is_empty() || domain.len() > 255 {
        return false;
    }
    let domain = domain.strip_suffix('.').unwrap_or(domain);
    domain.split('.').all(|label| {
        !label.is_empty()
            && label.len() <= 63
            && !label.starts_with('-')
            && !label.ends_with('-')
            && label
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
            && label.chars().any(|c| c.is_ascii_alphabetic() || c == '_')
    })
}

/// Returns true if the local part complies with RFC 3696 recommendations.
pub fn validate_local_part(local: &str) -> bool {
    const SPECIALS: &[u8] = b"!#$%&'*+-/=?^_`{|}~";

    let bytes = local.as_bytes();
    if bytes.is_empty() || bytes.len() > 64 || bytes[bytes.len() - 1] == b'.' {
        return false;
    }

    let mut prev = b'.';
    let mut in_char_quote = false;
    let mut in_string_quote = false;
    for &c in bytes {
        match c {
            b'a'..=b'z' | b'A'..=b'Z' | b'0'..=b'9' => in_char_quote = false,
            _ if SPECIALS.contains(&c) => in_char_quote = false,
            b'.' => {
                if prev == b'.' && !in_string_quote {
                    return false;
                }
            }
            b'\\' => in_char_quote = true,
            b'"' => {
                if in_char_quote {
                    in_char_quote = false;
                } else {
                    in_string_quote = !in_string_quote;
                }
            }
            _ if c > 127 => return false,
            _ => {
                if !(in_char_quote || in_string_quote) {
                    return false;
                }
                in_char_quote = false;
            }
        }
        prev = c;
    }
    !(in_char_quote || in_string_quote)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_single_address_forms() {
        let bare = EmailAddress::try_parse(" user@example.com ").unwrap();
        assert_eq!(bare.display(), "user@example.com");

        let named = EmailAddress::try_parse("User One <user1@example.com>").unwrap();
        assert_eq!(named.display_name, "User One");
        assert_eq!(named.address, "user1@example.com");

        let angle = EmailAddress::try_parse("<solo@example.com>").unwrap();
        assert_eq!(angle.display(), "solo@example.com");
    }

    #[test]
    fn test_parse_quoted_name() {
        let addr = EmailAddress::try_parse("\"Last, First\" <user@example.com>").unwrap();
        assert_eq!(addr.display_name, "Last, First");
        assert_eq!(addr.display(), "Last, First <user@example.com>");
    }

    #[test]
    fn test_unparsable_address() {
        assert!(EmailAddress::try_parse("undisclosed recipients").is_none());
        assert!(EmailAddress::try_parse("Name <a@b.com> trailing").is_none());
        assert!(EmailAddress::try_parse("").is_none());
    }

    #[test]
    fn test_parse_list_with_quoted_comma() {
        let list = EmailAddress::try_parse_list("\"Last, First\" <a@b.com>, other@c.com").unwrap();
        assert_eq!(list.len(), 2);
        assert_eq!(list[0].display_name, "Last, First");
        assert_eq!(list[1].address, "other@c.com");
    }

    #[test]
    fn test_parse_list_rejects_garbage_element() {
        assert!(EmailAddress::try_parse_list("a@b.com, not an address").is_none());
        assert!(EmailAddress::try_parse_list("").is_none());
    }

    #[test]
    fn test_mailbox_name_folds_case_and_tag() {
        assert_eq!(parse_mailbox_name("User@Example.com").unwrap(), "user");
        assert_eq!(parse_mailbox_name("user+news@example.com").unwrap(), "user");
        assert_eq!(parse_mailbox_name("<James.Bond@mi6.gov.uk>").unwrap(), "james.bond");
        assert_eq!(parse_mailbox_name("bare").unwrap(), "bare");
    }

    #[test]
    fn test_mailbox_name_rejects_malformed() {
        assert!(parse_mailbox_name("").is_err());
        assert!(parse_mailbox_name("two..dots@example.com").is_err());
        assert!(parse_mailbox_name("user@-bad.com").is_err());
        assert!(parse_mailbox_name("+tag@example.com").is_err());
        assert!(parse_mailbox_name("sp ace@example.com").is_err());
    }

    #[test]
    fn test_validate_domain_part() {
        assert!(validate_domain_part("example.com"));
        assert!(validate_domain_part("mail.example.com."));
        assert!(!validate_domain_part("example..com"));
        assert!(!validate_domain_part("123.456"));
        assert!(!validate_domain_part(&"a".repeat(64)));
    }

    #[test]
    fn test_validate_local_part() {
        assert!(validate_local_part("john.doe"));
        assert!(validate_local_part("o'hare+x"));
        assert!(validate_local_part("\"quoted space\""));
        assert!(!validate_local_part("trailing."));
        assert!(!validate_local_part("\"unterminated"));
        assert!(!validate_local_part(&"a".repeat(65)));
    }
}

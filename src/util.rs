use std::collections::HashSet;
use std::sync::OnceLock;

use regex::Regex;
use sha2::{Digest, Sha256};

use crate::error::ProfileError;

fn email_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"^[a-z0-9.!#$%&'*+/=?^_`{|}~-]+@[a-z0-9](?:[a-z0-9-]*[a-z0-9])?(?:\.[a-z0-9](?:[a-z0-9-]*[a-z0-9])?)+$")
            .expect("email pattern is valid")
    })
}

/// Normalize a customer identity: trimmed and lower-cased.
///
/// Example: "  Sarah.Chen@Acme.COM " → "sarah.chen@acme.com"
pub fn normalize_identity(identity: &str) -> String {
    identity.trim().to_lowercase()
}

/// Returns true if `identity` is a syntactically well-formed email address.
pub fn is_valid_email(identity: &str) -> bool {
    email_pattern().is_match(&normalize_identity(identity))
}

/// Normalize and validate an identity in one step.
///
/// Record IDs ("0x1a2b", "person-42") are rejected here, before any
/// upstream call sees them.
pub fn validate_identity(identity: &str) -> Result<String, ProfileError> {
    let normalized = normalize_identity(identity);
    if email_pattern().is_match(&normalized) {
        Ok(normalized)
    } else {
        Err(ProfileError::InvalidIdentity(identity.trim().to_string()))
    }
}

/// Extract the bare, normalized address from a sender/recipient header.
///
/// Example: "Sarah Chen <Sarah@Acme.com>" → "sarah@acme.com"
pub fn extract_address(header: &str) -> String {
    match (header.rfind('<'), header.rfind('>')) {
        (Some(start), Some(end)) if start < end => normalize_identity(&header[start + 1..end]),
        _ => normalize_identity(header),
    }
}

/// Local part of an address with any `+tag` suffix dropped.
fn mailbox(address: &str) -> &str {
    let local = address.split_once('@').map_or(address, |(local, _)| local);
    local.split_once('+').map_or(local, |(base, _)| base)
}

/// Id for a contact that was never persisted: mailbox and domain as a slug.
///
/// Example: "Sarah.Chen+crm@Acme.com" → "sarah-chen-acme-com"
pub fn person_id_from_email(email: &str) -> String {
    let address = normalize_identity(email);
    let domain = address.split_once('@').map_or("", |(_, domain)| domain);
    slugify(&format!("{} {}", mailbox(&address), domain))
}

/// Best-effort display name from the mailbox; empty when nothing usable is left.
pub fn name_from_email(email: &str) -> String {
    mailbox(email)
        .split(['.', '_', '-'])
        .filter(|part| !part.is_empty())
        .map(capitalize_first)
        .collect::<Vec<_>>()
        .join(" ")
}

/// First label of the domain, capitalized. Empty without a domain.
pub fn org_from_email(email: &str) -> String {
    email
        .split_once('@')
        .and_then(|(_, domain)| domain.split('.').next())
        .map(capitalize_first)
        .unwrap_or_default()
}

pub fn capitalize_first(s: &str) -> String {
    let mut chars = s.chars();
    match chars.next() {
        Some(c) => c.to_uppercase().to_string() + chars.as_str(),
        None => String::new(),
    }
}

/// Gravatar-style avatar URL for an identity. `d=404` so missing avatars
/// fail instead of rendering a placeholder.
pub fn avatar_url(identity: &str) -> String {
    let digest = Sha256::digest(normalize_identity(identity).as_bytes());
    format!("https://gravatar.com/avatar/{}?d=404", hex::encode(digest))
}

/// Trim, drop empties and suppress case-insensitive duplicates, keeping the
/// first spelling seen.
pub fn dedupe_tags<I, S>(tags: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut seen = HashSet::new();
    tags.into_iter()
        .map(|t| t.as_ref().trim().to_string())
        .filter(|t| !t.is_empty() && seen.insert(t.to_lowercase()))
        .collect()
}

/// Lower-case kebab slug: alphanumeric runs joined by single dashes.
pub fn slugify(text: &str) -> String {
    let mut slug = String::with_capacity(text.len());
    for c in text.chars().flat_map(char::to_lowercase) {
        if c.is_alphanumeric() {
            slug.push(c);
        } else if !slug.is_empty() && !slug.ends_with('-') {
            slug.push('-');
        }
    }
    while slug.ends_with('-') {
        slug.pop();
    }
    slug
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_identity() {
        assert_eq!(normalize_identity("  Sarah.Chen@Acme.COM "), "sarah.chen@acme.com");
    }

    #[test]
    fn test_validate_identity_accepts_addresses() {
        assert_eq!(validate_identity("A@X.com").unwrap(), "a@x.com");
        assert!(validate_identity("first.last+crm@sub.example.co.uk").is_ok());
    }

    #[test]
    fn test_validate_identity_rejects_record_ids() {
        for bad in ["", "person-42", "0x1a2b3c", "a@b", "@x.com", "a@@x.com", "a b@x.com"] {
            assert!(
                matches!(validate_identity(bad), Err(ProfileError::InvalidIdentity(_))),
                "{bad:?} should be rejected"
            );
        }
    }

    #[test]
    fn test_extract_address() {
        assert_eq!(extract_address("Sarah Chen <Sarah@Acme.com>"), "sarah@acme.com");
        assert_eq!(extract_address(" joe@bigcorp.io "), "joe@bigcorp.io");
        assert_eq!(extract_address("broken <header"), "broken <header");
    }

    #[test]
    fn test_person_id_from_email() {
        assert_eq!(person_id_from_email("sarah.chen@acme.com"), "sarah-chen-acme-com");
        assert_eq!(person_id_from_email("JOE@BIGCORP.IO"), "joe-bigcorp-io");
        assert_eq!(person_id_from_email("Sarah.Chen+crm@Acme.com"), "sarah-chen-acme-com");
    }

    #[test]
    fn test_name_from_email() {
        assert_eq!(name_from_email("sarah.chen@acme.com"), "Sarah Chen");
        assert_eq!(name_from_email("joe_smith@bigcorp.io"), "Joe Smith");
        assert_eq!(name_from_email("alice@example.com"), "Alice");
        assert_eq!(name_from_email("_@example.com"), "");
    }

    #[test]
    fn test_name_from_email_drops_tag() {
        assert_eq!(name_from_email("sarah.chen+newsletter@acme.com"), "Sarah Chen");
        assert_eq!(name_from_email("+promo@acme.com"), "");
    }

    #[test]
    fn test_org_from_email() {
        assert_eq!(org_from_email("sarah@acme.com"), "Acme");
        assert_eq!(org_from_email("joe@bigcorp.io"), "Bigcorp");
        assert_eq!(org_from_email("no-domain"), "");
    }

    #[test]
    fn test_avatar_url_is_case_insensitive() {
        assert_eq!(avatar_url("A@X.com"), avatar_url("a@x.com"));
        assert!(avatar_url("a@x.com").starts_with("https://gravatar.com/avatar/"));
    }

    #[test]
    fn test_dedupe_tags() {
        let tags = dedupe_tags(["vip", " VIP ", "", "renewal", "Renewal", "q3"]);
        assert_eq!(tags, vec!["vip", "renewal", "q3"]);
    }

    #[test]
    fn test_slugify_special_chars() {
        assert_eq!(slugify("Weekly Sync — Team Alpha"), "weekly-sync-team-alpha");
        assert_eq!(slugify("--Acme  Corp.--"), "acme-corp");
        assert_eq!(slugify("___"), "");
    }
}

use crate::models::OwnerContact;
use rand::{Rng, distr::Alphanumeric};

pub const SEPARATOR: &str = "-";
/// Marks ids that could not be derived from owner details.
pub const RANDOM_PREFIX: &str = "AUTO-";

/// Caller-supplied id wins; otherwise derive from owner details, falling back to random.
pub fn resolve_reference_id(explicit: Option<&str>, owner: &OwnerContact) -> String {
    explicit
        .map(str::trim)
        .filter(|id| !id.is_empty())
        .map(str::to_string)
        .or_else(|| derive_reference_id(owner))
        .unwrap_or_else(random_reference_id)
}

/// `<last 4 phone digits>-<first 4 of email local part, upper>-<title deed>`,
/// keeping only the parts that are present.
pub fn derive_reference_id(owner: &OwnerContact) -> Option<String> {
    let phone = owner.phone.as_deref().and_then(|raw| {
        let digits: Vec<char> = raw.chars().filter(char::is_ascii_digit).collect();
        let tail = &digits[digits.len().saturating_sub(4)..];
        (!tail.is_empty()).then(|| tail.iter().collect::<String>())
    });
    let email = owner.email.as_deref().and_then(|raw| {
        let local = raw.trim().split('@').next().unwrap_or("");
        let head: String = local.chars().take(4).collect();
        (!head.is_empty()).then(|| head.to_uppercase())
    });
    let deed = owner.title_deed.as_deref().and_then(|raw| {
        let compact: String = raw.chars().filter(|c| !c.is_whitespace()).collect();
        (!compact.is_empty()).then_some(compact)
    });

    let parts: Vec<String> = [phone, email, deed].into_iter().flatten().collect();
    if parts.is_empty() {
        None
    } else {
        Some(parts.join(SEPARATOR))
    }
}

pub fn random_reference_id() -> String {
    let suffix: String = rand::rng()
        .sample_iter(&Alphanumeric)
        .take(10)
        .map(|b| char::from(b).to_ascii_uppercase())
        .collect();
    format!("{RANDOM_PREFIX}{suffix}")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn owner(phone: Option<&str>, email: Option<&str>, deed: Option<&str>) -> OwnerContact {
        OwnerContact {
            phone: phone.map(str::to_string),
            email: email.map(str::to_string),
            title_deed: deed.map(str::to_string),
        }
    }

    #[test]
    fn derives_from_all_parts() {
        let contact = owner(Some("+357-99-123456"), Some("maria@example.com"), Some("0/1234"));
        assert_eq!(derive_reference_id(&contact).as_deref(), Some("3456-MARI-0/1234"));
        assert_eq!(
            resolve_reference_id(None, &contact),
            resolve_reference_id(None, &contact)
        );
    }

    #[test]
    fn uses_only_present_parts() {
        let contact = owner(None, Some("jo@example.com"), Some(" 12 / 345 "));
        assert_eq!(derive_reference_id(&contact).as_deref(), Some("JO-12/345"));
        let contact = owner(Some("99"), None, Some("   "));
        assert_eq!(derive_reference_id(&contact).as_deref(), Some("99"));
    }

    #[test]
    fn explicit_id_wins() {
        let contact = owner(Some("+357-99-123456"), None, None);
        assert_eq!(resolve_reference_id(Some(" REF-42 "), &contact), "REF-42");
        assert_eq!(resolve_reference_id(Some("  "), &contact), "3456");
    }

    #[test]
    fn no_inputs_yield_distinct_random_ids() {
        let empty = OwnerContact::default();
        let first = resolve_reference_id(None, &empty);
        let second = resolve_reference_id(None, &empty);
        assert!(first.starts_with(RANDOM_PREFIX));
        assert!(second.starts_with(RANDOM_PREFIX));
        assert_eq!(first.len(), RANDOM_PREFIX.len() + 10);
        assert_ne!(first, second);
    }
}

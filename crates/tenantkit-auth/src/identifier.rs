//! Login identifier classification.

use once_cell::sync::Lazy;
use regex::Regex;
use tenantkit_api::IdentifierKind;

static EMAIL_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[^\s@]+@[^\s@]+\.[^\s@]+$").expect("email pattern is valid")
});

// Optional `+` and 1-3 digit country code, a 3 digit (optionally parenthesised)
// area code, 3 digits, then 4-6 digits. Separators are `-`, `.` or whitespace.
// Digits are ASCII only.
static PHONE_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^\+?(?:[0-9]{1,3}[-.\s]?)?(?:\([0-9]{3}\)|[0-9]{3})[-.\s]?[0-9]{3}[-.\s]?[0-9]{4,6}$")
        .expect("phone pattern is valid")
});

/// Classify what a user typed into a login field.
///
/// Email wins over phone, and anything else (including the empty string)
/// is a username. Never fails.
#[must_use]
pub fn classify_identifier(input: &str) -> IdentifierKind {
    if EMAIL_RE.is_match(input) {
        IdentifierKind::Email
    } else if PHONE_RE.is_match(input) {
        IdentifierKind::Phone
    } else {
        IdentifierKind::Username
    }
}

//! Validation of operator-supplied run inputs.
//!
//! The recipient name and address end up in file names and mail headers, so
//! they are checked before a run starts.

use std::sync::LazyLock;

use anyhow::{bail, Result};
use regex::Regex;

use crate::path_validation::sanitize_component;

static EMAIL_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[A-Za-z0-9._%+\-]+@[A-Za-z0-9.\-]+\.[A-Za-z]{2,}$")
        .expect("valid email regex")
});

/// Participant who receives the activity files in Email Mode.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Recipient {
    pub name: String,
    pub email: String,
}

impl Recipient {
    /// Trims and validates both fields.
    pub fn new(name: &str, email: &str) -> Result<Self> {
        let name = name.trim();
        let email = email.trim();
        validate_name(name)?;
        validate_recipient_email(email)?;
        Ok(Self {
            name: name.to_string(),
            email: email.to_string(),
        })
    }

    /// File-name-safe local part of the address.
    pub fn local_part(&self) -> String {
        sanitize_localpart(&self.email)
    }
}

pub fn validate_name(name: &str) -> Result<()> {
    const MAX_NAME_LENGTH: usize = 100;

    if name.is_empty() {
        bail!("Please enter a name.");
    }
    if name.len() > MAX_NAME_LENGTH {
        bail!("Name too long: {} chars (max: {})", name.len(), MAX_NAME_LENGTH);
    }
    if name.contains(['\0', '\n', '\r']) {
        bail!("Name contains control characters");
    }
    Ok(())
}

pub fn validate_recipient_email(email: &str) -> Result<()> {
    if !EMAIL_RE.is_match(email) {
        bail!("Please enter a valid email address.");
    }
    Ok(())
}

pub fn sanitize_localpart(email: &str) -> String {
    let local = email.split('@').next().unwrap_or_default();
    sanitize_component(local)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_recipient_email() {
        assert!(validate_recipient_email("ana.maria+run@example.org").is_ok());
        assert!(validate_recipient_email("ana@mail.co").is_ok());
        assert!(validate_recipient_email("ana@localhost").is_err());
        assert!(validate_recipient_email("not an email").is_err());
        assert!(validate_recipient_email("").is_err());
    }

    #[test]
    fn test_validate_name() {
        assert!(validate_name("Ana").is_ok());
        assert!(validate_name("").is_err());
        assert!(validate_name("Ana\nBcc: x").is_err());
        assert!(validate_name(&"a".repeat(101)).is_err());
    }

    #[test]
    fn test_recipient_trims_and_sanitizes() {
        let recipient = Recipient::new("  Ana Maria ", " ana.m+fit@example.org ").unwrap();
        assert_eq!(recipient.name, "Ana Maria");
        assert_eq!(recipient.email, "ana.m+fit@example.org");
        assert_eq!(recipient.local_part(), "ana.mfit");
    }
}

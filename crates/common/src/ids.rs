//! Type-safe identifier newtypes for Switchyard.
//!
//! These types keep registry ids and domain names from being mixed up with
//! arbitrary strings, and guarantee that every `DomainName` is already in
//! normalized routing-key form.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

use crate::host::normalize_host;

/// Error returned when a string cannot be used as a domain name.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DomainNameError {
    #[error("domain name is empty")]
    Empty,

    #[error("domain name '{0}' contains invalid characters")]
    InvalidCharacters(String),
}

/// Normalized domain name.
///
/// Lowercase, without port suffix or trailing dot. Two names that differ
/// only in case compare equal once parsed.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct DomainName(String);

impl DomainName {
    /// Parse and normalize a domain name.
    pub fn parse(raw: &str) -> Result<Self, DomainNameError> {
        let normalized = normalize_host(raw).ok_or(DomainNameError::Empty)?;

        let valid = normalized
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'-' | b'.' | b'_' | b'*'));
        if !valid {
            return Err(DomainNameError::InvalidCharacters(raw.to_string()));
        }

        Ok(Self(normalized))
    }

    /// Get the inner string value
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Convert to owned String
    pub fn into_string(self) -> String {
        self.0
    }
}

impl fmt::Display for DomainName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl AsRef<str> for DomainName {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl TryFrom<&str> for DomainName {
    type Error = DomainNameError;

    fn try_from(s: &str) -> Result<Self, Self::Error> {
        Self::parse(s)
    }
}

impl<'de> Deserialize<'de> for DomainName {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let raw = String::deserialize(deserializer)?;
        Self::parse(&raw).map_err(serde::de::Error::custom)
    }
}

/// Registry identifier of a domain entry.
///
/// Opaque to the proxy; carried through for logging only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DomainId(u64);

impl DomainId {
    pub fn new(id: u64) -> Self {
        Self(id)
    }

    pub fn get(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for DomainId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_domain_name_normalizes() {
        let name = DomainName::parse("Example.COM").unwrap();
        assert_eq!(name.as_str(), "example.com");
        assert_eq!(name, DomainName::parse("example.com:443").unwrap());
    }

    #[test]
    fn test_domain_name_rejects_empty() {
        assert_eq!(DomainName::parse(""), Err(DomainNameError::Empty));
        assert_eq!(DomainName::parse("   "), Err(DomainNameError::Empty));
    }

    #[test]
    fn test_domain_name_rejects_garbage() {
        assert!(matches!(
            DomainName::parse("exa mple.com"),
            Err(DomainNameError::InvalidCharacters(_))
        ));
        assert!(matches!(
            DomainName::parse("a/b.com"),
            Err(DomainNameError::InvalidCharacters(_))
        ));
    }

    #[test]
    fn test_domain_name_deserialize() {
        let name: DomainName = serde_json::from_str("\"A.Test\"").unwrap();
        assert_eq!(name.as_str(), "a.test");

        let err = serde_json::from_str::<DomainName>("\"\"");
        assert!(err.is_err());
    }

    #[test]
    fn test_domain_id_display() {
        assert_eq!(DomainId::new(42).to_string(), "42");
    }
}

use std::{
    fmt,
    str::FromStr,
    time::{SystemTime, UNIX_EPOCH},
};

use serde::{Deserialize, Serialize};

pub type Timestamp = u64;

pub const HOUR_SECS: u64 = 60 * 60;
pub const DAY_SECS: u64 = 24 * HOUR_SECS;

pub const ADDRESS_HEX_LEN: usize = 64;

pub fn now_unix() -> Timestamp {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum IdentityError {
    #[error("address must start with 0x: {0:?}")]
    MissingPrefix(String),
    #[error("address has no hex digits")]
    Empty,
    #[error("address longer than {ADDRESS_HEX_LEN} hex digits")]
    TooLong,
    #[error("address contains a non-hex character")]
    NotHex,
}

/// Zero-padded lowercase form of an account, whatever spelling it was parsed from.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Address(String);

impl Address {
    pub fn parse(raw: &str) -> Result<Self, IdentityError> {
        let trimmed = raw.trim();
        let digits = trimmed
            .strip_prefix("0x")
            .or_else(|| trimmed.strip_prefix("0X"))
            .ok_or_else(|| IdentityError::MissingPrefix(trimmed.to_string()))?;
        if digits.is_empty() {
            return Err(IdentityError::Empty);
        }
        if digits.len() > ADDRESS_HEX_LEN {
            return Err(IdentityError::TooLong);
        }
        if !digits.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(IdentityError::NotHex);
        }
        Ok(Self(format!(
            "0x{:0>width$}",
            digits.to_ascii_lowercase(),
            width = ADDRESS_HEX_LEN
        )))
    }

    pub fn is_valid(raw: &str) -> bool {
        Self::parse(raw).is_ok()
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for Address {
    type Err = IdentityError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for Address {
    type Error = IdentityError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<Address> for String {
    fn from(value: Address) -> Self {
        value.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_and_padded_forms_are_the_same_account() {
        let short = Address::parse("0xA1").unwrap();
        let long = Address::parse(&format!("0x{:0>64}", "a1")).unwrap();
        assert_eq!(short, long);
        assert_eq!(short.as_str().len(), 2 + ADDRESS_HEX_LEN);
    }

    #[test]
    fn malformed_addresses_are_rejected() {
        assert_eq!(
            Address::parse("a1").unwrap_err(),
            IdentityError::MissingPrefix("a1".into())
        );
        assert_eq!(Address::parse("0x").unwrap_err(), IdentityError::Empty);
        assert_eq!(Address::parse("0xzz").unwrap_err(), IdentityError::NotHex);
        assert_eq!(
            Address::parse(&format!("0x{}", "1".repeat(65))).unwrap_err(),
            IdentityError::TooLong
        );
    }

    #[test]
    fn serde_goes_through_validation() {
        let parsed: Address = serde_json::from_str("\"0x2\"").unwrap();
        assert_eq!(parsed, Address::parse("0x2").unwrap());
        assert!(serde_json::from_str::<Address>("\"scout\"").is_err());
    }
}

//! Gateway MAC address newtype.
//!
//! Every MAC that enters the system (config, link monitor, store) passes
//! through `MacAddress::parse`, so comparisons are always made on the
//! normalized upper-case colon form.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid MAC address: '{0}'")]
pub struct MacParseError(pub String);

/// Normalized MAC address (`AA:BB:CC:11:22:33`)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct MacAddress(String);

impl MacAddress {
    /// Parse a MAC written with `:` or `-` separators, any case
    pub fn parse(raw: &str) -> Result<Self, MacParseError> {
        let trimmed = raw.trim();
        let octets: Vec<&str> = trimmed.split(|c| c == ':' || c == '-').collect();

        let well_formed = octets.len() == 6
            && octets
                .iter()
                .all(|o| o.len() == 2 && o.chars().all(|c| c.is_ascii_hexdigit()));

        if !well_formed {
            return Err(MacParseError(raw.to_string()));
        }

        Ok(Self(octets.join(":").to_ascii_uppercase()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl FromStr for MacAddress {
    type Err = MacParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for MacAddress {
    type Error = MacParseError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<MacAddress> for String {
    fn from(mac: MacAddress) -> Self {
        mac.0
    }
}

impl fmt::Display for MacAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_normalizes_case_and_separator() {
        let mac = MacAddress::parse("de-ad-be-ef-ca-fe").unwrap();
        assert_eq!(mac.as_str(), "DE:AD:BE:EF:CA:FE");
        assert_eq!(mac, "DE:AD:BE:EF:CA:FE".parse().unwrap());
    }

    #[test]
    fn test_parse_rejects_malformed() {
        assert!(MacAddress::parse("").is_err());
        assert!(MacAddress::parse("AA:BB:CC:11:22").is_err());
        assert!(MacAddress::parse("AA:BB:CC:11:22:3G").is_err());
        assert!(MacAddress::parse("AABBCC112233").is_err());
    }

    #[test]
    fn test_serde_uses_string_form() {
        let mac: MacAddress = serde_json::from_str("\"aa:bb:cc:11:22:33\"").unwrap();
        assert_eq!(serde_json::to_string(&mac).unwrap(), "\"AA:BB:CC:11:22:33\"");
        assert!(serde_json::from_str::<MacAddress>("\"nope\"").is_err());
    }
}

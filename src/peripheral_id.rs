//! Stable identity of a discovered peripheral.
//!
//! Platforms identify peripherals differently: Linux reports a 6-byte device
//! address, other stacks hand out opaque identifier strings. The aggregation
//! store only needs equality and hashing, so the identifier is kept as text
//! and MAC-style addresses are normalised to upper-case colon notation.

use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Identifier of a peripheral, e.g. `"AA:BB:CC:DD:EE:FF"`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PeripheralId(String);

impl PeripheralId {
    /// Borrow the identifier text.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PeripheralId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Errors returned when parsing a peripheral identifier.
#[derive(Error, Debug, PartialEq)]
pub enum ParseIdError {
    #[error("invalid peripheral identifier: empty")]
    Empty,
    #[error("invalid peripheral identifier: '{0}' contains whitespace")]
    Whitespace(String),
}

impl FromStr for PeripheralId {
    type Err = ParseIdError;

    /// Parse an identifier. Strings that look like a MAC address are
    /// upper-cased so `aa:bb:..` and `AA:BB:..` name the same peripheral;
    /// anything else is taken verbatim.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() {
            return Err(ParseIdError::Empty);
        }
        if s.chars().any(char::is_whitespace) {
            return Err(ParseIdError::Whitespace(s.to_string()));
        }

        match parse_mac(s) {
            Some(bytes) => Ok(bytes.into()),
            None => Ok(PeripheralId(s.to_string())),
        }
    }
}

fn parse_mac(s: &str) -> Option<[u8; 6]> {
    let mut bytes = [0u8; 6];
    let mut parts = s.split(':');
    for byte in bytes.iter_mut() {
        let part = parts.next()?;
        if part.len() != 2 {
            return None;
        }
        *byte = u8::from_str_radix(part, 16).ok()?;
    }
    parts.next().is_none().then_some(bytes)
}

impl From<[u8; 6]> for PeripheralId {
    fn from(bytes: [u8; 6]) -> Self {
        PeripheralId(format!(
            "{:02X}:{:02X}:{:02X}:{:02X}:{:02X}:{:02X}",
            bytes[0], bytes[1], bytes[2], bytes[3], bytes[4], bytes[5]
        ))
    }
}

#[cfg(feature = "bluer")]
impl From<bluer::Address> for PeripheralId {
    fn from(addr: bluer::Address) -> Self {
        addr.0.into()
    }
}

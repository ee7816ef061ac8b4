//! Network address derivation
//!
//! An address is the low-order 20 bytes of the keccak256 hash of the
//! uncompressed public key point (prefix byte dropped). The textual form
//! carries a mixed-case checksum recomputed from the binary value on every
//! render; it is never stored separately.

use std::fmt;
use std::str::FromStr;

use alloy_primitives::keccak256;

use crate::error::GeneratorError;

pub const ADDRESS_LENGTH: usize = 20;

/// A 20-byte account address derived from an EC public key.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Address([u8; ADDRESS_LENGTH]);

impl Address {
    /// Derive the address from an uncompressed SEC1 public key point
    /// (`0x04 || X || Y`, 65 bytes).
    ///
    /// Callers must hand in a well-formed point; this is a precondition,
    /// not a runtime check.
    pub fn from_public_key(uncompressed_point: &[u8; 65]) -> Self {
        debug_assert_eq!(uncompressed_point[0], 0x04);
        let hash = keccak256(&uncompressed_point[1..]);
        let mut bytes = [0u8; ADDRESS_LENGTH];
        bytes.copy_from_slice(&hash[12..]);
        Self(bytes)
    }

    pub fn from_bytes(bytes: [u8; ADDRESS_LENGTH]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; ADDRESS_LENGTH] {
        &self.0
    }

    /// Render the checksummed textual form: hash the lowercase hex
    /// representation and capitalize every hex digit whose corresponding
    /// hash nibble is >= 8.
    pub fn to_checksum_string(&self) -> String {
        let lower = hex::encode(self.0);
        let hash = keccak256(lower.as_bytes());

        let mut out = String::with_capacity(2 + lower.len());
        out.push_str("0x");
        for (i, c) in lower.chars().enumerate() {
            let nibble = if i % 2 == 0 {
                hash[i / 2] >> 4
            } else {
                hash[i / 2] & 0x0f
            };
            if c.is_ascii_alphabetic() && nibble >= 8 {
                out.push(c.to_ascii_uppercase());
            } else {
                out.push(c);
            }
        }
        out
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_checksum_string())
    }
}

impl fmt::Debug for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Address({})", self.to_checksum_string())
    }
}

impl FromStr for Address {
    type Err = GeneratorError;

    /// Parses any casing, with or without the `0x` prefix.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let stripped = s.strip_prefix("0x").unwrap_or(s);
        let bytes = hex::decode(stripped.to_ascii_lowercase())
            .map_err(|e| GeneratorError::InvalidAddress(format!("{}: {}", s, e)))?;
        let bytes: [u8; ADDRESS_LENGTH] = bytes
            .try_into()
            .map_err(|_| GeneratorError::InvalidAddress(format!("{}: wrong length", s)))?;
        Ok(Self(bytes))
    }
}

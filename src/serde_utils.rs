//! Shared serialization utilities for the balance engine.
//!
//! Ledger amounts cross the wire as decimal strings: JSON numbers cannot carry
//! a full 128-bit planck value without precision loss.

use serde::{Deserialize, Deserializer, Serializer};

/// Serde adapter for `u128` amounts encoded as decimal strings.
///
/// Usage: `#[serde(with = "crate::serde_utils::u128_string")]`.
pub mod u128_string {
    use super::*;

    pub fn serialize<S>(val: &u128, s: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        s.serialize_str(&val.to_string())
    }

    pub fn deserialize<'de, D>(d: D) -> Result<u128, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = String::deserialize(d)?;
        raw.parse::<u128>().map_err(serde::de::Error::custom)
    }
}

/// Skip-serializing helper for defaulted boolean flags.
pub fn is_false(v: &bool) -> bool {
    !*v
}

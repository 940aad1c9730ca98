//! Serde helpers for uint256 fields on the relay wire.
//!
//! Producers write gas values as decimal strings and the nonce as a plain JSON integer
//! whenever it fits in 64 bits. Consumers accept any of: JSON integer, decimal string or
//! `0x` hex string. JSON floats are refused since they have already lost precision.

use alloy_primitives::U256;
use serde::de::{self, Visitor};
use serde::{Deserializer, Serializer};
use std::fmt;

struct UintVisitor;

impl Visitor<'_> for UintVisitor {
    type Value = U256;

    fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("an unsigned integer, a decimal string or a 0x-prefixed hex string")
    }

    fn visit_u64<E: de::Error>(self, v: u64) -> Result<U256, E> {
        Ok(U256::from(v))
    }

    fn visit_u128<E: de::Error>(self, v: u128) -> Result<U256, E> {
        Ok(U256::from(v))
    }

    fn visit_i64<E: de::Error>(self, v: i64) -> Result<U256, E> {
        u64::try_from(v)
            .map(U256::from)
            .map_err(|_| E::custom(format!("negative value {v} for unsigned field")))
    }

    fn visit_f64<E: de::Error>(self, v: f64) -> Result<U256, E> {
        Err(E::custom(format!(
            "non-integral or out-of-range number {v}; encode large values as decimal strings"
        )))
    }

    fn visit_str<E: de::Error>(self, v: &str) -> Result<U256, E> {
        parse_uint(v).map_err(E::custom)
    }
}

pub fn parse_uint(value: &str) -> Result<U256, String> {
    let trimmed = value.trim();
    let (digits, radix) = match trimmed
        .strip_prefix("0x")
        .or_else(|| trimmed.strip_prefix("0X"))
    {
        Some(hex) => (hex, 16),
        None => (trimmed, 10),
    };
    if digits.is_empty() {
        return Err(format!("invalid unsigned integer '{value}': no digits"));
    }
    let parsed = U256::from_str_radix(digits, radix);
    parsed.map_err(|e| format!("invalid unsigned integer '{value}': {e}"))
}

/// Always a decimal string.
pub mod decimal {
    use super::*;

    pub fn serialize<S: Serializer>(value: &U256, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&value.to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<U256, D::Error> {
        deserializer.deserialize_any(UintVisitor)
    }
}

/// JSON integer when it fits in 64 bits, decimal string otherwise.
pub mod integer {
    use super::*;

    pub fn serialize<S: Serializer>(value: &U256, serializer: S) -> Result<S::Ok, S::Error> {
        match u64::try_from(*value) {
            Ok(small) => serializer.serialize_u64(small),
            Err(_) => serializer.serialize_str(&value.to_string()),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<U256, D::Error> {
        deserializer.deserialize_any(UintVisitor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::{Deserialize, Serialize};

    #[derive(Serialize, Deserialize)]
    struct Wrapper {
        #[serde(with = "decimal")]
        gas: U256,
        #[serde(with = "integer")]
        nonce: U256,
    }

    #[test]
    fn test_accepts_integer_decimal_and_hex() {
        let w: Wrapper = serde_json::from_str(r#"{"gas": 21000, "nonce": "0x10"}"#).unwrap();
        assert_eq!(w.gas, U256::from(21000u64));
        assert_eq!(w.nonce, U256::from(16u64));

        let w: Wrapper =
            serde_json::from_str(r#"{"gas": "12345678901234567890123456789012345", "nonce": 7}"#)
                .unwrap();
        assert_eq!(w.gas.to_string(), "12345678901234567890123456789012345");
    }

    #[test]
    fn test_rejects_lossy_and_negative_numbers() {
        assert!(serde_json::from_str::<Wrapper>(r#"{"gas": 1.5, "nonce": 1}"#).is_err());
        assert!(serde_json::from_str::<Wrapper>(r#"{"gas": -1, "nonce": 1}"#).is_err());
        assert!(
            serde_json::from_str::<Wrapper>(r#"{"gas": 100000000000000000000000, "nonce": 1}"#)
                .is_err()
        );
        assert!(serde_json::from_str::<Wrapper>(r#"{"gas": "12a", "nonce": 1}"#).is_err());
    }

    #[test]
    fn test_large_nonce_falls_back_to_string() {
        // ERC-4337 nonces carry a 192-bit key in the upper bits
        let nonce = U256::from(1u64) << 100;
        let json = serde_json::to_value(Wrapper { gas: U256::ZERO, nonce }).unwrap();
        assert_eq!(json["nonce"], serde_json::json!(nonce.to_string()));
        assert_eq!(json["gas"], serde_json::json!("0"));

        let json = serde_json::to_value(Wrapper { gas: U256::ZERO, nonce: U256::from(3u64) })
            .unwrap();
        assert_eq!(json["nonce"], serde_json::json!(3));
    }
}

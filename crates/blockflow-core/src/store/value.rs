//! Typed value arithmetic for store update policies.
//!
//! Store values are opaque bytes on disk; numeric policies decode them as
//! ASCII decimal per the store's declared value type, combine, and re-encode.

use anyhow::{anyhow, Result};
use bigdecimal::BigDecimal;
use num_bigint::BigInt;
use std::str::FromStr;

pub const TYPE_INT64: &str = "int64";
pub const TYPE_FLOAT64: &str = "float64";
pub const TYPE_BIGINT: &str = "bigint";
pub const TYPE_BIGFLOAT: &str = "bigfloat";

fn as_str(value: &[u8]) -> Result<&str> {
    std::str::from_utf8(value).map_err(|_| anyhow!("value is not valid utf-8"))
}

pub fn parse_int64(value: &[u8]) -> Result<i64> {
    let s = as_str(value)?;
    s.parse::<i64>().map_err(|_| anyhow!("invalid int64 {:?}", s))
}

pub fn parse_float64(value: &[u8]) -> Result<f64> {
    let s = as_str(value)?;
    s.parse::<f64>()
        .map_err(|_| anyhow!("invalid float64 {:?}", s))
}

pub fn parse_bigint(value: &[u8]) -> Result<BigInt> {
    let s = as_str(value)?;
    BigInt::from_str(s).map_err(|_| anyhow!("invalid bigint {:?}", s))
}

pub fn parse_bigfloat(value: &[u8]) -> Result<BigDecimal> {
    let s = as_str(value)?;
    BigDecimal::from_str(s).map_err(|_| anyhow!("invalid bigfloat {:?}", s))
}

pub fn encode_int64(value: i64) -> Vec<u8> {
    value.to_string().into_bytes()
}

pub fn encode_float64(value: f64) -> Vec<u8> {
    value.to_string().into_bytes()
}

pub fn encode_bigint(value: &BigInt) -> Vec<u8> {
    value.to_string().into_bytes()
}

pub fn encode_bigfloat(value: &BigDecimal) -> Vec<u8> {
    value.normalized().to_string().into_bytes()
}

/// Numeric addition of two encoded values.
pub fn combine_add(value_type: &str, left: &[u8], right: &[u8]) -> Result<Vec<u8>> {
    match value_type {
        TYPE_INT64 => Ok(encode_int64(parse_int64(left)? + parse_int64(right)?)),
        TYPE_FLOAT64 => Ok(encode_float64(parse_float64(left)? + parse_float64(right)?)),
        TYPE_BIGINT => Ok(encode_bigint(&(parse_bigint(left)? + parse_bigint(right)?))),
        TYPE_BIGFLOAT => Ok(encode_bigfloat(&(parse_bigfloat(left)? + parse_bigfloat(right)?))),
        other => Err(anyhow!("update policy add does not support value type {:?}", other)),
    }
}

/// Element-wise minimum of two encoded values.
pub fn combine_min(value_type: &str, left: &[u8], right: &[u8]) -> Result<Vec<u8>> {
    select(value_type, left, right, true)
}

/// Element-wise maximum of two encoded values.
pub fn combine_max(value_type: &str, left: &[u8], right: &[u8]) -> Result<Vec<u8>> {
    select(value_type, left, right, false)
}

fn select(value_type: &str, left: &[u8], right: &[u8], want_min: bool) -> Result<Vec<u8>> {
    let left_wins = match value_type {
        TYPE_INT64 => (parse_int64(left)? < parse_int64(right)?) == want_min,
        TYPE_FLOAT64 => (parse_float64(left)? < parse_float64(right)?) == want_min,
        TYPE_BIGINT => (parse_bigint(left)? < parse_bigint(right)?) == want_min,
        TYPE_BIGFLOAT => (parse_bigfloat(left)? < parse_bigfloat(right)?) == want_min,
        other => {
            return Err(anyhow!(
                "update policies min/max do not support value type {:?}",
                other
            ))
        }
    };
    Ok(if left_wins { left.to_vec() } else { right.to_vec() })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_per_type() {
        assert_eq!(combine_add(TYPE_INT64, b"10", b"-3").unwrap(), b"7");
        assert_eq!(combine_add(TYPE_FLOAT64, b"1.5", b"2.25").unwrap(), b"3.75");
        assert_eq!(
            combine_add(TYPE_BIGINT, b"123456789876543212345", b"1").unwrap(),
            b"123456789876543212346"
        );
        assert_eq!(
            combine_add(TYPE_BIGFLOAT, b"12345678987654321.5", b"0.5").unwrap(),
            b"12345678987654322"
        );
        assert!(combine_add("string", b"a", b"b").is_err());
    }

    #[test]
    fn min_max_per_type() {
        assert_eq!(combine_min(TYPE_INT64, b"5", b"2").unwrap(), b"2");
        assert_eq!(combine_max(TYPE_INT64, b"5", b"2").unwrap(), b"5");
        assert_eq!(combine_min(TYPE_FLOAT64, b"10.05", b"10.04").unwrap(), b"10.04");
        assert_eq!(combine_max(TYPE_BIGINT, b"3", b"11").unwrap(), b"11");
        assert_eq!(
            combine_min(TYPE_BIGFLOAT, b"11.05", b"11.04").unwrap(),
            b"11.04"
        );
        assert!(combine_min("bytes", b"a", b"b").is_err());
    }

    #[test]
    fn malformed_values_error() {
        assert!(combine_add(TYPE_INT64, b"x", b"1").is_err());
        assert!(combine_min(TYPE_BIGINT, b"", b"1").is_err());
    }
}

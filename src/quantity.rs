//! Kubernetes resource quantity parsing
//!
//! Converts `resource.Quantity` strings such as `5G`, `10Gi`, `1.5e3` or
//! `500m` into whole bytes, rounding fractional results up.

use crate::error::{Error, Result};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;

/// Parse a quantity into bytes
pub fn parse_bytes(quantity: &Quantity) -> Result<i64> {
    parse_str(&quantity.0)
}

/// Parse a quantity string into bytes
pub fn parse_str(raw: &str) -> Result<i64> {
    let s = raw.trim();
    let invalid = || Error::CapacityParse(format!("invalid quantity {:?}", raw));

    let split = s
        .find(|c: char| !(c.is_ascii_digit() || matches!(c, '.' | '+' | '-')))
        .unwrap_or(s.len());
    let (number, suffix) = s.split_at(split);

    if number.is_empty() || number.starts_with('-') {
        return Err(invalid());
    }
    let value: f64 = number.parse().map_err(|_| invalid())?;

    let multiplier = match suffix {
        "" => 1.0,
        "m" => 1e-3,
        "k" => 1e3,
        "M" => 1e6,
        "G" => 1e9,
        "T" => 1e12,
        "P" => 1e15,
        "E" => 1e18,
        "Ki" => 1024f64,
        "Mi" => 1024f64.powi(2),
        "Gi" => 1024f64.powi(3),
        "Ti" => 1024f64.powi(4),
        "Pi" => 1024f64.powi(5),
        "Ei" => 1024f64.powi(6),
        exp if exp.starts_with(['e', 'E']) => {
            let power: i32 = exp[1..].parse().map_err(|_| invalid())?;
            10f64.powi(power)
        }
        _ => return Err(invalid()),
    };

    let bytes = (value * multiplier).ceil();
    if !bytes.is_finite() || bytes > i64::MAX as f64 {
        return Err(invalid());
    }
    Ok(bytes as i64)
}

//! Storage quantity arithmetic
//!
//! Parses Kubernetes resource quantities ("10Gi", "500M", "1.5Ti", "1e9")
//! into byte counts and formats byte counts back using binary suffixes.

use k8s_openapi::apimachinery::pkg::api::resource::Quantity;

use crate::error::{Error, Result};

const BINARY_SUFFIXES: [(&str, u32); 6] = [
    ("Ki", 1),
    ("Mi", 2),
    ("Gi", 3),
    ("Ti", 4),
    ("Pi", 5),
    ("Ei", 6),
];

const DECIMAL_SUFFIXES: [(&str, u32); 6] = [
    ("k", 1),
    ("M", 2),
    ("G", 3),
    ("T", 4),
    ("P", 5),
    ("E", 6),
];

pub const MIB: u128 = 1024 * 1024;

/// Byte interpretation of a resource quantity
pub trait QuantityParser {
    /// Parse into bytes, rounding fractional bytes up
    fn to_bytes(&self) -> Result<u128>;
}

impl QuantityParser for Quantity {
    fn to_bytes(&self) -> Result<u128> {
        parse_str(&self.0)
    }
}

fn parse_str(raw: &str) -> Result<u128> {
    let s = raw.trim();
    let invalid = || Error::InvalidSpec(format!("invalid quantity {:?}", raw));
    if s.is_empty() || s.starts_with('-') {
        return Err(invalid());
    }
    let s = s.strip_prefix('+').unwrap_or(s);

    let split = s
        .find(|c: char| !(c.is_ascii_digit() || c == '.'))
        .unwrap_or(s.len());
    let (number, suffix) = s.split_at(split);
    if number.is_empty() {
        return Err(invalid());
    }

    // value = mantissa * num / den
    let (mantissa, scale) = parse_decimal(number).ok_or_else(invalid)?;
    let mut num: u128 = mantissa;
    let mut den: u128 = 10u128.checked_pow(scale).ok_or_else(invalid)?;

    if suffix == "m" {
        den = den.checked_mul(1000).ok_or_else(invalid)?;
    } else if let Some((_, exp)) = BINARY_SUFFIXES.iter().find(|(sfx, _)| *sfx == suffix) {
        num = num.checked_mul(1024u128.pow(*exp)).ok_or_else(invalid)?;
    } else if let Some((_, exp)) = DECIMAL_SUFFIXES.iter().find(|(sfx, _)| *sfx == suffix) {
        num = num.checked_mul(1000u128.pow(*exp)).ok_or_else(invalid)?;
    } else if let Some(exp) = suffix
        .strip_prefix('e')
        .or_else(|| suffix.strip_prefix('E'))
    {
        let exp: i32 = exp.parse().map_err(|_| invalid())?;
        if exp >= 0 {
            num = num
                .checked_mul(10u128.checked_pow(exp as u32).ok_or_else(invalid)?)
                .ok_or_else(invalid)?;
        } else {
            den = den
                .checked_mul(10u128.checked_pow(exp.unsigned_abs()).ok_or_else(invalid)?)
                .ok_or_else(invalid)?;
        }
    } else if !suffix.is_empty() {
        return Err(invalid());
    }

    Ok(num.div_ceil(den))
}

fn parse_decimal(number: &str) -> Option<(u128, u32)> {
    let mut parts = number.splitn(2, '.');
    let int_part = parts.next().unwrap_or("");
    let frac_part = parts.next().unwrap_or("");
    if frac_part.contains('.') || (int_part.is_empty() && frac_part.is_empty()) {
        return None;
    }
    // Trailing fractional zeros only widen the scale
    let frac_part = frac_part.trim_end_matches('0');
    let digits = format!("{}{}", int_part, frac_part);
    let mantissa = if digits.is_empty() { 0 } else { digits.parse().ok()? };
    Some((mantissa, frac_part.len() as u32))
}

/// Format bytes with the largest binary suffix that divides evenly
pub fn format_bytes(bytes: u128) -> Quantity {
    if bytes == 0 {
        return Quantity("0".to_string());
    }
    for (suffix, exp) in BINARY_SUFFIXES.iter().rev() {
        let unit = 1024u128.pow(*exp);
        if bytes % unit == 0 {
            return Quantity(format!("{}{}", bytes / unit, suffix));
        }
    }
    Quantity(bytes.to_string())
}

/// Round up to the next multiple of `alignment`
pub fn align_up(bytes: u128, alignment: u128) -> u128 {
    bytes.div_ceil(alignment) * alignment
}

/// Grow a requested size so the usable space survives filesystem overhead
pub fn inflate_for_overhead(bytes: u128, overhead: f64) -> u128 {
    let aligned = align_up(bytes, MIB);
    if overhead <= 0.0 || overhead >= 1.0 {
        return aligned;
    }
    (aligned as f64 / (1.0 - overhead)).ceil() as u128
}

//! Kubernetes quantity strings to canonical integer units.
//!
//! `cpu` is accounted in millicores; every other resource in base units.
//! Fractional base units round up, so a request never under-counts.

use crate::{RampartError, Result};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;

const KI: i128 = 1024;

/// Whether the resource is accounted in milli-units
pub fn is_milli_resource(resource: &str) -> bool {
    resource == "cpu"
}

/// Parse a quantity into canonical units for `resource`
pub fn parse_quantity(resource: &str, quantity: &Quantity) -> Result<i64> {
    parse_quantity_str(resource, &quantity.0)
}

/// Parse a quantity string (e.g. "500m", "2", "1.5", "128Mi", "1G") into
/// canonical units for `resource`
pub fn parse_quantity_str(resource: &str, value: &str) -> Result<i64> {
    let invalid = || RampartError::invalid_quantity(resource, value);

    let trimmed = value.trim();
    let (negative, unsigned) = match trimmed.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, trimmed.strip_prefix('+').unwrap_or(trimmed)),
    };

    let split = unsigned
        .find(|c: char| !(c.is_ascii_digit() || c == '.'))
        .unwrap_or(unsigned.len());
    let (number, suffix) = unsigned.split_at(split);
    if number.is_empty() {
        return Err(invalid());
    }

    // (numerator, denominator) of the suffix multiplier in base units
    let (mul, div): (i128, i128) = match suffix {
        "" => (1, 1),
        "m" => (1, 1000),
        "k" => (1_000, 1),
        "M" => (1_000_000, 1),
        "G" => (1_000_000_000, 1),
        "T" => (1_000_000_000_000, 1),
        "P" => (1_000_000_000_000_000, 1),
        "Ki" => (KI, 1),
        "Mi" => (KI.pow(2), 1),
        "Gi" => (KI.pow(3), 1),
        "Ti" => (KI.pow(4), 1),
        "Pi" => (KI.pow(5), 1),
        _ => return Err(invalid()),
    };

    let (int_part, frac_part) = number.split_once('.').unwrap_or((number, ""));
    if frac_part.len() > 9 || (int_part.is_empty() && frac_part.is_empty()) {
        return Err(invalid());
    }
    let digits = format!("{}{}", int_part, frac_part);
    let mantissa: i128 = digits.parse().map_err(|_| invalid())?;
    let scale = 10i128.pow(frac_part.len() as u32);

    // Value in milli-units, kept exact as a fraction
    let numerator = mantissa * mul * 1000;
    let denominator = scale * div;

    let canonical = if is_milli_resource(resource) {
        ceil_div(numerator, denominator)
    } else {
        ceil_div(numerator, denominator * 1000)
    };

    let signed = if negative { -canonical } else { canonical };
    i64::try_from(signed).map_err(|_| invalid())
}

fn ceil_div(numerator: i128, denominator: i128) -> i128 {
    (numerator + denominator - 1) / denominator
}

/// Render canonical units for `resource` back into a quantity string
pub fn format_quantity(resource: &str, value: i64) -> Quantity {
    if is_milli_resource(resource) {
        if value % 1000 == 0 {
            return Quantity(format!("{}", value / 1000));
        }
        return Quantity(format!("{}m", value));
    }

    let v = value as i128;
    let binary = [
        ("Pi", KI.pow(5)),
        ("Ti", KI.pow(4)),
        ("Gi", KI.pow(3)),
        ("Mi", KI.pow(2)),
        ("Ki", KI),
    ];
    for (suffix, unit) in binary {
        if v != 0 && v % unit == 0 {
            return Quantity(format!("{}{}", v / unit, suffix));
        }
    }
    Quantity(format!("{}", value))
}

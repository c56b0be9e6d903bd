// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Capacity arithmetic: request rounding and byte-quantity parsing.

/// 1 MB (decimal).
pub const MB: u64 = 1000 * 1000;
/// 1 GB (decimal).
pub const GB: u64 = 1000 * 1000 * 1000;
/// 1 MiB.
pub const MIB: u64 = 1024 * 1024;
/// 1 GiB.
pub const GIB: u64 = 1024 * 1024 * 1024;

/// Rounds a requested capacity onto an allocation boundary.
///
/// Requests above 1 GiB round up to the next GiB multiple, everything else
/// rounds up to the next MiB multiple with a floor of 1 MiB. The branch
/// switches at exactly 1 GiB (a 1 GiB request stays 1 GiB); that
/// discontinuity is contractual and must not be smoothed over.
pub fn rounded_capacity(size: u64) -> u64 {
    if size > GIB {
        size.div_ceil(GIB) * GIB
    } else {
        (size.div_ceil(MIB) * MIB).max(MIB)
    }
}

#[derive(Clone, Debug, thiserror::Error, PartialEq, Eq)]
pub enum QuantityError {
    #[error("empty quantity")]
    Empty,
    #[error("invalid number in quantity {0:?}")]
    BadNumber(String),
    #[error("unrecognized unit suffix {suffix:?} in quantity {quantity:?}")]
    BadSuffix { quantity: String, suffix: String },
    #[error("quantity {0:?} overflows a byte count")]
    Overflow(String),
}

/// Parses a byte quantity such as `"512Mi"`, `"5G"` or `"1048576"`.
///
/// Binary suffixes (`Ki`, `Mi`, `Gi`, `Ti`, `Pi`) are powers of 1024;
/// decimal suffixes (`k`, `K`, `M`, `G`, `T`, `P`) are powers of 1000; no
/// suffix means bytes. Fractional values are accepted (`"1.5Gi"`) and
/// truncate to whole bytes. Unknown suffixes are rejected rather than
/// guessed at.
pub fn parse_quantity(s: &str) -> Result<u64, QuantityError> {
    let s = s.trim();
    if s.is_empty() {
        return Err(QuantityError::Empty);
    }

    let split = s
        .find(|c: char| !(c.is_ascii_digit() || c == '.'))
        .unwrap_or(s.len());
    let (number, suffix) = s.split_at(split);
    if number.is_empty() {
        return Err(QuantityError::BadNumber(s.to_string()));
    }

    let multiplier: u64 = match suffix {
        "" => 1,
        "k" | "K" => 1000,
        "M" => 1000 * 1000,
        "G" => GB,
        "T" => 1000 * GB,
        "P" => 1000 * 1000 * GB,
        "Ki" => 1024,
        "Mi" => MIB,
        "Gi" => GIB,
        "Ti" => 1024 * GIB,
        "Pi" => 1024 * 1024 * GIB,
        _ => {
            return Err(QuantityError::BadSuffix {
                quantity: s.to_string(),
                suffix: suffix.to_string(),
            });
        }
    };

    if number.contains('.') {
        let value: f64 = number
            .parse()
            .map_err(|_| QuantityError::BadNumber(s.to_string()))?;
        let bytes = value * multiplier as f64;
        if !bytes.is_finite() || bytes < 0.0 || bytes >= u64::MAX as f64 {
            return Err(QuantityError::Overflow(s.to_string()));
        }
        Ok(bytes as u64)
    } else {
        let value: u64 = number
            .parse()
            .map_err(|_| QuantityError::BadNumber(s.to_string()))?;
        value
            .checked_mul(multiplier)
            .ok_or_else(|| QuantityError::Overflow(s.to_string()))
    }
}

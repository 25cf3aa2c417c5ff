//! Decimal amounts in native units, held as 18-decimal minor units.
//!
//! Amounts cross the chain encoder only through fixed-point strings, so a
//! float quotient like `3e-3` can never reach `decimal_to_wei`.

use std::fmt;

use candid::Nat;
use num_bigint::BigUint;
use num_traits::{ToPrimitive, Zero};

use crate::error::{RelayError, RelayResult};

pub const NATIVE_DECIMALS: usize = 18;

#[derive(Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct Amount {
    wei: BigUint,
}

impl Amount {
    pub fn from_wei(wei: BigUint) -> Self {
        Self { wei }
    }

    pub fn from_nat(value: &Nat) -> Self {
        Self {
            wei: value.0.clone(),
        }
    }

    /// Parses a user-supplied decimal such as `"1.5"`. The value must be
    /// positive; exponents, signs and more than 18 fractional digits are
    /// rejected.
    pub fn parse(value: &str) -> RelayResult<Self> {
        let wei = decimal_to_wei(value.trim(), NATIVE_DECIMALS)?;
        if wei.is_zero() {
            return Err(RelayError::InvalidAmount {
                reason: format!("amount must be positive, got {:?}", value),
            });
        }
        Ok(Self { wei })
    }

    /// Converts a computed quotient. Non-finite and non-positive values, and
    /// values below one minor unit, are rejected.
    pub fn from_f64(value: f64) -> RelayResult<Self> {
        if !value.is_finite() || value <= 0.0 {
            return Err(RelayError::InvalidAmount {
                reason: format!("computed amount {} is not a positive finite number", value),
            });
        }
        let fixed = to_fixed(value, NATIVE_DECIMALS);
        let wei = decimal_to_wei(&fixed, NATIVE_DECIMALS)?;
        if wei.is_zero() {
            return Err(RelayError::InvalidAmount {
                reason: format!("computed amount {} rounds to zero", value),
            });
        }
        Ok(Self { wei })
    }

    pub fn wei(&self) -> &BigUint {
        &self.wei
    }

    pub fn to_nat(&self) -> Nat {
        Nat::from(self.wei.clone())
    }

    pub fn is_zero(&self) -> bool {
        self.wei.is_zero()
    }

    /// Exact fixed-point rendering with all 18 decimals.
    pub fn to_fixed_string(&self) -> String {
        wei_to_decimal(&self.wei, NATIVE_DECIMALS)
    }

    /// Rounded rendering for messages.
    pub fn display(&self, decimals: usize) -> String {
        to_fixed(self.as_f64(), decimals)
    }

    pub fn as_f64(&self) -> f64 {
        let whole = self.wei.to_f64().unwrap_or(f64::INFINITY);
        whole / 10f64.powi(NATIVE_DECIMALS as i32)
    }
}

impl fmt::Display for Amount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_fixed_string())
    }
}

impl fmt::Debug for Amount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Amount({})", self.to_fixed_string())
    }
}

/// Fixed-point formatting; Rust never switches `{:.N}` to scientific notation.
pub fn to_fixed(value: f64, decimals: usize) -> String {
    format!("{:.*}", decimals, value)
}

pub fn decimal_to_wei(value: &str, decimals: usize) -> RelayResult<BigUint> {
    let invalid = |reason: &str| RelayError::InvalidAmount {
        reason: format!("{} ({:?})", reason, value),
    };
    if value.is_empty() {
        return Err(invalid("empty amount"));
    }
    let (whole, fraction) = match value.split_once('.') {
        Some((whole, fraction)) => (whole, fraction),
        None => (value, ""),
    };
    if whole.is_empty() && fraction.is_empty() {
        return Err(invalid("not a decimal number"));
    }
    if !whole.bytes().all(|b| b.is_ascii_digit()) || !fraction.bytes().all(|b| b.is_ascii_digit())
    {
        return Err(invalid("not a decimal number"));
    }
    if fraction.len() > decimals {
        return Err(invalid("too many decimal places"));
    }

    let mut digits = String::with_capacity(whole.len() + decimals);
    digits.push_str(whole);
    digits.push_str(fraction);
    digits.extend(std::iter::repeat('0').take(decimals - fraction.len()));
    let digits = digits.trim_start_matches('0');
    if digits.is_empty() {
        return Ok(BigUint::zero());
    }
    BigUint::parse_bytes(digits.as_bytes(), 10).ok_or_else(|| invalid("not a decimal number"))
}

pub fn wei_to_decimal(wei: &BigUint, decimals: usize) -> String {
    let digits = wei.to_str_radix(10);
    if digits.len() <= decimals {
        format!("0.{}{}", "0".repeat(decimals - digits.len()), digits)
    } else {
        let (whole, fraction) = digits.split_at(digits.len() - decimals);
        format!("{}.{}", whole, fraction)
    }
}

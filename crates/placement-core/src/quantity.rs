//! Resource quantities.
//!
//! A [`Quantity`] is stored with milli precision, which is what the scheduler
//! needs for CPU (millicores) while still covering byte counts well into the
//! petabyte range. Parsing accepts the usual suffixes:
//!
//! - decimal: `n u m k M G T P E`
//! - binary: `Ki Mi Gi Ti Pi Ei`
//! - exponent: `1e3`, `2E6`
//!
//! Values that are finer than a milli are rounded up.

use crate::error::{CoreError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// A resource amount with milli precision.
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "QuantityRepr", into = "String")]
pub struct Quantity {
    millis: i64,
}

impl Quantity {
    /// The zero quantity.
    pub const ZERO: Self = Self { millis: 0 };

    /// Build a quantity from a milli value (e.g. millicores).
    #[must_use]
    pub const fn from_millis(millis: i64) -> Self {
        Self { millis }
    }

    /// Build a quantity from a whole value (e.g. bytes or cores).
    #[must_use]
    pub const fn from_value(value: i64) -> Self {
        Self {
            millis: value.saturating_mul(1000),
        }
    }

    /// The amount in thousandths.
    #[must_use]
    pub const fn milli_value(&self) -> i64 {
        self.millis
    }

    /// The amount in whole units, rounded up.
    #[must_use]
    pub const fn value(&self) -> i64 {
        let whole = self.millis.div_euclid(1000);
        if self.millis.rem_euclid(1000) == 0 {
            whole
        } else {
            whole + 1
        }
    }

    /// Check whether the quantity is zero.
    #[must_use]
    pub const fn is_zero(&self) -> bool {
        self.millis == 0
    }

    /// Parse a quantity string such as `500m`, `2Gi` or `1.5`.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::InvalidQuantity`] if the string is malformed or the
    /// value does not fit in milli precision.
    pub fn parse(input: &str) -> Result<Self> {
        let invalid = |reason| CoreError::InvalidQuantity {
            input: input.to_string(),
            reason,
        };

        let s = input.trim();
        let (negative, rest) = match s.as_bytes().first() {
            None => return Err(invalid("empty quantity")),
            Some(b'-') => (true, &s[1..]),
            Some(b'+') => (false, &s[1..]),
            Some(_) => (false, s),
        };

        let number_end = rest
            .find(|c: char| !(c.is_ascii_digit() || c == '.'))
            .unwrap_or(rest.len());
        let (number, suffix) = rest.split_at(number_end);
        let (int_part, frac_part) = number.split_once('.').unwrap_or((number, ""));
        if int_part.is_empty() && frac_part.is_empty() {
            return Err(invalid("missing numeric part"));
        }
        if frac_part.contains('.') {
            return Err(invalid("more than one decimal point"));
        }

        let digits = format!("{int_part}{frac_part}");
        let mantissa: i128 = digits.parse().map_err(|_| invalid("number too large"))?;
        let frac_len = i32::try_from(frac_part.len()).map_err(|_| invalid("number too large"))?;

        let mut exp10 = -frac_len;
        let mut binary_pow = 0u32;
        match suffix {
            "" => {}
            "Ki" => binary_pow = 1,
            "Mi" => binary_pow = 2,
            "Gi" => binary_pow = 3,
            "Ti" => binary_pow = 4,
            "Pi" => binary_pow = 5,
            "Ei" => binary_pow = 6,
            "n" => exp10 -= 9,
            "u" => exp10 -= 6,
            "m" => exp10 -= 3,
            "k" => exp10 += 3,
            "M" => exp10 += 6,
            "G" => exp10 += 9,
            "T" => exp10 += 12,
            "P" => exp10 += 15,
            "E" => exp10 += 18,
            other if other.starts_with(['e', 'E']) => {
                let exponent: i32 = other[1..]
                    .parse()
                    .map_err(|_| invalid("unknown suffix"))?;
                exp10 += exponent;
            }
            _ => return Err(invalid("unknown suffix")),
        }

        // Scale to thousandths.
        exp10 += 3;

        let overflow = || invalid("value out of range");
        let mut scaled = mantissa
            .checked_mul(1024i128.pow(binary_pow))
            .ok_or_else(overflow)?;
        if exp10 >= 0 {
            let factor = 10i128
                .checked_pow(exp10.unsigned_abs())
                .ok_or_else(overflow)?;
            scaled = scaled.checked_mul(factor).ok_or_else(overflow)?;
        } else {
            scaled = match 10i128.checked_pow(exp10.unsigned_abs()) {
                Some(divisor) => (scaled + divisor - 1) / divisor,
                None => i128::from(scaled > 0),
            };
        }
        if negative {
            scaled = -scaled;
        }

        let millis = i64::try_from(scaled).map_err(|_| overflow())?;
        Ok(Self { millis })
    }
}

impl FromStr for Quantity {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl fmt::Debug for Quantity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Quantity({self})")
    }
}

impl fmt::Display for Quantity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.millis % 1000 == 0 {
            write!(f, "{}", self.millis / 1000)
        } else {
            write!(f, "{}m", self.millis)
        }
    }
}

impl From<Quantity> for String {
    fn from(q: Quantity) -> Self {
        q.to_string()
    }
}

/// Wire forms accepted for a quantity: a bare integer, a float or a string.
#[derive(Deserialize)]
#[serde(untagged)]
enum QuantityRepr {
    Int(i64),
    Float(f64),
    Str(String),
}

impl TryFrom<QuantityRepr> for Quantity {
    type Error = CoreError;

    #[allow(clippy::cast_possible_truncation)]
    fn try_from(repr: QuantityRepr) -> Result<Self> {
        match repr {
            QuantityRepr::Int(v) => Ok(Self::from_value(v)),
            QuantityRepr::Float(v) if v.is_finite() => {
                Ok(Self::from_millis((v * 1000.0).ceil() as i64))
            }
            QuantityRepr::Float(v) => Err(CoreError::InvalidQuantity {
                input: v.to_string(),
                reason: "not a finite number",
            }),
            QuantityRepr::Str(s) => Self::parse(&s),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn q(s: &str) -> Quantity {
        Quantity::parse(s).unwrap()
    }

    #[test]
    fn parses_cpu_forms() {
        assert_eq!(q("500m").milli_value(), 500);
        assert_eq!(q("2").milli_value(), 2000);
        assert_eq!(q("1.5").milli_value(), 1500);
        assert_eq!(q("0.1").milli_value(), 100);
        assert_eq!(q("100u").milli_value(), 1);
    }

    #[test]
    fn parses_memory_forms() {
        assert_eq!(q("2Gi").value(), 2 * 1024 * 1024 * 1024);
        assert_eq!(q("500Mi").value(), 500 * 1024 * 1024);
        assert_eq!(q("1k").value(), 1000);
        assert_eq!(q("128974848").value(), 128_974_848);
        assert_eq!(q("129e6").value(), 129_000_000);
        assert_eq!(q("1P").value(), 1_000_000_000_000_000);
    }

    #[test]
    fn value_rounds_up() {
        assert_eq!(q("1500m").value(), 2);
        assert_eq!(q("-1500m").value(), -1);
        assert_eq!(q("-2").value(), -2);
    }

    #[test]
    fn rejects_malformed_input() {
        for bad in ["", "abc", "1.2.3", "5Xi", "m", "1e", "99999999999999999999999999999999999999999"] {
            assert!(Quantity::parse(bad).is_err(), "{bad} should be rejected");
        }
        assert!(Quantity::parse("9Ei").is_err());
    }

    #[test]
    fn display_prefers_whole_units() {
        assert_eq!(q("2").to_string(), "2");
        assert_eq!(q("250m").to_string(), "250m");
    }

    #[test]
    fn deserializes_numbers_and_strings() {
        let from_str: Quantity = serde_json::from_str("\"250m\"").unwrap();
        let from_int: Quantity = serde_json::from_str("4").unwrap();
        let from_float: Quantity = serde_json::from_str("0.5").unwrap();
        assert_eq!(from_str.milli_value(), 250);
        assert_eq!(from_int.milli_value(), 4000);
        assert_eq!(from_float.milli_value(), 500);
        assert_eq!(serde_json::to_string(&from_str).unwrap(), "\"250m\"");
    }
}

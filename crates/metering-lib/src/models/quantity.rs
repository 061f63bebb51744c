//! Resource quantities in fixed-point milli-units
//!
//! Accepts the Kubernetes quantity notation (`250m`, `2`, `1.5`, `512Mi`,
//! `10G`) and stores the amount as a signed count of milli-units so that cost
//! arithmetic never touches floating point.

use crate::error::{MeteringError, Result};
use serde::de::{self, Visitor};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::iter::Sum;
use std::ops::{Add, AddAssign};
use std::str::FromStr;

/// A resource amount measured in milli-units
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Quantity {
    milli: i64,
}

impl Quantity {
    pub const ZERO: Quantity = Quantity { milli: 0 };

    pub fn from_milli(milli: i64) -> Self {
        Self { milli }
    }

    pub fn from_units(units: i64) -> Self {
        Self {
            milli: units.saturating_mul(1000),
        }
    }

    pub fn milli_value(&self) -> i64 {
        self.milli
    }

    pub fn is_zero(&self) -> bool {
        self.milli == 0
    }

    pub fn is_negative(&self) -> bool {
        self.milli < 0
    }

    /// Parse a quantity string such as `500m`, `1.5`, `2Gi` or `100k`
    pub fn parse(input: &str) -> Result<Self> {
        let trimmed = input.trim();
        if trimmed.is_empty() {
            return Err(MeteringError::InvalidQuantity("empty quantity".into()));
        }

        let (negative, unsigned) = match trimmed.as_bytes()[0] {
            b'-' => (true, &trimmed[1..]),
            b'+' => (false, &trimmed[1..]),
            _ => (false, trimmed),
        };

        let split = unsigned
            .find(|c: char| !(c.is_ascii_digit() || c == '.'))
            .unwrap_or(unsigned.len());
        let (number, suffix) = unsigned.split_at(split);

        let (mantissa, scale) = parse_decimal(number)
            .ok_or_else(|| MeteringError::InvalidQuantity(format!("bad number in {input:?}")))?;

        // Multiplier expressed in milli-units per unit of the suffix
        let multiplier: i128 = match suffix {
            "m" => 1,
            "" => 1_000,
            "k" => 1_000 * 1_000,
            "M" => 1_000 * 1_000_000,
            "G" => 1_000 * 1_000_000_000,
            "T" => 1_000 * 1_000_000_000_000,
            "P" => 1_000 * 1_000_000_000_000_000,
            "Ki" => 1_000 * (1 << 10),
            "Mi" => 1_000 * (1 << 20),
            "Gi" => 1_000 * (1 << 30),
            "Ti" => 1_000 * (1 << 40),
            "Pi" => 1_000 * (1 << 50),
            other => {
                return Err(MeteringError::InvalidQuantity(format!(
                    "unsupported suffix {other:?} in {input:?}"
                )))
            }
        };

        let divisor = 10i128.pow(scale);
        let scaled = mantissa
            .checked_mul(multiplier)
            .ok_or_else(|| MeteringError::InvalidQuantity(format!("{input:?} overflows")))?;
        // Fractions of a milli-unit round up
        let mut milli = scaled / divisor;
        if scaled % divisor != 0 {
            milli += 1;
        }
        if negative {
            milli = -milli;
        }

        let milli = i64::try_from(milli)
            .map_err(|_| MeteringError::InvalidQuantity(format!("{input:?} overflows")))?;
        Ok(Self { milli })
    }
}

/// Returns (digits as integer, number of fractional digits)
fn parse_decimal(number: &str) -> Option<(i128, u32)> {
    if number.is_empty() {
        return None;
    }
    let mut parts = number.splitn(2, '.');
    let whole = parts.next().unwrap_or("");
    let fraction = parts.next().unwrap_or("");
    if whole.is_empty() && fraction.is_empty() {
        return None;
    }
    if fraction.contains('.') || fraction.len() > 18 {
        return None;
    }

    let digits = format!("{whole}{fraction}");
    let mantissa = digits.parse::<i128>().ok()?;
    Some((mantissa, fraction.len() as u32))
}

impl FromStr for Quantity {
    type Err = MeteringError;

    fn from_str(s: &str) -> Result<Self> {
        Quantity::parse(s)
    }
}

impl fmt::Display for Quantity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.milli % 1000 == 0 {
            write!(f, "{}", self.milli / 1000)
        } else {
            write!(f, "{}m", self.milli)
        }
    }
}

impl Add for Quantity {
    type Output = Quantity;

    fn add(self, rhs: Quantity) -> Quantity {
        Quantity::from_milli(self.milli.saturating_add(rhs.milli))
    }
}

impl AddAssign for Quantity {
    fn add_assign(&mut self, rhs: Quantity) {
        self.milli = self.milli.saturating_add(rhs.milli);
    }
}

impl Sum for Quantity {
    fn sum<I: Iterator<Item = Quantity>>(iter: I) -> Quantity {
        iter.fold(Quantity::ZERO, |acc, q| acc + q)
    }
}

impl Serialize for Quantity {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Quantity {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        struct QuantityVisitor;

        impl<'de> Visitor<'de> for QuantityVisitor {
            type Value = Quantity;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a quantity string or integer")
            }

            fn visit_str<E: de::Error>(self, v: &str) -> std::result::Result<Quantity, E> {
                Quantity::parse(v).map_err(E::custom)
            }

            fn visit_i64<E: de::Error>(self, v: i64) -> std::result::Result<Quantity, E> {
                Ok(Quantity::from_units(v))
            }

            fn visit_u64<E: de::Error>(self, v: u64) -> std::result::Result<Quantity, E> {
                i64::try_from(v)
                    .map(Quantity::from_units)
                    .map_err(|_| E::custom("quantity overflows"))
            }
        }

        deserializer.deserialize_any(QuantityVisitor)
    }
}

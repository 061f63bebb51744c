//! Usage to cost conversion

use crate::error::{InvariantViolation, Result};
use crate::models::{Quantity, ResourcePrice};

/// How a fractional cost is rounded to minor units
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rounding {
    /// Workload resources
    Floor,
    /// Quota-derived storage
    Ceil,
}

/// Cost of `used` at `price`: `used_milli * price / unit_milli`, rounded.
///
/// The product is computed in 128 bits; results beyond `i64` saturate.
pub fn cost_of(
    resource: &str,
    used: Quantity,
    price: &ResourcePrice,
    rounding: Rounding,
) -> Result<i64> {
    let unit = i128::from(price.unit.milli_value());
    if unit <= 0 {
        return Err(InvariantViolation::ZeroPriceUnit {
            resource: resource.to_string(),
        }
        .into());
    }

    let numerator = i128::from(used.milli_value()) * i128::from(price.price);
    let cost = match rounding {
        Rounding::Floor => numerator.div_euclid(unit),
        Rounding::Ceil => -(-numerator).div_euclid(unit),
    };

    Ok(i64::try_from(cost).unwrap_or(if cost < 0 { i64::MIN } else { i64::MAX }))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn price(unit: &str, price: i64) -> ResourcePrice {
        ResourcePrice {
            unit: Quantity::parse(unit).unwrap(),
            price,
            describe: None,
        }
    }

    #[test]
    fn test_storage_rounding_asymmetry() {
        let per_unit = price("1", 2);

        let exact = Quantity::from_milli(1500);
        assert_eq!(cost_of("storage", exact, &per_unit, Rounding::Ceil).unwrap(), 3);
        assert_eq!(cost_of("storage", exact, &per_unit, Rounding::Floor).unwrap(), 3);

        let short = Quantity::from_milli(1499);
        assert_eq!(cost_of("storage", short, &per_unit, Rounding::Floor).unwrap(), 2);
        assert_eq!(cost_of("storage", short, &per_unit, Rounding::Ceil).unwrap(), 3);
    }

    #[test]
    fn test_binary_units() {
        // 3Gi of memory at 4 per Gi
        let memory = Quantity::parse("3Gi").unwrap();
        assert_eq!(
            cost_of("memory", memory, &price("1Gi", 4), Rounding::Floor).unwrap(),
            12
        );

        // 500m cpu at 10 per core
        let cpu = Quantity::parse("500m").unwrap();
        assert_eq!(cost_of("cpu", cpu, &price("1", 10), Rounding::Floor).unwrap(), 5);
    }

    #[test]
    fn test_large_values_do_not_overflow() {
        let huge = Quantity::parse("1Pi").unwrap();
        let cost = cost_of("storage", huge, &price("1m", i64::MAX), Rounding::Floor).unwrap();
        assert_eq!(cost, i64::MAX);
    }

    #[test]
    fn test_zero_unit_is_rejected() {
        let err = cost_of("cpu", Quantity::from_units(1), &price("0", 1), Rounding::Floor)
            .unwrap_err();
        assert_eq!(err.label(), "invariant");
    }
}

use crate::error::AutopayError;
use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};
use std::fmt;

/// A monetary amount for a debit, at least one cent.
///
/// Smaller values are rejected at construction since they would go out as
/// `0.00`, so any `Amount` in a transaction can be submitted as-is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Serialize, Deserialize)]
#[serde(try_from = "Decimal", into = "Decimal")]
pub struct Amount(Decimal);

impl Amount {
    pub const MIN: Decimal = Decimal::from_parts(1, 0, 0, false, 2);

    pub fn new(value: Decimal) -> Result<Self, AutopayError> {
        if value >= Self::MIN {
            Ok(Self(value))
        } else {
            Err(AutopayError::ValidationError(format!(
                "Amount must be at least {}",
                Self::MIN
            )))
        }
    }

    pub fn value(&self) -> Decimal {
        self.0
    }

    /// Formats the amount with exactly two decimal places, as the processor expects.
    pub fn to_wire(&self) -> String {
        let mut rounded = self
            .0
            .round_dp_with_strategy(2, RoundingStrategy::MidpointAwayFromZero);
        rounded.rescale(2);
        rounded.to_string()
    }
}

impl TryFrom<Decimal> for Amount {
    type Error = AutopayError;

    fn try_from(value: Decimal) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<Amount> for Decimal {
    fn from(amount: Amount) -> Self {
        amount.0
    }
}

impl fmt::Display for Amount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_wire())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_amount_validation() {
        assert!(Amount::new(dec!(1.0)).is_ok());
        assert!(matches!(
            Amount::new(dec!(0.0)),
            Err(AutopayError::ValidationError(_))
        ));
        assert!(matches!(
            Amount::new(dec!(-1.0)),
            Err(AutopayError::ValidationError(_))
        ));
    }

    #[test]
    fn test_amount_wire_format_has_two_places() {
        assert_eq!(Amount::new(dec!(150)).unwrap().to_wire(), "150.00");
        assert_eq!(Amount::new(dec!(99.5)).unwrap().to_wire(), "99.50");
        assert_eq!(Amount::new(dec!(10.005)).unwrap().to_wire(), "10.01");
        assert_eq!(Amount::new(dec!(0.01)).unwrap().to_wire(), "0.01");
    }

    #[test]
    fn test_sub_cent_amount_is_rejected() {
        assert!(matches!(
            Amount::new(dec!(0.001)),
            Err(AutopayError::ValidationError(_))
        ));
        assert!(matches!(
            Amount::new(dec!(0.009)),
            Err(AutopayError::ValidationError(_))
        ));
        assert!(serde_json::from_str::<Amount>("\"0.004\"").is_err());
    }

    #[test]
    fn test_amount_deserialization_rejects_non_positive() {
        let ok: Amount = serde_json::from_str("\"12.34\"").unwrap();
        assert_eq!(ok.value(), dec!(12.34));
        assert!(serde_json::from_str::<Amount>("\"0\"").is_err());
    }
}

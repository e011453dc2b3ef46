use super::ids::{AuthorizationId, CustomerId, LoanId};
use chrono::{NaiveDate, NaiveDateTime};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// The slice of a loan record this crate reads from the loan system.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Loan {
    pub id: LoanId,
    pub customer_id: CustomerId,
    /// Loan-level payment account, taking precedence over the customer default.
    pub payment_override: Option<AuthorizationId>,
}

/// Next unpaid instalment of a loan. The amount is taken as reported and may
/// be zero when the instalment is already covered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DuePayment {
    pub due_date: NaiveDate,
    pub amount: Decimal,
}

/// A payment account chosen for a loan through this crate. Once stored it
/// replaces the loan book's override, including when it clears it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentOverride {
    pub loan_id: LoanId,
    pub authorization_id: Option<AuthorizationId>,
    pub updated_at: NaiveDateTime,
}

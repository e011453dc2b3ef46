use super::ids::{CustomerId, LoanId, SettlementId, TransactionId};
use super::money::Amount;
use super::transaction::AchTransaction;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

/// Ledger entry for funds received from a cleared debit.
///
/// Keyed naturally by `transaction_id`: a transaction settles at most once.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SettlementRecord {
    pub id: SettlementId,
    pub transaction_id: TransactionId,
    pub loan_id: LoanId,
    pub customer_id: CustomerId,
    pub amount: Amount,
    pub received_on: NaiveDate,
}

impl SettlementRecord {
    pub fn for_transaction(txn: &AchTransaction, received_on: NaiveDate) -> Self {
        Self {
            id: SettlementId::generate(),
            transaction_id: txn.id,
            loan_id: txn.loan_id.clone(),
            customer_id: txn.customer_id.clone(),
            amount: txn.amount,
            received_on,
        }
    }
}

use super::authorization::{Authorization, AuthorizationChange};
use super::ids::{AuthorizationId, CustomerId, LoanId, TransactionId};
use super::loan::{DuePayment, Loan, PaymentOverride};
use super::processor::{
    Notice, PaymentRequest, PaymentSubmission, ProcessorResult, StatusReport, TokenizeRequest,
    VerifiedAccount,
};
use super::settlement::SettlementRecord;
use super::transaction::{AchTransaction, TransactionFilter};
use crate::error::Result;
use async_trait::async_trait;
use chrono::{NaiveDate, NaiveDateTime};
use std::sync::Arc;

#[async_trait]
pub trait AuthorizationStore: Send + Sync {
    async fn get(&self, id: AuthorizationId) -> Result<Option<Authorization>>;
    async fn for_customer(&self, customer_id: &CustomerId) -> Result<Vec<Authorization>>;
    async fn for_loan(&self, loan_id: &LoanId) -> Result<Vec<Authorization>>;
    /// Persists a new authorization after checking it against the customer's
    /// existing ones, as one atomic step (see [`admit`](super::authorization::admit)).
    async fn insert(&self, authorization: Authorization) -> Result<Authorization>;
    /// Applies a change to an existing authorization and whichever siblings
    /// it touches, as one atomic step. Returns the updated target.
    async fn apply(&self, id: AuthorizationId, change: AuthorizationChange)
    -> Result<Authorization>;
}

#[async_trait]
pub trait TransactionStore: Send + Sync {
    /// Inserts or replaces `txn`. A `notification_sent` flag already set on
    /// the stored record is kept.
    async fn store(&self, txn: AchTransaction) -> Result<()>;
    async fn get(&self, id: TransactionId) -> Result<Option<AchTransaction>>;
    async fn find_by_processor_id(&self, processor_id: &str) -> Result<Option<AchTransaction>>;
    /// Matching transactions ordered by scheduled date, then creation time.
    async fn query(&self, filter: &TransactionFilter) -> Result<Vec<AchTransaction>>;
    /// Sets `notification_sent` if it is not set yet. Returns whether this
    /// call set it, i.e. whether the caller may send the outcome notice.
    async fn claim_notification(&self, id: TransactionId) -> Result<bool>;
}

#[async_trait]
pub trait SettlementStore: Send + Sync {
    /// Stores `record` unless the transaction already has one. Returns the
    /// record that is stored afterwards and whether it was created by this call.
    async fn insert_if_absent(&self, record: SettlementRecord) -> Result<(SettlementRecord, bool)>;
}

/// The loan system's view of loans, owners and repayment schedules.
#[async_trait]
pub trait LoanBook: Send + Sync {
    async fn active_loans(&self) -> Result<Vec<Loan>>;
    async fn get(&self, id: &LoanId) -> Result<Option<Loan>>;
    async fn loans_for_customer(&self, customer_id: &CustomerId) -> Result<Vec<Loan>>;
    /// First unpaid instalment due on or after `from`.
    async fn next_due_payment(&self, id: &LoanId, from: NaiveDate) -> Result<Option<DuePayment>>;
}

/// Loan payment accounts set through this crate, kept apart from the loan
/// book so they outlive a reload of the snapshot.
#[async_trait]
pub trait PaymentOverrideStore: Send + Sync {
    async fn find(&self, loan_id: &LoanId) -> Result<Option<PaymentOverride>>;
    async fn save(&self, entry: PaymentOverride) -> Result<()>;
}

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, notice: &Notice) -> Result<()>;
}

/// The remote ACH gateway.
#[async_trait]
pub trait PaymentProcessor: Send + Sync {
    async fn tokenize_and_verify(&self, request: &TokenizeRequest)
    -> ProcessorResult<VerifiedAccount>;
    async fn create_payment(&self, request: &PaymentRequest) -> ProcessorResult<PaymentSubmission>;
    async fn get_payment_status(&self, processor_transaction_id: &str)
    -> ProcessorResult<StatusReport>;
    async fn get_status_by_date(&self, date: NaiveDate) -> ProcessorResult<Vec<StatusReport>>;
    async fn cancel_payment(&self, processor_transaction_id: &str) -> ProcessorResult<()>;
    /// Decodes a webhook body in the processor's configured response format.
    fn decode_status_report(&self, raw: &str) -> ProcessorResult<StatusReport>;
}

pub trait Clock: Send + Sync {
    fn now(&self) -> NaiveDateTime;

    fn today(&self) -> NaiveDate {
        self.now().date()
    }
}

pub type AuthorizationStoreRef = Arc<dyn AuthorizationStore>;
pub type TransactionStoreRef = Arc<dyn TransactionStore>;
pub type SettlementStoreRef = Arc<dyn SettlementStore>;
pub type LoanBookRef = Arc<dyn LoanBook>;
pub type PaymentOverrideStoreRef = Arc<dyn PaymentOverrideStore>;
pub type NotifierRef = Arc<dyn Notifier>;
pub type PaymentProcessorRef = Arc<dyn PaymentProcessor>;
pub type ClockRef = Arc<dyn Clock>;

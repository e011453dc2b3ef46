use super::ids::{AuthorizationId, CustomerId, LoanId, SettlementId, TransactionId};
use super::money::Amount;
use crate::error::{AutopayError, Result};
use chrono::{Duration, NaiveDate, NaiveDateTime};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Return codes that end a retry chain immediately, with their bank meaning.
pub const NON_RETRYABLE_RETURN_CODES: [(&str, &str); 9] = [
    ("R02", "Account Closed"),
    ("R03", "No Account"),
    ("R04", "Invalid Account Number"),
    ("R07", "Authorization Revoked"),
    ("R08", "Payment Stopped"),
    ("R10", "Customer Advises Unauthorized"),
    ("R16", "Account Frozen"),
    ("R20", "Non-Transaction Account"),
    ("R29", "Corporate Not Authorized"),
];

/// Bank-reported reason a debit did not clear, e.g. `R01` (insufficient funds).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ReturnCode(String);

impl ReturnCode {
    pub fn new(code: impl AsRef<str>) -> Self {
        Self(code.as_ref().trim().to_ascii_uppercase())
    }

    /// Builds a code from an optional processor field, treating blanks as absent.
    pub fn from_field(code: Option<&str>) -> Option<Self> {
        code.map(str::trim)
            .filter(|c| !c.is_empty())
            .map(ReturnCode::new)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_retryable(&self) -> bool {
        self.description().is_none()
    }

    /// Meaning of a non-retryable code; `None` for every retryable one.
    pub fn description(&self) -> Option<&'static str> {
        NON_RETRYABLE_RETURN_CODES
            .iter()
            .find(|(code, _)| *code == self.0)
            .map(|(_, description)| *description)
    }
}

impl fmt::Display for ReturnCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TransactionStatus {
    Scheduled,
    Initiated,
    Processing,
    Success,
    Returned,
    Failed,
    Cancelled,
}

impl TransactionStatus {
    /// Success and Cancelled are final; nothing reported later changes them.
    pub fn is_terminal(&self) -> bool {
        matches!(self, TransactionStatus::Success | TransactionStatus::Cancelled)
    }

    /// Statuses that still count against a due date when scanning for
    /// upcoming payments.
    pub fn is_open(&self) -> bool {
        !matches!(
            self,
            TransactionStatus::Cancelled | TransactionStatus::Failed | TransactionStatus::Returned
        )
    }

    pub fn is_failure(&self) -> bool {
        matches!(self, TransactionStatus::Failed | TransactionStatus::Returned)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionStatus::Scheduled => "Scheduled",
            TransactionStatus::Initiated => "Initiated",
            TransactionStatus::Processing => "Processing",
            TransactionStatus::Success => "Success",
            TransactionStatus::Returned => "Returned",
            TransactionStatus::Failed => "Failed",
            TransactionStatus::Cancelled => "Cancelled",
        }
    }
}

impl fmt::Display for TransactionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a debit did not go through.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FailureDetails {
    pub failure_code: Option<String>,
    pub failure_reason: Option<String>,
    pub return_code: Option<ReturnCode>,
}

/// One scheduled or submitted debit against a loan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AchTransaction {
    pub id: TransactionId,
    pub authorization_id: AuthorizationId,
    pub loan_id: LoanId,
    pub customer_id: CustomerId,
    pub amount: Amount,
    pub status: TransactionStatus,
    pub scheduled_date: NaiveDate,
    /// Due date of the instalment this debit pays.
    pub due_date: Option<NaiveDate>,
    pub processor_transaction_id: Option<String>,
    /// Last status string the processor reported, verbatim.
    pub processor_status: Option<String>,
    pub failure_code: Option<String>,
    pub failure_reason: Option<String>,
    pub return_code: Option<ReturnCode>,
    pub retry_attempt: u32,
    pub max_retries: u32,
    pub next_retry_date: Option<NaiveDate>,
    /// Shared by every transaction of a retry lineage; the id of the first one.
    pub chain_id: Option<TransactionId>,
    pub initiated_at: Option<NaiveDateTime>,
    pub settlement_date: Option<NaiveDate>,
    pub completed_at: Option<NaiveDateTime>,
    pub settlement_id: Option<SettlementId>,
    pub notification_sent: bool,
    pub created_at: NaiveDateTime,
}

impl AchTransaction {
    #[allow(clippy::too_many_arguments)]
    pub fn scheduled(
        authorization_id: AuthorizationId,
        loan_id: LoanId,
        customer_id: CustomerId,
        amount: Amount,
        scheduled_date: NaiveDate,
        due_date: Option<NaiveDate>,
        max_retries: u32,
        now: NaiveDateTime,
    ) -> Self {
        Self {
            id: TransactionId::generate(),
            authorization_id,
            loan_id,
            customer_id,
            amount,
            status: TransactionStatus::Scheduled,
            scheduled_date,
            due_date,
            processor_transaction_id: None,
            processor_status: None,
            failure_code: None,
            failure_reason: None,
            return_code: None,
            retry_attempt: 0,
            max_retries,
            next_retry_date: None,
            chain_id: None,
            initiated_at: None,
            settlement_date: None,
            completed_at: None,
            settlement_id: None,
            notification_sent: false,
            created_at: now,
        }
    }

    fn expect_status(&self, allowed: &[TransactionStatus], message: &str) -> Result<()> {
        if allowed.contains(&self.status) {
            Ok(())
        } else {
            Err(AutopayError::InvalidTransition(format!(
                "{message} (transaction {} is {})",
                self.id, self.status
            )))
        }
    }

    fn expect_not_terminal(&self) -> Result<()> {
        if self.status.is_terminal() {
            return Err(AutopayError::InvalidTransition(format!(
                "Transaction {} is {} and can no longer change",
                self.id, self.status
            )));
        }
        Ok(())
    }

    pub fn chain_root(&self) -> TransactionId {
        self.chain_id.unwrap_or(self.id)
    }

    /// Records a submission the processor accepted.
    pub fn record_initiated(
        &mut self,
        processor_transaction_id: String,
        processor_status: String,
        now: NaiveDateTime,
        settlement_date: NaiveDate,
    ) -> Result<()> {
        self.expect_status(
            &[TransactionStatus::Scheduled],
            "Only scheduled transactions can be initiated",
        )?;
        self.status = TransactionStatus::Initiated;
        self.processor_transaction_id = Some(processor_transaction_id);
        self.processor_status = Some(processor_status);
        self.initiated_at = Some(now);
        self.settlement_date = Some(settlement_date);
        Ok(())
    }

    /// Records a submission the processor refused. No retry is scheduled for
    /// submission failures.
    pub fn record_submission_failure(
        &mut self,
        failure_code: Option<String>,
        failure_reason: String,
    ) -> Result<()> {
        self.expect_status(
            &[TransactionStatus::Scheduled],
            "Only scheduled transactions can be initiated",
        )?;
        self.status = TransactionStatus::Failed;
        self.failure_code = failure_code;
        self.failure_reason = Some(failure_reason);
        Ok(())
    }

    pub fn mark_processing(&mut self, processor_status: &str) -> Result<()> {
        self.expect_status(
            &[TransactionStatus::Initiated],
            "Only initiated transactions move to processing",
        )?;
        self.status = TransactionStatus::Processing;
        self.processor_status = Some(processor_status.to_string());
        Ok(())
    }

    pub fn mark_success(&mut self, processor_status: Option<&str>, now: NaiveDateTime) -> Result<()> {
        if self.status == TransactionStatus::Cancelled {
            return Err(AutopayError::InvalidTransition(format!(
                "Transaction {} is cancelled",
                self.id
            )));
        }
        self.status = TransactionStatus::Success;
        self.completed_at = Some(now);
        self.next_retry_date = None;
        if let Some(status) = processor_status {
            self.processor_status = Some(status.to_string());
        }
        Ok(())
    }

    /// Moves to Returned (when a return code is present) or Failed, and
    /// schedules a retry date when the lineage is still eligible.
    ///
    /// Returns whether a retry was scheduled. The retry transaction itself is
    /// created later by the retry sweep.
    pub fn mark_failed(
        &mut self,
        details: FailureDetails,
        now: NaiveDateTime,
        retry_delay_days: u32,
    ) -> Result<bool> {
        self.expect_not_terminal()?;
        self.status = if details.return_code.is_some() {
            TransactionStatus::Returned
        } else {
            TransactionStatus::Failed
        };
        self.failure_code = details.failure_code;
        self.failure_reason = details.failure_reason;
        self.return_code = details.return_code;
        self.completed_at = Some(now);

        if self.should_retry(self.return_code.as_ref()) {
            self.next_retry_date = Some(now.date() + Duration::days(i64::from(retry_delay_days)));
            Ok(true)
        } else {
            self.next_retry_date = None;
            Ok(false)
        }
    }

    pub fn should_retry(&self, return_code: Option<&ReturnCode>) -> bool {
        if self.retry_attempt >= self.max_retries {
            return false;
        }
        return_code.is_none_or(ReturnCode::is_retryable)
    }

    pub fn cancel(&mut self, reason: Option<String>) -> Result<()> {
        self.expect_status(
            &[TransactionStatus::Scheduled, TransactionStatus::Initiated],
            "Only scheduled or initiated transactions can be cancelled",
        )?;
        self.status = TransactionStatus::Cancelled;
        self.failure_reason = Some(reason.unwrap_or_else(|| "Cancelled by user".to_string()));
        Ok(())
    }

    /// Cancellation reported by the processor; accepted from any non-terminal status.
    pub fn mark_cancelled_upstream(&mut self, processor_status: &str) -> Result<()> {
        self.expect_not_terminal()?;
        self.status = TransactionStatus::Cancelled;
        self.processor_status = Some(processor_status.to_string());
        self.next_retry_date = None;
        Ok(())
    }

    /// Builds the next attempt of this lineage as a fresh Scheduled
    /// transaction. The caller is responsible for checking the mandate.
    pub fn next_attempt(&self, today: NaiveDate, now: NaiveDateTime) -> Result<AchTransaction> {
        self.expect_status(
            &[TransactionStatus::Failed, TransactionStatus::Returned],
            "Only failed or returned transactions can be retried",
        )?;
        if self.retry_attempt >= self.max_retries {
            return Err(AutopayError::InvalidTransition(format!(
                "Maximum retry attempts reached for transaction {}",
                self.id
            )));
        }
        let mut retry = AchTransaction::scheduled(
            self.authorization_id,
            self.loan_id.clone(),
            self.customer_id.clone(),
            self.amount,
            today,
            self.due_date,
            self.max_retries,
            now,
        );
        retry.retry_attempt = self.retry_attempt + 1;
        retry.chain_id = Some(self.chain_root());
        Ok(retry)
    }

    pub fn clear_retry(&mut self) {
        self.next_retry_date = None;
    }
}

/// Query-by-filter over stored transactions. Empty criteria match everything.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransactionFilter {
    pub statuses: Vec<TransactionStatus>,
    pub authorization_id: Option<AuthorizationId>,
    pub loan_id: Option<LoanId>,
    pub scheduled_on_or_before: Option<NaiveDate>,
    pub scheduled_on_or_after: Option<NaiveDate>,
    pub retry_due_on_or_before: Option<NaiveDate>,
}

impl TransactionFilter {
    pub fn with_statuses(statuses: &[TransactionStatus]) -> Self {
        Self {
            statuses: statuses.to_vec(),
            ..Self::default()
        }
    }

    pub fn authorization(mut self, id: AuthorizationId) -> Self {
        self.authorization_id = Some(id);
        self
    }

    pub fn loan(mut self, id: LoanId) -> Self {
        self.loan_id = Some(id);
        self
    }

    pub fn scheduled_on_or_before(mut self, date: NaiveDate) -> Self {
        self.scheduled_on_or_before = Some(date);
        self
    }

    pub fn scheduled_on_or_after(mut self, date: NaiveDate) -> Self {
        self.scheduled_on_or_after = Some(date);
        self
    }

    pub fn retry_due_on_or_before(mut self, date: NaiveDate) -> Self {
        self.retry_due_on_or_before = Some(date);
        self
    }

    pub fn matches(&self, txn: &AchTransaction) -> bool {
        (self.statuses.is_empty() || self.statuses.contains(&txn.status))
            && self
                .authorization_id
                .is_none_or(|id| id == txn.authorization_id)
            && self.loan_id.as_ref().is_none_or(|loan| *loan == txn.loan_id)
            && self
                .scheduled_on_or_before
                .is_none_or(|date| txn.scheduled_date <= date)
            && self
                .scheduled_on_or_after
                .is_none_or(|date| txn.scheduled_date >= date)
            && self
                .retry_due_on_or_before
                .is_none_or(|date| txn.next_retry_date.is_some_and(|due| due <= date))
    }
}

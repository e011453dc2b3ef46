//! Values exchanged with the ACH processor and the notification channel.
//!
//! Processor calls never fail with an [`AutopayError`](crate::error::AutopayError):
//! every outcome, including transport trouble, comes back as a
//! [`ProcessorFailure`] for the caller to branch on.

use super::authorization::{
    AccountNumber, AccountType, CheckType, ProcessorToken, RoutingNumber, TokenSource,
    VerificationStatus,
};
use super::ids::{CustomerId, LoanId, TransactionId};
use super::money::Amount;
use super::transaction::AchTransaction;
use chrono::NaiveDate;
use serde::Serialize;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{message}")]
pub struct ProcessorFailure {
    pub code: Option<String>,
    pub message: String,
}

impl ProcessorFailure {
    pub fn new(code: Option<String>, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn message(message: impl Into<String>) -> Self {
        Self::new(None, message)
    }
}

pub type ProcessorResult<T> = std::result::Result<T, ProcessorFailure>;

/// Raw bank details submitted once for tokenization.
#[derive(Debug, Clone)]
pub struct TokenizeRequest {
    pub routing_number: RoutingNumber,
    pub account_number: AccountNumber,
    pub account_type: AccountType,
    pub customer_name: String,
    pub check_type: Option<CheckType>,
}

/// A tokenized account together with the processor's verification verdict.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerifiedAccount {
    pub token: ProcessorToken,
    pub bank_name: Option<String>,
    pub verification: VerificationStatus,
    pub verification_code: Option<String>,
    pub verification_description: Option<String>,
    pub routing_last4: String,
    pub account_last4: String,
    pub reference_id: Option<String>,
}

#[derive(Debug, Clone)]
pub struct PaymentRequest {
    pub amount: Amount,
    pub token: ProcessorToken,
    pub token_source: TokenSource,
    pub customer_name: String,
    pub description: String,
    /// Our transaction id, echoed back by webhooks.
    pub reference_id: TransactionId,
    pub sec_code: String,
    pub customer_ip: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PaymentSubmission {
    pub processor_transaction_id: String,
    pub status: String,
    pub reference_id: Option<String>,
}

/// One status observation for a payment, from a poll or a webhook.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StatusReport {
    pub processor_transaction_id: Option<String>,
    pub reference_id: Option<String>,
    pub status: Option<String>,
    pub return_code: Option<String>,
    pub return_description: Option<String>,
    pub response_code: Option<String>,
    pub description: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum NoticeKind {
    Upcoming,
    Success,
    Failure,
}

/// A customer-facing message about one debit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Notice {
    pub kind: NoticeKind,
    pub customer_id: CustomerId,
    pub loan_id: LoanId,
    pub transaction_id: TransactionId,
    pub amount: Amount,
    pub scheduled_date: NaiveDate,
    pub failure_reason: Option<String>,
}

impl Notice {
    pub fn for_transaction(kind: NoticeKind, txn: &AchTransaction) -> Self {
        Self {
            kind,
            customer_id: txn.customer_id.clone(),
            loan_id: txn.loan_id.clone(),
            transaction_id: txn.id,
            amount: txn.amount,
            scheduled_date: txn.scheduled_date,
            failure_reason: txn.failure_reason.clone(),
        }
    }

    pub fn subject(&self) -> String {
        match self.kind {
            NoticeKind::Upcoming => format!("Upcoming Payment - {}", self.amount),
            NoticeKind::Success => format!("Payment Successful - {}", self.amount),
            NoticeKind::Failure => format!("Payment Failed - {}", self.amount),
        }
    }

    pub fn template(&self) -> &'static str {
        match self.kind {
            NoticeKind::Upcoming => "ach_payment_upcoming",
            NoticeKind::Success => "ach_payment_success",
            NoticeKind::Failure => "ach_payment_failure",
        }
    }
}

//! Brings local transactions in line with what the processor reports, from
//! webhook pushes and from polling.
//!
//! Applying the same report twice leaves the same state behind: terminal
//! transactions are never touched again, and a failure is not re-applied to a
//! transaction that already failed.

use super::lifecycle::TransactionLifecycle;
use super::{AutopayContext, SweepReport};
use crate::domain::ids::TransactionId;
use crate::domain::processor::StatusReport;
use crate::domain::transaction::{
    AchTransaction, FailureDetails, ReturnCode, TransactionFilter, TransactionStatus,
};
use crate::error::{AutopayError, Result};
use chrono::NaiveDate;
use serde::Serialize;
use tracing::{debug, error, info, warn};

/// Internal status a processor payment status maps to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderOutcome {
    Scheduled,
    Processing,
    Success,
    Returned,
    Failed,
    Cancelled,
}

/// Maps a processor payment status, case-insensitively. Unknown statuses
/// map to `None`.
pub fn map_provider_status(raw: &str) -> Option<ProviderOutcome> {
    let outcome = match raw.trim().to_ascii_lowercase().as_str() {
        "scheduled" => ProviderOutcome::Scheduled,
        "inprocess" => ProviderOutcome::Processing,
        "cleared" | "settled" | "success" => ProviderOutcome::Success,
        "returned" | "returned-nsf" | "returned-other" | "chargedback" => {
            ProviderOutcome::Returned
        }
        "cancelled" => ProviderOutcome::Cancelled,
        "rejected" | "failed" | "declined" => ProviderOutcome::Failed,
        _ => return None,
    };
    Some(outcome)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ReconcileOutcome {
    /// The transaction changed status.
    Applied,
    /// Nothing to do; the report agrees with what is stored.
    Unchanged,
    /// The transaction is Success or Cancelled and stays that way.
    TerminalIgnored,
    /// Only the raw processor status was refreshed.
    RawStatusOnly,
    /// No local transaction matches the report.
    Unmatched,
}

/// Body returned for every webhook delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct WebhookAck {
    pub status: &'static str,
}

impl WebhookAck {
    pub const PROCESSED: WebhookAck = WebhookAck {
        status: "processed",
    };
}

#[derive(Clone)]
pub struct Reconciler {
    ctx: AutopayContext,
    lifecycle: TransactionLifecycle,
}

impl Reconciler {
    pub fn new(ctx: AutopayContext) -> Self {
        let lifecycle = TransactionLifecycle::new(ctx.clone());
        Self { ctx, lifecycle }
    }

    /// Looks the transaction up by our own reference first, then by the
    /// processor's id.
    async fn find_transaction(&self, report: &StatusReport) -> Result<Option<AchTransaction>> {
        if let Some(reference) = report.reference_id.as_deref()
            && let Ok(id) = reference.parse::<TransactionId>()
            && let Some(txn) = self.ctx.transactions.get(id).await?
        {
            return Ok(Some(txn));
        }
        match report.processor_transaction_id.as_deref() {
            Some(processor_id) => self.ctx.transactions.find_by_processor_id(processor_id).await,
            None => Ok(None),
        }
    }

    pub async fn apply_report(&self, report: &StatusReport) -> Result<ReconcileOutcome> {
        if report.reference_id.is_none() && report.processor_transaction_id.is_none() {
            warn!(status = ?report.status, "Status report names no transaction");
            return Ok(ReconcileOutcome::Unmatched);
        }
        match self.find_transaction(report).await? {
            Some(txn) => self.apply_to(txn, report).await,
            None => {
                warn!(
                    processor_transaction_id = ?report.processor_transaction_id,
                    reference_id = ?report.reference_id,
                    "No transaction matches status report"
                );
                Ok(ReconcileOutcome::Unmatched)
            }
        }
    }

    /// Applies one report to a known transaction.
    pub async fn apply_to(
        &self,
        mut txn: AchTransaction,
        report: &StatusReport,
    ) -> Result<ReconcileOutcome> {
        let raw = report.status.clone().unwrap_or_default();
        if txn.status.is_terminal() {
            debug!(transaction_id = %txn.id, status = %txn.status, reported = %raw, "Ignoring report for terminal transaction");
            return Ok(ReconcileOutcome::TerminalIgnored);
        }

        let outcome = match map_provider_status(&raw) {
            Some(ProviderOutcome::Success) => {
                self.lifecycle.mark_success(txn, Some(&raw)).await?;
                ReconcileOutcome::Applied
            }
            Some(ProviderOutcome::Returned) if txn.status.is_failure() => ReconcileOutcome::Unchanged,
            Some(ProviderOutcome::Returned) => {
                txn.processor_status = Some(raw.clone());
                let details = FailureDetails {
                    failure_code: report.return_code.clone(),
                    failure_reason: report.return_description.clone(),
                    return_code: ReturnCode::from_field(report.return_code.as_deref()),
                };
                self.lifecycle.mark_failed(txn, details).await?;
                ReconcileOutcome::Applied
            }
            Some(ProviderOutcome::Failed) if txn.status.is_failure() => ReconcileOutcome::Unchanged,
            Some(ProviderOutcome::Failed) => {
                txn.processor_status = Some(raw.clone());
                let details = FailureDetails {
                    failure_code: Some(
                        report
                            .return_code
                            .clone()
                            .unwrap_or_else(|| "FAILED".to_string()),
                    ),
                    failure_reason: Some(
                        report
                            .return_description
                            .clone()
                            .unwrap_or_else(|| "Payment failed".to_string()),
                    ),
                    return_code: None,
                };
                self.lifecycle.mark_failed(txn, details).await?;
                ReconcileOutcome::Applied
            }
            Some(ProviderOutcome::Processing) if txn.status == TransactionStatus::Initiated => {
                txn.mark_processing(&raw)?;
                self.ctx.transactions.store(txn).await?;
                ReconcileOutcome::Applied
            }
            Some(ProviderOutcome::Cancelled) => {
                txn.mark_cancelled_upstream(&raw)?;
                info!(transaction_id = %txn.id, "Processor cancelled ACH debit");
                self.ctx.transactions.store(txn).await?;
                ReconcileOutcome::Applied
            }
            Some(ProviderOutcome::Processing | ProviderOutcome::Scheduled) | None => {
                if raw.is_empty() || txn.processor_status.as_deref() == Some(raw.as_str()) {
                    ReconcileOutcome::Unchanged
                } else {
                    if map_provider_status(&raw).is_none() {
                        warn!(transaction_id = %txn.id, reported = %raw, "Unknown processor status");
                    }
                    txn.processor_status = Some(raw);
                    self.ctx.transactions.store(txn).await?;
                    ReconcileOutcome::RawStatusOnly
                }
            }
        };
        Ok(outcome)
    }

    /// Handles one webhook body. Every delivery is acknowledged, whatever
    /// happens to it; problems are logged.
    pub async fn handle_webhook(&self, raw: &str) -> WebhookAck {
        let report = match self.ctx.processor.decode_status_report(raw) {
            Ok(report) => report,
            Err(failure) => {
                warn!(error = %failure, "Undecodable webhook body");
                return WebhookAck::PROCESSED;
            }
        };
        match self.apply_report(&report).await {
            Ok(outcome) => info!(
                processor_transaction_id = ?report.processor_transaction_id,
                status = ?report.status,
                outcome = ?outcome,
                "Webhook processed"
            ),
            Err(e) => error!(
                processor_transaction_id = ?report.processor_transaction_id,
                error = %e,
                "Webhook processing failed"
            ),
        }
        WebhookAck::PROCESSED
    }

    /// Pulls every status change the processor tracked on `date`.
    pub async fn reconcile_by_date(&self, date: NaiveDate) -> Result<SweepReport> {
        let reports = self
            .ctx
            .processor
            .get_status_by_date(date)
            .await
            .map_err(|failure| AutopayError::ProcessorError(failure.message))?;

        let mut sweep = SweepReport::default();
        for report in &reports {
            sweep.examined += 1;
            match self.apply_report(report).await {
                Ok(ReconcileOutcome::Applied) => sweep.acted += 1,
                Ok(_) => sweep.skipped += 1,
                Err(e) => {
                    sweep.failed += 1;
                    error!(
                        processor_transaction_id = ?report.processor_transaction_id,
                        error = %e,
                        "Failed to apply tracked status"
                    );
                }
            }
        }
        Ok(sweep)
    }

    /// Polls the processor for every Initiated or Processing transaction.
    pub async fn reconcile_pending(&self) -> Result<SweepReport> {
        let pending = self
            .ctx
            .transactions
            .query(&TransactionFilter::with_statuses(&[
                TransactionStatus::Initiated,
                TransactionStatus::Processing,
            ]))
            .await?;

        let mut sweep = SweepReport::default();
        for txn in pending {
            sweep.examined += 1;
            let Some(processor_id) = txn.processor_transaction_id.clone() else {
                sweep.skipped += 1;
                continue;
            };
            let txn_id = txn.id;
            let result = match self.ctx.processor.get_payment_status(&processor_id).await {
                Ok(report) => self.apply_to(txn, &report).await,
                Err(failure) => Err(AutopayError::ProcessorError(failure.message)),
            };
            match result {
                Ok(ReconcileOutcome::Applied) => sweep.acted += 1,
                Ok(_) => sweep.skipped += 1,
                Err(e) => {
                    sweep.failed += 1;
                    warn!(transaction_id = %txn_id, error = %e, "Status poll failed");
                }
            }
        }
        Ok(sweep)
    }
}

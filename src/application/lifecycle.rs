use super::AutopayContext;
use crate::domain::authorization::Authorization;
use crate::domain::ids::TransactionId;
use crate::domain::loan::Loan;
use crate::domain::money::Amount;
use crate::domain::processor::{Notice, NoticeKind, PaymentRequest};
use crate::domain::settlement::SettlementRecord;
use crate::domain::transaction::{AchTransaction, FailureDetails, TransactionStatus};
use crate::error::{AutopayError, Result};
use chrono::{Duration, NaiveDate};
use tracing::{error, info, warn};

/// Drives single transactions through their states, with the side effects
/// each transition carries: processor calls, settlement records and notices.
#[derive(Clone)]
pub struct TransactionLifecycle {
    ctx: AutopayContext,
}

impl TransactionLifecycle {
    pub fn new(ctx: AutopayContext) -> Self {
        Self { ctx }
    }

    async fn load(&self, id: TransactionId) -> Result<AchTransaction> {
        self.ctx
            .transactions
            .get(id)
            .await?
            .ok_or_else(|| AutopayError::NotFound(format!("Transaction {id}")))
    }

    async fn active_authorization(&self, txn: &AchTransaction) -> Result<Authorization> {
        match self.ctx.authorizations.get(txn.authorization_id).await? {
            Some(auth) if auth.is_active() => Ok(auth),
            Some(auth) => Err(AutopayError::InvalidTransition(format!(
                "Authorization {} is {}",
                auth.id, auth.status
            ))),
            None => Err(AutopayError::NotFound(format!(
                "Authorization {}",
                txn.authorization_id
            ))),
        }
    }

    /// Creates a Scheduled debit for a loan against `authorization`.
    pub async fn schedule(
        &self,
        authorization: &Authorization,
        loan: &Loan,
        amount: Amount,
        scheduled_date: NaiveDate,
        due_date: Option<NaiveDate>,
    ) -> Result<AchTransaction> {
        let txn = AchTransaction::scheduled(
            authorization.id,
            loan.id.clone(),
            loan.customer_id.clone(),
            amount,
            scheduled_date,
            due_date,
            self.ctx.settings.schedule.max_retries,
            self.ctx.clock.now(),
        );
        self.ctx.transactions.store(txn.clone()).await?;
        info!(
            transaction_id = %txn.id,
            loan_id = %txn.loan_id,
            amount = %txn.amount,
            scheduled_date = %txn.scheduled_date,
            "Scheduled ACH debit"
        );
        Ok(txn)
    }

    pub async fn initiate(&self, id: TransactionId) -> Result<AchTransaction> {
        let txn = self.load(id).await?;
        self.initiate_loaded(txn).await
    }

    /// Submits a Scheduled debit. A processor refusal is recorded on the
    /// transaction (Failed, no retry) and is not an error of this call.
    pub async fn initiate_loaded(&self, mut txn: AchTransaction) -> Result<AchTransaction> {
        if txn.status != TransactionStatus::Scheduled {
            return Err(AutopayError::InvalidTransition(format!(
                "Only scheduled transactions can be initiated (transaction {} is {})",
                txn.id, txn.status
            )));
        }
        let auth = self.active_authorization(&txn).await?;

        let request = PaymentRequest {
            amount: txn.amount,
            token: auth.token.clone(),
            token_source: auth.token_source,
            customer_name: auth.account_holder.clone(),
            description: format!("Loan payment for {}", txn.loan_id),
            reference_id: txn.id,
            sec_code: auth.consent.sec_code.clone(),
            customer_ip: auth.consent.ip_address.clone(),
        };

        match self.ctx.processor.create_payment(&request).await {
            Ok(submission) => {
                let now = self.ctx.clock.now();
                let settlement_estimate =
                    now.date() + Duration::days(i64::from(self.ctx.settings.schedule.settlement_days));
                txn.record_initiated(
                    submission.processor_transaction_id,
                    submission.status,
                    now,
                    settlement_estimate,
                )?;
                info!(
                    transaction_id = %txn.id,
                    processor_transaction_id = txn.processor_transaction_id.as_deref().unwrap_or_default(),
                    "Initiated ACH debit"
                );
            }
            Err(failure) => {
                warn!(
                    transaction_id = %txn.id,
                    code = failure.code.as_deref().unwrap_or_default(),
                    error = %failure,
                    "Processor refused ACH debit"
                );
                txn.record_submission_failure(failure.code, failure.message)?;
            }
        }
        self.ctx.transactions.store(txn.clone()).await?;
        Ok(txn)
    }

    /// Marks the debit as cleared, books the settlement and tells the customer.
    ///
    /// The settlement record is created at most once per transaction; if
    /// booking it fails the transaction still counts as successful.
    pub async fn mark_success(
        &self,
        mut txn: AchTransaction,
        processor_status: Option<&str>,
    ) -> Result<AchTransaction> {
        let now = self.ctx.clock.now();
        txn.mark_success(processor_status, now)?;

        let record = SettlementRecord::for_transaction(&txn, now.date());
        match self.ctx.settlements.insert_if_absent(record).await {
            Ok((record, created)) => {
                if created {
                    info!(transaction_id = %txn.id, settlement_id = %record.id, "Booked settlement");
                }
                txn.settlement_id = Some(record.id);
            }
            Err(e) => error!(transaction_id = %txn.id, error = %e, "Failed to book settlement"),
        }

        self.ctx.transactions.store(txn.clone()).await?;
        info!(transaction_id = %txn.id, loan_id = %txn.loan_id, "ACH debit succeeded");

        self.notify_outcome(&mut txn, NoticeKind::Success).await?;
        Ok(txn)
    }

    /// Marks the debit as Returned or Failed and stamps a retry date when the
    /// lineage may still be retried.
    pub async fn mark_failed(
        &self,
        mut txn: AchTransaction,
        details: FailureDetails,
    ) -> Result<AchTransaction> {
        let now = self.ctx.clock.now();
        let retry = txn.mark_failed(details, now, self.ctx.settings.schedule.retry_delay_days)?;
        self.ctx.transactions.store(txn.clone()).await?;

        if retry {
            info!(
                transaction_id = %txn.id,
                next_retry_date = ?txn.next_retry_date,
                attempt = txn.retry_attempt + 1,
                max_retries = txn.max_retries,
                "Retry scheduled"
            );
        } else {
            warn!(
                transaction_id = %txn.id,
                status = %txn.status,
                return_code = txn.return_code.as_ref().map(|c| c.as_str()).unwrap_or_default(),
                "ACH debit failed without retry"
            );
        }

        self.notify_outcome(&mut txn, NoticeKind::Failure).await?;
        Ok(txn)
    }

    pub async fn cancel(&self, id: TransactionId, reason: Option<String>) -> Result<AchTransaction> {
        let txn = self.load(id).await?;
        self.cancel_loaded(txn, reason).await
    }

    /// Cancels a Scheduled or Initiated debit. For an Initiated one the
    /// processor is asked to cancel first; its refusal is logged only.
    pub async fn cancel_loaded(
        &self,
        mut txn: AchTransaction,
        reason: Option<String>,
    ) -> Result<AchTransaction> {
        if !matches!(
            txn.status,
            TransactionStatus::Scheduled | TransactionStatus::Initiated
        ) {
            return Err(AutopayError::InvalidTransition(format!(
                "Only scheduled or initiated transactions can be cancelled (transaction {} is {})",
                txn.id, txn.status
            )));
        }

        if txn.status == TransactionStatus::Initiated
            && let Some(processor_id) = txn.processor_transaction_id.as_deref()
            && let Err(failure) = self.ctx.processor.cancel_payment(processor_id).await
        {
            warn!(
                transaction_id = %txn.id,
                processor_transaction_id = processor_id,
                error = %failure,
                "Processor did not confirm cancellation"
            );
        }

        txn.cancel(reason)?;
        self.ctx.transactions.store(txn.clone()).await?;
        info!(
            transaction_id = %txn.id,
            reason = txn.failure_reason.as_deref().unwrap_or_default(),
            "ACH debit cancelled"
        );
        Ok(txn)
    }

    pub async fn create_retry(&self, id: TransactionId) -> Result<AchTransaction> {
        let txn = self.load(id).await?;
        self.create_retry_loaded(txn).await
    }

    /// Creates the next attempt of a failed lineage, dated today, and clears
    /// the predecessor's retry date.
    pub async fn create_retry_loaded(&self, mut txn: AchTransaction) -> Result<AchTransaction> {
        if txn.retry_attempt >= txn.max_retries {
            return Err(AutopayError::InvalidTransition(format!(
                "Maximum retry attempts reached for transaction {}",
                txn.id
            )));
        }
        self.active_authorization(&txn).await?;

        let retry = txn.next_attempt(self.ctx.clock.today(), self.ctx.clock.now())?;
        self.ctx.transactions.store(retry.clone()).await?;
        txn.clear_retry();
        self.ctx.transactions.store(txn.clone()).await?;

        info!(
            transaction_id = %retry.id,
            chain_id = %retry.chain_root(),
            attempt = retry.retry_attempt,
            max_retries = retry.max_retries,
            "Created retry"
        );
        Ok(retry)
    }

    /// Announces an upcoming debit. Errors are logged; the flag guarding
    /// outcome notices is left alone.
    pub async fn send_upcoming_notice(&self, txn: &AchTransaction) {
        if !self.ctx.settings.notifications.upcoming {
            return;
        }
        let notice = Notice::for_transaction(NoticeKind::Upcoming, txn);
        if let Err(e) = self.ctx.notifier.notify(&notice).await {
            error!(transaction_id = %txn.id, error = %e, "Failed to send upcoming notice");
        }
    }

    /// Sends the outcome notice unless one was already sent for this
    /// transaction. The flag is claimed in the store before sending, so two
    /// reports racing on the same transaction produce one notice; a send that
    /// fails after the claim is logged and not repeated.
    async fn notify_outcome(&self, txn: &mut AchTransaction, kind: NoticeKind) -> Result<()> {
        let toggles = &self.ctx.settings.notifications;
        let enabled = match kind {
            NoticeKind::Success => toggles.success,
            NoticeKind::Failure => toggles.failure,
            NoticeKind::Upcoming => toggles.upcoming,
        };
        if !enabled || txn.notification_sent {
            return Ok(());
        }
        let claimed = self.ctx.transactions.claim_notification(txn.id).await?;
        txn.notification_sent = true;
        if !claimed {
            return Ok(());
        }

        let notice = Notice::for_transaction(kind, txn);
        if let Err(e) = self.ctx.notifier.notify(&notice).await {
            error!(transaction_id = %txn.id, error = %e, "Failed to send notice");
        }
        Ok(())
    }
}

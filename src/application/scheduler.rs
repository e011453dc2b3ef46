use super::lifecycle::TransactionLifecycle;
use super::reconciliation::Reconciler;
use super::registry::AuthorizationRegistry;
use super::{AutopayContext, SweepReport};
use crate::domain::loan::Loan;
use crate::domain::money::Amount;
use crate::domain::transaction::{AchTransaction, TransactionFilter, TransactionStatus};
use crate::error::{AutopayError, Result};
use crate::settings::StatusCheckStrategy;
use chrono::{Duration, NaiveDate};
use std::fmt;
use std::str::FromStr;
use tokio::time::{MissedTickBehavior, interval};
use tracing::{debug, error, info, warn};

const HOUR: std::time::Duration = std::time::Duration::from_secs(60 * 60);
const DAY: std::time::Duration = std::time::Duration::from_secs(24 * 60 * 60);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Job {
    UpcomingScan,
    InitiationSweep,
    RetrySweep,
    StatusCheck,
}

impl Job {
    pub const ALL: [Job; 4] = [
        Job::UpcomingScan,
        Job::InitiationSweep,
        Job::RetrySweep,
        Job::StatusCheck,
    ];

    /// Daily jobs in the order they run: retries created today are submitted
    /// by the initiation sweep that follows.
    pub const DAILY: [Job; 3] = [Job::UpcomingScan, Job::RetrySweep, Job::InitiationSweep];

    pub fn name(&self) -> &'static str {
        match self {
            Job::UpcomingScan => "upcoming-scan",
            Job::InitiationSweep => "initiation-sweep",
            Job::RetrySweep => "retry-sweep",
            Job::StatusCheck => "status-check",
        }
    }

    /// How often the job runs under [`SchedulerDriver::run_forever`].
    pub fn period(&self) -> std::time::Duration {
        match self {
            Job::StatusCheck => HOUR,
            _ => DAY,
        }
    }
}

impl fmt::Display for Job {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Job {
    type Err = AutopayError;

    fn from_str(s: &str) -> Result<Self> {
        Job::ALL
            .into_iter()
            .find(|job| job.name() == s.trim())
            .ok_or_else(|| AutopayError::ValidationError(format!("Unknown job '{s}'")))
    }
}

/// Runs the periodic jobs. Items are handled one at a time; a failing item
/// is logged and counted and the sweep carries on.
#[derive(Clone)]
pub struct SchedulerDriver {
    ctx: AutopayContext,
    registry: AuthorizationRegistry,
    lifecycle: TransactionLifecycle,
    reconciler: Reconciler,
}

impl SchedulerDriver {
    pub fn new(ctx: AutopayContext) -> Self {
        Self {
            registry: AuthorizationRegistry::new(ctx.clone()),
            lifecycle: TransactionLifecycle::new(ctx.clone()),
            reconciler: Reconciler::new(ctx.clone()),
            ctx,
        }
    }

    pub async fn run(&self, job: Job) -> Result<SweepReport> {
        if !self.ctx.settings.enabled {
            debug!(job = %job, "ACH autopay disabled, skipping job");
            return Ok(SweepReport::default());
        }
        match job {
            Job::UpcomingScan => self.upcoming_payment_scan().await,
            Job::InitiationSweep => self.initiation_sweep().await,
            Job::RetrySweep => self.retry_sweep().await,
            Job::StatusCheck => self.status_check().await,
        }
    }

    async fn run_logged(&self, job: Job) {
        match self.run(job).await {
            Ok(report) => info!(
                job = %job,
                examined = report.examined,
                acted = report.acted,
                skipped = report.skipped,
                failed = report.failed,
                "Job finished"
            ),
            Err(e) => error!(job = %job, error = %e, "Job failed"),
        }
    }

    /// Runs the status check hourly and the other jobs daily, until the task
    /// is dropped. The first ticks fire immediately.
    pub async fn run_forever(&self) {
        let mut hourly = interval(Job::StatusCheck.period());
        let mut daily = interval(Job::DAILY[0].period());
        hourly.set_missed_tick_behavior(MissedTickBehavior::Delay);
        daily.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!("Starting job scheduler");
        loop {
            tokio::select! {
                _ = hourly.tick() => self.run_logged(Job::StatusCheck).await,
                _ = daily.tick() => {
                    for job in Job::DAILY {
                        self.run_logged(job).await;
                    }
                }
            }
        }
    }

    /// Creates the Scheduled transaction and sends the upcoming notice for
    /// every instalment due `advance_notification_days` from today.
    pub async fn upcoming_payment_scan(&self) -> Result<SweepReport> {
        let schedule = &self.ctx.settings.schedule;
        let today = self.ctx.clock.today();
        let target = today + Duration::days(i64::from(schedule.advance_notification_days));
        let lead = Duration::days(i64::from(schedule.initiation_lead_days));

        let mut sweep = SweepReport::default();
        for loan in self.ctx.loans.active_loans().await? {
            sweep.examined += 1;
            match self.scan_loan(&loan, today, target, lead).await {
                Ok(true) => sweep.acted += 1,
                Ok(false) => sweep.skipped += 1,
                Err(e) => {
                    sweep.failed += 1;
                    error!(loan_id = %loan.id, error = %e, "Upcoming payment scan failed for loan");
                }
            }
        }
        Ok(sweep)
    }

    async fn scan_loan(
        &self,
        loan: &Loan,
        today: NaiveDate,
        target: NaiveDate,
        lead: Duration,
    ) -> Result<bool> {
        let Some(authorization) = self.registry.resolve_payment_account(&loan.id).await? else {
            return Ok(false);
        };
        let Some(due) = self.ctx.loans.next_due_payment(&loan.id, today).await? else {
            return Ok(false);
        };
        if due.due_date != target {
            return Ok(false);
        }
        let Ok(amount) = Amount::new(due.amount) else {
            debug!(loan_id = %loan.id, amount = %due.amount, "Nothing due");
            return Ok(false);
        };

        let scheduled_date = due.due_date - lead;
        let existing = self
            .ctx
            .transactions
            .query(
                &TransactionFilter::default()
                    .loan(loan.id.clone())
                    .scheduled_on_or_after(scheduled_date),
            )
            .await?;
        if existing.iter().any(|t| t.status.is_open()) {
            debug!(loan_id = %loan.id, due_date = %due.due_date, "Debit already scheduled");
            return Ok(false);
        }

        let txn = self
            .lifecycle
            .schedule(&authorization, loan, amount, scheduled_date, Some(due.due_date))
            .await?;
        self.lifecycle.send_upcoming_notice(&txn).await;
        Ok(true)
    }

    /// Submits every Scheduled transaction dated today or earlier, unless the
    /// daily cutoff has passed.
    pub async fn initiation_sweep(&self) -> Result<SweepReport> {
        let now = self.ctx.clock.now();
        if let Some(cutoff) = self.ctx.settings.schedule.cutoff_time
            && now.time() > cutoff
        {
            info!(%cutoff, "Past initiation cutoff, skipping sweep");
            return Ok(SweepReport::default());
        }

        let due = self
            .ctx
            .transactions
            .query(
                &TransactionFilter::with_statuses(&[TransactionStatus::Scheduled])
                    .scheduled_on_or_before(now.date()),
            )
            .await?;

        let mut sweep = SweepReport::default();
        for txn in due {
            sweep.examined += 1;
            let txn_id = txn.id;
            match self.ctx.authorizations.get(txn.authorization_id).await {
                Ok(Some(auth)) if auth.is_active() => {}
                Ok(_) => {
                    warn!(transaction_id = %txn_id, "Authorization not active, leaving debit scheduled");
                    sweep.skipped += 1;
                    continue;
                }
                Err(e) => {
                    error!(transaction_id = %txn_id, error = %e, "Failed to load authorization");
                    sweep.failed += 1;
                    continue;
                }
            }
            match self.lifecycle.initiate_loaded(txn).await {
                Ok(txn) if txn.status == TransactionStatus::Initiated => sweep.acted += 1,
                Ok(_) => sweep.failed += 1,
                Err(e) => {
                    sweep.failed += 1;
                    error!(transaction_id = %txn_id, error = %e, "Initiation failed");
                }
            }
        }
        Ok(sweep)
    }

    /// Creates retries for failed debits whose retry date has come.
    pub async fn retry_sweep(&self) -> Result<SweepReport> {
        let today = self.ctx.clock.today();
        let due = self
            .ctx
            .transactions
            .query(
                &TransactionFilter::with_statuses(&[
                    TransactionStatus::Failed,
                    TransactionStatus::Returned,
                ])
                .retry_due_on_or_before(today),
            )
            .await?;

        let mut sweep = SweepReport::default();
        for txn in due {
            sweep.examined += 1;
            let txn_id = txn.id;
            match self.retry_one(txn).await {
                Ok(true) => sweep.acted += 1,
                Ok(false) => sweep.skipped += 1,
                Err(e) => {
                    sweep.failed += 1;
                    error!(transaction_id = %txn_id, error = %e, "Retry creation failed");
                }
            }
        }
        Ok(sweep)
    }

    async fn retry_one(&self, mut txn: AchTransaction) -> Result<bool> {
        let active = self
            .ctx
            .authorizations
            .get(txn.authorization_id)
            .await?
            .is_some_and(|auth| auth.is_active());
        if !active || txn.retry_attempt >= txn.max_retries {
            info!(transaction_id = %txn.id, "Retry no longer possible, clearing retry date");
            txn.clear_retry();
            self.ctx.transactions.store(txn).await?;
            return Ok(false);
        }
        self.lifecycle.create_retry_loaded(txn).await?;
        Ok(true)
    }

    /// Pulls status changes from the processor by date over the lookback
    /// window, or polls each open transaction, as configured.
    pub async fn status_check(&self) -> Result<SweepReport> {
        let schedule = &self.ctx.settings.schedule;
        match schedule.status_check {
            StatusCheckStrategy::PerTransaction => self.reconciler.reconcile_pending().await,
            StatusCheckStrategy::ByDate => {
                let today = self.ctx.clock.today();
                let mut sweep = SweepReport::default();
                for offset in 0..=schedule.status_lookback_days {
                    let date = today - Duration::days(i64::from(offset));
                    match self.reconciler.reconcile_by_date(date).await {
                        Ok(report) => sweep.absorb(report),
                        Err(e) => {
                            sweep.failed += 1;
                            warn!(%date, error = %e, "Status tracking query failed");
                        }
                    }
                }
                Ok(sweep)
            }
        }
    }
}

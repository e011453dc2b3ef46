#![allow(dead_code)]

use ach_autopay::application::AutopayContext;
use ach_autopay::application::lifecycle::TransactionLifecycle;
use ach_autopay::application::registry::{AuthorizationRegistry, LinkRequest};
use ach_autopay::domain::authorization::{
    AccountType, Authorization, ProcessorToken, VerificationStatus,
};
use ach_autopay::domain::ids::{CustomerId, LoanId};
use ach_autopay::domain::loan::{DuePayment, Loan};
use ach_autopay::domain::money::Amount;
use ach_autopay::domain::ports::PaymentProcessor;
use ach_autopay::domain::processor::{
    PaymentRequest, PaymentSubmission, ProcessorFailure, ProcessorResult, StatusReport,
    TokenizeRequest, VerifiedAccount,
};
use ach_autopay::domain::transaction::AchTransaction;
use ach_autopay::infrastructure::clock::FixedClock;
use ach_autopay::infrastructure::in_memory::{
    InMemoryAuthorizationStore, InMemoryLoanBook, InMemoryPaymentOverrideStore,
    InMemorySettlementStore, InMemoryTransactionStore,
};
use ach_autopay::infrastructure::notifier::RecordingNotifier;
use ach_autopay::settings::{Secret, Settings};
use async_trait::async_trait;
use chrono::{NaiveDate, NaiveDateTime};
use rust_decimal::Decimal;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

pub fn date(y: i32, m: u32, d: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(y, m, d).unwrap()
}

/// Monday 2026-03-02, 10:30.
pub fn start() -> NaiveDateTime {
    date(2026, 3, 2).and_hms_opt(10, 30, 0).unwrap()
}

pub fn enabled_settings() -> Settings {
    let mut settings = Settings::default();
    settings.enabled = true;
    settings.processor.merchant_id = "M-100".to_string();
    settings.processor.merchant_gate_id = "gate".to_string();
    settings.processor.merchant_gate_key = Secret::new("key");
    settings
}

#[derive(Default)]
struct Script {
    verification: Option<String>,
    payment_refusal: Option<ProcessorFailure>,
    submitted: Vec<PaymentRequest>,
    statuses: HashMap<String, StatusReport>,
    by_date: HashMap<NaiveDate, Vec<StatusReport>>,
    cancelled: Vec<String>,
}

/// A processor that answers from a script and records what it was asked.
#[derive(Default)]
pub struct ScriptedProcessor {
    script: Mutex<Script>,
}

impl ScriptedProcessor {
    /// Verification grade returned by the next tokenizations (`POS` when unset).
    pub fn verify_as(&self, code: &str) {
        self.script.lock().unwrap().verification = Some(code.to_string());
    }

    pub fn refuse_payments(&self, code: &str, message: &str) {
        self.script.lock().unwrap().payment_refusal =
            Some(ProcessorFailure::new(Some(code.to_string()), message));
    }

    pub fn report_status(&self, report: StatusReport) {
        let key = report.processor_transaction_id.clone().unwrap_or_default();
        self.script.lock().unwrap().statuses.insert(key, report);
    }

    pub fn report_on(&self, date: NaiveDate, report: StatusReport) {
        self.script
            .lock()
            .unwrap()
            .by_date
            .entry(date)
            .or_default()
            .push(report);
    }

    pub fn submitted(&self) -> Vec<PaymentRequest> {
        self.script.lock().unwrap().submitted.clone()
    }

    pub fn cancelled(&self) -> Vec<String> {
        self.script.lock().unwrap().cancelled.clone()
    }
}

#[async_trait]
impl PaymentProcessor for ScriptedProcessor {
    async fn tokenize_and_verify(
        &self,
        request: &TokenizeRequest,
    ) -> ProcessorResult<VerifiedAccount> {
        let code = self
            .script
            .lock()
            .unwrap()
            .verification
            .clone()
            .unwrap_or_else(|| "POS".to_string());
        Ok(VerifiedAccount {
            token: ProcessorToken::new(format!("tok-{}", request.account_number.last4())),
            bank_name: Some("First Test Bank".to_string()),
            verification: VerificationStatus::from_code(&code),
            verification_code: Some(code),
            verification_description: None,
            routing_last4: request.routing_number.last4(),
            account_last4: request.account_number.last4(),
            reference_id: None,
        })
    }

    async fn create_payment(&self, request: &PaymentRequest) -> ProcessorResult<PaymentSubmission> {
        let mut script = self.script.lock().unwrap();
        if let Some(refusal) = script.payment_refusal.clone() {
            return Err(refusal);
        }
        script.submitted.push(request.clone());
        Ok(PaymentSubmission {
            processor_transaction_id: format!("ACHQ-{}", script.submitted.len()),
            status: "Scheduled".to_string(),
            reference_id: Some(request.reference_id.to_string()),
        })
    }

    async fn get_payment_status(&self, processor_transaction_id: &str) -> ProcessorResult<StatusReport> {
        self.script
            .lock()
            .unwrap()
            .statuses
            .get(processor_transaction_id)
            .cloned()
            .ok_or_else(|| ProcessorFailure::message("Transaction not found"))
    }

    async fn get_status_by_date(&self, date: NaiveDate) -> ProcessorResult<Vec<StatusReport>> {
        Ok(self
            .script
            .lock()
            .unwrap()
            .by_date
            .get(&date)
            .cloned()
            .unwrap_or_default())
    }

    async fn cancel_payment(&self, processor_transaction_id: &str) -> ProcessorResult<()> {
        self.script
            .lock()
            .unwrap()
            .cancelled
            .push(processor_transaction_id.to_string());
        Ok(())
    }

    /// Reads a flat JSON body: `TransactionID`, `ReferenceID`, `Status`, `ReturnCode`.
    fn decode_status_report(&self, raw: &str) -> ProcessorResult<StatusReport> {
        let body: Value =
            serde_json::from_str(raw).map_err(|e| ProcessorFailure::message(e.to_string()))?;
        let field = |name: &str| body.get(name).and_then(Value::as_str).map(str::to_string);
        Ok(StatusReport {
            processor_transaction_id: field("TransactionID"),
            reference_id: field("ReferenceID"),
            status: field("Status"),
            return_code: field("ReturnCode"),
            return_description: field("ReturnDescription"),
            ..StatusReport::default()
        })
    }
}

/// In-memory wiring around a scripted processor, a recording notifier and a
/// clock that only moves when told to.
pub struct Harness {
    pub ctx: AutopayContext,
    pub processor: Arc<ScriptedProcessor>,
    pub notifier: Arc<RecordingNotifier>,
    pub clock: Arc<FixedClock>,
    pub loans: Arc<InMemoryLoanBook>,
    pub settlements: Arc<InMemorySettlementStore>,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_settings(enabled_settings())
    }

    pub fn with_settings(settings: Settings) -> Self {
        let processor = Arc::new(ScriptedProcessor::default());
        let notifier = Arc::new(RecordingNotifier::new());
        let clock = Arc::new(FixedClock::new(start()));
        let loans = Arc::new(InMemoryLoanBook::new());
        let settlements = Arc::new(InMemorySettlementStore::new());
        let ctx = AutopayContext {
            authorizations: Arc::new(InMemoryAuthorizationStore::new()),
            transactions: Arc::new(InMemoryTransactionStore::new()),
            settlements: settlements.clone(),
            loans: loans.clone(),
            overrides: Arc::new(InMemoryPaymentOverrideStore::new()),
            processor: processor.clone(),
            notifier: notifier.clone(),
            clock: clock.clone(),
            settings: Arc::new(settings),
        };
        Self {
            ctx,
            processor,
            notifier,
            clock,
            loans,
            settlements,
        }
    }

    pub fn registry(&self) -> AuthorizationRegistry {
        AuthorizationRegistry::new(self.ctx.clone())
    }

    pub fn lifecycle(&self) -> TransactionLifecycle {
        TransactionLifecycle::new(self.ctx.clone())
    }

    pub async fn add_loan(&self, loan: &str, customer: &str) -> Loan {
        let loan = Loan {
            id: LoanId::from(loan),
            customer_id: CustomerId::from(customer),
            payment_override: None,
        };
        self.loans.upsert_loan(loan.clone()).await;
        loan
    }

    pub async fn add_instalment(&self, loan: &Loan, due_date: NaiveDate, amount: Decimal) {
        self.loans
            .add_instalment(&loan.id, DuePayment { due_date, amount })
            .await
            .unwrap();
    }

    pub fn link_request(customer: &str, loan: Option<&str>, is_default: bool) -> LinkRequest {
        LinkRequest {
            customer_id: CustomerId::from(customer),
            loan_id: loan.map(LoanId::from),
            routing_number: "123456789".to_string(),
            account_number: "12345678".to_string(),
            account_type: AccountType::Checking,
            customer_name: "Jane Borrower".to_string(),
            check_type: None,
            is_default,
            ip_address: Some("203.0.113.7".to_string()),
        }
    }

    pub async fn link(&self, customer: &str, is_default: bool) -> Authorization {
        self.registry()
            .tokenize_and_link(Self::link_request(customer, None, is_default))
            .await
            .unwrap()
    }

    pub async fn schedule(
        &self,
        auth: &Authorization,
        loan: &Loan,
        amount: Decimal,
        on: NaiveDate,
    ) -> AchTransaction {
        self.lifecycle()
            .schedule(auth, loan, Amount::new(amount).unwrap(), on, None)
            .await
            .unwrap()
    }

    /// Schedules and submits a debit dated today.
    pub async fn initiated(&self, auth: &Authorization, loan: &Loan, amount: Decimal) -> AchTransaction {
        let txn = self.schedule(auth, loan, amount, start().date()).await;
        self.lifecycle().initiate(txn.id).await.unwrap()
    }

    pub async fn reload(&self, txn: &AchTransaction) -> AchTransaction {
        self.ctx.transactions.get(txn.id).await.unwrap().unwrap()
    }
}

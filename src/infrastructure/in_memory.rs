use crate::domain::authorization::{Authorization, AuthorizationChange, admit};
use crate::domain::ids::{AuthorizationId, CustomerId, LoanId, TransactionId};
use crate::domain::loan::{DuePayment, Loan, PaymentOverride};
use crate::domain::ports::{
    AuthorizationStore, LoanBook, PaymentOverrideStore, SettlementStore, TransactionStore,
};
use crate::domain::settlement::SettlementRecord;
use crate::domain::transaction::{AchTransaction, TransactionFilter};
use crate::error::{AutopayError, Result};
use async_trait::async_trait;
use chrono::NaiveDate;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

/// A thread-safe in-memory store for authorizations.
///
/// Multi-record changes run under a single write guard, so the sibling check
/// and the writes it leads to cannot interleave with another change.
#[derive(Default, Clone)]
pub struct InMemoryAuthorizationStore {
    authorizations: Arc<RwLock<HashMap<AuthorizationId, Authorization>>>,
}

impl InMemoryAuthorizationStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn sorted_by_creation(mut list: Vec<Authorization>) -> Vec<Authorization> {
    list.sort_by_key(|a| a.created_at);
    list
}

#[async_trait]
impl AuthorizationStore for InMemoryAuthorizationStore {
    async fn get(&self, id: AuthorizationId) -> Result<Option<Authorization>> {
        let authorizations = self.authorizations.read().await;
        Ok(authorizations.get(&id).cloned())
    }

    async fn for_customer(&self, customer_id: &CustomerId) -> Result<Vec<Authorization>> {
        let authorizations = self.authorizations.read().await;
        Ok(sorted_by_creation(
            authorizations
                .values()
                .filter(|a| a.customer_id == *customer_id)
                .cloned()
                .collect(),
        ))
    }

    async fn for_loan(&self, loan_id: &LoanId) -> Result<Vec<Authorization>> {
        let authorizations = self.authorizations.read().await;
        Ok(sorted_by_creation(
            authorizations
                .values()
                .filter(|a| a.loan_id.as_ref() == Some(loan_id))
                .cloned()
                .collect(),
        ))
    }

    async fn insert(&self, authorization: Authorization) -> Result<Authorization> {
        let mut authorizations = self.authorizations.write().await;
        if authorizations.contains_key(&authorization.id) {
            return Err(AutopayError::Conflict(format!(
                "Authorization {} already exists",
                authorization.id
            )));
        }
        let siblings = authorizations
            .values()
            .filter(|a| a.customer_id == authorization.customer_id)
            .cloned()
            .collect();
        let changed = admit(authorization, siblings)?;
        let inserted = changed[0].clone();
        for record in changed {
            authorizations.insert(record.id, record);
        }
        Ok(inserted)
    }

    async fn apply(
        &self,
        id: AuthorizationId,
        change: AuthorizationChange,
    ) -> Result<Authorization> {
        let mut authorizations = self.authorizations.write().await;
        let target = authorizations
            .get(&id)
            .cloned()
            .ok_or_else(|| AutopayError::NotFound(format!("Authorization {id}")))?;
        let siblings = authorizations
            .values()
            .filter(|a| a.customer_id == target.customer_id && a.id != id)
            .cloned()
            .collect();
        let changed = change.apply(target, siblings)?;
        let updated = changed[0].clone();
        for record in changed {
            authorizations.insert(record.id, record);
        }
        Ok(updated)
    }
}

/// A thread-safe in-memory store for ACH transactions.
#[derive(Default, Clone)]
pub struct InMemoryTransactionStore {
    transactions: Arc<RwLock<HashMap<TransactionId, AchTransaction>>>,
}

impl InMemoryTransactionStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl TransactionStore for InMemoryTransactionStore {
    async fn store(&self, mut txn: AchTransaction) -> Result<()> {
        let mut transactions = self.transactions.write().await;
        if let Some(existing) = transactions.get(&txn.id) {
            txn.notification_sent |= existing.notification_sent;
        }
        transactions.insert(txn.id, txn);
        Ok(())
    }

    async fn get(&self, id: TransactionId) -> Result<Option<AchTransaction>> {
        let transactions = self.transactions.read().await;
        Ok(transactions.get(&id).cloned())
    }

    async fn find_by_processor_id(&self, processor_id: &str) -> Result<Option<AchTransaction>> {
        let transactions = self.transactions.read().await;
        Ok(transactions
            .values()
            .find(|t| t.processor_transaction_id.as_deref() == Some(processor_id))
            .cloned())
    }

    async fn query(&self, filter: &TransactionFilter) -> Result<Vec<AchTransaction>> {
        let transactions = self.transactions.read().await;
        let mut matching: Vec<AchTransaction> = transactions
            .values()
            .filter(|t| filter.matches(t))
            .cloned()
            .collect();
        matching.sort_by_key(|t| (t.scheduled_date, t.created_at));
        Ok(matching)
    }

    async fn claim_notification(&self, id: TransactionId) -> Result<bool> {
        let mut transactions = self.transactions.write().await;
        let txn = transactions
            .get_mut(&id)
            .ok_or_else(|| AutopayError::NotFound(format!("Transaction {id}")))?;
        if txn.notification_sent {
            return Ok(false);
        }
        txn.notification_sent = true;
        Ok(true)
    }
}

/// A thread-safe in-memory ledger of settlement records, one per transaction.
#[derive(Default, Clone)]
pub struct InMemorySettlementStore {
    settlements: Arc<RwLock<HashMap<TransactionId, SettlementRecord>>>,
}

impl InMemorySettlementStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn all(&self) -> Vec<SettlementRecord> {
        self.settlements.read().await.values().cloned().collect()
    }
}

#[async_trait]
impl SettlementStore for InMemorySettlementStore {
    async fn insert_if_absent(&self, record: SettlementRecord) -> Result<(SettlementRecord, bool)> {
        let mut settlements = self.settlements.write().await;
        if let Some(existing) = settlements.get(&record.transaction_id) {
            return Ok((existing.clone(), false));
        }
        settlements.insert(record.transaction_id, record.clone());
        Ok((record, true))
    }
}

#[derive(Debug, Clone)]
struct LoanEntry {
    loan: Loan,
    schedule: Vec<DuePayment>,
}

/// Loan book snapshot held in memory, typically loaded from CSV.
#[derive(Default, Clone)]
pub struct InMemoryLoanBook {
    loans: Arc<RwLock<HashMap<LoanId, LoanEntry>>>,
}

impl InMemoryLoanBook {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds the loan, or replaces its owner and override while keeping the
    /// repayment schedule already known.
    pub async fn upsert_loan(&self, loan: Loan) {
        let mut loans = self.loans.write().await;
        match loans.get_mut(&loan.id) {
            Some(entry) => entry.loan = loan,
            None => {
                loans.insert(
                    loan.id.clone(),
                    LoanEntry {
                        loan,
                        schedule: Vec::new(),
                    },
                );
            }
        }
    }

    pub async fn add_instalment(&self, id: &LoanId, payment: DuePayment) -> Result<()> {
        let mut loans = self.loans.write().await;
        let entry = loans
            .get_mut(id)
            .ok_or_else(|| AutopayError::NotFound(format!("Loan {id}")))?;
        entry.schedule.push(payment);
        entry.schedule.sort_by_key(|p| p.due_date);
        Ok(())
    }
}

#[async_trait]
impl LoanBook for InMemoryLoanBook {
    async fn active_loans(&self) -> Result<Vec<Loan>> {
        let loans = self.loans.read().await;
        let mut active: Vec<Loan> = loans.values().map(|e| e.loan.clone()).collect();
        active.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(active)
    }

    async fn get(&self, id: &LoanId) -> Result<Option<Loan>> {
        let loans = self.loans.read().await;
        Ok(loans.get(id).map(|e| e.loan.clone()))
    }

    async fn loans_for_customer(&self, customer_id: &CustomerId) -> Result<Vec<Loan>> {
        let mut owned: Vec<Loan> = self
            .active_loans()
            .await?
            .into_iter()
            .filter(|l| l.customer_id == *customer_id)
            .collect();
        owned.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(owned)
    }

    async fn next_due_payment(&self, id: &LoanId, from: NaiveDate) -> Result<Option<DuePayment>> {
        let loans = self.loans.read().await;
        Ok(loans
            .get(id)
            .and_then(|e| e.schedule.iter().find(|p| p.due_date >= from).copied()))
    }
}

/// Loan payment overrides held in memory for the life of the process.
#[derive(Default, Clone)]
pub struct InMemoryPaymentOverrideStore {
    overrides: Arc<RwLock<HashMap<LoanId, PaymentOverride>>>,
}

impl InMemoryPaymentOverrideStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl PaymentOverrideStore for InMemoryPaymentOverrideStore {
    async fn find(&self, loan_id: &LoanId) -> Result<Option<PaymentOverride>> {
        let overrides = self.overrides.read().await;
        Ok(overrides.get(loan_id).cloned())
    }

    async fn save(&self, entry: PaymentOverride) -> Result<()> {
        let mut overrides = self.overrides.write().await;
        overrides.insert(entry.loan_id.clone(), entry);
        Ok(())
    }
}

//! Application layer: the services that orchestrate the domain through its
//! ports.
//!
//! All services share one [`AutopayContext`]. Each call loads the records it
//! needs, applies a domain transition and saves the result; there is no
//! in-process cache to keep consistent.

pub mod lifecycle;
pub mod reconciliation;
pub mod registry;
pub mod scheduler;

use crate::domain::ports::{
    AuthorizationStoreRef, ClockRef, LoanBookRef, NotifierRef, PaymentOverrideStoreRef,
    PaymentProcessorRef, SettlementStoreRef, TransactionStoreRef,
};
use crate::settings::Settings;
use serde::Serialize;
use std::sync::Arc;

/// The ports and settings every service works with.
#[derive(Clone)]
pub struct AutopayContext {
    pub authorizations: AuthorizationStoreRef,
    pub transactions: TransactionStoreRef,
    pub settlements: SettlementStoreRef,
    pub loans: LoanBookRef,
    pub overrides: PaymentOverrideStoreRef,
    pub processor: PaymentProcessorRef,
    pub notifier: NotifierRef,
    pub clock: ClockRef,
    pub settings: Arc<Settings>,
}

/// Per-run counters of a sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub examined: usize,
    pub acted: usize,
    pub skipped: usize,
    pub failed: usize,
}

impl SweepReport {
    pub fn absorb(&mut self, other: SweepReport) {
        self.examined += other.examined;
        self.acted += other.acted;
        self.skipped += other.skipped;
        self.failed += other.failed;
    }
}

//! Domain layer: records, value objects and state transitions, plus the ports
//! through which the application reaches storage, the loan system, the
//! processor and the notification channel.

pub mod authorization;
pub mod ids;
pub mod loan;
pub mod money;
pub mod ports;
pub mod processor;
pub mod settlement;
pub mod transaction;

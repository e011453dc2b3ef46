use crate::domain::ports::Notifier;
use crate::domain::processor::Notice;
use crate::error::Result;
use async_trait::async_trait;
use tokio::sync::RwLock;
use tracing::info;

/// Emits each notice as a structured log event. Stands in for the loan
/// system's mailer when the crate runs on its own.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingNotifier;

#[async_trait]
impl Notifier for TracingNotifier {
    async fn notify(&self, notice: &Notice) -> Result<()> {
        info!(
            customer_id = %notice.customer_id,
            loan_id = %notice.loan_id,
            transaction_id = %notice.transaction_id,
            template = notice.template(),
            "{}",
            notice.subject()
        );
        Ok(())
    }
}

/// Keeps every notice it is handed, in order.
#[derive(Debug, Default)]
pub struct RecordingNotifier {
    sent: RwLock<Vec<Notice>>,
}

impl RecordingNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn sent(&self) -> Vec<Notice> {
        self.sent.read().await.clone()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn notify(&self, notice: &Notice) -> Result<()> {
        self.sent.write().await.push(notice.clone());
        Ok(())
    }
}

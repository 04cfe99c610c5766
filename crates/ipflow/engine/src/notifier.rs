//! Notification dispatch seam.
//!
//! Delivery itself (email, push) is an external collaborator. The engine
//! treats every delivery as best-effort: a failed dispatch is logged and
//! never blocks a state transition.

use async_trait::async_trait;
use ipflow_types::Notification;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("delivery failed: {0}")]
    Delivery(String),
}

/// Outbound notification channel.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn deliver(&self, notification: &Notification) -> Result<(), NotifyError>;
}

/// Notifier that only writes to the log. Default for deployments where a
/// real delivery channel is wired up out of process.
#[derive(Clone, Debug, Default)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn deliver(&self, notification: &Notification) -> Result<(), NotifyError> {
        tracing::info!(
            recipient = %notification.recipient_id,
            kind = %notification.kind,
            title = %notification.title,
            "notification dispatched"
        );
        Ok(())
    }
}

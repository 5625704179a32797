use async_trait::async_trait;
use tracing::info;

/// Outgoing out-of-band message.
#[derive(Debug, Clone)]
pub struct Message {
    pub to: String,
    pub subject: String,
    pub body: String,
}

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn send(&self, message: Message) -> anyhow::Result<()>;
}

/// Logs the envelope instead of delivering. Bodies may carry secrets and are never logged.
#[derive(Clone, Default)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn send(&self, message: Message) -> anyhow::Result<()> {
        info!(to = %message.to, subject = %message.subject, "notification queued");
        Ok(())
    }
}

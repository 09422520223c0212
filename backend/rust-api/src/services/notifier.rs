use async_trait::async_trait;
use redis::aio::ConnectionManager;

use crate::models::{NotificationEvent, NotifyTarget};

/// Fire-and-forget notification sink. Delivery failures never reach the caller.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, target: NotifyTarget, event: NotificationEvent);
}

/// Publishes events as JSON on Redis Pub/Sub, one channel per target.
pub struct RedisNotifier {
    redis: ConnectionManager,
}

impl RedisNotifier {
    pub fn new(redis: ConnectionManager) -> Self {
        Self { redis }
    }

    async fn publish(&self, channel: &str, event: &NotificationEvent) -> anyhow::Result<()> {
        let payload = serde_json::to_string(event)?;
        let mut conn = self.redis.clone();
        let _: () = redis::cmd("PUBLISH")
            .arg(channel)
            .arg(payload)
            .query_async(&mut conn)
            .await?;
        Ok(())
    }
}

#[async_trait]
impl Notifier for RedisNotifier {
    async fn notify(&self, target: NotifyTarget, event: NotificationEvent) {
        let channel = target.channel();
        match self.publish(&channel, &event).await {
            Ok(()) => tracing::debug!(
                "Notification published: channel={}, event={}",
                channel,
                event.name()
            ),
            Err(e) => tracing::warn!(
                "Failed to publish notification {} to {}: {:#}",
                event.name(),
                channel,
                e
            ),
        }
    }
}

/// Writes notifications to the log only.
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify(&self, target: NotifyTarget, event: NotificationEvent) {
        tracing::info!(
            "Notification: channel={}, event={}",
            target.channel(),
            event.name()
        );
    }
}

use crate::config::Config;
use crate::error::{CoreError, CoreResult};
use crate::metrics;
use crate::stores::{
    AccountStore, AttemptStore, MemorySmsCodeStore, MemoryStore, MongoStore, PaymentStore,
    PromotionStore, QuizStore, RedisSmsCodeStore, SmsCodeStore,
};
use anyhow::Context;
use mongodb::{Client as MongoClient, Database};
use redis::aio::ConnectionManager;
use std::future::Future;
use std::sync::Arc;

pub mod attempt_service;
pub mod content_service;
pub mod gateway;
pub mod notifier;
pub mod payment_service;
pub mod promotion_service;

use gateway::{gateway_from_config, PaymentGateway, SimulatedGateway};
use notifier::{LogNotifier, Notifier, RedisNotifier};

/// Live connections, present only when running against MongoDB and Redis.
pub struct Backends {
    pub mongo: Database,
    pub redis: ConnectionManager,
}

pub struct AppState {
    pub config: Config,
    pub quizzes: Arc<dyn QuizStore>,
    pub attempts: Arc<dyn AttemptStore>,
    pub promotions: Arc<dyn PromotionStore>,
    pub payments: Arc<dyn PaymentStore>,
    pub accounts: Arc<dyn AccountStore>,
    pub sms_codes: Arc<dyn SmsCodeStore>,
    pub gateway: Arc<dyn PaymentGateway>,
    pub notifier: Arc<dyn Notifier>,
    pub backends: Option<Backends>,
}

impl AppState {
    pub async fn new(
        config: Config,
        mongo_client: MongoClient,
        redis_client: redis::Client,
    ) -> anyhow::Result<Self> {
        let mongo = mongo_client.database(&config.mongo_database);

        tracing::info!("Attempting to connect to Redis...");

        let redis = tokio::time::timeout(
            std::time::Duration::from_secs(30),
            ConnectionManager::new(redis_client),
        )
        .await
        .map_err(|_| anyhow::anyhow!("Redis connection timeout after 30s"))??;

        let mut conn = redis.clone();
        tokio::time::timeout(
            std::time::Duration::from_secs(5),
            redis::cmd("PING").query_async::<String>(&mut conn),
        )
        .await
        .map_err(|_| anyhow::anyhow!("Redis PING timeout after 5s"))??;

        tracing::info!("Redis connection established successfully");

        let store = Arc::new(MongoStore::new(mongo_client, mongo.clone()));
        store
            .ensure_indexes()
            .await
            .context("Failed to prepare MongoDB indexes")?;

        let gateway = gateway_from_config(&config.payment)?;

        Ok(Self {
            config,
            quizzes: store.clone(),
            attempts: store.clone(),
            promotions: store.clone(),
            payments: store.clone(),
            accounts: store,
            sms_codes: Arc::new(RedisSmsCodeStore::new(redis.clone())),
            gateway,
            notifier: Arc::new(RedisNotifier::new(redis.clone())),
            backends: Some(Backends { mongo, redis }),
        })
    }

    /// State over a process-local store, simulated gateway and log notifier.
    pub fn in_memory(config: Config, store: Arc<MemoryStore>) -> Self {
        let gateway = Arc::new(SimulatedGateway::new(&config.payment));
        Self {
            config,
            quizzes: store.clone(),
            attempts: store.clone(),
            promotions: store.clone(),
            payments: store.clone(),
            accounts: store,
            sms_codes: Arc::new(MemorySmsCodeStore::new()),
            gateway,
            notifier: Arc::new(LogNotifier),
            backends: None,
        }
    }

    pub fn with_notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = notifier;
        self
    }

    pub fn with_sms_codes(mut self, sms_codes: Arc<dyn SmsCodeStore>) -> Self {
        self.sms_codes = sms_codes;
        self
    }

    pub fn with_gateway(mut self, gateway: Arc<dyn PaymentGateway>) -> Self {
        self.gateway = gateway;
        self
    }
}

/// Runs a read-modify-conditional-write step. `Ok(None)` means the conditional
/// write lost to a concurrent writer; the step is re-run once from a fresh read
/// before the loss surfaces as [`CoreError::Conflict`].
pub(crate) async fn with_conflict_retry<T, F, Fut>(
    aggregate: &'static str,
    id: &str,
    mut step: F,
) -> CoreResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = CoreResult<Option<T>>>,
{
    for round in 1..=2 {
        if let Some(value) = step().await? {
            return Ok(value);
        }
        metrics::record_conflict(aggregate);
        tracing::warn!(
            "Concurrent update lost on {} {} (round {})",
            aggregate,
            id,
            round
        );
    }

    Err(CoreError::conflict(format!(
        "{} {} was modified concurrently, retry the request",
        aggregate, id
    )))
}


#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn conflict_retry_reruns_once_then_gives_up() {
        let calls = AtomicUsize::new(0);
        let result: CoreResult<()> = with_conflict_retry("attempt", "a1", || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Ok(None)
        })
        .await;

        assert!(matches!(result, Err(CoreError::Conflict(_))));
        assert!(result.unwrap_err().is_retryable());
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn conflict_retry_returns_second_round_success() {
        let calls = AtomicUsize::new(0);
        let result = with_conflict_retry("payment", "p1", || async {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            Ok(if n == 0 { None } else { Some(n) })
        })
        .await
        .unwrap();

        assert_eq!(result, 1);
    }
}

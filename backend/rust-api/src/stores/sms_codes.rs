use anyhow::{Context, Result};
use async_trait::async_trait;
use redis::aio::ConnectionManager;
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;

/// Result of checking a submitted code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CodeCheck {
    /// Code matched and is now spent.
    Accepted,
    /// Wrong, missing or expired. The stored code, if any, stays.
    Rejected,
    /// Wrong again after too many misses. The stored code is gone.
    Revoked,
}

/// Expiring one-time codes.
#[async_trait]
pub trait SmsCodeStore: Send + Sync {
    /// Stores `code` under `key`, replacing any previous code and its miss count.
    async fn put(&self, key: &str, code: &str, ttl: Duration) -> Result<()>;

    /// Deletes the code if it equals `code`. A mismatch counts a miss; the
    /// `max_misses`-th miss deletes the code as well.
    async fn consume_if_matches(&self, key: &str, code: &str, max_misses: u32)
        -> Result<CodeCheck>;
}

pub fn payment_code_key(payment_id: &str) -> String {
    format!("sms:verification:payment:{}", payment_id)
}

fn misses_key(key: &str) -> String {
    format!("{}:misses", key)
}

pub struct RedisSmsCodeStore {
    redis: ConnectionManager,
}

impl RedisSmsCodeStore {
    pub fn new(redis: ConnectionManager) -> Self {
        Self { redis }
    }
}

#[async_trait]
impl SmsCodeStore for RedisSmsCodeStore {
    async fn put(&self, key: &str, code: &str, ttl: Duration) -> Result<()> {
        let mut conn = self.redis.clone();
        redis::cmd("SET")
            .arg(key)
            .arg(code)
            .arg("EX")
            .arg(ttl.as_secs().max(1))
            .query_async::<()>(&mut conn)
            .await
            .context("Failed to store SMS code")?;
        redis::cmd("DEL")
            .arg(misses_key(key))
            .query_async::<()>(&mut conn)
            .await
            .context("Failed to reset SMS code misses")?;
        Ok(())
    }

    async fn consume_if_matches(
        &self,
        key: &str,
        code: &str,
        max_misses: u32,
    ) -> Result<CodeCheck> {
        let mut conn = self.redis.clone();

        // 1 = consumed, 0 = miss, -1 = miss that revoked the code.
        // The miss counter expires together with the code.
        let lua_script = r#"
            local stored = redis.call('GET', KEYS[1])
            if not stored then
                return 0
            end
            if stored == ARGV[1] then
                redis.call('DEL', KEYS[1], KEYS[2])
                return 1
            end
            local misses = redis.call('INCR', KEYS[2])
            if misses >= tonumber(ARGV[2]) then
                redis.call('DEL', KEYS[1], KEYS[2])
                return -1
            end
            local ttl = redis.call('PTTL', KEYS[1])
            if ttl > 0 then
                redis.call('PEXPIRE', KEYS[2], ttl)
            end
            return 0
        "#;

        let outcome: i32 = redis::Script::new(lua_script)
            .key(key)
            .key(misses_key(key))
            .arg(code)
            .arg(max_misses.max(1))
            .invoke_async(&mut conn)
            .await
            .context("Failed to execute SMS code Lua script")?;

        Ok(match outcome {
            1 => CodeCheck::Accepted,
            -1 => CodeCheck::Revoked,
            _ => CodeCheck::Rejected,
        })
    }
}

struct StoredCode {
    code: String,
    expires_at: Instant,
    misses: u32,
}

#[derive(Default)]
pub struct MemorySmsCodeStore {
    codes: Mutex<HashMap<String, StoredCode>>,
}

impl MemorySmsCodeStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current code for `key`, if not expired.
    pub async fn peek(&self, key: &str) -> Option<String> {
        let codes = self.codes.lock().await;
        codes
            .get(key)
            .filter(|stored| Instant::now() < stored.expires_at)
            .map(|stored| stored.code.clone())
    }
}

#[async_trait]
impl SmsCodeStore for MemorySmsCodeStore {
    async fn put(&self, key: &str, code: &str, ttl: Duration) -> Result<()> {
        let mut codes = self.codes.lock().await;
        codes.insert(
            key.to_string(),
            StoredCode {
                code: code.to_string(),
                expires_at: Instant::now() + ttl,
                misses: 0,
            },
        );
        Ok(())
    }

    async fn consume_if_matches(
        &self,
        key: &str,
        code: &str,
        max_misses: u32,
    ) -> Result<CodeCheck> {
        let mut codes = self.codes.lock().await;
        let Some(stored) = codes.get_mut(key) else {
            return Ok(CodeCheck::Rejected);
        };

        if Instant::now() >= stored.expires_at {
            codes.remove(key);
            return Ok(CodeCheck::Rejected);
        }
        if stored.code == code {
            codes.remove(key);
            return Ok(CodeCheck::Accepted);
        }

        stored.misses += 1;
        if stored.misses >= max_misses.max(1) {
            codes.remove(key);
            return Ok(CodeCheck::Revoked);
        }
        Ok(CodeCheck::Rejected)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn code_is_single_use() {
        let store = MemorySmsCodeStore::new();
        let key = payment_code_key("p1");
        store.put(&key, "123456", Duration::from_secs(300)).await.unwrap();

        assert_eq!(
            store.consume_if_matches(&key, "123456", 5).await.unwrap(),
            CodeCheck::Accepted
        );
        assert_eq!(
            store.consume_if_matches(&key, "123456", 5).await.unwrap(),
            CodeCheck::Rejected
        );
    }

    #[tokio::test]
    async fn wrong_code_keeps_the_stored_one() {
        let store = MemorySmsCodeStore::new();
        let key = payment_code_key("p1");
        store.put(&key, "123456", Duration::from_secs(300)).await.unwrap();

        assert_eq!(
            store.consume_if_matches(&key, "000000", 5).await.unwrap(),
            CodeCheck::Rejected
        );
        assert_eq!(
            store.consume_if_matches(&key, "123456", 5).await.unwrap(),
            CodeCheck::Accepted
        );
    }

    #[tokio::test]
    async fn repeated_misses_revoke_the_code() {
        let store = MemorySmsCodeStore::new();
        let key = payment_code_key("p1");
        store.put(&key, "123456", Duration::from_secs(300)).await.unwrap();

        for _ in 0..2 {
            assert_eq!(
                store.consume_if_matches(&key, "000000", 3).await.unwrap(),
                CodeCheck::Rejected
            );
        }
        assert_eq!(
            store.consume_if_matches(&key, "000000", 3).await.unwrap(),
            CodeCheck::Revoked
        );
        assert!(store.peek(&key).await.is_none());
        assert_eq!(
            store.consume_if_matches(&key, "123456", 3).await.unwrap(),
            CodeCheck::Rejected
        );

        store.put(&key, "654321", Duration::from_secs(300)).await.unwrap();
        assert_eq!(
            store.consume_if_matches(&key, "000000", 3).await.unwrap(),
            CodeCheck::Rejected
        );
        assert_eq!(
            store.consume_if_matches(&key, "654321", 3).await.unwrap(),
            CodeCheck::Accepted
        );
    }

    #[tokio::test]
    async fn expired_code_is_rejected() {
        let store = MemorySmsCodeStore::new();
        let key = payment_code_key("p1");
        store.put(&key, "123456", Duration::ZERO).await.unwrap();

        assert!(store.peek(&key).await.is_none());
        assert_eq!(
            store.consume_if_matches(&key, "123456", 5).await.unwrap(),
            CodeCheck::Rejected
        );
    }

    #[test]
    fn payment_keys_are_namespaced() {
        assert_eq!(payment_code_key("p1"), "sms:verification:payment:p1");
    }
}

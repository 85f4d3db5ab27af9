//! Read-through cache for the plan catalog and subscription-by-campus lookups
//!
//! Two backends share one contract: an in-process map (default) and Redis when
//! `REDIS_URL` is configured. Values are stored as JSON with a fixed TTL and are
//! invalidated explicitly after every committed write. Cache failures are logged
//! and treated as misses; they never fail a billing operation.
//!
//! A fill takes a [`FillToken`] before reading the store and only lands if no
//! invalidation happened in between, so a read that raced a commit is never
//! cached over the newer row.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::error::BillingResult;

const KEY_PREFIX: &str = "edubill:";

/// In-memory map size at which expired entries are swept on write
const MEMORY_SWEEP_THRESHOLD: usize = 1024;

/// Extra lifetime of a Redis invalidation epoch beyond the value TTL
const EPOCH_GRACE_SECS: i64 = 60;

/// Sets the value only while the key's invalidation epoch is unchanged
const FILL_SCRIPT: &str = r#"
local current = redis.call('GET', KEYS[2])
if (current or '') == ARGV[1] then
  redis.call('SET', KEYS[1], ARGV[2], 'EX', ARGV[3])
  return 1
end
return 0
"#;

#[derive(Default)]
struct MemoryCache {
    entries: RwLock<HashMap<String, (String, Instant)>>,
    /// Bumped by every invalidation
    epoch: AtomicU64,
}

#[derive(Clone)]
enum CacheBackend {
    Memory(Arc<MemoryCache>),
    Redis(ConnectionManager),
    Disabled,
}

/// Invalidation epoch observed before a store read
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FillToken(String);

#[derive(Clone)]
pub struct BillingCache {
    backend: CacheBackend,
    ttl: Duration,
}

impl BillingCache {
    pub fn in_memory(ttl_secs: u64) -> Self {
        Self {
            backend: CacheBackend::Memory(Arc::new(MemoryCache::default())),
            ttl: Duration::from_secs(ttl_secs),
        }
    }

    /// Connect to Redis through a connection manager
    pub async fn redis(url: &str, ttl_secs: u64) -> BillingResult<Self> {
        let client = redis::Client::open(url)?;
        let manager = ConnectionManager::new(client).await?;
        tracing::info!("Billing cache using Redis backend");
        Ok(Self {
            backend: CacheBackend::Redis(manager),
            ttl: Duration::from_secs(ttl_secs),
        })
    }

    /// A cache that never stores anything
    pub fn disabled() -> Self {
        Self {
            backend: CacheBackend::Disabled,
            ttl: Duration::ZERO,
        }
    }

    pub fn plan_key(plan_id: Uuid) -> String {
        format!("plan:{}", plan_id)
    }

    pub fn catalog_key() -> String {
        "plans:catalog".to_string()
    }

    pub fn campus_subscription_key(campus_id: Uuid) -> String {
        format!("subscription:campus:{}", campus_id)
    }

    fn epoch_key(key: &str) -> String {
        format!("{}epoch:{}", KEY_PREFIX, key)
    }

    pub async fn get<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let raw = match &self.backend {
            CacheBackend::Memory(memory) => {
                let map = memory.entries.read().await;
                match map.get(key) {
                    Some((value, expires_at)) if *expires_at > Instant::now() => {
                        Some(value.clone())
                    }
                    _ => None,
                }
            }
            CacheBackend::Redis(manager) => {
                let mut conn = manager.clone();
                let result: Result<Option<String>, redis::RedisError> =
                    conn.get(format!("{}{}", KEY_PREFIX, key)).await;
                match result {
                    Ok(value) => value,
                    Err(e) => {
                        tracing::warn!(key = %key, error = %e, "Cache read failed");
                        None
                    }
                }
            }
            CacheBackend::Disabled => None,
        }?;

        match serde_json::from_str(&raw) {
            Ok(value) => Some(value),
            Err(e) => {
                tracing::warn!(key = %key, error = %e, "Discarding undecodable cache entry");
                None
            }
        }
    }

    /// Take before reading the value from the store
    pub async fn fill_token(&self, key: &str) -> FillToken {
        match &self.backend {
            CacheBackend::Memory(memory) => {
                FillToken(memory.epoch.load(Ordering::Acquire).to_string())
            }
            CacheBackend::Redis(manager) => {
                let mut conn = manager.clone();
                let result: Result<Option<String>, redis::RedisError> =
                    conn.get(Self::epoch_key(key)).await;
                match result {
                    Ok(epoch) => FillToken(epoch.unwrap_or_default()),
                    Err(e) => {
                        tracing::warn!(key = %key, error = %e, "Cache epoch read failed");
                        // Never matches, so the fill is skipped
                        FillToken("unavailable".to_string())
                    }
                }
            }
            CacheBackend::Disabled => FillToken(String::new()),
        }
    }

    /// Store `value` unless `key` was invalidated since `token` was taken
    pub async fn fill<T: Serialize>(&self, key: &str, value: &T, token: FillToken) {
        let raw = match serde_json::to_string(value) {
            Ok(raw) => raw,
            Err(e) => {
                tracing::warn!(key = %key, error = %e, "Failed to encode cache entry");
                return;
            }
        };

        match &self.backend {
            CacheBackend::Memory(memory) => {
                let mut map = memory.entries.write().await;
                if memory.epoch.load(Ordering::Acquire).to_string() != token.0 {
                    tracing::debug!(key = %key, "Skipping cache fill raced by an invalidation");
                    return;
                }
                let now = Instant::now();
                if map.len() >= MEMORY_SWEEP_THRESHOLD {
                    map.retain(|_, (_, expires_at)| *expires_at > now);
                }
                map.insert(key.to_string(), (raw, now + self.ttl));
            }
            CacheBackend::Redis(manager) => {
                let mut conn = manager.clone();
                let script = redis::Script::new(FILL_SCRIPT);
                let mut invocation = script.prepare_invoke();
                invocation
                    .key(format!("{}{}", KEY_PREFIX, key))
                    .key(Self::epoch_key(key))
                    .arg(&token.0)
                    .arg(raw)
                    .arg(self.ttl.as_secs().max(1));
                let result: Result<i32, redis::RedisError> =
                    invocation.invoke_async(&mut conn).await;
                match result {
                    Ok(0) => {
                        tracing::debug!(key = %key, "Skipping cache fill raced by an invalidation")
                    }
                    Ok(_) => {}
                    Err(e) => tracing::warn!(key = %key, error = %e, "Cache write failed"),
                }
            }
            CacheBackend::Disabled => {}
        }
    }

    pub async fn invalidate(&self, keys: &[String]) {
        if keys.is_empty() {
            return;
        }

        match &self.backend {
            CacheBackend::Memory(memory) => {
                let mut map = memory.entries.write().await;
                for key in keys {
                    map.remove(key);
                }
                memory.epoch.fetch_add(1, Ordering::AcqRel);
            }
            CacheBackend::Redis(manager) => {
                let mut conn = manager.clone();
                let prefixed: Vec<String> = keys
                    .iter()
                    .map(|k| format!("{}{}", KEY_PREFIX, k))
                    .collect();
                let epoch_ttl = self.ttl.as_secs() as i64 + EPOCH_GRACE_SECS;
                let mut pipe = redis::pipe();
                pipe.atomic().del(&prefixed).ignore();
                for key in keys {
                    let epoch = Self::epoch_key(key);
                    pipe.incr(&epoch, 1).ignore().expire(&epoch, epoch_ttl).ignore();
                }
                let result: Result<(), redis::RedisError> = pipe.query_async(&mut conn).await;
                if let Err(e) = result {
                    tracing::warn!(keys = ?keys, error = %e, "Cache invalidation failed");
                }
            }
            CacheBackend::Disabled => {}
        }
    }
}

impl std::fmt::Debug for BillingCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let backend = match self.backend {
            CacheBackend::Memory(_) => "memory",
            CacheBackend::Redis(_) => "redis",
            CacheBackend::Disabled => "disabled",
        };
        f.debug_struct("BillingCache")
            .field("backend", &backend)
            .field("ttl", &self.ttl)
            .finish()
    }
}

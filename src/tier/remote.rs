//! Shared remote tier with watermark-based invalidation
//!
//! This module provides:
//! - [`RemoteStore`]: the minimal surface expected from the shared key-value
//!   store (string keys, expiring sets, multi-get, global flush)
//! - [`RedisStore`]: the default store over `redis::aio::ConnectionManager`,
//!   with one client per worker thread supplied by a client factory
//! - [`RemoteTier`]: the read/write protocol — value envelopes carrying a
//!   creation timestamp, the watermark staleness check on reads, and the
//!   conditional write-back that keeps racing fallbacks from persisting
//!   values older than a pending invalidation

use std::cell::RefCell;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Instant, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use futures::future::BoxFuture;
use redis::aio::ConnectionManager;
use serde::{Deserialize, Serialize};

use crate::config::{CacheLayer, ConfigProvider, RedisConfig};
use crate::context;
use crate::error::{GCacheError, GCacheResult};
use crate::key::GCacheKey;
use crate::metrics::GCacheMetrics;
use crate::tier::{resolve_config, CacheTier, Fallback};

/// Watermarks outlive any invalidatable cache entry; 4 hours covers the
/// cacheable TTL range this stack is intended for.
pub const WATERMARK_TTL_SECONDS: u64 = 4 * 3600;

/// Envelopes at or above this size are decoded off the scheduler thread.
pub const OFF_THREAD_DECODE_THRESHOLD_BYTES: usize = 50_000;

/// Minimal surface the remote tier needs from a shared key-value store.
#[async_trait]
pub trait RemoteStore: Send + Sync {
    /// Fetch the raw bytes stored under `key`.
    async fn get(&self, key: &str) -> GCacheResult<Option<Vec<u8>>>;

    /// Fetch the value bytes and the watermark timestamp in one round trip.
    async fn get_with_watermark(
        &self,
        key: &str,
        watermark_key: &str,
    ) -> GCacheResult<(Option<Vec<u8>>, Option<i64>)>;

    /// Store `value` under `key`, expiring after `ttl_sec` seconds.
    async fn set_with_expiry(&self, key: &str, value: Vec<u8>, ttl_sec: u64) -> GCacheResult<()>;

    /// Remove `key`; reports whether an entry was present.
    async fn delete(&self, key: &str) -> GCacheResult<bool>;

    /// Remove every entry in the store.
    async fn flush_all(&self) -> GCacheResult<()>;
}

/// Factory producing one remote client per worker thread.
pub type RedisClientFactory =
    Arc<dyn Fn() -> BoxFuture<'static, GCacheResult<ConnectionManager>> + Send + Sync>;

/// Default factory: a managed multiplexed connection to the configured URL.
pub fn default_client_factory(config: &RedisConfig) -> RedisClientFactory {
    let url = config.url();
    Arc::new(move || {
        let url = url.clone();
        Box::pin(async move {
            let client = redis::Client::open(url.as_str())?;
            let manager = ConnectionManager::new(client).await?;
            Ok(manager)
        })
    })
}

static STORE_IDS: AtomicU64 = AtomicU64::new(0);

thread_local! {
    // One client slot per (thread, store). Async redis clients bind to the
    // scheduler that created them, so clients are never shared across worker
    // threads.
    static CLIENT_SLOTS: RefCell<HashMap<u64, ConnectionManager>> = RefCell::new(HashMap::new());
}

/// Redis-backed [`RemoteStore`].
pub struct RedisStore {
    id: u64,
    factory: RedisClientFactory,
}

impl RedisStore {
    /// Store using the default client factory for `config`.
    pub fn new(config: &RedisConfig) -> Self {
        Self::with_client_factory(default_client_factory(config))
    }

    /// Store using a caller-supplied client factory. The factory is invoked
    /// at most once per worker thread; the resulting client is reused for all
    /// later operations on that thread.
    pub fn with_client_factory(factory: RedisClientFactory) -> Self {
        Self {
            id: STORE_IDS.fetch_add(1, Ordering::Relaxed),
            factory,
        }
    }

    /// The client bound to the current thread, created on first use.
    async fn connection(&self) -> GCacheResult<ConnectionManager> {
        let cached = CLIENT_SLOTS.with(|slots| slots.borrow().get(&self.id).cloned());
        if let Some(manager) = cached {
            return Ok(manager);
        }

        let manager = (self.factory)().await?;
        CLIENT_SLOTS.with(|slots| {
            slots.borrow_mut().insert(self.id, manager.clone());
        });
        Ok(manager)
    }
}

#[async_trait]
impl RemoteStore for RedisStore {
    async fn get(&self, key: &str) -> GCacheResult<Option<Vec<u8>>> {
        let mut conn = self.connection().await?;
        let data: Option<Vec<u8>> = redis::cmd("GET").arg(key).query_async(&mut conn).await?;
        Ok(data)
    }

    async fn get_with_watermark(
        &self,
        key: &str,
        watermark_key: &str,
    ) -> GCacheResult<(Option<Vec<u8>>, Option<i64>)> {
        let mut conn = self.connection().await?;
        let values: (Option<Vec<u8>>, Option<i64>) = redis::cmd("MGET")
            .arg(key)
            .arg(watermark_key)
            .query_async(&mut conn)
            .await?;
        Ok(values)
    }

    async fn set_with_expiry(&self, key: &str, value: Vec<u8>, ttl_sec: u64) -> GCacheResult<()> {
        let mut conn = self.connection().await?;
        redis::cmd("SETEX")
            .arg(key)
            .arg(ttl_sec)
            .arg(value)
            .query_async::<_, ()>(&mut conn)
            .await?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> GCacheResult<bool> {
        let mut conn = self.connection().await?;
        let removed: i64 = redis::cmd("DEL").arg(key).query_async(&mut conn).await?;
        Ok(removed > 0)
    }

    async fn flush_all(&self) -> GCacheResult<()> {
        let mut conn = self.connection().await?;
        redis::cmd("FLUSHALL").query_async::<_, ()>(&mut conn).await?;
        Ok(())
    }
}

/// Stored record: the payload plus its creation timestamp. The timestamp is
/// what the watermark check compares against; any envelope created at or
/// before the watermark is stale. Encoded with bincode.
#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct Envelope {
    pub(crate) created_at_ms: u64,
    pub(crate) payload: Vec<u8>,
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Remote key of the watermark entry for an entity. Always braced so the
/// watermark shares a shard slot with the entity's tracked values.
pub(crate) fn watermark_key(key_type: &str, id: &str) -> String {
    format!("{{{}:{}:{}}}#watermark", context::urn_prefix(), key_type, id)
}

async fn decode_envelope(raw: Vec<u8>) -> GCacheResult<Envelope> {
    if raw.len() < OFF_THREAD_DECODE_THRESHOLD_BYTES {
        bincode::deserialize(&raw).map_err(|e| GCacheError::Serialization(e.to_string()))
    } else {
        // Large envelopes decode on the blocking pool so the scheduler
        // thread keeps serving other tasks.
        tokio::task::spawn_blocking(move || {
            bincode::deserialize(&raw).map_err(|e| GCacheError::Serialization(e.to_string()))
        })
        .await
        .map_err(|e| GCacheError::Serialization(e.to_string()))?
    }
}

/// Tier backed by the shared remote store.
pub struct RemoteTier {
    provider: Arc<dyn ConfigProvider>,
    store: Arc<dyn RemoteStore>,
}

impl RemoteTier {
    /// Create a remote tier over `store`.
    pub fn new(provider: Arc<dyn ConfigProvider>, store: Arc<dyn RemoteStore>) -> Self {
        Self { provider, store }
    }

    /// Run the fallback and conditionally write its result back.
    ///
    /// The write happens only when the watermark observed during the read is
    /// absent or already in the past. A watermark still in the future means
    /// an invalidation window is open, and a value fetched during that window
    /// may predate the write the invalidator is protecting.
    async fn exec_fallback(
        &self,
        key: &GCacheKey,
        watermark_ms: Option<i64>,
        fallback: Fallback,
    ) -> GCacheResult<Vec<u8>> {
        let value = fallback().await?;
        if watermark_ms.map_or(true, |wm| wm < now_ms() as i64) {
            self.put(key, value.clone()).await?;
        }
        Ok(value)
    }
}

#[async_trait]
impl CacheTier for RemoteTier {
    async fn get(&self, key: &GCacheKey, fallback: Fallback) -> GCacheResult<Vec<u8>> {
        log::debug!("remote tier lookup for {key}");

        let (raw, watermark_ms) = if key.invalidation_tracking() {
            self.store
                .get_with_watermark(key.urn(), &key.watermark_key())
                .await?
        } else {
            (self.store.get(key.urn()).await?, None)
        };

        let Some(raw) = raw else {
            return self.exec_fallback(key, watermark_ms, fallback).await;
        };

        let start = Instant::now();
        let envelope = decode_envelope(raw).await?;
        let payload = match key.codec() {
            Some(codec) => codec
                .load(&envelope.payload)
                .await
                .map_err(|e| GCacheError::Serialization(e.to_string()))?,
            None => envelope.payload,
        };
        GCacheMetrics::get()
            .serialization_timer
            .with_label_values(&[key.use_case(), key.key_type(), self.layer().as_str(), "load"])
            .observe(start.elapsed().as_secs_f64());

        if let Some(watermark_ms) = watermark_ms {
            if watermark_ms >= envelope.created_at_ms as i64 {
                return self.exec_fallback(key, Some(watermark_ms), fallback).await;
            }
        }
        Ok(payload)
    }

    async fn put(&self, key: &GCacheKey, value: Vec<u8>) -> GCacheResult<()> {
        let config = resolve_config(&self.provider, key)
            .await
            .map_err(|e| GCacheError::ConfigProvider(e.to_string()))?
            .ok_or_else(|| GCacheError::MissingKeyConfig(key.use_case().to_string()))?;
        let ttl_sec = config
            .ttl_sec
            .get(&self.layer())
            .copied()
            .ok_or_else(|| GCacheError::MissingKeyConfig(key.use_case().to_string()))?;

        let created_at_ms = now_ms();
        let start = Instant::now();
        let payload = match key.codec() {
            Some(codec) => codec
                .dump(&value)
                .await
                .map_err(|e| GCacheError::Serialization(e.to_string()))?,
            None => value,
        };
        let encoded = bincode::serialize(&Envelope {
            created_at_ms,
            payload,
        })
        .map_err(|e| GCacheError::Serialization(e.to_string()))?;

        let metrics = GCacheMetrics::get();
        let labels = [key.use_case(), key.key_type(), self.layer().as_str()];
        metrics
            .serialization_timer
            .with_label_values(&[labels[0], labels[1], labels[2], "dump"])
            .observe(start.elapsed().as_secs_f64());
        metrics
            .size_histogram
            .with_label_values(&labels)
            .observe(encoded.len() as f64);

        self.store.set_with_expiry(key.urn(), encoded, ttl_sec).await
    }

    async fn delete(&self, key: &GCacheKey) -> GCacheResult<bool> {
        self.store.delete(key.urn()).await
    }

    async fn invalidate(
        &self,
        key_type: &str,
        id: &str,
        future_buffer_ms: u64,
    ) -> GCacheResult<()> {
        GCacheMetrics::get()
            .invalidation
            .with_label_values(&[key_type, self.layer().as_str()])
            .inc();

        let key = watermark_key(key_type, id);
        let watermark_ms = now_ms() + future_buffer_ms;
        self.store
            .set_with_expiry(
                &key,
                watermark_ms.to_string().into_bytes(),
                WATERMARK_TTL_SECONDS,
            )
            .await
    }

    async fn flush_all(&self) -> GCacheResult<()> {
        self.store.flush_all().await
    }

    fn layer(&self) -> CacheLayer {
        CacheLayer::Remote
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{KeyConfig, NullConfigProvider};
    use parking_lot::Mutex;
    use std::sync::atomic::AtomicU32;
    use std::time::Duration;

    /// Store stand-in backed by a plain map; expiry is honored on read.
    #[derive(Default)]
    struct MapStore {
        entries: Mutex<HashMap<String, (Vec<u8>, SystemTime)>>,
    }

    impl MapStore {
        fn fetch(&self, key: &str) -> Option<Vec<u8>> {
            let entries = self.entries.lock();
            entries.get(key).and_then(|(value, expires_at)| {
                (SystemTime::now() < *expires_at).then(|| value.clone())
            })
        }

        fn keys(&self) -> Vec<String> {
            self.entries.lock().keys().cloned().collect()
        }
    }

    #[async_trait]
    impl RemoteStore for MapStore {
        async fn get(&self, key: &str) -> GCacheResult<Option<Vec<u8>>> {
            Ok(self.fetch(key))
        }

        async fn get_with_watermark(
            &self,
            key: &str,
            watermark_key: &str,
        ) -> GCacheResult<(Option<Vec<u8>>, Option<i64>)> {
            let watermark = self
                .fetch(watermark_key)
                .and_then(|raw| String::from_utf8(raw).ok())
                .and_then(|text| text.parse().ok());
            Ok((self.fetch(key), watermark))
        }

        async fn set_with_expiry(
            &self,
            key: &str,
            value: Vec<u8>,
            ttl_sec: u64,
        ) -> GCacheResult<()> {
            let expires_at = SystemTime::now() + Duration::from_secs(ttl_sec);
            self.entries
                .lock()
                .insert(key.to_string(), (value, expires_at));
            Ok(())
        }

        async fn delete(&self, key: &str) -> GCacheResult<bool> {
            Ok(self.entries.lock().remove(key).is_some())
        }

        async fn flush_all(&self) -> GCacheResult<()> {
            self.entries.lock().clear();
            Ok(())
        }
    }

    fn tier_with_store() -> (RemoteTier, Arc<MapStore>) {
        let store = Arc::new(MapStore::default());
        let tier = RemoteTier::new(Arc::new(NullConfigProvider), store.clone());
        (tier, store)
    }

    fn tracked_key(id: &str, use_case: &str) -> GCacheKey {
        GCacheKey::builder("t", id, use_case)
            .track_for_invalidation(true)
            .default_config(KeyConfig::enabled(3600))
            .build()
    }

    fn counting_fallback(counter: Arc<AtomicU32>, value: Vec<u8>) -> Fallback {
        Arc::new(move || {
            let counter = counter.clone();
            let value = value.clone();
            Box::pin(async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(value)
            })
        })
    }

    #[tokio::test]
    async fn test_miss_populates_then_hits() {
        let (tier, _store) = tier_with_store();
        let key = tracked_key("1", "uc.remote.hit");
        let calls = Arc::new(AtomicU32::new(0));
        let fallback = counting_fallback(calls.clone(), vec![1, 2]);

        assert_eq!(tier.get(&key, fallback.clone()).await.unwrap(), vec![1, 2]);
        assert_eq!(tier.get(&key, fallback).await.unwrap(), vec![1, 2]);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_watermark_marks_entry_stale() {
        let (tier, _store) = tier_with_store();
        let key = tracked_key("2", "uc.remote.stale");
        let calls = Arc::new(AtomicU32::new(0));

        tier.get(&key, counting_fallback(calls.clone(), vec![1]))
            .await
            .unwrap();
        // Invalidate with no buffer; the stored envelope is now stale.
        tokio::time::sleep(Duration::from_millis(5)).await;
        tier.invalidate("t", "2", 0).await.unwrap();

        let value = tier
            .get(&key, counting_fallback(calls.clone(), vec![9]))
            .await
            .unwrap();
        assert_eq!(value, vec![9]);
        assert_eq!(calls.load(Ordering::SeqCst), 2);

        // The fresh value was written back (the watermark is in the past) and
        // later reads hit it.
        tokio::time::sleep(Duration::from_millis(5)).await;
        let value = tier
            .get(&key, counting_fallback(calls.clone(), vec![0]))
            .await
            .unwrap();
        assert_eq!(value, vec![9]);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_future_watermark_suppresses_write_back() {
        let (tier, store) = tier_with_store();
        let key = tracked_key("3", "uc.remote.buffer");

        tier.invalidate("t", "3", 60_000).await.unwrap();
        let calls = Arc::new(AtomicU32::new(0));
        let value = tier
            .get(&key, counting_fallback(calls.clone(), vec![4]))
            .await
            .unwrap();
        assert_eq!(value, vec![4]);

        // Only the watermark key exists; the value was not persisted.
        let keys = store.keys();
        assert_eq!(keys, vec![key.watermark_key()]);
    }

    #[tokio::test]
    async fn test_untracked_key_skips_watermark_lookup() {
        let (tier, store) = tier_with_store();
        let key = GCacheKey::builder("t", "4", "uc.remote.plain")
            .default_config(KeyConfig::enabled(3600))
            .build();
        let calls = Arc::new(AtomicU32::new(0));

        // A watermark for the same entity does not affect untracked keys.
        tier.invalidate("t", "4", 60_000).await.unwrap();
        tier.get(&key, counting_fallback(calls.clone(), vec![1]))
            .await
            .unwrap();
        assert!(store.keys().contains(&key.urn().to_string()));
        assert_eq!(
            tier.get(&key, counting_fallback(calls.clone(), vec![2]))
                .await
                .unwrap(),
            vec![1]
        );
    }

    #[tokio::test]
    async fn test_put_requires_config() {
        let store = Arc::new(MapStore::default());
        let tier = RemoteTier::new(Arc::new(NullConfigProvider), store);
        let key = GCacheKey::builder("t", "5", "uc.remote.noconfig").build();

        assert!(matches!(
            tier.put(&key, vec![1]).await,
            Err(GCacheError::MissingKeyConfig(_))
        ));
    }

    #[tokio::test]
    async fn test_delete_reports_presence() {
        let (tier, _store) = tier_with_store();
        let key = tracked_key("6", "uc.remote.delete");

        assert!(!tier.delete(&key).await.unwrap());
        tier.put(&key, vec![1]).await.unwrap();
        assert!(tier.delete(&key).await.unwrap());
    }

    #[tokio::test]
    async fn test_large_envelope_round_trips() {
        let (tier, _store) = tier_with_store();
        let key = tracked_key("7", "uc.remote.large");
        let big = vec![0xAB; OFF_THREAD_DECODE_THRESHOLD_BYTES + 1];

        tier.put(&key, big.clone()).await.unwrap();
        let calls = Arc::new(AtomicU32::new(0));
        let value = tier
            .get(&key, counting_fallback(calls.clone(), vec![]))
            .await
            .unwrap();
        assert_eq!(value, big);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }
}

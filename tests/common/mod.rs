//! Shared fixtures for the integration tests
//!
//! The remote store is an external collaborator, so the tests run against an
//! in-memory stand-in that honors the same contract: string keys, expiring
//! sets, multi-get with the watermark entry, and a global flush. Operation
//! counters let tests assert which tiers were touched.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use parking_lot::Mutex;

use gcache::{GCacheResult, RemoteStore};

/// In-memory [`RemoteStore`] with per-operation counters.
#[derive(Default)]
pub struct MemoryStore {
    entries: Mutex<HashMap<String, (Vec<u8>, SystemTime)>>,
    pub gets: AtomicU32,
    pub sets: AtomicU32,
}

impl MemoryStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn fetch(&self, key: &str) -> Option<Vec<u8>> {
        let entries = self.entries.lock();
        entries.get(key).and_then(|(value, expires_at)| {
            (SystemTime::now() < *expires_at).then(|| value.clone())
        })
    }

    /// All live keys, sorted for stable assertions.
    pub fn keys(&self) -> Vec<String> {
        let now = SystemTime::now();
        let mut keys: Vec<String> = self
            .entries
            .lock()
            .iter()
            .filter(|(_, (_, expires_at))| now < *expires_at)
            .map(|(key, _)| key.clone())
            .collect();
        keys.sort();
        keys
    }

    pub fn get_count(&self) -> u32 {
        self.gets.load(Ordering::SeqCst)
    }

    pub fn set_count(&self) -> u32 {
        self.sets.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl RemoteStore for MemoryStore {
    async fn get(&self, key: &str) -> GCacheResult<Option<Vec<u8>>> {
        self.gets.fetch_add(1, Ordering::SeqCst);
        Ok(self.fetch(key))
    }

    async fn get_with_watermark(
        &self,
        key: &str,
        watermark_key: &str,
    ) -> GCacheResult<(Option<Vec<u8>>, Option<i64>)> {
        self.gets.fetch_add(1, Ordering::SeqCst);
        let watermark = self
            .fetch(watermark_key)
            .and_then(|raw| String::from_utf8(raw).ok())
            .and_then(|text| text.parse().ok());
        Ok((self.fetch(key), watermark))
    }

    async fn set_with_expiry(&self, key: &str, value: Vec<u8>, ttl_sec: u64) -> GCacheResult<()> {
        self.sets.fetch_add(1, Ordering::SeqCst);
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

/// Store whose reads always fail; writes are accepted and dropped.
#[derive(Default)]
pub struct FailingStore;

#[async_trait]
impl RemoteStore for FailingStore {
    async fn get(&self, _key: &str) -> GCacheResult<Option<Vec<u8>>> {
        Err(gcache::GCacheError::Serialization(
            "injected store failure".to_string(),
        ))
    }

    async fn get_with_watermark(
        &self,
        _key: &str,
        _watermark_key: &str,
    ) -> GCacheResult<(Option<Vec<u8>>, Option<i64>)> {
        Err(gcache::GCacheError::Serialization(
            "injected store failure".to_string(),
        ))
    }

    async fn set_with_expiry(
        &self,
        _key: &str,
        _value: Vec<u8>,
        _ttl_sec: u64,
    ) -> GCacheResult<()> {
        Ok(())
    }

    async fn delete(&self, _key: &str) -> GCacheResult<bool> {
        Ok(false)
    }

    async fn flush_all(&self) -> GCacheResult<()> {
        Ok(())
    }
}

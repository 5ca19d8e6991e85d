//! Bounded structure cache.
//!
//! Entries are keyed by the SHA-256 of the URL string, expire after a fixed
//! TTL (removed lazily on access), and are evicted oldest-insertion-first when
//! either the entry count or the total payload size would exceed its bound.

use crate::clock::{Clock, SystemClock};
use crate::model::ExtractionResult;
use log::debug;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Limits applied by [`StructureCache`].
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Entries older than this are treated as absent
    pub ttl: Duration,
    /// Upper bound on the summed JSON size of all entries
    pub max_bytes: usize,
    /// Upper bound on the number of entries
    pub max_entries: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(60 * 60),
            max_bytes: 50 * 1024 * 1024,
            max_entries: 100,
        }
    }
}

#[derive(Debug, Clone)]
struct CacheEntry {
    data: Arc<ExtractionResult>,
    created_at: Duration,
    /// Insertion sequence; breaks ties between equal timestamps
    seq: u64,
    size_bytes: usize,
}

#[derive(Default)]
struct Inner {
    entries: HashMap<String, CacheEntry>,
    total_bytes: usize,
    next_seq: u64,
}

impl Inner {
    fn remove(&mut self, key: &str) -> Option<CacheEntry> {
        let entry = self.entries.remove(key)?;
        self.total_bytes -= entry.size_bytes;
        Some(entry)
    }

    fn oldest_key(&self) -> Option<String> {
        self.entries
            .iter()
            .min_by_key(|(_, e)| (e.created_at, e.seq))
            .map(|(k, _)| k.clone())
    }
}

/// Cache from URL to a shared, immutable [`ExtractionResult`].
pub struct StructureCache {
    config: CacheConfig,
    clock: Arc<dyn Clock>,
    inner: Mutex<Inner>,
}

impl StructureCache {
    pub fn new(config: CacheConfig) -> Self {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    pub fn with_clock(config: CacheConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            config,
            clock,
            inner: Mutex::new(Inner::default()),
        }
    }

    /// Content hash of the URL string; no normalization beyond the caller's.
    pub fn key_for(url: &str) -> String {
        hex::encode(Sha256::digest(url.as_bytes()))
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    pub fn get(&self, url: &str) -> Option<Arc<ExtractionResult>> {
        let key = Self::key_for(url);
        let now = self.clock.now();
        let mut inner = self.lock();
        let expired = match inner.entries.get(&key) {
            None => {
                debug!("structure cache miss for {}", url);
                return None;
            }
            Some(entry) => now.saturating_sub(entry.created_at) >= self.config.ttl,
        };
        if expired {
            debug!("structure cache entry for {} expired", url);
            inner.remove(&key);
            return None;
        }
        debug!("structure cache hit for {}", url);
        inner.entries.get(&key).map(|e| e.data.clone())
    }

    pub fn set(&self, url: &str, data: Arc<ExtractionResult>) {
        let size_bytes = serde_json::to_vec(data.as_ref())
            .map(|v| v.len())
            .unwrap_or(0);
        if size_bytes > self.config.max_bytes || self.config.max_entries == 0 {
            debug!(
                "not caching {}: {} bytes exceeds the cache budget",
                url, size_bytes
            );
            return;
        }

        let key = Self::key_for(url);
        let now = self.clock.now();
        let mut inner = self.lock();
        inner.remove(&key);

        while inner.entries.len() + 1 > self.config.max_entries
            || inner.total_bytes + size_bytes > self.config.max_bytes
        {
            let Some(oldest) = inner.oldest_key() else {
                break;
            };
            debug!("evicting structure cache entry {}", oldest);
            inner.remove(&oldest);
        }

        let seq = inner.next_seq;
        inner.next_seq += 1;
        inner.total_bytes += size_bytes;
        inner.entries.insert(
            key,
            CacheEntry {
                data,
                created_at: now,
                seq,
                size_bytes,
            },
        );
    }

    pub fn clear(&self) {
        let mut inner = self.lock();
        inner.entries.clear();
        inner.total_bytes = 0;
    }

    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn total_bytes(&self) -> usize {
        self.lock().total_bytes
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

//! Response cache with TTL expiry.
//!
//! Cache keys are a pure function of the normalized inputs, so identical
//! requests hit the same entry across time, workers and process restarts.
//! Cache failures never block the critical path: the pipeline treats an error
//! as a miss and carries on.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;
use sha2::{Digest, Sha256};

use crate::error::Result;
use crate::types::PromptOptions;

/// Derive the cache key for a prompt and its options.
///
/// Fields are length-framed before hashing so adjacent values cannot collide
/// ("ab" + "c" vs "a" + "bc"). Options are already normalized, so ordering at
/// the call site does not affect the key.
pub fn cache_key(prompt: &str, options: &PromptOptions) -> String {
    let mut hasher = Sha256::new();
    hasher.update((prompt.len() as u64).to_be_bytes());
    hasher.update(prompt.as_bytes());
    for (name, value) in options.iter() {
        hasher.update((name.len() as u64).to_be_bytes());
        hasher.update(name.as_bytes());
        hasher.update((value.len() as u64).to_be_bytes());
        hasher.update(value.as_bytes());
    }
    format!("{:x}", hasher.finalize())
}

/// Storage abstraction for cached responses.
#[async_trait]
pub trait ResponseCache: Send + Sync {
    /// Look up a live entry. Entries past their TTL read as `None` and may be
    /// evicted opportunistically.
    async fn get(&self, key: &str) -> Result<Option<String>>;

    /// Store a value with a time-to-live.
    async fn put(&self, key: &str, value: String, ttl: Duration) -> Result<()>;

    /// Wipe all entries unconditionally. Operator action.
    async fn clear(&self) -> Result<()>;
}

struct CacheEntry {
    value: String,
    created_at: Instant,
    ttl: Duration,
}

impl CacheEntry {
    fn is_expired(&self) -> bool {
        self.created_at.elapsed() >= self.ttl
    }
}

/// In-memory TTL cache over a concurrent map.
///
/// Concurrent `get`/`put` on the same key never observe a partially written
/// value; each entry is replaced atomically.
pub struct MemoryCache {
    entries: DashMap<String, CacheEntry>,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Default for MemoryCache {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ResponseCache for MemoryCache {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let value = self
            .entries
            .get(key)
            .and_then(|entry| (!entry.is_expired()).then(|| entry.value.clone()));

        if value.is_none() {
            // Expired (or never present): evict opportunistically.
            self.entries.remove_if(key, |_, entry| entry.is_expired());
        }

        Ok(value)
    }

    async fn put(&self, key: &str, value: String, ttl: Duration) -> Result<()> {
        self.entries.insert(
            key.to_string(),
            CacheEntry {
                value,
                created_at: Instant::now(),
                ttl,
            },
        );
        Ok(())
    }

    async fn clear(&self) -> Result<()> {
        self.entries.clear();
        Ok(())
    }
}

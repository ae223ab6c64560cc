//! Distributed cache collaborator.
//!
//! The pipeline only needs per-key atomic `get`/`set`/`remove` over opaque byte strings.
//! [`MemoryCache`] is the in-process implementation used by the binary and the tests;
//! deployments running several instances plug a shared backend in through
//! [`DistributedCache`].

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("Cache operation failed: {0}")]
    Backend(String),
}

pub type CacheResult<T> = Result<T, CacheError>;

/// Key/value cache shared by every call of the server.
///
/// Implementations must make each operation atomic for a given key.
#[async_trait]
pub trait DistributedCache: Send + Sync {
    /// Returns the stored bytes, or `None` when the key is unknown or expired.
    async fn get(&self, key: &str) -> CacheResult<Option<Vec<u8>>>;

    async fn set(&self, key: &str, value: Vec<u8>, ttl: Duration) -> CacheResult<()>;

    /// Removes the entry. Removing an absent key is not an error.
    async fn remove(&self, key: &str) -> CacheResult<()>;
}

#[derive(Clone)]
struct CacheEntry {
    data: Vec<u8>,
    expires_at: Instant,
}

impl CacheEntry {
    fn new(data: Vec<u8>, ttl: Duration) -> Self {
        Self {
            data,
            expires_at: Instant::now() + ttl,
        }
    }

    fn is_expired(&self) -> bool {
        Instant::now() > self.expires_at
    }
}

/// In-process [`DistributedCache`] backed by a `DashMap`.
#[derive(Clone)]
pub struct MemoryCache {
    entries: Arc<DashMap<String, CacheEntry>>,
    last_cleanup: Arc<Mutex<Instant>>,
}

impl Default for MemoryCache {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryCache {
    pub fn new() -> Self {
        Self {
            entries: Arc::new(DashMap::new()),
            last_cleanup: Arc::new(Mutex::new(Instant::now())),
        }
    }

    /// Perform lazy cleanup if enough time has passed
    fn maybe_cleanup(&self) {
        const CLEANUP_INTERVAL: Duration = Duration::from_secs(60);

        if let Ok(mut last_cleanup) = self.last_cleanup.try_lock()
            && last_cleanup.elapsed() >= CLEANUP_INTERVAL
        {
            *last_cleanup = Instant::now();
            drop(last_cleanup);

            self.entries.retain(|_, entry| !entry.is_expired());
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[async_trait]
impl DistributedCache for MemoryCache {
    async fn get(&self, key: &str) -> CacheResult<Option<Vec<u8>>> {
        self.maybe_cleanup();

        Ok(self.entries.get(key).and_then(|entry| {
            if entry.is_expired() {
                None
            } else {
                Some(entry.data.clone())
            }
        }))
    }

    async fn set(&self, key: &str, value: Vec<u8>, ttl: Duration) -> CacheResult<()> {
        self.maybe_cleanup();

        self.entries
            .insert(key.to_string(), CacheEntry::new(value, ttl));
        Ok(())
    }

    async fn remove(&self, key: &str) -> CacheResult<()> {
        self.entries.remove(key);
        Ok(())
    }
}

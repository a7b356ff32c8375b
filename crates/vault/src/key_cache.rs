//! Expiring in-process cache for the unwrapped master key.
//!
//! This is a performance cache only: the wrapped key stays persisted
//! regardless, and an evicted key is simply unwrapped again on next use.
//! Expiry is checked on every access; a background task additionally drops
//! the entry once the TTL elapses so the key does not linger in memory.

use std::{
    future::Future,
    sync::{Arc, Mutex, Weak},
    time::Duration,
};

use tokio::{task::JoinHandle, time::Instant};

use crate::{error::Result, master_key::MasterKey};

struct CacheEntry {
    key: MasterKey,
    expires_at: Instant,
    generation: u64,
    evictor: Option<JoinHandle<()>>,
}

#[derive(Default)]
struct Slot {
    entry: Option<CacheEntry>,
    generation: u64,
}

impl Slot {
    fn take(&mut self) {
        if let Some(entry) = self.entry.take()
            && let Some(evictor) = entry.evictor
        {
            evictor.abort();
        }
    }
}

/// Single-entry cache with a fixed time-to-live.
pub struct KeyCache {
    ttl: Duration,
    slot: Arc<Mutex<Slot>>,
}

impl KeyCache {
    /// A zero `ttl` disables caching entirely.
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            slot: Arc::new(Mutex::new(Slot::default())),
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// The cached key if present and unexpired.
    pub fn get(&self) -> Option<MasterKey> {
        let mut slot = self.slot.lock().unwrap_or_else(|e| e.into_inner());
        let live = slot
            .entry
            .as_ref()
            .map(|entry| (Instant::now() < entry.expires_at).then(|| entry.key.clone()));
        match live {
            Some(Some(key)) => Some(key),
            Some(None) => {
                slot.take();
                None
            },
            None => None,
        }
    }

    /// Cache `key` for one TTL, replacing any previous entry.
    pub fn insert(&self, key: MasterKey) {
        if self.ttl.is_zero() {
            return;
        }

        let mut slot = self.slot.lock().unwrap_or_else(|e| e.into_inner());
        slot.take();
        slot.generation += 1;

        let generation = slot.generation;
        let expires_at = Instant::now() + self.ttl;
        let evictor = tokio::runtime::Handle::try_current()
            .ok()
            .map(|handle| handle.spawn(evict_at(Arc::downgrade(&self.slot), generation, expires_at)));

        slot.entry = Some(CacheEntry {
            key,
            expires_at,
            generation,
            evictor,
        });
    }

    /// Return the cached key, or run `derive` and cache its result.
    pub async fn get_or_derive<F, Fut>(&self, derive: F) -> Result<MasterKey>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<MasterKey>>,
    {
        if let Some(key) = self.get() {
            return Ok(key);
        }
        let key = derive().await?;
        self.insert(key.clone());
        Ok(key)
    }

    /// Drop the cached key immediately.
    pub fn clear(&self) {
        self.slot
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
    }

    /// Whether an entry is held right now, expired or not.
    pub fn is_populated(&self) -> bool {
        self.slot
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .entry
            .is_some()
    }
}

impl Drop for KeyCache {
    fn drop(&mut self) {
        self.clear();
    }
}

/// Holds only a weak handle so a pending timer never keeps a dropped cache
/// (and its key) alive.
async fn evict_at(slot: Weak<Mutex<Slot>>, generation: u64, expires_at: Instant) {
    tokio::time::sleep_until(expires_at).await;
    let Some(slot) = slot.upgrade() else {
        return;
    };
    let mut slot = slot.lock().unwrap_or_else(|e| e.into_inner());
    if slot
        .entry
        .as_ref()
        .is_some_and(|entry| entry.generation == generation)
    {
        // Running inside the evictor itself: drop without aborting.
        slot.entry = None;
        #[cfg(feature = "tracing")]
        tracing::debug!("master key cache entry expired");
    }
}

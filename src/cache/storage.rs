//! Bounded in-memory store with per-entry expiry and a byte budget.
//!
//! Entries are charged an estimated footprint (see [`EstimateSize`]). When a
//! `set` pushes the total over `max_bytes`, entries are evicted before the
//! call returns: already-expired entries first, then the least recently
//! touched. Recency is a logical clock shared by inserts and hits, so two
//! entries never tie and untouched entries fall out in insertion order.

use super::size::{entry_size, EstimateSize};
use crate::error::ShieldError;
use log::debug;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::time::Instant;

/// Cache entry with expiry and access tracking
#[derive(Debug)]
struct CacheEntry<V> {
    value: V,
    /// `None` when the TTL reaches past the clock's range
    expires_at: Option<Instant>,
    size: usize,
    last_access: AtomicU64,
}

impl<V> CacheEntry<V> {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| now >= at)
    }

    fn touch(&self, stamp: u64) {
        self.last_access.store(stamp, Ordering::Relaxed);
    }

    fn recency(&self) -> u64 {
        self.last_access.load(Ordering::Relaxed)
    }
}

struct StoreInner<V> {
    entries: HashMap<String, CacheEntry<V>>,
    current_bytes: usize,
}

/// What a `set` did to the store, for metrics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SetOutcome {
    /// Footprint charged for the new entry
    pub size: usize,
    /// Footprint of the entry that was overwritten, if any
    pub replaced: Option<usize>,
    pub evicted: usize,
    pub evicted_bytes: usize,
}

/// Entries removed by a sweep or clear
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Removed {
    pub count: usize,
    pub bytes: usize,
}

pub struct BoundedStore<V> {
    inner: RwLock<StoreInner<V>>,
    clock: AtomicU64,
    max_bytes: usize,
}

impl<V: Clone + EstimateSize> BoundedStore<V> {
    pub fn new(max_bytes: usize) -> Result<Self, ShieldError> {
        if max_bytes == 0 {
            return Err(ShieldError::InvalidConfig(
                "store max_bytes must be greater than zero".to_string(),
            ));
        }
        Ok(Self {
            inner: RwLock::new(StoreInner {
                entries: HashMap::new(),
                current_bytes: 0,
            }),
            clock: AtomicU64::new(0),
            max_bytes,
        })
    }

    fn tick(&self) -> u64 {
        self.clock.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Insert or overwrite `key`, evicting until the byte budget holds again
    pub fn set(&self, key: impl Into<String>, value: V, ttl: Duration) -> Result<SetOutcome, ShieldError> {
        if ttl.is_zero() {
            return Err(ShieldError::InvalidTtl(ttl));
        }
        let key = key.into();
        let size = entry_size(&key, &value);
        if size > self.max_bytes {
            return Err(ShieldError::ItemTooLarge {
                key,
                size,
                max: self.max_bytes,
            });
        }

        let now = Instant::now();
        let entry = CacheEntry {
            value,
            expires_at: now.checked_add(ttl),
            size,
            last_access: AtomicU64::new(self.tick()),
        };

        let mut inner = self.inner.write();
        let mut outcome = SetOutcome {
            size,
            ..SetOutcome::default()
        };

        if let Some(old) = inner.entries.insert(key, entry) {
            inner.current_bytes -= old.size;
            outcome.replaced = Some(old.size);
        }
        inner.current_bytes += size;

        while inner.current_bytes > self.max_bytes && !inner.entries.is_empty() {
            let victim = inner
                .entries
                .iter()
                .min_by_key(|(_, e)| (!e.is_expired(now), e.recency()))
                .map(|(k, _)| k.clone());
            let Some(victim) = victim else { break };
            if let Some(evicted) = inner.entries.remove(&victim) {
                inner.current_bytes -= evicted.size;
                outcome.evicted += 1;
                outcome.evicted_bytes += evicted.size;
                debug!("Evicted '{}' ({} bytes) to stay under {} bytes", victim, evicted.size, self.max_bytes);
            }
        }

        Ok(outcome)
    }

    /// Value for `key` if present and unexpired; refreshes its recency
    pub fn get(&self, key: &str) -> Option<V> {
        let now = Instant::now();
        {
            let inner = self.inner.read();
            match inner.entries.get(key) {
                None => return None,
                Some(entry) if !entry.is_expired(now) => {
                    entry.touch(self.tick());
                    return Some(entry.value.clone());
                }
                Some(_) => {}
            }
        }

        // Expired: drop it now rather than waiting for the sweeper.
        let mut inner = self.inner.write();
        if inner.entries.get(key).is_some_and(|e| e.is_expired(now)) {
            if let Some(entry) = inner.entries.remove(key) {
                inner.current_bytes -= entry.size;
            }
        }
        None
    }

    /// Whether `key` is present and unexpired, without touching recency
    pub fn contains(&self, key: &str) -> bool {
        let now = Instant::now();
        self.inner
            .read()
            .entries
            .get(key)
            .is_some_and(|e| !e.is_expired(now))
    }

    /// Time left before `key` expires
    pub fn ttl_remaining(&self, key: &str) -> Option<Duration> {
        let now = Instant::now();
        self.inner
            .read()
            .entries
            .get(key)
            .filter(|e| !e.is_expired(now))
            .map(|e| e.expires_at.map_or(Duration::MAX, |at| at - now))
    }

    /// Remove `key`, returning the bytes it freed
    pub fn remove(&self, key: &str) -> Option<usize> {
        let mut inner = self.inner.write();
        let entry = inner.entries.remove(key)?;
        inner.current_bytes -= entry.size;
        Some(entry.size)
    }

    pub fn delete(&self, key: &str) -> bool {
        self.remove(key).is_some()
    }

    /// Drop every expired entry.
    ///
    /// Candidates are collected under the read lock so concurrent readers
    /// only contend with the short removal phase.
    pub fn remove_expired(&self) -> Removed {
        let now = Instant::now();
        let expired: Vec<String> = {
            let inner = self.inner.read();
            inner
                .entries
                .iter()
                .filter(|(_, e)| e.is_expired(now))
                .map(|(k, _)| k.clone())
                .collect()
        };
        if expired.is_empty() {
            return Removed::default();
        }

        let mut removed = Removed::default();
        let mut inner = self.inner.write();
        for key in expired {
            // Re-check: the key may have been refreshed in between.
            if inner.entries.get(&key).is_some_and(|e| e.is_expired(now)) {
                if let Some(entry) = inner.entries.remove(&key) {
                    inner.current_bytes -= entry.size;
                    removed.count += 1;
                    removed.bytes += entry.size;
                }
            }
        }
        removed
    }

    pub fn clear(&self) -> Removed {
        let mut inner = self.inner.write();
        let removed = Removed {
            count: inner.entries.len(),
            bytes: inner.current_bytes,
        };
        inner.entries.clear();
        inner.current_bytes = 0;
        removed
    }

    /// Number of stored entries, including expired ones not yet swept
    pub fn len(&self) -> usize {
        self.inner.read().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn total_size(&self) -> usize {
        self.inner.read().current_bytes
    }

    pub fn max_size(&self) -> usize {
        self.max_bytes
    }
}

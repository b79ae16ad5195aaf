//! Tiered cache engine
//!
//! Three cascading tiers with their own TTLs:
//!
//! | Tier | Backend                  | Default TTL |
//! |------|--------------------------|-------------|
//! | L1   | process memory (bounded) | 30s         |
//! | L2   | embedded persistent KV   | 5min        |
//! | L3   | durable KV               | 1h          |
//!
//! Reads fall through L1 → L2 → L3 and promote hits into the faster tiers.
//! A promoted copy never outlives the entry it was promoted from, so a value
//! written with TTL `T` is never served after `T` elapses, whichever tier
//! answers.
//!
//! Writes can target tiers explicitly ([`TieredCache::set`]) or let the
//! per-key access frequency decide ([`TieredCache::set_adaptive`]): cold keys
//! stay in memory, warm keys reach L2, hot keys reach every tier.
//!
//! Storage failures are never surfaced. A read error or a corrupt entry
//! evicts the key from that tier and the lookup continues with the next one.

mod entry;

pub use entry::{CacheEntry, CacheTier};

use parking_lot::Mutex;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing::{debug, trace, warn};

use crate::clock::SharedClock;
use crate::config::CacheConfig;
use crate::store::{KeyValueStore, MemoryKeyValueStore};

/// Reserved L2 key prefix for access counters.
pub const FREQUENCY_PREFIX: &str = "__freq__:";

/// Point-in-time cache counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub l1_hits: u64,
    pub l2_hits: u64,
    pub l3_hits: u64,
    pub misses: u64,
    pub backend_errors: u64,
}

#[derive(Debug, Default)]
struct Counters {
    l1_hits: AtomicU64,
    l2_hits: AtomicU64,
    l3_hits: AtomicU64,
    misses: AtomicU64,
    backend_errors: AtomicU64,
}

/// Three-tier cache with per-tier TTLs and adaptive promotion.
pub struct TieredCache {
    l1: Mutex<HashMap<String, CacheEntry<Value>>>,
    l2: Arc<dyn KeyValueStore>,
    l3: Arc<dyn KeyValueStore>,
    config: CacheConfig,
    clock: SharedClock,
    counters: Counters,
}

impl TieredCache {
    pub fn new(
        config: CacheConfig,
        l2: Arc<dyn KeyValueStore>,
        l3: Arc<dyn KeyValueStore>,
        clock: SharedClock,
    ) -> Self {
        debug!(l2 = l2.name(), l3 = l3.name(), l1_capacity = config.l1_capacity, "Tiered cache created");
        Self { l1: Mutex::new(HashMap::new()), l2, l3, config, clock, counters: Counters::default() }
    }

    /// A cache whose persistent tiers are in-memory stores.
    pub fn in_memory(config: CacheConfig, clock: SharedClock) -> Self {
        Self::new(
            config,
            Arc::new(MemoryKeyValueStore::new("l2-memory")),
            Arc::new(MemoryKeyValueStore::new("l3-memory")),
            clock,
        )
    }

    fn ttl(&self, tier: CacheTier) -> Duration {
        Duration::from_secs(match tier {
            CacheTier::Memory => self.config.l1_ttl_secs,
            CacheTier::Persistent => self.config.l2_ttl_secs,
            CacheTier::Durable => self.config.l3_ttl_secs,
        })
    }

    fn store(&self, tier: CacheTier) -> &dyn KeyValueStore {
        match tier {
            CacheTier::Persistent => self.l2.as_ref(),
            _ => self.l3.as_ref(),
        }
    }

    /// Look a key up, falling through the tiers and promoting hits.
    pub async fn get<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        self.record_access(key).await;
        let now = self.clock.now_ms();

        if let Some(value) = self.l1_get(key, now) {
            match serde_json::from_value::<T>(value) {
                Ok(typed) => {
                    self.counters.l1_hits.fetch_add(1, Ordering::Relaxed);
                    trace!(key, "L1 hit");
                    return Some(typed);
                }
                Err(e) => {
                    warn!(key, error = %e, "L1 entry has unexpected shape, evicting");
                    self.l1.lock().remove(key);
                }
            }
        }

        for tier in [CacheTier::Persistent, CacheTier::Durable] {
            let Some(entry) = self.read_tier(tier, key, now).await else {
                continue;
            };
            let typed = match serde_json::from_value::<T>(entry.value.clone()) {
                Ok(typed) => typed,
                Err(e) => {
                    warn!(key, %tier, error = %e, "Cached value has unexpected shape, evicting");
                    self.evict(tier, key).await;
                    continue;
                }
            };

            self.l1_insert(key, entry.promoted(now, self.ttl(CacheTier::Memory)), now);
            if tier == CacheTier::Durable {
                let promoted = entry.promoted(now, self.ttl(CacheTier::Persistent));
                self.write_tier(CacheTier::Persistent, key, &promoted).await;
                self.counters.l3_hits.fetch_add(1, Ordering::Relaxed);
            } else {
                self.counters.l2_hits.fetch_add(1, Ordering::Relaxed);
            }
            debug!(key, %tier, "Cache hit, promoted to faster tiers");
            return Some(typed);
        }

        self.counters.misses.fetch_add(1, Ordering::Relaxed);
        trace!(key, "Cache miss");
        None
    }

    /// Write a value to L1 and every tier up to `max_tier`.
    ///
    /// Slower tiers above `max_tier` drop the key so they can never serve an
    /// older value once the faster copy expires.
    pub async fn set<T: Serialize>(&self, key: &str, value: &T, max_tier: CacheTier) {
        let value = match serde_json::to_value(value) {
            Ok(value) => value,
            Err(e) => {
                warn!(key, error = %e, "Value is not serializable, not cached");
                return;
            }
        };
        let now = self.clock.now_ms();

        self.l1_insert(key, CacheEntry::new(value.clone(), now, self.ttl(CacheTier::Memory)), now);

        for tier in [CacheTier::Persistent, CacheTier::Durable] {
            if tier <= max_tier {
                let entry = CacheEntry::new(value.clone(), now, self.ttl(tier));
                self.write_tier(tier, key, &entry).await;
            } else {
                self.evict(tier, key).await;
            }
        }
        trace!(key, %max_tier, "Cached value");
    }

    /// Write a value to the tiers its access frequency earns.
    pub async fn set_adaptive<T: Serialize>(&self, key: &str, value: &T) -> CacheTier {
        let tier = self.tier_for(self.access_count(key).await);
        self.set(key, value, tier).await;
        tier
    }

    /// Tier a key with `accesses` reads qualifies for.
    pub fn tier_for(&self, accesses: u64) -> CacheTier {
        if accesses >= self.config.promote_all_after {
            CacheTier::Durable
        } else if accesses >= self.config.promote_persistent_after {
            CacheTier::Persistent
        } else {
            CacheTier::Memory
        }
    }

    /// Reads recorded for `key`. Counters live in L2 only.
    pub async fn access_count(&self, key: &str) -> u64 {
        match self.l2.get(&frequency_key(key)).await {
            Ok(Some(bytes)) => serde_json::from_slice(&bytes).unwrap_or(0),
            Ok(None) => 0,
            Err(e) => {
                debug!(key, error = %e, "Access counter unavailable");
                0
            }
        }
    }

    async fn record_access(&self, key: &str) {
        let count = self.access_count(key).await.saturating_add(1);
        let bytes = count.to_string().into_bytes();
        if let Err(e) = self.l2.put(&frequency_key(key), bytes).await {
            debug!(key, error = %e, "Failed to record access");
        }
    }

    /// Remove a key from every tier.
    pub async fn invalidate(&self, key: &str) {
        self.l1.lock().remove(key);
        self.evict(CacheTier::Persistent, key).await;
        self.evict(CacheTier::Durable, key).await;
        debug!(key, "Invalidated cache key");
    }

    /// Remove every key starting with `prefix` from every tier.
    ///
    /// Access counters are kept.
    pub async fn invalidate_prefix(&self, prefix: &str) {
        let removed_l1 = {
            let mut l1 = self.l1.lock();
            let before = l1.len();
            l1.retain(|key, _| !key.starts_with(prefix));
            before - l1.len()
        };

        let mut removed_persistent = 0;
        for tier in [CacheTier::Persistent, CacheTier::Durable] {
            let keys = match self.store(tier).keys().await {
                Ok(keys) => keys,
                Err(e) => {
                    self.counters.backend_errors.fetch_add(1, Ordering::Relaxed);
                    warn!(%tier, prefix, error = %e, "Cannot enumerate keys for prefix sweep");
                    continue;
                }
            };
            for key in keys.iter().filter(|k| k.starts_with(prefix) && !k.starts_with(FREQUENCY_PREFIX)) {
                self.evict(tier, key).await;
                removed_persistent += 1;
            }
        }
        debug!(prefix, removed_l1, removed_persistent, "Invalidated cache prefix");
    }

    /// Whether L1 currently holds an unexpired entry for `key`.
    pub fn in_memory_tier(&self, key: &str) -> bool {
        let now = self.clock.now_ms();
        self.l1.lock().get(key).is_some_and(|entry| !entry.is_expired_at(now))
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            l1_hits: self.counters.l1_hits.load(Ordering::Relaxed),
            l2_hits: self.counters.l2_hits.load(Ordering::Relaxed),
            l3_hits: self.counters.l3_hits.load(Ordering::Relaxed),
            misses: self.counters.misses.load(Ordering::Relaxed),
            backend_errors: self.counters.backend_errors.load(Ordering::Relaxed),
        }
    }

    fn l1_get(&self, key: &str, now: u64) -> Option<Value> {
        let mut l1 = self.l1.lock();
        let entry = l1.get_mut(key)?;
        if entry.is_expired_at(now) {
            l1.remove(key);
            return None;
        }
        entry.touch(now);
        Some(entry.value.clone())
    }

    fn l1_insert(&self, key: &str, entry: CacheEntry<Value>, now: u64) {
        let mut l1 = self.l1.lock();
        if !l1.contains_key(key) && l1.len() >= self.config.l1_capacity {
            l1.retain(|_, entry| !entry.is_expired_at(now));
            if l1.len() >= self.config.l1_capacity {
                let coldest = l1.iter().min_by_key(|(_, entry)| entry.last_accessed).map(|(k, _)| k.clone());
                if let Some(coldest) = coldest {
                    trace!(key = %coldest, "L1 full, evicting least recently used");
                    l1.remove(&coldest);
                }
            }
        }
        l1.insert(key.to_string(), entry);
    }

    async fn read_tier(&self, tier: CacheTier, key: &str, now: u64) -> Option<CacheEntry<Value>> {
        let bytes = match self.store(tier).get(key).await {
            Ok(Some(bytes)) => bytes,
            Ok(None) => return None,
            Err(e) => {
                self.counters.backend_errors.fetch_add(1, Ordering::Relaxed);
                warn!(key, %tier, error = %e, "Cache tier read failed, falling through");
                self.evict(tier, key).await;
                return None;
            }
        };

        match serde_json::from_slice::<CacheEntry<Value>>(&bytes) {
            Ok(entry) if entry.is_expired_at(now) => {
                trace!(key, %tier, "Entry expired");
                self.evict(tier, key).await;
                None
            }
            Ok(entry) => Some(entry),
            Err(e) => {
                self.counters.backend_errors.fetch_add(1, Ordering::Relaxed);
                warn!(key, %tier, error = %e, "Corrupt cache entry, evicting");
                self.evict(tier, key).await;
                None
            }
        }
    }

    async fn write_tier(&self, tier: CacheTier, key: &str, entry: &CacheEntry<Value>) {
        let bytes = match serde_json::to_vec(entry) {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!(key, %tier, error = %e, "Failed to encode cache entry");
                return;
            }
        };
        if let Err(e) = self.store(tier).put(key, bytes).await {
            self.counters.backend_errors.fetch_add(1, Ordering::Relaxed);
            warn!(key, %tier, error = %e, "Cache tier write failed, evicting");
            self.evict(tier, key).await;
        }
    }

    async fn evict(&self, tier: CacheTier, key: &str) {
        if let Err(e) = self.store(tier).delete(key).await {
            debug!(key, %tier, error = %e, "Eviction failed");
        }
    }
}

fn frequency_key(key: &str) -> String {
    format!("{FREQUENCY_PREFIX}{key}")
}

//! Cache entries and tiers

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// A cached value with its timestamps (epoch milliseconds).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry<T> {
    pub value: T,
    pub created_at: u64,
    pub expires_at: u64,
    pub last_accessed: u64,
}

impl<T> CacheEntry<T> {
    pub fn new(value: T, now: u64, ttl: Duration) -> Self {
        Self { value, created_at: now, expires_at: now.saturating_add(ttl.as_millis() as u64), last_accessed: now }
    }

    /// An entry is still readable at exactly `expires_at` and gone after.
    pub fn is_expired_at(&self, now: u64) -> bool {
        now > self.expires_at
    }

    pub fn touch(&mut self, now: u64) {
        self.last_accessed = now;
    }

    /// Copy for a tier with `ttl`, never outliving the entry it came from.
    pub fn promoted(&self, now: u64, ttl: Duration) -> Self
    where
        T: Clone,
    {
        let mut entry = Self::new(self.value.clone(), now, ttl);
        entry.created_at = self.created_at;
        entry.expires_at = entry.expires_at.min(self.expires_at);
        entry
    }
}

/// One level of the cache hierarchy, ordered fastest to slowest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum CacheTier {
    /// L1: process memory
    Memory,
    /// L2: embedded persistent store
    Persistent,
    /// L3: durable store
    Durable,
}

impl fmt::Display for CacheTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CacheTier::Memory => f.write_str("l1"),
            CacheTier::Persistent => f.write_str("l2"),
            CacheTier::Durable => f.write_str("l3"),
        }
    }
}

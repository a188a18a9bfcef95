//! Bounded, time-limited "have I seen this?" cache.
//!
//! Guards the push boundary against the tail agent's at-least-once
//! resubmission. Entries expire lazily: an expired fingerprint is only
//! purged when it is looked up again or reaches the eviction end of the
//! recency list. Every entry shares one TTL, so recency order is also
//! expiry order and the least-recently-used entry is always the first to
//! expire.

use std::num::NonZeroUsize;
use std::time::{Duration, Instant};

use lru::LruCache;
use parking_lot::Mutex;

use crate::config::DedupConfig;

pub const DEFAULT_MAX_ENTRIES: usize = 100_000;
pub const DEFAULT_TTL: Duration = Duration::from_secs(600);

pub struct DedupCache {
    ttl: Duration,
    entries: Mutex<LruCache<String, Instant>>,
}

impl DedupCache {
    /// Create a cache; a zero capacity or TTL falls back to the defaults.
    pub fn new(max_entries: usize, ttl: Duration) -> Self {
        let max_entries = if max_entries == 0 {
            DEFAULT_MAX_ENTRIES
        } else {
            max_entries
        };
        let capacity = NonZeroUsize::new(max_entries).unwrap_or(NonZeroUsize::MIN);
        let ttl = if ttl.is_zero() { DEFAULT_TTL } else { ttl };
        Self {
            ttl,
            entries: Mutex::new(LruCache::new(capacity)),
        }
    }

    pub fn from_config(config: &DedupConfig) -> Self {
        Self::new(config.max_entries, Duration::from_secs(config.ttl_secs))
    }

    /// Report whether `key` was already present and unexpired, marking it
    /// seen either way.
    pub fn seen(&self, key: &str) -> bool {
        self.seen_at(key, Instant::now())
    }

    /// [`seen`](Self::seen) against an explicit clock.
    pub fn seen_at(&self, key: &str, now: Instant) -> bool {
        let expires_at = now + self.ttl;
        let mut entries = self.entries.lock();

        let expired = match entries.get_mut(key) {
            Some(existing) if *existing > now => {
                *existing = expires_at;
                return true;
            }
            Some(_) => true,
            None => false,
        };
        if expired {
            entries.pop(key);
        }

        // Drop an expired tail first so a full cache never evicts a live entry
        // while a dead one is still resident
        if entries.len() == entries.cap().get() {
            if let Some((_, &tail_expiry)) = entries.peek_lru() {
                if tail_expiry <= now {
                    entries.pop_lru();
                }
            }
        }
        entries.push(key.to_string(), expires_at);
        false
    }

    /// Unmark `key`, so a later sighting is not treated as a duplicate.
    pub fn forget(&self, key: &str) {
        self.entries.lock().pop(key);
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for DedupCache {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_ENTRIES, DEFAULT_TTL)
    }
}

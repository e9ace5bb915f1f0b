//! Keyed TTL cache
//!
//! Entries live in a sharded map (per-key atomic access) while an ordered
//! expiry index lets `sweep` visit only what has expired. Each insert gets a
//! generation number; the sweep removes a key only if the generation it
//! indexed is still the live one, so a re-inserted key survives a stale index
//! entry.

use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tracing::debug;

/// Longest TTL honoured; longer TTLs are clamped to it
pub const MAX_TTL: Duration = Duration::from_secs(10 * 365 * 24 * 3_600);

#[derive(Debug, Clone)]
struct Slot<V> {
    value: V,
    expires_at: Instant,
    generation: u64,
}

/// Concurrent cache whose entries expire after a per-entry TTL
#[derive(Debug)]
pub struct TtlCache<K, V>
where
    K: Eq + Hash,
{
    entries: DashMap<K, Slot<V>>,
    expiry_index: Mutex<BTreeMap<(Instant, u64), K>>,
    generation: AtomicU64,
    default_ttl: Duration,
    sweep_threshold: usize,
}

impl<K, V> TtlCache<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    /// Create a cache; inserting past `sweep_threshold` entries triggers a sweep
    pub fn new(default_ttl: Duration, sweep_threshold: usize) -> Self {
        Self {
            entries: DashMap::new(),
            expiry_index: Mutex::new(BTreeMap::new()),
            generation: AtomicU64::new(0),
            default_ttl,
            sweep_threshold,
        }
    }

    /// Live value for `key`; expired entries read as absent
    pub fn get(&self, key: &K) -> Option<V> {
        let now = Instant::now();
        self.entries
            .get(key)
            .filter(|slot| slot.expires_at > now)
            .map(|slot| slot.value.clone())
    }

    /// Whether a live entry exists for `key`
    pub fn contains(&self, key: &K) -> bool {
        let now = Instant::now();
        self.entries
            .get(key)
            .map(|slot| slot.expires_at > now)
            .unwrap_or(false)
    }

    /// Insert with the default TTL
    pub fn insert(&self, key: K, value: V) -> usize {
        self.insert_with_ttl(key, value, self.default_ttl)
    }

    /// Insert with an explicit TTL, clamped to [`MAX_TTL`]. Returns the number
    /// of entries removed by an opportunistic sweep (0 when none ran).
    pub fn insert_with_ttl(&self, key: K, value: V, ttl: Duration) -> usize {
        let generation = self.generation.fetch_add(1, Ordering::Relaxed);
        let now = Instant::now();
        let expires_at = now.checked_add(ttl.min(MAX_TTL)).unwrap_or(now);

        self.entries.insert(
            key.clone(),
            Slot {
                value,
                expires_at,
                generation,
            },
        );
        self.expiry_index.lock().insert((expires_at, generation), key);

        if self.entries.len() > self.sweep_threshold {
            self.sweep()
        } else {
            0
        }
    }

    /// Remove every expired entry, returning how many were dropped
    pub fn sweep(&self) -> usize {
        let now = Instant::now();

        let expired: Vec<((Instant, u64), K)> = {
            let mut index = self.expiry_index.lock();
            let live = index.split_off(&(now, u64::MAX));
            let expired = std::mem::replace(&mut *index, live);
            expired.into_iter().collect()
        };

        let mut removed = 0;
        for ((_, generation), key) in expired {
            if self
                .entries
                .remove_if(&key, |_, slot| slot.generation == generation)
                .is_some()
            {
                removed += 1;
            }
        }

        if removed > 0 {
            debug!(removed, remaining = self.entries.len(), "TTL cache sweep");
        }
        removed
    }

    /// Number of stored entries, expired-but-unswept ones included
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the cache holds no entries
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Default TTL applied by `insert`
    pub fn default_ttl(&self) -> Duration {
        self.default_ttl
    }
}

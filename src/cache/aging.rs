//! Concurrent key-value store with per-entry expiry.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use super::clock::{Clock, SystemClock};

/// A stored value and the instant it stops being visible.
#[derive(Debug)]
struct Slot<V> {
    value: V,
    expire_at: Instant,
}

impl<V> Slot<V> {
    fn new(value: V, now: Instant, ttl: Duration) -> Self {
        Self {
            value,
            expire_at: deadline(now, ttl),
        }
    }

    fn is_live(&self, now: Instant) -> bool {
        now < self.expire_at
    }

    fn remaining(&self, now: Instant) -> Duration {
        self.expire_at.saturating_duration_since(now)
    }
}

/// `now + ttl`, saturating at the furthest instant the platform can hold.
fn deadline(now: Instant, ttl: Duration) -> Instant {
    if let Some(at) = now.checked_add(ttl) {
        return at;
    }
    let (mut reachable, mut step) = (now, ttl);
    while !step.is_zero() {
        match reachable.checked_add(step) {
            Some(at) => reachable = at,
            None => step /= 2,
        }
    }
    reachable
}

/// Outcome of an `atomic_update` callback.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Update<V> {
    /// Overwrite the stored value. The entry keeps its expiry.
    Replace(V),
    /// Leave the stored value untouched.
    Keep,
}

/// Result of an `atomic_update`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Touch<V> {
    /// The value held before this update (the initial value on first touch).
    pub previous: V,
    /// Time left until the entry expires.
    pub remaining: Duration,
    /// `true` when the key was absent or expired and has just been created.
    pub inserted: bool,
}

/// Counts reported by one sweep pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepStats {
    /// Entries inspected
    pub scanned: usize,
    /// Expired entries removed
    pub removed: usize,
}

impl SweepStats {
    /// Fraction of the scanned entries that had expired.
    pub fn expired_ratio(&self) -> f64 {
        if self.scanned == 0 {
            0.0
        } else {
            self.removed as f64 / self.scanned as f64
        }
    }
}

/// A concurrent map from string keys to values that expire independently.
///
/// Entries are sharded across `DashMap` shards, so operations on one key
/// lock only that key's shard and only for the duration of an in-memory
/// read or write. Expired entries are invisible to readers immediately and
/// are reclaimed lazily on lookup or by [`AgingCache::sweep`].
pub struct AgingCache<V> {
    entries: DashMap<String, Slot<V>>,
    clock: Arc<dyn Clock>,
}

impl<V: Clone> AgingCache<V> {
    /// Create a cache driven by the system clock.
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock::new()))
    }

    /// Create a cache driven by the given clock.
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: DashMap::new(),
            clock,
        }
    }

    /// Insert or overwrite `key`, expiring `ttl` from now.
    pub fn store(&self, key: impl Into<String>, value: V, ttl: Duration) {
        let now = self.clock.now();
        self.entries.insert(key.into(), Slot::new(value, now, ttl));
    }

    /// Get the value for `key` if it is present and unexpired.
    ///
    /// An expired entry found here is removed on the spot.
    pub fn load(&self, key: &str) -> Option<V> {
        let now = self.clock.now();

        let expired = match self.entries.get(key) {
            Some(slot) if slot.is_live(now) => return Some(slot.value.clone()),
            Some(_) => true,
            None => false,
        };

        if expired {
            // Re-checked under the write lock: a concurrent store may have
            // replaced the stale entry in between.
            self.entries.remove_if(key, |_, slot| !slot.is_live(now));
        }
        None
    }

    /// Time left before `key` expires, if it is present and unexpired.
    pub fn time_remaining(&self, key: &str) -> Option<Duration> {
        let now = self.clock.now();
        self.entries
            .get(key)
            .filter(|slot| slot.is_live(now))
            .map(|slot| slot.remaining(now))
    }

    /// Atomically create or update the entry for `key`.
    ///
    /// If the key is absent or expired it is (re)created holding `initial`
    /// with a fresh `ttl`, and `update` is not called. Otherwise `update`
    /// receives the current value and may replace it; the entry keeps its
    /// original expiry either way.
    ///
    /// The whole operation runs under the key's shard lock, so concurrent
    /// callers on one key are serialized: no update is lost and exactly one
    /// caller per entry lifetime sees `inserted == true`. `update` runs with
    /// that lock held and must not block or call back into this cache.
    pub fn atomic_update<F>(&self, key: &str, initial: V, ttl: Duration, update: F) -> Touch<V>
    where
        F: FnOnce(&V) -> Update<V>,
    {
        let now = self.clock.now();

        match self.entries.entry(key.to_string()) {
            Entry::Occupied(mut occupied) if occupied.get().is_live(now) => {
                let slot = occupied.get_mut();
                let previous = slot.value.clone();
                if let Update::Replace(value) = update(&slot.value) {
                    slot.value = value;
                }
                Touch {
                    previous,
                    remaining: slot.remaining(now),
                    inserted: false,
                }
            }
            Entry::Occupied(mut occupied) => {
                let slot = Slot::new(initial.clone(), now, ttl);
                let remaining = slot.remaining(now);
                occupied.insert(slot);
                Touch {
                    previous: initial,
                    remaining,
                    inserted: true,
                }
            }
            Entry::Vacant(vacant) => {
                let slot = Slot::new(initial.clone(), now, ttl);
                let remaining = slot.remaining(now);
                vacant.insert(slot);
                Touch {
                    previous: initial,
                    remaining,
                    inserted: true,
                }
            }
        }
    }
}

impl<V> AgingCache<V> {
    /// Remove `key`, returning its value if it was present.
    pub fn remove(&self, key: &str) -> Option<V> {
        self.entries.remove(key).map(|(_, slot)| slot.value)
    }

    /// Number of stored entries, including expired ones not yet reclaimed.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Check if the cache holds no entries.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Remove every entry.
    pub fn clear(&self) {
        self.entries.clear();
    }

    /// Remove every expired entry.
    ///
    /// Shards are visited one at a time, each locked only while it is being
    /// filtered.
    pub fn sweep(&self) -> SweepStats {
        let now = self.clock.now();
        let mut stats = SweepStats::default();

        self.entries.retain(|_, slot| {
            stats.scanned += 1;
            let live = slot.is_live(now);
            if !live {
                stats.removed += 1;
            }
            live
        });

        stats
    }
}

impl<V: Clone> Default for AgingCache<V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<V> fmt::Debug for AgingCache<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AgingCache")
            .field("len", &self.entries.len())
            .field("clock", &self.clock)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MockClock;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn mock_cache<V: Clone>() -> (AgingCache<V>, MockClock) {
        let clock = MockClock::default();
        (AgingCache::with_clock(Arc::new(clock.clone())), clock)
    }

    #[test]
    fn test_store_and_load() {
        let (cache, _) = mock_cache();
        cache.store("a", 1u64, Duration::from_secs(5));

        assert_eq!(cache.load("a"), Some(1));
        assert_eq!(cache.load("missing"), None);
    }

    #[test]
    fn test_store_overwrites_value_and_expiry() {
        let (cache, clock) = mock_cache();
        cache.store("a", 1u64, Duration::from_secs(5));
        clock.advance(Duration::from_secs(4));
        cache.store("a", 2u64, Duration::from_secs(5));
        clock.advance(Duration::from_secs(4));

        assert_eq!(cache.load("a"), Some(2));
    }

    #[test]
    fn test_load_expires_lazily() {
        let (cache, clock) = mock_cache();
        cache.store("a", 1u64, Duration::from_secs(5));

        clock.advance(Duration::from_millis(4999));
        assert_eq!(cache.load("a"), Some(1));

        // Expired exactly at the deadline.
        clock.advance(Duration::from_millis(1));
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.load("a"), None);
        assert_eq!(cache.len(), 0);
    }

    #[test]
    fn test_entries_expire_independently() {
        let (cache, clock) = mock_cache();
        cache.store("short", 1u64, Duration::from_secs(1));
        cache.store("long", 2u64, Duration::from_secs(10));

        clock.advance(Duration::from_secs(2));
        assert_eq!(cache.load("short"), None);
        assert_eq!(cache.load("long"), Some(2));
        assert_eq!(cache.time_remaining("long"), Some(Duration::from_secs(8)));
    }

    #[test]
    fn test_first_touch_does_not_call_update() {
        let (cache, _) = mock_cache();
        let touch = cache.atomic_update("k", 1u64, Duration::from_secs(3), |_| {
            panic!("update must not run on first touch")
        });

        assert_eq!(
            touch,
            Touch {
                previous: 1,
                remaining: Duration::from_secs(3),
                inserted: true,
            }
        );
        assert_eq!(cache.load("k"), Some(1));
    }

    #[test]
    fn test_update_preserves_expiry() {
        let (cache, clock) = mock_cache();
        cache.atomic_update("k", 1u64, Duration::from_secs(10), |_| Update::Keep);

        clock.advance(Duration::from_secs(4));
        let touch = cache.atomic_update("k", 1u64, Duration::from_secs(10), |v| {
            Update::Replace(v + 1)
        });
        assert!(!touch.inserted);
        assert_eq!(touch.previous, 1);
        assert_eq!(touch.remaining, Duration::from_secs(6));
        assert_eq!(cache.load("k"), Some(2));

        clock.advance(Duration::from_secs(6));
        assert_eq!(cache.load("k"), None);
    }

    #[test]
    fn test_update_keep_leaves_value() {
        let (cache, _) = mock_cache();
        cache.store("k", 7u64, Duration::from_secs(10));

        let touch = cache.atomic_update("k", 1, Duration::from_secs(10), |_| Update::Keep);
        assert_eq!(touch.previous, 7);
        assert_eq!(cache.load("k"), Some(7));
    }

    #[test]
    fn test_expired_entry_is_recreated() {
        let (cache, clock) = mock_cache();
        cache.store("k", 9u64, Duration::from_secs(1));
        clock.advance(Duration::from_secs(1));

        let touch = cache.atomic_update("k", 1, Duration::from_secs(5), |_| {
            panic!("expired entries are treated as absent")
        });
        assert!(touch.inserted);
        assert_eq!(touch.remaining, Duration::from_secs(5));
        assert_eq!(cache.load("k"), Some(1));
    }

    #[test]
    fn test_huge_ttl_saturates() {
        let (cache, clock) = mock_cache();
        cache.store("s", 1u64, Duration::MAX);
        let touch = cache.atomic_update("u", 1u64, Duration::MAX, |_| Update::Keep);

        assert!(touch.inserted);
        assert!(touch.remaining > Duration::from_secs(86400 * 365));
        clock.advance(Duration::from_secs(86400 * 365));
        assert_eq!(cache.load("s"), Some(1));
        assert_eq!(cache.load("u"), Some(1));
    }

    #[test]
    fn test_sweep_removes_only_expired() {
        let (cache, clock) = mock_cache();
        cache.store("a", 1u64, Duration::from_secs(1));
        cache.store("b", 2u64, Duration::from_secs(1));
        cache.store("c", 3u64, Duration::from_secs(60));

        clock.advance(Duration::from_secs(2));
        let stats = cache.sweep();

        assert_eq!(stats, SweepStats { scanned: 3, removed: 2 });
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.load("c"), Some(3));
    }

    #[test]
    fn test_expired_ratio() {
        assert_eq!(SweepStats::default().expired_ratio(), 0.0);
        assert_eq!(SweepStats { scanned: 4, removed: 1 }.expired_ratio(), 0.25);
    }

    #[test]
    fn test_remove_and_clear() {
        let (cache, _) = mock_cache();
        cache.store("a", 1u64, Duration::from_secs(5));
        cache.store("b", 2u64, Duration::from_secs(5));

        assert_eq!(cache.remove("a"), Some(1));
        assert_eq!(cache.remove("a"), None);
        cache.clear();
        assert!(cache.is_empty());
    }

    #[test]
    fn test_concurrent_updates_are_not_lost() {
        let cache: AgingCache<u64> = AgingCache::new();
        let inserted = AtomicUsize::new(0);

        std::thread::scope(|scope| {
            for _ in 0..8 {
                scope.spawn(|| {
                    for _ in 0..250 {
                        let touch = cache.atomic_update("shared", 1, Duration::from_secs(60), |v| {
                            Update::Replace(v + 1)
                        });
                        if touch.inserted {
                            inserted.fetch_add(1, Ordering::SeqCst);
                        }
                    }
                });
            }
        });

        assert_eq!(inserted.load(Ordering::SeqCst), 1);
        assert_eq!(cache.load("shared"), Some(2000));
    }
}

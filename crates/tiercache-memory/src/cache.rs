//! Memory tier
//!
//! A hash map from key to node handle plus a [`RecencyIndex`], guarded by a
//! single mutex. Every operation is synchronous and serialized per instance.
//!
//! # Eviction
//!
//! All trims pop from the tail of the recency index, so eviction order is
//! strict LRU. Trims take the lock once per evicted entry, which keeps
//! concurrent `get`/`set` from waiting on more than one removal.
//!
//! # Age ordering
//!
//! Every touch moves an entry to the head *and* stamps its access time with
//! the same monotonic clock, so tail-to-head order is also access-time order.
//! [`MemoryCache::trim_to_age`] relies on this to stop at the first entry that
//! is young enough instead of scanning the whole cache. Nothing may set an
//! entry's access time without also moving it to the head.

use crate::lru::{NodeId, RecencyIndex};
use crate::release::Releaser;
use parking_lot::{Mutex, RwLock};
use std::borrow::Borrow;
use std::collections::HashMap;
use std::fmt;
use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tiercache_common::{MemoryCacheConfig, Ticker};
use tracing::{debug, warn};

/// Callback invoked with the cache when the host signals pressure or backgrounding
pub type CacheHook<K, V> = Arc<dyn Fn(&MemoryCache<K, V>) + Send + Sync>;

/// Cache statistics
#[derive(Debug, Default)]
pub struct CacheStats {
    /// Number of cache hits
    pub hits: AtomicU64,
    /// Number of cache misses
    pub misses: AtomicU64,
    /// Number of entries evicted by trims and limits
    pub evictions: AtomicU64,
}

impl CacheStats {
    /// Calculate hit ratio (0.0 to 1.0)
    pub fn hit_ratio(&self) -> f64 {
        let hits = self.hits.load(Ordering::Relaxed) as f64;
        let misses = self.misses.load(Ordering::Relaxed) as f64;
        let total = hits + misses;
        if total == 0.0 { 0.0 } else { hits / total }
    }

    /// Reset all statistics
    pub fn reset(&self) {
        self.hits.store(0, Ordering::Relaxed);
        self.misses.store(0, Ordering::Relaxed);
        self.evictions.store(0, Ordering::Relaxed);
    }
}

/// A resident entry
struct Entry<K, V> {
    key: K,
    value: Arc<V>,
    cost: u64,
    last_access: Instant,
}

/// Map + recency index, always mutated together
struct State<K, V> {
    map: HashMap<K, NodeId>,
    lru: RecencyIndex<Entry<K, V>>,
    // Wide enough that a sum of u64 costs never overflows
    total_cost: u128,
}

impl<K, V> Default for State<K, V> {
    fn default() -> Self {
        Self {
            map: HashMap::new(),
            lru: RecencyIndex::new(),
            total_cost: 0,
        }
    }
}

impl<K: Hash + Eq, V> State<K, V> {
    fn pop_lru(&mut self) -> Option<Arc<V>> {
        let entry = self.lru.pop_back()?;
        self.map.remove(&entry.key);
        self.total_cost -= u128::from(entry.cost);
        Some(entry.value)
    }
}

/// Mutable limits and behaviour flags
#[derive(Debug, Clone)]
struct Limits {
    count: Option<usize>,
    cost: Option<u64>,
    age: Option<Duration>,
    remove_all_on_memory_pressure: bool,
    remove_all_on_background: bool,
}

struct Hooks<K, V> {
    memory_pressure: Option<CacheHook<K, V>>,
    background: Option<CacheHook<K, V>>,
}

struct Inner<K, V> {
    name: String,
    state: Mutex<State<K, V>>,
    limits: RwLock<Limits>,
    hooks: RwLock<Hooks<K, V>>,
    stats: CacheStats,
    releaser: Option<Releaser>,
    trimmer: Mutex<Option<Ticker>>,
}

/// Thread-safe, count/cost/age bounded LRU cache
///
/// Cloning the handle is cheap and shares the same cache. Values are held as
/// `Arc<V>`: a `get` hands out its own strong reference, so a value stays
/// alive for the caller even if the entry is evicted right after.
///
/// `V` may itself be an `Option<T>` when "cached as nothing" has to be told
/// apart from "not cached".
pub struct MemoryCache<K, V> {
    inner: Arc<Inner<K, V>>,
}

impl<K, V> Clone for MemoryCache<K, V> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<K, V> fmt::Debug for MemoryCache<K, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("MemoryCache")
            .field("name", &self.inner.name)
            .field("total_count", &state.lru.len())
            .field("total_cost", &state.total_cost)
            .finish_non_exhaustive()
    }
}

impl<K, V> Default for MemoryCache<K, V>
where
    K: Hash + Eq + Clone + Send + Sync + 'static,
    V: Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new(MemoryCacheConfig::default())
    }
}

impl<K, V> MemoryCache<K, V>
where
    K: Hash + Eq + Clone + Send + Sync + 'static,
    V: Send + Sync + 'static,
{
    /// Create a memory cache and start its auto trim task
    pub fn new(config: MemoryCacheConfig) -> Self {
        let name = config
            .name
            .clone()
            .unwrap_or_else(|| "memory-cache".to_string());

        let releaser = if config.release_asynchronously {
            match Releaser::spawn(&name) {
                Ok(r) => Some(r),
                Err(e) => {
                    warn!("{}: failed to start release thread, releasing inline: {}", name, e);
                    None
                }
            }
        } else {
            None
        };

        let inner = Arc::new(Inner {
            name,
            state: Mutex::new(State::default()),
            limits: RwLock::new(Limits {
                count: config.count_limit,
                cost: config.cost_limit,
                age: config.age_limit(),
                remove_all_on_memory_pressure: config.remove_all_on_memory_pressure,
                remove_all_on_background: config.remove_all_on_background,
            }),
            hooks: RwLock::new(Hooks {
                memory_pressure: None,
                background: None,
            }),
            stats: CacheStats::default(),
            releaser,
            trimmer: Mutex::new(None),
        });

        let cache = Self { inner };
        if let Some(interval) = config.auto_trim_interval() {
            cache.start_auto_trim(interval);
        }
        cache
    }

    fn start_auto_trim(&self, interval: Duration) {
        let weak: Weak<Inner<K, V>> = Arc::downgrade(&self.inner);
        let spawned = Ticker::spawn(format!("{}-trim", self.inner.name), interval, move || {
            // The task must not keep the cache alive
            let Some(inner) = weak.upgrade() else {
                return false;
            };
            Self { inner }.trim();
            true
        });

        match spawned {
            Ok(ticker) => *self.inner.trimmer.lock() = Some(ticker),
            Err(e) => warn!("{}: failed to start auto trim: {}", self.inner.name, e),
        }
    }

    /// Cache name
    #[must_use]
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Get cache statistics
    #[must_use]
    pub fn stats(&self) -> &CacheStats {
        &self.inner.stats
    }

    /// Number of resident entries
    #[must_use]
    pub fn total_count(&self) -> usize {
        self.inner.state.lock().lru.len()
    }

    /// Sum of the costs of all resident entries, saturating at `u64::MAX`
    #[must_use]
    pub fn total_cost(&self) -> u64 {
        u64::try_from(self.inner.state.lock().total_cost).unwrap_or(u64::MAX)
    }

    /// Check for a key without touching it
    pub fn contains<Q>(&self, key: &Q) -> bool
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.inner.state.lock().map.contains_key(key)
    }

    /// Look up a value, marking it most recently used on a hit
    pub fn get<Q>(&self, key: &Q) -> Option<Arc<V>>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        let mut state = self.inner.state.lock();
        let Some(&id) = state.map.get(key) else {
            self.inner.stats.misses.fetch_add(1, Ordering::Relaxed);
            return None;
        };

        let value = state.lru.get_mut(id).map(|entry| {
            entry.last_access = Instant::now();
            Arc::clone(&entry.value)
        });
        state.lru.touch(id);
        self.inner.stats.hits.fetch_add(1, Ordering::Relaxed);
        value
    }

    /// Insert or replace a value with zero cost
    ///
    /// Zero-cost entries still count toward the count limit.
    pub fn set(&self, key: K, value: V) {
        self.set_with_cost(key, value, 0);
    }

    /// Insert or replace a value
    pub fn set_with_cost(&self, key: K, value: V, cost: u64) {
        let now = Instant::now();
        let value = Arc::new(value);
        let limits = self.inner.limits.read().clone();

        let mut replaced = None;
        let mut evicted = Vec::new();
        let over_cost = {
            let mut state = self.inner.state.lock();
            let state = &mut *state;

            if let Some(&id) = state.map.get(&key) {
                if let Some(entry) = state.lru.get_mut(id) {
                    state.total_cost -= u128::from(entry.cost);
                    state.total_cost += u128::from(cost);
                    entry.cost = cost;
                    entry.last_access = now;
                    replaced = Some(std::mem::replace(&mut entry.value, value));
                }
                state.lru.touch(id);
            } else {
                let id = state.lru.push_front(Entry {
                    key: key.clone(),
                    value,
                    cost,
                    last_access: now,
                });
                state.map.insert(key, id);
                state.total_cost += u128::from(cost);
            }

            if let Some(limit) = limits.count {
                while state.lru.len() > limit {
                    match state.pop_lru() {
                        Some(v) => evicted.push(v),
                        None => break,
                    }
                }
            }

            limits
                .cost
                .filter(|&limit| state.total_cost > u128::from(limit))
        };

        self.record_evictions(evicted.len());
        if let Some(old) = replaced {
            evicted.push(old);
        }
        if !evicted.is_empty() {
            self.release(evicted);
        }

        if let Some(limit) = over_cost {
            self.trim_to_cost(limit);
        }
    }

    /// Remove a key; no-op if absent
    pub fn remove<Q>(&self, key: &Q)
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        let removed = {
            let mut state = self.inner.state.lock();
            let state = &mut *state;
            let entry = state.map.remove(key).and_then(|id| state.lru.remove(id));
            if let Some(entry) = &entry {
                state.total_cost -= u128::from(entry.cost);
            }
            entry.map(|entry| entry.value)
        };
        if let Some(value) = removed {
            self.release(value);
        }
    }

    /// Remove every entry
    ///
    /// The map and index are swapped out under the lock in O(1); dropping
    /// the old contents happens afterwards, on the release thread if enabled.
    pub fn remove_all(&self) {
        let old = std::mem::take(&mut *self.inner.state.lock());
        if !old.lru.is_empty() {
            debug!("{}: removed all {} entries", self.inner.name, old.lru.len());
            self.release(old);
        }
    }

    /// Evict least recently used entries until at most `limit` remain
    pub fn trim_to_count(&self, limit: usize) {
        self.trim_while(|state, _| state.lru.len() > limit);
    }

    /// Evict least recently used entries until the total cost is at most `limit`
    pub fn trim_to_cost(&self, limit: u64) {
        self.trim_while(|state, _| state.total_cost > u128::from(limit));
    }

    /// Evict entries not accessed within `max_age`
    ///
    /// Stops at the first tail entry that is young enough; see the module
    /// docs for why that is sufficient.
    pub fn trim_to_age(&self, max_age: Duration) {
        self.trim_while(|state, now| {
            state
                .lru
                .back()
                .is_some_and(|entry| now.saturating_duration_since(entry.last_access) > max_age)
        });
    }

    /// Run every trim with the current limits
    pub fn trim(&self) {
        let limits = self.inner.limits.read().clone();
        if let Some(limit) = limits.cost {
            self.trim_to_cost(limit);
        }
        if let Some(limit) = limits.count {
            self.trim_to_count(limit);
        }
        if let Some(age) = limits.age {
            self.trim_to_age(age);
        }
    }

    fn trim_while<F>(&self, mut over_limit: F)
    where
        F: FnMut(&State<K, V>, Instant) -> bool,
    {
        let now = Instant::now();
        let mut garbage = Vec::new();
        loop {
            // One entry per lock acquisition
            let mut state = self.inner.state.lock();
            if !over_limit(&*state, now) {
                break;
            }
            match state.pop_lru() {
                Some(value) => garbage.push(value),
                None => break,
            }
        }

        if !garbage.is_empty() {
            debug!("{}: trimmed {} entries", self.inner.name, garbage.len());
            self.record_evictions(garbage.len());
            self.release(garbage);
        }
    }

    /// Called by the host when the process is under memory pressure
    pub fn handle_memory_pressure(&self) {
        let hook = self.inner.hooks.read().memory_pressure.clone();
        if let Some(hook) = hook {
            hook(self);
        }
        if self.inner.limits.read().remove_all_on_memory_pressure {
            self.remove_all();
        }
    }

    /// Called by the host when the process moves to the background
    pub fn handle_enter_background(&self) {
        let hook = self.inner.hooks.read().background.clone();
        if let Some(hook) = hook {
            hook(self);
        }
        if self.inner.limits.read().remove_all_on_background {
            self.remove_all();
        }
    }

    /// Set the hook run on memory pressure
    pub fn set_memory_pressure_hook<F>(&self, hook: F)
    where
        F: Fn(&Self) + Send + Sync + 'static,
    {
        self.inner.hooks.write().memory_pressure = Some(Arc::new(hook));
    }

    /// Set the hook run on entering the background
    pub fn set_background_hook<F>(&self, hook: F)
    where
        F: Fn(&Self) + Send + Sync + 'static,
    {
        self.inner.hooks.write().background = Some(Arc::new(hook));
    }

    /// Keys from most to least recently used
    #[must_use]
    pub fn keys_by_recency(&self) -> Vec<K> {
        self.inner
            .state
            .lock()
            .lru
            .iter()
            .map(|entry| entry.key.clone())
            .collect()
    }

    /// Maximum number of entries, `None` when unlimited
    #[must_use]
    pub fn count_limit(&self) -> Option<usize> {
        self.inner.limits.read().count
    }

    /// Change the entry limit; takes effect on the next set or trim
    pub fn set_count_limit(&self, limit: Option<usize>) {
        self.inner.limits.write().count = limit;
    }

    /// Maximum total cost, `None` when unlimited
    #[must_use]
    pub fn cost_limit(&self) -> Option<u64> {
        self.inner.limits.read().cost
    }

    /// Change the cost limit; takes effect on the next set or trim
    pub fn set_cost_limit(&self, limit: Option<u64>) {
        self.inner.limits.write().cost = limit;
    }

    /// Maximum time since last access, `None` when unlimited
    #[must_use]
    pub fn age_limit(&self) -> Option<Duration> {
        self.inner.limits.read().age
    }

    /// Change the age limit; enforced by the next trim
    pub fn set_age_limit(&self, limit: Option<Duration>) {
        self.inner.limits.write().age = limit;
    }

    /// Whether a memory pressure signal clears the cache
    pub fn set_remove_all_on_memory_pressure(&self, enabled: bool) {
        self.inner.limits.write().remove_all_on_memory_pressure = enabled;
    }

    /// Whether entering the background clears the cache
    pub fn set_remove_all_on_background(&self, enabled: bool) {
        self.inner.limits.write().remove_all_on_background = enabled;
    }

    fn record_evictions(&self, n: usize) {
        if n > 0 {
            self.inner
                .stats
                .evictions
                .fetch_add(n as u64, Ordering::Relaxed);
        }
    }

    fn release<T: Send + 'static>(&self, garbage: T) {
        match &self.inner.releaser {
            Some(releaser) => releaser.release(Box::new(garbage)),
            None => drop(garbage),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};
    use std::collections::HashSet;
    use std::sync::atomic::AtomicUsize;
    use std::thread;

    fn test_config() -> MemoryCacheConfig {
        MemoryCacheConfig {
            auto_trim_interval_ms: 0, // Manual trims for tests
            release_asynchronously: false,
            ..Default::default()
        }
    }

    fn resident<V>(cache: &MemoryCache<&'static str, V>) -> HashSet<&'static str>
    where
        V: Send + Sync + 'static,
    {
        cache.keys_by_recency().into_iter().collect()
    }

    #[test]
    fn test_set_and_get() {
        let cache = MemoryCache::new(test_config());
        cache.set("a", 1);

        assert_eq!(cache.get("a").as_deref(), Some(&1));
        assert!(cache.get("missing").is_none());
        assert_eq!(cache.total_count(), 1);
        assert_eq!(cache.stats().hits.load(Ordering::Relaxed), 1);
        assert_eq!(cache.stats().misses.load(Ordering::Relaxed), 1);
        assert!((cache.stats().hit_ratio() - 0.5).abs() < 0.01);
    }

    #[test]
    fn test_count_limit_evicts_lru_on_set() {
        let cache = MemoryCache::new(MemoryCacheConfig {
            count_limit: Some(2),
            ..test_config()
        });

        cache.set("a", 1);
        cache.set("b", 2);
        cache.set("c", 3);
        assert_eq!(resident(&cache), HashSet::from(["b", "c"]));

        // The touch on b makes c the eviction candidate
        cache.get("b");
        cache.set("d", 4);
        assert_eq!(resident(&cache), HashSet::from(["b", "d"]));
        assert_eq!(cache.stats().evictions.load(Ordering::Relaxed), 2);
    }

    #[test]
    fn test_miss_does_not_touch() {
        let cache = MemoryCache::new(test_config());
        cache.set("a", 1);
        cache.set("b", 2);
        cache.get("zzz");
        assert_eq!(cache.keys_by_recency(), vec!["b", "a"]);

        cache.get("a");
        assert_eq!(cache.keys_by_recency(), vec!["a", "b"]);
    }

    #[test]
    fn test_replace_updates_cost_and_recency() {
        let cache = MemoryCache::new(test_config());
        cache.set_with_cost("a", 1, 10);
        cache.set_with_cost("b", 2, 20);
        cache.set_with_cost("a", 3, 5);

        assert_eq!(cache.total_count(), 2);
        assert_eq!(cache.total_cost(), 25);
        assert_eq!(cache.keys_by_recency(), vec!["a", "b"]);
        assert_eq!(cache.get("a").as_deref(), Some(&3));
    }

    #[test]
    fn test_huge_costs_saturate_total() {
        let cache = MemoryCache::new(test_config());
        let half = u64::MAX / 2 + 1;
        cache.set_with_cost("a", 1, half);
        cache.set_with_cost("b", 2, half);

        assert_eq!(cache.total_count(), 2);
        assert_eq!(cache.total_cost(), u64::MAX);

        cache.remove("a");
        assert_eq!(cache.total_cost(), half);
        cache.set_with_cost("b", 3, u64::MAX);
        assert_eq!(cache.total_cost(), u64::MAX);
        cache.set_with_cost("c", 4, 1);
        assert_eq!(cache.total_cost(), u64::MAX);

        cache.trim_to_cost(u64::MAX);
        assert_eq!(cache.keys_by_recency(), vec!["c"]);
        assert_eq!(cache.total_cost(), 1);
    }

    #[test]
    fn test_none_is_a_cached_value() {
        let cache: MemoryCache<&str, Option<i32>> = MemoryCache::new(test_config());
        cache.set("nothing", None);

        assert!(cache.contains("nothing"));
        assert_eq!(cache.get("nothing").as_deref(), Some(&None));
        assert_eq!(cache.get("absent"), None);
    }

    #[test]
    fn test_value_outlives_eviction() {
        let cache = MemoryCache::new(test_config());
        cache.set("big", vec![7u8; 1024]);

        let held = cache.get("big").unwrap();
        cache.remove("big");
        cache.set("big", vec![0u8; 1]);

        assert_eq!(held.len(), 1024);
        assert!(held.iter().all(|&b| b == 7));
    }

    #[test]
    fn test_remove_and_remove_all() {
        let cache = MemoryCache::new(test_config());
        cache.set_with_cost("a", 1, 3);
        cache.set_with_cost("b", 2, 4);

        cache.remove("a");
        cache.remove("a");
        assert!(!cache.contains("a"));
        assert_eq!(cache.total_cost(), 4);

        cache.remove_all();
        assert_eq!(cache.total_count(), 0);
        assert_eq!(cache.total_cost(), 0);
        assert!(cache.get("b").is_none());

        // Still usable afterwards
        cache.set("c", 3);
        assert_eq!(cache.keys_by_recency(), vec!["c"]);
    }

    #[test]
    fn test_trim_to_cost_is_lru_first() {
        let cache = MemoryCache::new(test_config());
        cache.set_with_cost("a", 1, 10);
        cache.set_with_cost("b", 2, 10);
        cache.set_with_cost("c", 3, 10);
        cache.get("a");

        cache.trim_to_cost(15);
        assert_eq!(cache.keys_by_recency(), vec!["a"]);
        assert_eq!(cache.total_cost(), 10);
    }

    #[test]
    fn test_cost_limit_enforced_on_set() {
        let cache = MemoryCache::new(MemoryCacheConfig {
            cost_limit: Some(100),
            ..test_config()
        });
        cache.set_with_cost("a", 1, 60);
        cache.set_with_cost("b", 2, 60);

        assert_eq!(cache.keys_by_recency(), vec!["b"]);
        assert_eq!(cache.total_cost(), 60);
    }

    #[test]
    fn test_zero_cost_counts_toward_count_only() {
        let cache = MemoryCache::new(MemoryCacheConfig {
            count_limit: Some(3),
            cost_limit: Some(0),
            ..test_config()
        });
        for key in ["a", "b", "c", "d"] {
            cache.set(key, 0);
        }
        assert_eq!(cache.total_count(), 3);
        assert_eq!(cache.total_cost(), 0);
    }

    #[test]
    fn test_trim_to_age_stops_at_first_young_entry() {
        let cache = MemoryCache::new(test_config());
        cache.set("old1", 1);
        cache.set("old2", 2);
        thread::sleep(Duration::from_millis(60));
        cache.set("young", 3);

        cache.trim_to_age(Duration::from_millis(30));
        assert_eq!(cache.keys_by_recency(), vec!["young"]);
    }

    #[test]
    fn test_get_refreshes_age() {
        let cache = MemoryCache::new(test_config());
        cache.set("a", 1);
        cache.set("b", 2);
        thread::sleep(Duration::from_millis(60));
        cache.get("a");

        cache.trim_to_age(Duration::from_millis(30));
        assert_eq!(cache.keys_by_recency(), vec!["a"]);
    }

    #[test]
    fn test_trim_uses_current_limits() {
        let cache = MemoryCache::new(test_config());
        for (i, key) in ["a", "b", "c", "d", "e"].into_iter().enumerate() {
            cache.set_with_cost(key, i, 1);
        }

        cache.set_count_limit(Some(4));
        cache.set_cost_limit(Some(2));
        assert_eq!(cache.count_limit(), Some(4));
        cache.trim();
        assert_eq!(cache.keys_by_recency(), vec!["e", "d"]);

        cache.set_cost_limit(None);
        assert_eq!(cache.cost_limit(), None);
        cache.trim_to_count(0);
        assert_eq!(cache.total_count(), 0);
    }

    #[test]
    fn test_lru_order_property() {
        let mut rng = StdRng::seed_from_u64(0x5eed);

        for _ in 0..50 {
            let cache = MemoryCache::new(test_config());
            // Model: most recently touched key last
            let mut model: Vec<u32> = Vec::new();

            for _ in 0..200 {
                let key = rng.gen_range(0..30u32);
                if rng.gen_bool(0.6) {
                    cache.set(key, key);
                    model.retain(|&k| k != key);
                    model.push(key);
                } else if cache.get(&key).is_some() {
                    model.retain(|&k| k != key);
                    model.push(key);
                }
            }

            let n = rng.gen_range(0..15usize);
            cache.trim_to_count(n);

            let expected: HashSet<u32> = model.iter().rev().take(n).copied().collect();
            let actual: HashSet<u32> = cache.keys_by_recency().into_iter().collect();
            assert_eq!(actual, expected);
        }
    }

    #[test]
    fn test_cost_accounting_property() {
        let mut rng = StdRng::seed_from_u64(42);
        let cache = MemoryCache::new(test_config());
        let mut costs: HashMap<u32, u64> = HashMap::new();

        for _ in 0..2000 {
            let key = rng.gen_range(0..50u32);
            match rng.gen_range(0..10) {
                0..=5 => {
                    let cost = rng.gen_range(0..100u64);
                    cache.set_with_cost(key, (), cost);
                    costs.insert(key, cost);
                }
                6 | 7 => {
                    cache.remove(&key);
                    costs.remove(&key);
                }
                8 => {
                    cache.trim_to_cost(rng.gen_range(0..3000));
                    let live: HashSet<u32> = cache.keys_by_recency().into_iter().collect();
                    costs.retain(|k, _| live.contains(k));
                }
                _ => {
                    cache.trim_to_count(rng.gen_range(0..50));
                    let live: HashSet<u32> = cache.keys_by_recency().into_iter().collect();
                    costs.retain(|k, _| live.contains(k));
                }
            }

            assert_eq!(cache.total_cost(), costs.values().sum::<u64>());
            assert_eq!(cache.total_count(), costs.len());
        }
    }

    #[test]
    fn test_memory_pressure_hook() {
        let cache = MemoryCache::new(test_config());
        let calls = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&calls);
        cache.set_memory_pressure_hook(move |c: &MemoryCache<&'static str, i32>| {
            // The hook runs before the entries are dropped
            assert_eq!(c.total_count(), 1);
            seen.fetch_add(1, Ordering::Relaxed);
        });

        cache.set("a", 1);
        cache.handle_memory_pressure();
        assert_eq!(calls.load(Ordering::Relaxed), 1);
        assert_eq!(cache.total_count(), 0);
    }

    #[test]
    fn test_background_flag_disabled_keeps_entries() {
        let cache = MemoryCache::new(MemoryCacheConfig {
            remove_all_on_background: false,
            ..test_config()
        });
        let calls = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&calls);
        cache.set_background_hook(move |_: &MemoryCache<&'static str, i32>| {
            seen.fetch_add(1, Ordering::Relaxed);
        });

        cache.set("a", 1);
        cache.handle_enter_background();
        assert_eq!(calls.load(Ordering::Relaxed), 1);
        assert!(cache.contains("a"));

        cache.set_remove_all_on_background(true);
        cache.handle_enter_background();
        assert_eq!(cache.total_count(), 0);
    }

    #[test]
    fn test_auto_trim_applies_age_limit() {
        let cache = MemoryCache::new(MemoryCacheConfig {
            age_limit_secs: Some(0),
            auto_trim_interval_ms: 10,
            ..test_config()
        });
        cache.set("a", 1);

        let deadline = Instant::now() + Duration::from_secs(5);
        while cache.total_count() > 0 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(10));
        }
        assert_eq!(cache.total_count(), 0);
    }

    #[test]
    fn test_async_release() {
        let cache = MemoryCache::new(MemoryCacheConfig {
            release_asynchronously: true,
            count_limit: Some(1),
            ..test_config()
        });
        let marker = Arc::new(());
        cache.set("a", Arc::clone(&marker));
        cache.set("b", Arc::clone(&marker));
        cache.remove_all();

        // Dropping the last handle joins the release thread
        drop(cache);
        assert_eq!(Arc::strong_count(&marker), 1);
    }

    #[test]
    fn test_concurrent_access_keeps_totals_consistent() {
        let cache = MemoryCache::new(MemoryCacheConfig {
            count_limit: Some(64),
            ..test_config()
        });

        let handles: Vec<_> = (0..4u64)
            .map(|t| {
                let cache = cache.clone();
                thread::spawn(move || {
                    let mut rng = StdRng::seed_from_u64(t);
                    for _ in 0..2000 {
                        let key = rng.gen_range(0..128u64);
                        match rng.gen_range(0..4) {
                            0 | 1 => cache.set_with_cost(key, key, key),
                            2 => {
                                cache.get(&key);
                            }
                            _ => cache.remove(&key),
                        }
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let keys = cache.keys_by_recency();
        assert!(keys.len() <= 64);
        assert_eq!(cache.total_count(), keys.len());
        // Values equal costs equal keys
        assert_eq!(cache.total_cost(), keys.iter().sum::<u64>());
    }
}

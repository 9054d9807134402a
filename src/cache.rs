//! In-memory result cache with per-entry TTL, dependency links, tags, and LRU eviction
//!
//! An entry is valid while `now - written_at < ttl` and every key it
//! depends on is itself present and valid. Invalidating an entry drops all
//! of its transitive dependents with it. Reads refresh LRU recency but never
//! extend TTL.

use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::error::{AppError, Result};

/// Default number of entries held before LRU eviction kicks in
pub const DEFAULT_CAPACITY: usize = 500;

/// Invalidated tags and keys remembered for in-flight writes. Past this the
/// marks are dropped and every write started earlier is refused.
const MAX_INVALIDATION_MARKS: usize = 4096;

/// A cached value and its bookkeeping
#[derive(Debug, Clone)]
pub struct CacheEntry<V> {
    pub key: String,
    pub value: V,
    pub written_at: Instant,
    pub ttl: Duration,
    pub depends_on: BTreeSet<String>,
    pub tags: BTreeSet<String>,
}

impl<V> CacheEntry<V> {
    pub fn is_expired(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.written_at) >= self.ttl
    }

    pub fn remaining_ttl(&self, now: Instant) -> Duration {
        self.ttl
            .saturating_sub(now.saturating_duration_since(self.written_at))
    }
}

struct Slot<V> {
    entry: CacheEntry<V>,
    last_access: u64,
}

struct Inner<V> {
    slots: HashMap<String, Slot<V>>,
    /// dependency target -> keys that depend on it
    dependents: HashMap<String, HashSet<String>>,
    tags: HashMap<String, HashSet<String>>,
    /// access tick -> key, oldest first
    recency: BTreeMap<u64, String>,
    tick: u64,
    /// bumped by every invalidation
    generation: u64,
    /// writes started before this generation are refused
    floor: u64,
    tag_marks: HashMap<String, u64>,
    key_marks: HashMap<String, u64>,
}

impl<V> Inner<V> {
    fn new() -> Self {
        Self {
            slots: HashMap::new(),
            dependents: HashMap::new(),
            tags: HashMap::new(),
            recency: BTreeMap::new(),
            tick: 0,
            generation: 0,
            floor: 0,
            tag_marks: HashMap::new(),
            key_marks: HashMap::new(),
        }
    }

    fn bump_generation(&mut self) -> u64 {
        self.generation += 1;
        if self.tag_marks.len() + self.key_marks.len() > MAX_INVALIDATION_MARKS {
            self.tag_marks.clear();
            self.key_marks.clear();
            self.floor = self.generation;
        }
        self.generation
    }

    /// Whether a write started at generation `since` touches anything
    /// invalidated after it.
    fn invalidated_since(
        &self,
        since: u64,
        key: &str,
        depends_on: &BTreeSet<String>,
        tags: &BTreeSet<String>,
    ) -> bool {
        let after = |mark: Option<&u64>| mark.is_some_and(|g| *g > since);
        since < self.floor
            || after(self.key_marks.get(key))
            || depends_on.iter().any(|dep| after(self.key_marks.get(dep)))
            || tags.iter().any(|tag| after(self.tag_marks.get(tag)))
    }

    /// Cascade-remove `roots`, marking every removed key and each root.
    fn invalidate_keys(&mut self, roots: &[String], generation: u64) -> usize {
        let mut removed = 0;
        for root in roots {
            self.key_marks.insert(root.clone(), generation);
            for key in self.cascade(root) {
                self.key_marks.insert(key, generation);
                removed += 1;
            }
        }
        removed
    }

    fn next_tick(&mut self) -> u64 {
        self.tick += 1;
        self.tick
    }

    fn touch(&mut self, key: &str) {
        let tick = self.next_tick();
        if let Some(slot) = self.slots.get_mut(key) {
            self.recency.remove(&slot.last_access);
            slot.last_access = tick;
            self.recency.insert(tick, key.to_string());
        }
    }

    /// Whether `key` is present and valid. Missing keys are invalid.
    fn is_valid(&self, key: &str, now: Instant) -> Result<bool> {
        self.check(key, now, &mut Vec::new(), &mut HashMap::new())
    }

    /// Depth-first validity walk. `resolved` memoizes keys already decided so
    /// shared dependencies are visited once.
    fn check(
        &self,
        key: &str,
        now: Instant,
        path: &mut Vec<String>,
        resolved: &mut HashMap<String, bool>,
    ) -> Result<bool> {
        if let Some(valid) = resolved.get(key) {
            return Ok(*valid);
        }
        let Some(slot) = self.slots.get(key) else {
            return Ok(false);
        };
        if path.iter().any(|k| k == key) {
            return Err(AppError::CacheInconsistency(format!(
                "dependency cycle: {} -> {}",
                path.join(" -> "),
                key
            )));
        }

        let mut valid = !slot.entry.is_expired(now);
        if valid {
            path.push(key.to_string());
            for dep in &slot.entry.depends_on {
                if !self.check(dep, now, path, resolved)? {
                    valid = false;
                    break;
                }
            }
            path.pop();
        }
        resolved.insert(key.to_string(), valid);
        Ok(valid)
    }

    /// Keys reachable from `roots` along depends_on edges, roots included.
    fn closure<'a>(&self, roots: impl IntoIterator<Item = &'a String>) -> HashSet<String> {
        let mut stack: Vec<String> = roots.into_iter().cloned().collect();
        let mut seen = HashSet::new();
        while let Some(key) = stack.pop() {
            if let Some(slot) = self.slots.get(&key) {
                stack.extend(
                    slot.entry
                        .depends_on
                        .iter()
                        .filter(|dep| !seen.contains(*dep))
                        .cloned(),
                );
            }
            seen.insert(key);
        }
        seen
    }

    /// Whether `target` is reachable from `from` along depends_on edges.
    fn reaches(&self, from: &str, target: &str) -> bool {
        let mut stack = vec![from.to_string()];
        let mut seen = HashSet::new();
        while let Some(key) = stack.pop() {
            if key == target {
                return true;
            }
            if !seen.insert(key.clone()) {
                continue;
            }
            if let Some(slot) = self.slots.get(&key) {
                stack.extend(slot.entry.depends_on.iter().cloned());
            }
        }
        false
    }

    /// Remove a single slot and its index entries without cascading.
    fn detach(&mut self, key: &str) -> Option<CacheEntry<V>> {
        let slot = self.slots.remove(key)?;
        self.recency.remove(&slot.last_access);
        for tag in &slot.entry.tags {
            if let Some(keys) = self.tags.get_mut(tag) {
                keys.remove(key);
                if keys.is_empty() {
                    self.tags.remove(tag);
                }
            }
        }
        for dep in &slot.entry.depends_on {
            if let Some(keys) = self.dependents.get_mut(dep) {
                keys.remove(key);
                if keys.is_empty() {
                    self.dependents.remove(dep);
                }
            }
        }
        Some(slot.entry)
    }

    /// Remove `key` and every transitive dependent. Returns the removed keys.
    fn cascade(&mut self, key: &str) -> Vec<String> {
        let mut removed = Vec::new();
        let mut stack = vec![key.to_string()];
        let mut seen = HashSet::new();
        while let Some(current) = stack.pop() {
            if !seen.insert(current.clone()) {
                continue;
            }
            if let Some(dependents) = self.dependents.remove(&current) {
                stack.extend(dependents);
            }
            if self.detach(&current).is_some() {
                removed.push(current);
            }
        }
        removed
    }

    fn remove_cascade(&mut self, key: &str) -> usize {
        self.cascade(key).len()
    }

    fn insert(&mut self, entry: CacheEntry<V>) {
        let tick = self.next_tick();
        let key = entry.key.clone();
        for tag in &entry.tags {
            self.tags.entry(tag.clone()).or_default().insert(key.clone());
        }
        for dep in &entry.depends_on {
            self.dependents
                .entry(dep.clone())
                .or_default()
                .insert(key.clone());
        }
        self.recency.insert(tick, key.clone());
        self.slots.insert(
            key,
            Slot {
                entry,
                last_access: tick,
            },
        );
    }

    fn expired_keys(&self, now: Instant) -> Vec<String> {
        self.slots
            .iter()
            .filter(|(_, slot)| slot.entry.is_expired(now))
            .map(|(key, _)| key.clone())
            .collect()
    }
}

/// Cache counters
#[derive(Default)]
pub struct CacheStats {
    hits: AtomicU64,
    misses: AtomicU64,
    inserts: AtomicU64,
    evictions: AtomicU64,
    invalidations: AtomicU64,
    expirations: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CacheStatsSnapshot {
    pub hits: u64,
    pub misses: u64,
    pub inserts: u64,
    /// Entries dropped under capacity pressure, cascades included
    pub evictions: u64,
    /// Entries dropped by explicit or tag invalidation, cascades included
    pub invalidations: u64,
    pub expirations: u64,
    pub size: usize,
    pub capacity: usize,
}

/// Bounded result cache. All mutation goes through its methods under one lock.
pub struct ResultCache<V> {
    capacity: usize,
    inner: Mutex<Inner<V>>,
    stats: CacheStats,
}

impl<V: Clone> ResultCache<V> {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            inner: Mutex::new(Inner::new()),
            stats: CacheStats::default(),
        }
    }

    /// Look up a valid entry, refreshing its recency.
    ///
    /// Expired entries, entries with an invalid dependency, and entries caught
    /// in a dependency cycle are evicted (with their dependents) and reported
    /// as a miss.
    pub fn get(&self, key: &str) -> Option<CacheEntry<V>> {
        let now = Instant::now();
        let mut inner = self.inner.lock();

        if !inner.slots.contains_key(key) {
            self.stats.misses.fetch_add(1, Ordering::Relaxed);
            return None;
        }

        match inner.is_valid(key, now) {
            Ok(true) => {
                inner.touch(key);
                self.stats.hits.fetch_add(1, Ordering::Relaxed);
                inner.slots.get(key).map(|slot| slot.entry.clone())
            }
            Ok(false) => {
                let removed = inner.remove_cascade(key);
                debug!(key = %key, removed = removed, "Cache entry stale, dropped");
                self.stats
                    .expirations
                    .fetch_add(removed as u64, Ordering::Relaxed);
                self.stats.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
            Err(e) => {
                warn!(key = %key, error = %e, "Dropping inconsistent cache entry");
                let removed = inner.remove_cascade(key);
                self.stats
                    .invalidations
                    .fetch_add(removed as u64, Ordering::Relaxed);
                self.stats.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    /// Write an entry, replacing any previous value for `key`.
    ///
    /// Fails with `CacheInconsistency` (and leaves `key` absent) if the new
    /// dependencies would form a cycle, or if there is no room without
    /// evicting one of the entry's own dependencies.
    pub fn set(
        &self,
        key: &str,
        value: V,
        ttl: Duration,
        depends_on: impl IntoIterator<Item = String>,
        tags: impl IntoIterator<Item = String>,
    ) -> Result<()> {
        self.write(None, key, value, ttl, depends_on, tags).map(|_| ())
    }

    /// Current invalidation generation; pass it to [`set_unless_invalidated`]
    /// for a value computed from here on.
    ///
    /// [`set_unless_invalidated`]: ResultCache::set_unless_invalidated
    pub fn generation(&self) -> u64 {
        self.inner.lock().generation
    }

    /// Like `set`, but skips the write (returning `Ok(false)`) when the key,
    /// one of its dependencies, or one of its tags was invalidated after
    /// generation `since`.
    pub fn set_unless_invalidated(
        &self,
        since: u64,
        key: &str,
        value: V,
        ttl: Duration,
        depends_on: impl IntoIterator<Item = String>,
        tags: impl IntoIterator<Item = String>,
    ) -> Result<bool> {
        self.write(Some(since), key, value, ttl, depends_on, tags)
    }

    fn write(
        &self,
        since: Option<u64>,
        key: &str,
        value: V,
        ttl: Duration,
        depends_on: impl IntoIterator<Item = String>,
        tags: impl IntoIterator<Item = String>,
    ) -> Result<bool> {
        let depends_on: BTreeSet<String> = depends_on.into_iter().collect();
        let tags: BTreeSet<String> = tags.into_iter().collect();
        let now = Instant::now();
        let mut inner = self.inner.lock();

        if let Some(since) = since {
            if inner.invalidated_since(since, key, &depends_on, &tags) {
                debug!(key = %key, since = since, "Skipping write invalidated in flight");
                return Ok(false);
            }
        }

        if depends_on.iter().any(|dep| inner.reaches(dep, key)) {
            let removed = inner.remove_cascade(key);
            self.stats
                .invalidations
                .fetch_add(removed as u64, Ordering::Relaxed);
            warn!(key = %key, "Refusing cache entry with cyclic dependencies");
            return Err(AppError::CacheInconsistency(format!(
                "entry '{}' would depend on itself",
                key
            )));
        }

        if inner.detach(key).is_none() && inner.slots.len() >= self.capacity {
            let protected = inner.closure(&depends_on);
            if !self.make_room(&mut inner, now, &protected) {
                warn!(key = %key, "No room without evicting the entry's dependencies");
                return Err(AppError::CacheInconsistency(format!(
                    "no room for '{}' without evicting its dependencies",
                    key
                )));
            }
        }

        inner.insert(CacheEntry {
            key: key.to_string(),
            value,
            written_at: now,
            ttl,
            depends_on,
            tags,
        });
        self.stats.inserts.fetch_add(1, Ordering::Relaxed);
        Ok(true)
    }

    /// Free one slot, never evicting a key in `protected`.
    fn make_room(&self, inner: &mut Inner<V>, now: Instant, protected: &HashSet<String>) -> bool {
        for key in inner.expired_keys(now) {
            let removed = inner.remove_cascade(&key);
            self.stats
                .expirations
                .fetch_add(removed as u64, Ordering::Relaxed);
        }

        while inner.slots.len() >= self.capacity {
            let Some(victim) = inner
                .recency
                .values()
                .find(|key| !protected.contains(*key))
                .cloned()
            else {
                return false;
            };
            let removed = inner.remove_cascade(&victim);
            debug!(key = %victim, removed = removed, "Evicted least recently used entry");
            self.stats
                .evictions
                .fetch_add(removed as u64, Ordering::Relaxed);
        }
        true
    }

    /// Drop `key` and all entries that depend on it. Returns entries removed.
    pub fn invalidate(&self, key: &str) -> usize {
        let mut inner = self.inner.lock();
        let generation = inner.bump_generation();
        let removed = inner.invalidate_keys(&[key.to_string()], generation);
        self.stats
            .invalidations
            .fetch_add(removed as u64, Ordering::Relaxed);
        debug!(key = %key, removed = removed, "Invalidated cache key");
        removed
    }

    /// Drop every entry carrying `tag`, with dependents.
    pub fn invalidate_by_tag(&self, tag: &str) -> usize {
        self.invalidate_by_tags(&[tag])
    }

    /// Drop every entry whose tag set intersects `tags`, with dependents.
    pub fn invalidate_by_tags<S: AsRef<str>>(&self, tags: &[S]) -> usize {
        let mut inner = self.inner.lock();
        let generation = inner.bump_generation();
        let mut keys: Vec<String> = Vec::new();
        for tag in tags {
            let tag = tag.as_ref();
            if let Some(tagged) = inner.tags.get(tag) {
                keys.extend(tagged.iter().cloned());
            }
            inner.tag_marks.insert(tag.to_string(), generation);
        }

        let removed = inner.invalidate_keys(&keys, generation);
        self.stats
            .invalidations
            .fetch_add(removed as u64, Ordering::Relaxed);
        debug!(tags = tags.len(), removed = removed, "Invalidated cache by tag");
        removed
    }

    /// Evict every expired entry and its dependents.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let mut inner = self.inner.lock();
        let removed: usize = inner
            .expired_keys(now)
            .iter()
            .map(|key| inner.remove_cascade(key))
            .sum();
        self.stats
            .expirations
            .fetch_add(removed as u64, Ordering::Relaxed);
        removed
    }

    /// Drop everything. Writes already in flight are refused.
    pub fn clear(&self) {
        let mut inner = self.inner.lock();
        let generation = inner.generation + 1;
        *inner = Inner::new();
        inner.generation = generation;
        inner.floor = generation;
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.inner.lock().slots.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn stats(&self) -> CacheStatsSnapshot {
        CacheStatsSnapshot {
            hits: self.stats.hits.load(Ordering::Relaxed),
            misses: self.stats.misses.load(Ordering::Relaxed),
            inserts: self.stats.inserts.load(Ordering::Relaxed),
            evictions: self.stats.evictions.load(Ordering::Relaxed),
            invalidations: self.stats.invalidations.load(Ordering::Relaxed),
            expirations: self.stats.expirations.load(Ordering::Relaxed),
            size: self.len(),
            capacity: self.capacity,
        }
    }
}

impl<V: Clone> Default for ResultCache<V> {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn none() -> Vec<String> {
        Vec::new()
    }

    fn keys(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test(start_paused = true)]
    async fn test_ttl_expiry_boundary() {
        let cache = ResultCache::new(10);
        cache
            .set("k", 1, Duration::from_millis(1000), none(), none())
            .unwrap();

        tokio::time::advance(Duration::from_millis(999)).await;
        assert_eq!(cache.get("k").map(|e| e.value), Some(1));

        tokio::time::advance(Duration::from_millis(1)).await;
        assert!(cache.get("k").is_none());
        assert!(cache.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_reads_do_not_extend_ttl() {
        let cache = ResultCache::new(10);
        cache.set("k", 1, Duration::from_secs(10), none(), none()).unwrap();

        for _ in 0..9 {
            tokio::time::advance(Duration::from_secs(1)).await;
            assert!(cache.get("k").is_some());
        }
        tokio::time::advance(Duration::from_secs(1)).await;
        assert!(cache.get("k").is_none());
    }

    #[tokio::test]
    async fn test_dependency_cascade() {
        let cache = ResultCache::new(10);
        cache.set("a", 1, Duration::from_secs(60), none(), none()).unwrap();
        cache
            .set("b", 2, Duration::from_secs(60), keys(&["a"]), none())
            .unwrap();
        cache
            .set("c", 3, Duration::from_secs(60), keys(&["b"]), none())
            .unwrap();

        assert_eq!(cache.invalidate("a"), 3);
        assert!(cache.get("b").is_none());
        assert!(cache.get("c").is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_dependency_invalidates_dependent() {
        let cache = ResultCache::new(10);
        cache.set("topology", 1, Duration::from_secs(5), none(), none()).unwrap();
        cache
            .set("metrics", 2, Duration::from_secs(60), keys(&["topology"]), none())
            .unwrap();

        tokio::time::advance(Duration::from_secs(5)).await;
        assert!(cache.get("metrics").is_none());
    }

    #[tokio::test]
    async fn test_missing_dependency_is_a_miss() {
        let cache = ResultCache::new(10);
        cache
            .set("b", 2, Duration::from_secs(60), keys(&["never-written"]), none())
            .unwrap();
        assert!(cache.get("b").is_none());
    }

    #[tokio::test]
    async fn test_invalidate_by_tag() {
        let cache = ResultCache::new(10);
        cache
            .set("a", 1, Duration::from_secs(60), none(), keys(&["guid-1", "kind:cluster"]))
            .unwrap();
        cache
            .set("b", 2, Duration::from_secs(60), none(), keys(&["guid-2"]))
            .unwrap();
        cache
            .set("c", 3, Duration::from_secs(60), keys(&["a"]), none())
            .unwrap();

        assert_eq!(cache.invalidate_by_tag("guid-1"), 2);
        assert!(cache.get("a").is_none());
        assert!(cache.get("c").is_none());
        assert_eq!(cache.get("b").map(|e| e.value), Some(2));
    }

    #[tokio::test]
    async fn test_invalidate_by_tags_intersection() {
        let cache = ResultCache::new(10);
        cache.set("a", 1, Duration::from_secs(60), none(), keys(&["x"])).unwrap();
        cache.set("b", 2, Duration::from_secs(60), none(), keys(&["y"])).unwrap();
        cache.set("c", 3, Duration::from_secs(60), none(), keys(&["z"])).unwrap();

        assert_eq!(cache.invalidate_by_tags(&["x", "y", "missing"]), 2);
        assert_eq!(cache.len(), 1);
    }

    #[tokio::test]
    async fn test_lru_eviction_prefers_least_recently_read() {
        let cache = ResultCache::new(2);
        cache.set("a", 1, Duration::from_secs(60), none(), none()).unwrap();
        cache.set("b", 2, Duration::from_secs(60), none(), none()).unwrap();

        assert!(cache.get("a").is_some());
        cache.set("c", 3, Duration::from_secs(60), none(), none()).unwrap();

        assert!(cache.get("b").is_none());
        assert!(cache.get("a").is_some());
        assert!(cache.get("c").is_some());
        assert_eq!(cache.stats().evictions, 1);
    }

    #[tokio::test]
    async fn test_lru_eviction_cascades_to_dependents() {
        let cache = ResultCache::new(3);
        cache.set("a", 1, Duration::from_secs(60), none(), none()).unwrap();
        cache
            .set("b", 2, Duration::from_secs(60), keys(&["a"]), none())
            .unwrap();
        cache.set("x", 9, Duration::from_secs(60), none(), none()).unwrap();
        assert!(cache.get("b").is_some());
        assert!(cache.get("x").is_some());

        cache.set("d", 4, Duration::from_secs(60), none(), none()).unwrap();

        assert!(cache.get("a").is_none());
        assert!(cache.get("b").is_none());
        assert!(cache.get("x").is_some());
        assert!(cache.get("d").is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_entries_go_before_lru() {
        let cache = ResultCache::new(2);
        cache.set("short", 1, Duration::from_secs(1), none(), none()).unwrap();
        cache.set("long", 2, Duration::from_secs(60), none(), none()).unwrap();
        tokio::time::advance(Duration::from_secs(2)).await;

        cache.set("new", 3, Duration::from_secs(60), none(), none()).unwrap();

        assert!(cache.get("long").is_some());
        assert!(cache.get("new").is_some());
        assert_eq!(cache.stats().evictions, 0);
    }

    #[tokio::test]
    async fn test_cycle_is_rejected_and_dropped() {
        let cache = ResultCache::new(10);
        cache
            .set("a", 1, Duration::from_secs(60), keys(&["b"]), none())
            .unwrap();

        let err = cache
            .set("b", 2, Duration::from_secs(60), keys(&["a"]), none())
            .unwrap_err();
        assert!(matches!(err, AppError::CacheInconsistency(_)));
        assert!(cache.get("a").is_none());
        assert!(cache.get("b").is_none());

        let err = cache
            .set("self", 1, Duration::from_secs(60), keys(&["self"]), none())
            .unwrap_err();
        assert!(matches!(err, AppError::CacheInconsistency(_)));
    }

    #[tokio::test]
    async fn test_overwrite_is_last_writer_wins() {
        let cache = ResultCache::new(10);
        cache.set("k", 1, Duration::from_secs(60), none(), keys(&["t1"])).unwrap();
        cache.set("k", 2, Duration::from_secs(60), none(), keys(&["t2"])).unwrap();

        assert_eq!(cache.get("k").map(|e| e.value), Some(2));
        assert_eq!(cache.invalidate_by_tag("t1"), 0);
        assert_eq!(cache.len(), 1);
    }

    #[tokio::test]
    async fn test_shared_dependencies_are_checked_once() {
        let cache = ResultCache::new(64);
        cache.set("k0", 0, Duration::from_secs(60), none(), none()).unwrap();
        cache
            .set("k1", 1, Duration::from_secs(60), keys(&["k0"]), none())
            .unwrap();
        for i in 2..40 {
            let deps = vec![format!("k{}", i - 1), format!("k{}", i - 2)];
            cache
                .set(&format!("k{}", i), i, Duration::from_secs(60), deps, none())
                .unwrap();
        }

        let started = std::time::Instant::now();
        assert_eq!(cache.get("k39").map(|e| e.value), Some(39));
        assert!(started.elapsed() < Duration::from_secs(1));

        assert_eq!(cache.invalidate("k0"), 40);
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn test_eviction_spares_the_new_entry_dependencies() {
        let cache = ResultCache::new(2);
        cache.set("topology", 1, Duration::from_secs(60), none(), none()).unwrap();
        cache.set("other", 2, Duration::from_secs(60), none(), none()).unwrap();
        assert!(cache.get("other").is_some());

        cache
            .set("view", 3, Duration::from_secs(60), keys(&["topology"]), none())
            .unwrap();

        assert!(cache.get("topology").is_some());
        assert_eq!(cache.get("view").map(|e| e.value), Some(3));
        assert!(cache.get("other").is_none());
    }

    #[tokio::test]
    async fn test_write_refused_when_only_dependencies_remain() {
        let cache = ResultCache::new(1);
        cache.set("topology", 1, Duration::from_secs(60), none(), none()).unwrap();

        let err = cache
            .set("view", 2, Duration::from_secs(60), keys(&["topology"]), none())
            .unwrap_err();

        assert!(matches!(err, AppError::CacheInconsistency(_)));
        assert!(cache.get("topology").is_some());
        assert_eq!(cache.len(), 1);
    }

    #[tokio::test]
    async fn test_write_skipped_after_tag_invalidated_in_flight() {
        let cache = ResultCache::new(10);
        let since = cache.generation();

        assert_eq!(cache.invalidate_by_tag("cluster:prod"), 0);

        let written = cache
            .set_unless_invalidated(since, "view", 1, Duration::from_secs(60), none(), keys(&["cluster:prod"]))
            .unwrap();
        assert!(!written);
        assert!(cache.get("view").is_none());

        let written = cache
            .set_unless_invalidated(since, "other", 2, Duration::from_secs(60), none(), keys(&["cluster:dev"]))
            .unwrap();
        assert!(written);

        let fresh = cache.generation();
        assert!(cache
            .set_unless_invalidated(fresh, "view", 3, Duration::from_secs(60), none(), keys(&["cluster:prod"]))
            .unwrap());
    }

    #[tokio::test]
    async fn test_write_skipped_after_dependency_invalidated_in_flight() {
        let cache = ResultCache::new(10);
        cache.set("topology", 1, Duration::from_secs(60), none(), none()).unwrap();
        let since = cache.generation();

        cache.invalidate("topology");
        cache.set("topology", 2, Duration::from_secs(60), none(), none()).unwrap();

        let written = cache
            .set_unless_invalidated(since, "view", 3, Duration::from_secs(60), keys(&["topology"]), none())
            .unwrap();
        assert!(!written);
        assert_eq!(cache.len(), 1);
    }

    #[tokio::test]
    async fn test_clear_refuses_older_writes() {
        let cache = ResultCache::new(10);
        let since = cache.generation();
        cache.clear();

        assert!(!cache
            .set_unless_invalidated(since, "k", 1, Duration::from_secs(60), none(), none())
            .unwrap());
        assert!(cache.generation() > since);
    }

    #[tokio::test(start_paused = true)]
    async fn test_purge_expired() {
        let cache = ResultCache::new(10);
        cache.set("a", 1, Duration::from_secs(1), none(), none()).unwrap();
        cache.set("b", 2, Duration::from_secs(10), none(), none()).unwrap();
        tokio::time::advance(Duration::from_secs(2)).await;

        assert_eq!(cache.purge_expired(), 1);
        assert_eq!(cache.len(), 1);
    }
}

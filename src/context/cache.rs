// src/context/cache.rs
//! In-process cache for resolved and raw contexts.
//!
//! Correctness contract: a write at any level must never leave a stale
//! resolved view readable for that context or its descendants. Invalidation
//! wins populate races via per-key epochs: resolution snapshots the epoch
//! before loading, and a populate with a stale epoch is dropped instead of
//! inserted. Capacity is a bounded LRU; eviction is silent and only costs a
//! re-resolution.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use tracing::debug;

use crate::context::types::{Context, ContextLevel, ResolvedContext, UserScope};

#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Maximum entries per cache side (resolved / raw).
    pub capacity: usize,
    /// TTL for entries that survive invalidation.
    pub ttl: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            capacity: 4096,
            ttl: Duration::from_secs(3600),
        }
    }
}

impl CacheConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity;
        self
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }
}

/// Cache key: user scope plus the context coordinate.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub user_id: String,
    pub level: ContextLevel,
    pub context_id: String,
}

impl CacheKey {
    pub fn new(scope: &UserScope, level: ContextLevel, context_id: &str) -> Self {
        Self {
            user_id: scope.user_id().to_string(),
            level,
            context_id: context_id.to_string(),
        }
    }
}

struct ResolvedEntry {
    resolved: ResolvedContext,
    epoch: u64,
    expires_at: Instant,
    last_used: u64,
}

struct RawEntry {
    context: Context,
    epoch: u64,
    expires_at: Instant,
    last_used: u64,
}

#[derive(Default)]
struct CacheInner {
    resolved: HashMap<CacheKey, ResolvedEntry>,
    raw: HashMap<CacheKey, RawEntry>,
    /// Invalidation epochs, one per side so cascades on resolved views do
    /// not needlessly drop unchanged raw ancestors.
    resolved_epochs: HashMap<CacheKey, u64>,
    raw_epochs: HashMap<CacheKey, u64>,
    /// Reverse index: ancestor key -> resolved keys whose resolution merged
    /// it (or registered interest while it was absent). Built lazily by the
    /// resolver.
    dependents: HashMap<CacheKey, HashSet<CacheKey>>,
    tick: u64,
}

impl CacheInner {
    fn next_tick(&mut self) -> u64 {
        self.tick += 1;
        self.tick
    }

    fn evict_resolved(&mut self, capacity: usize) {
        while self.resolved.len() > capacity {
            let Some(victim) = self
                .resolved
                .iter()
                .min_by_key(|(_, e)| e.last_used)
                .map(|(k, _)| k.clone())
            else {
                break;
            };
            self.resolved.remove(&victim);
        }
    }

    fn evict_raw(&mut self, capacity: usize) {
        while self.raw.len() > capacity {
            let Some(victim) = self
                .raw
                .iter()
                .min_by_key(|(_, e)| e.last_used)
                .map(|(k, _)| k.clone())
            else {
                break;
            };
            self.raw.remove(&victim);
        }
    }
}

pub struct ContextCache {
    config: CacheConfig,
    inner: Mutex<CacheInner>,
}

impl ContextCache {
    pub fn new(config: CacheConfig) -> Self {
        Self {
            config,
            inner: Mutex::new(CacheInner::default()),
        }
    }

    /// Snapshot the resolved-side epoch for a key before resolving.
    /// `put_resolved` with this snapshot loses against any invalidation
    /// that happened in between.
    pub fn begin_resolved(&self, key: &CacheKey) -> u64 {
        let inner = self.inner.lock().expect("cache lock");
        inner.resolved_epochs.get(key).copied().unwrap_or(0)
    }

    pub fn begin_raw(&self, key: &CacheKey) -> u64 {
        let inner = self.inner.lock().expect("cache lock");
        inner.raw_epochs.get(key).copied().unwrap_or(0)
    }

    pub fn get_resolved(&self, key: &CacheKey) -> Option<ResolvedContext> {
        let mut inner = self.inner.lock().expect("cache lock");
        let current_epoch = inner.resolved_epochs.get(key).copied().unwrap_or(0);
        let tick = inner.next_tick();

        let stale = match inner.resolved.get_mut(key) {
            Some(entry) if entry.epoch == current_epoch && entry.expires_at > Instant::now() => {
                entry.last_used = tick;
                return Some(entry.resolved.clone());
            }
            Some(_) => true,
            None => false,
        };
        if stale {
            inner.resolved.remove(key);
        }
        None
    }

    /// Populate the resolved cache. `ancestors` are the chain keys this
    /// resolution depends on (present or not); each gets a reverse-index
    /// entry so invalidating it cascades here. A stale `epoch` means an
    /// invalidation won the race and the populate is dropped.
    pub fn put_resolved(
        &self,
        key: &CacheKey,
        resolved: ResolvedContext,
        ancestors: &[CacheKey],
        epoch: u64,
    ) {
        let mut inner = self.inner.lock().expect("cache lock");
        let current_epoch = inner.resolved_epochs.get(key).copied().unwrap_or(0);
        if current_epoch != epoch {
            debug!(
                "cache: dropped stale resolved populate for {}/{}",
                key.level, key.context_id
            );
            return;
        }

        let tick = inner.next_tick();
        inner.resolved.insert(
            key.clone(),
            ResolvedEntry {
                resolved,
                epoch,
                expires_at: Instant::now() + self.config.ttl,
                last_used: tick,
            },
        );
        for ancestor in ancestors {
            if ancestor != key {
                inner
                    .dependents
                    .entry(ancestor.clone())
                    .or_default()
                    .insert(key.clone());
            }
        }
        inner.evict_resolved(self.config.capacity);
    }

    pub fn get_raw(&self, key: &CacheKey) -> Option<Context> {
        let mut inner = self.inner.lock().expect("cache lock");
        let current_epoch = inner.raw_epochs.get(key).copied().unwrap_or(0);
        let tick = inner.next_tick();

        let stale = match inner.raw.get_mut(key) {
            Some(entry) if entry.epoch == current_epoch && entry.expires_at > Instant::now() => {
                entry.last_used = tick;
                return Some(entry.context.clone());
            }
            Some(_) => true,
            None => false,
        };
        if stale {
            inner.raw.remove(key);
        }
        None
    }

    pub fn put_raw(&self, key: &CacheKey, context: Context, epoch: u64) {
        let mut inner = self.inner.lock().expect("cache lock");
        let current_epoch = inner.raw_epochs.get(key).copied().unwrap_or(0);
        if current_epoch != epoch {
            return;
        }
        let tick = inner.next_tick();
        inner.raw.insert(
            key.clone(),
            RawEntry {
                context,
                epoch,
                expires_at: Instant::now() + self.config.ttl,
                last_used: tick,
            },
        );
        inner.evict_raw(self.config.capacity);
    }

    /// Remove the raw and resolved entries for exactly this context.
    pub fn invalidate_context(&self, key: &CacheKey) {
        let mut inner = self.inner.lock().expect("cache lock");
        *inner.resolved_epochs.entry(key.clone()).or_insert(0) += 1;
        *inner.raw_epochs.entry(key.clone()).or_insert(0) += 1;
        inner.resolved.remove(key);
        inner.raw.remove(key);
        debug!("cache: invalidated {}/{}", key.level, key.context_id);
    }

    /// Remove resolved entries for this context and everything that resolved
    /// through it, walking the reverse index transitively.
    pub fn invalidate_inheritance(&self, key: &CacheKey) {
        let mut inner = self.inner.lock().expect("cache lock");

        let mut queue: VecDeque<CacheKey> = VecDeque::new();
        let mut seen: HashSet<CacheKey> = HashSet::new();
        queue.push_back(key.clone());
        seen.insert(key.clone());

        while let Some(current) = queue.pop_front() {
            *inner.resolved_epochs.entry(current.clone()).or_insert(0) += 1;
            inner.resolved.remove(&current);

            if let Some(dependents) = inner.dependents.get(&current) {
                for dependent in dependents.clone() {
                    if seen.insert(dependent.clone()) {
                        queue.push_back(dependent);
                    }
                }
            }
        }

        debug!(
            "cache: inheritance invalidation from {}/{} touched {} keys",
            key.level,
            key.context_id,
            seen.len()
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::types::JsonMap;
    use chrono::Utc;

    fn resolved(level: ContextLevel, id: &str) -> ResolvedContext {
        ResolvedContext {
            level,
            context_id: id.to_string(),
            data: JsonMap::new(),
            inheritance_chain: vec![level],
            resolved_at: Utc::now(),
        }
    }

    fn key(level: ContextLevel, id: &str) -> CacheKey {
        CacheKey::new(&UserScope::new("u1"), level, id)
    }

    #[test]
    fn test_hit_after_populate() {
        let cache = ContextCache::new(CacheConfig::default());
        let k = key(ContextLevel::Task, "t1");
        let epoch = cache.begin_resolved(&k);
        cache.put_resolved(&k, resolved(ContextLevel::Task, "t1"), &[], epoch);
        assert!(cache.get_resolved(&k).is_some());
    }

    #[test]
    fn test_invalidation_wins_populate_race() {
        let cache = ContextCache::new(CacheConfig::default());
        let k = key(ContextLevel::Task, "t1");

        // A resolution snapshots the epoch, then an invalidation lands
        // before the populate. The populate must be dropped.
        let epoch = cache.begin_resolved(&k);
        cache.invalidate_context(&k);
        cache.put_resolved(&k, resolved(ContextLevel::Task, "t1"), &[], epoch);
        assert!(cache.get_resolved(&k).is_none());
    }

    #[test]
    fn test_inheritance_invalidation_cascades_through_dependents() {
        let cache = ContextCache::new(CacheConfig::default());
        let project = key(ContextLevel::Project, "p1");
        let task = key(ContextLevel::Task, "t1");
        let other = key(ContextLevel::Task, "t2");

        let epoch = cache.begin_resolved(&task);
        cache.put_resolved(
            &task,
            resolved(ContextLevel::Task, "t1"),
            std::slice::from_ref(&project),
            epoch,
        );
        let epoch = cache.begin_resolved(&other);
        cache.put_resolved(&other, resolved(ContextLevel::Task, "t2"), &[], epoch);

        cache.invalidate_inheritance(&project);
        assert!(cache.get_resolved(&task).is_none());
        // Unrelated task is untouched.
        assert!(cache.get_resolved(&other).is_some());
    }

    #[test]
    fn test_dependency_registered_while_ancestor_absent() {
        let cache = ContextCache::new(CacheConfig::default());
        let global = key(ContextLevel::Global, "u1");
        let task = key(ContextLevel::Task, "t1");

        // Resolution that skipped a missing GLOBAL still registers interest;
        // creating the GLOBAL later must drop the cached view.
        let epoch = cache.begin_resolved(&task);
        cache.put_resolved(
            &task,
            resolved(ContextLevel::Task, "t1"),
            std::slice::from_ref(&global),
            epoch,
        );
        cache.invalidate_inheritance(&global);
        assert!(cache.get_resolved(&task).is_none());
    }

    #[test]
    fn test_lru_eviction_respects_capacity() {
        let cache = ContextCache::new(CacheConfig::default().with_capacity(2));
        for id in ["t1", "t2", "t3"] {
            let k = key(ContextLevel::Task, id);
            let epoch = cache.begin_resolved(&k);
            cache.put_resolved(&k, resolved(ContextLevel::Task, id), &[], epoch);
        }
        let cached: Vec<bool> = ["t1", "t2", "t3"]
            .iter()
            .map(|id| cache.get_resolved(&key(ContextLevel::Task, id)).is_some())
            .collect();
        assert_eq!(cached.iter().filter(|hit| **hit).count(), 2);
        // The oldest entry is the one that went.
        assert!(!cached[0]);
    }

    #[test]
    fn test_ttl_expiry() {
        let cache = ContextCache::new(CacheConfig::default().with_ttl(Duration::from_secs(0)));
        let k = key(ContextLevel::Task, "t1");
        let epoch = cache.begin_resolved(&k);
        cache.put_resolved(&k, resolved(ContextLevel::Task, "t1"), &[], epoch);
        assert!(cache.get_resolved(&k).is_none());
    }

    #[test]
    fn test_raw_side_survives_inheritance_invalidation() {
        let cache = ContextCache::new(CacheConfig::default());
        let k = key(ContextLevel::Branch, "b1");
        let epoch = cache.begin_raw(&k);
        cache.put_raw(
            &k,
            Context::new(ContextLevel::Branch, "b1", "u1", JsonMap::new()),
            epoch,
        );

        // Cascade on the resolved side leaves the unchanged raw row alone.
        cache.invalidate_inheritance(&k);
        assert!(cache.get_raw(&k).is_some());

        // A direct write to the context drops it.
        cache.invalidate_context(&k);
        assert!(cache.get_raw(&k).is_none());
    }
}

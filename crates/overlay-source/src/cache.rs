//! Shared byte-bounded cache of fetched ranges and open sources.
//!
//! One mutex guards all state. It is only held for map operations, never
//! across a fetch, and a range is inserted only after its fetch succeeded.
//! Lock poisoning (another thread panicked mid-update) is treated as
//! unrecoverable, as in the in-memory stores.

use crate::fetch::ByteRange;
use crate::source::Source;
use bytes::Bytes;
use lru::LruCache;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};

/// Request accounting. Each range request is counted exactly once.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    /// Served from the cache
    pub hits: u64,
    /// Fetched successfully and inserted
    pub misses: u64,
    /// Fetch failed; nothing was cached
    pub errors: u64,
    /// Bytes fetched on misses
    pub bytes: u64,
}

impl CacheStats {
    fn add(&mut self, other: &CacheStats) {
        self.hits += other.hits;
        self.misses += other.misses;
        self.errors += other.errors;
        self.bytes += other.bytes;
    }
}

/// Something dropped to stay within the byte budget
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EvictionEvent {
    pub key: String,
    /// `None` when a whole source was evicted
    pub range: Option<ByteRange>,
    pub reason: String,
}

pub type EvictionListener = Arc<dyn Fn(&EvictionEvent) + Send + Sync>;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct RangeKey {
    key: String,
    range: ByteRange,
}

struct CacheState {
    max_bytes: u64,
    ranges: LruCache<RangeKey, Bytes>,
    range_bytes: u64,
    sources: LruCache<String, Arc<Source>>,
    source_bytes: u64,
    stats: HashMap<String, CacheStats>,
}

impl CacheState {
    fn total_bytes(&self) -> u64 {
        self.range_bytes + self.source_bytes
    }

    /// Drop least-recently-used ranges, then least-recently-used sources,
    /// until the budget holds. The most recent source is never evicted.
    fn evict(&mut self) -> Vec<EvictionEvent> {
        let mut events = Vec::new();
        while self.total_bytes() > self.max_bytes {
            if let Some((k, bytes)) = self.ranges.pop_lru() {
                self.range_bytes -= bytes.len() as u64;
                events.push(EvictionEvent {
                    key: k.key,
                    range: Some(k.range),
                    reason: "range cache over budget".to_string(),
                });
                continue;
            }
            if self.sources.len() <= 1 {
                break;
            }
            match self.sources.pop_lru() {
                Some((key, source)) => {
                    self.source_bytes -= source.index_bytes();
                    events.push(EvictionEvent {
                        key,
                        range: None,
                        reason: "source index over budget".to_string(),
                    });
                }
                None => break,
            }
        }
        events
    }
}

/// State shared by a `SourceCache` and the sources it opened
pub struct SharedCache {
    state: Mutex<CacheState>,
    listener: RwLock<Option<EvictionListener>>,
}

impl SharedCache {
    pub(crate) fn new(max_bytes: u64) -> Self {
        Self {
            state: Mutex::new(CacheState {
                max_bytes,
                ranges: LruCache::unbounded(),
                range_bytes: 0,
                sources: LruCache::unbounded(),
                source_bytes: 0,
                stats: HashMap::new(),
            }),
            listener: RwLock::new(None),
        }
    }

    pub(crate) fn set_listener(&self, listener: EvictionListener) {
        *self.listener.write().unwrap() = Some(listener);
    }

    fn notify(&self, events: Vec<EvictionEvent>) {
        if events.is_empty() {
            return;
        }
        for event in &events {
            tracing::debug!(key = %event.key, range = ?event.range, reason = %event.reason, "evicted");
        }
        if let Some(listener) = self.listener.read().unwrap().as_ref() {
            for event in &events {
                listener(event);
            }
        }
    }

    /// Look up a cached range, counting a hit when found
    pub(crate) fn lookup_range(&self, key: &str, range: ByteRange) -> Option<Bytes> {
        let mut state = self.state.lock().unwrap();
        let lookup = RangeKey { key: key.to_string(), range };
        let bytes = state.ranges.get(&lookup).cloned()?;
        state.stats.entry(key.to_string()).or_default().hits += 1;
        Some(bytes)
    }

    /// Insert a successfully fetched range, counting a miss
    pub(crate) fn insert_range(&self, key: &str, range: ByteRange, bytes: Bytes) {
        let events = {
            let mut state = self.state.lock().unwrap();
            let len = bytes.len() as u64;
            let stats = state.stats.entry(key.to_string()).or_default();
            stats.misses += 1;
            stats.bytes += len;

            if let Some(old) = state.ranges.put(RangeKey { key: key.to_string(), range }, bytes) {
                state.range_bytes -= old.len() as u64;
            }
            state.range_bytes += len;
            state.evict()
        };
        self.notify(events);
    }

    pub(crate) fn record_error(&self, key: &str) {
        let mut state = self.state.lock().unwrap();
        state.stats.entry(key.to_string()).or_default().errors += 1;
    }

    pub(crate) fn get_source(&self, key: &str) -> Option<Arc<Source>> {
        self.state.lock().unwrap().sources.get(key).cloned()
    }

    /// Insert an opened source, returning the already cached one if a
    /// concurrent open won
    pub(crate) fn insert_source(&self, source: Arc<Source>) -> Arc<Source> {
        let (source, events) = {
            let mut state = self.state.lock().unwrap();
            if let Some(existing) = state.sources.get(source.key()) {
                return Arc::clone(existing);
            }
            state.source_bytes += source.index_bytes();
            state.sources.put(source.key().to_string(), Arc::clone(&source));
            let events = state.evict();
            (source, events)
        };
        self.notify(events);
        source
    }

    pub(crate) fn stats_for(&self, key: &str) -> CacheStats {
        self.state.lock().unwrap().stats.get(key).copied().unwrap_or_default()
    }

    pub(crate) fn stats(&self) -> CacheStats {
        let state = self.state.lock().unwrap();
        let mut total = CacheStats::default();
        for stats in state.stats.values() {
            total.add(stats);
        }
        total
    }

    pub(crate) fn cached_bytes(&self) -> u64 {
        self.state.lock().unwrap().total_bytes()
    }

    pub(crate) fn max_bytes(&self) -> u64 {
        self.state.lock().unwrap().max_bytes
    }

    pub(crate) fn source_count(&self) -> usize {
        self.state.lock().unwrap().sources.len()
    }

    pub(crate) fn clear(&self) {
        let mut state = self.state.lock().unwrap();
        state.ranges.clear();
        state.range_bytes = 0;
        state.sources.clear();
        state.source_bytes = 0;
    }
}

//! Process-wide cache of open sources.
//!
//! Concurrent `get` calls for one key share a single open. The in-flight
//! registry uses `Mutex::unwrap()`; a poisoned lock means a thread panicked
//! while registering an open, which is treated as unrecoverable.

use crate::cache::{CacheStats, EvictionListener, SharedCache};
use crate::error::{Result, SourceError};
use crate::fetch::{DefaultRangeFetcher, RangeFetcher};
use crate::source::Source;
use futures::future::{BoxFuture, FutureExt, Shared};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

type OpenFuture = Shared<BoxFuture<'static, std::result::Result<Arc<Source>, SourceError>>>;

/// Per-call overrides for [`SourceCache::get_with`]
#[derive(Clone, Default)]
pub struct GetOptions {
    /// Fetcher used if the source is not open yet
    pub fetcher: Option<Arc<dyn RangeFetcher>>,
    /// Approximate dataset size, sizes the initial header fetch
    pub size_hint: Option<u64>,
}

impl GetOptions {
    pub fn with_fetcher(mut self, fetcher: Arc<dyn RangeFetcher>) -> Self {
        self.fetcher = Some(fetcher);
        self
    }

    pub fn with_size_hint(mut self, size_hint: Option<u64>) -> Self {
        self.size_hint = size_hint;
        self
    }
}

struct Inner {
    shared: Arc<SharedCache>,
    fetcher: Arc<dyn RangeFetcher>,
    opening: Mutex<HashMap<String, OpenFuture>>,
}

/// Open sources and fetched ranges under one byte budget
#[derive(Clone)]
pub struct SourceCache {
    inner: Arc<Inner>,
}

impl SourceCache {
    /// Cache using HTTP for `http(s)://` keys and the filesystem otherwise
    pub fn new(max_bytes: u64) -> Self {
        Self::with_fetcher(max_bytes, Arc::new(DefaultRangeFetcher::new()))
    }

    pub fn with_fetcher(max_bytes: u64, fetcher: Arc<dyn RangeFetcher>) -> Self {
        Self {
            inner: Arc::new(Inner {
                shared: Arc::new(SharedCache::new(max_bytes)),
                fetcher,
                opening: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Called for every evicted range or source
    pub fn on_evict(&self, listener: EvictionListener) {
        self.inner.shared.set_listener(listener);
    }

    pub async fn get(&self, key: &str) -> Result<Arc<Source>> {
        self.get_with(key, GetOptions::default()).await
    }

    /// Return the open source for `key`, opening it if needed
    pub async fn get_with(&self, key: &str, options: GetOptions) -> Result<Arc<Source>> {
        if let Some(source) = self.inner.shared.get_source(key) {
            return Ok(source);
        }

        let open = {
            let mut opening = self.inner.opening.lock().unwrap();
            if let Some(open) = opening.get(key) {
                open.clone()
            } else if let Some(source) = self.inner.shared.get_source(key) {
                // An open finished between the first lookup and taking the lock
                return Ok(source);
            } else {
                let open = self.open_future(key, options);
                opening.insert(key.to_string(), open.clone());
                open
            }
        };

        open.await
    }

    fn open_future(&self, key: &str, options: GetOptions) -> OpenFuture {
        let inner = Arc::clone(&self.inner);
        let key = key.to_string();
        let fetcher = options.fetcher.unwrap_or_else(|| Arc::clone(&inner.fetcher));

        async move {
            let cache = Arc::downgrade(&inner.shared);
            let result = Source::open(&key, fetcher, cache, options.size_hint)
                .await
                .map(|source| inner.shared.insert_source(Arc::new(source)));
            if let Err(e) = &result {
                tracing::warn!(dataset = %key, error = %e, "failed to open source");
            }
            inner.opening.lock().unwrap().remove(&key);
            result
        }
        .boxed()
        .shared()
    }

    /// Totals across all sources
    pub fn stats(&self) -> CacheStats {
        self.inner.shared.stats()
    }

    pub fn stats_for(&self, key: &str) -> CacheStats {
        self.inner.shared.stats_for(key)
    }

    /// Range bytes plus open source index bytes
    pub fn cached_bytes(&self) -> u64 {
        self.inner.shared.cached_bytes()
    }

    pub fn max_bytes(&self) -> u64 {
        self.inner.shared.max_bytes()
    }

    pub fn source_count(&self) -> usize {
        self.inner.shared.source_count()
    }

    /// Drop every cached range and source. Statistics are kept.
    pub fn clear(&self) {
        self.inner.shared.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fetch::{ByteRange, MemoryRangeFetcher};
    use async_trait::async_trait;
    use bytes::Bytes;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingFetcher {
        inner: MemoryRangeFetcher,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl RangeFetcher for CountingFetcher {
        async fn fetch_range(&self, key: &str, range: ByteRange) -> Result<Bytes> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::task::yield_now().await;
            self.inner.fetch_range(key, range).await
        }
    }

    #[tokio::test]
    async fn test_missing_dataset_is_not_cached() {
        let cache = SourceCache::with_fetcher(1 << 20, Arc::new(MemoryRangeFetcher::new()));
        let err = cache.get("missing").await.unwrap_err();
        assert!(err.is_retryable());
        assert_eq!(cache.source_count(), 0);
        assert!(cache.inner.opening.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_bad_magic_is_format_error() {
        let memory = MemoryRangeFetcher::new();
        memory.insert("junk", Bytes::from_static(b"definitely not a dataset"));
        let fetcher = Arc::new(CountingFetcher { inner: memory, calls: AtomicUsize::new(0) });
        let cache = SourceCache::with_fetcher(1 << 20, fetcher.clone());

        let err = cache.get("junk").await.unwrap_err();
        assert!(matches!(err, SourceError::Format { .. }));
        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 1);
    }
}

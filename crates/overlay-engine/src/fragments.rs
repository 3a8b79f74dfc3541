//! Content-addressed fragment storage.
//!
//! Identical clip results from unrelated sketches hash to the same key, so
//! each fragment is computed once. Concurrent requests for one hash attach
//! to a single in-flight computation. Locks use `unwrap()`: poisoning means
//! a thread panicked mid-update, which is unrecoverable here.

use crate::error::{EngineError, Result};
use futures::future::{BoxFuture, FutureExt, Shared};
use overlay_core::models::{Fragment, FragmentHash};
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, RwLock};

type InFlight = Shared<BoxFuture<'static, std::result::Result<Arc<Fragment>, String>>>;

#[derive(Default)]
struct Inner {
    fragments: RwLock<HashMap<FragmentHash, Arc<Fragment>>>,
    in_flight: Mutex<HashMap<FragmentHash, InFlight>>,
}

/// Shared store of immutable fragments keyed by content hash
#[derive(Clone, Default)]
pub struct FragmentStore {
    inner: Arc<Inner>,
}

impl FragmentStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, hash: &FragmentHash) -> Option<Arc<Fragment>> {
        self.inner.fragments.read().unwrap().get(hash).cloned()
    }

    pub fn len(&self) -> usize {
        self.inner.fragments.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Return the fragment for `hash`, running `compute` if nobody has.
    ///
    /// `compute` runs at most once per hash among concurrent callers; late
    /// callers wait for the same outcome. A failure is not stored, so a later
    /// call computes again.
    pub async fn get_or_create<F, Fut>(&self, hash: FragmentHash, compute: F) -> Result<Arc<Fragment>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Fragment>> + Send + 'static,
    {
        if let Some(fragment) = self.get(&hash) {
            return Ok(fragment);
        }

        let pending = {
            let mut in_flight = self.inner.in_flight.lock().unwrap();
            if let Some(pending) = in_flight.get(&hash) {
                pending.clone()
            } else if let Some(fragment) = self.get(&hash) {
                return Ok(fragment);
            } else {
                let pending = self.spawn_compute(hash.clone(), compute());
                in_flight.insert(hash.clone(), pending.clone());
                pending
            }
        };

        pending
            .await
            .map_err(|reason| EngineError::FragmentFailed { hash: hash.to_string(), reason })
    }

    fn spawn_compute<Fut>(&self, hash: FragmentHash, compute: Fut) -> InFlight
    where
        Fut: Future<Output = Result<Fragment>> + Send + 'static,
    {
        let inner = Arc::clone(&self.inner);
        async move {
            let result = compute.await.map(Arc::new).map_err(|e| e.to_string());
            match &result {
                Ok(fragment) => {
                    inner.fragments.write().unwrap().insert(hash.clone(), Arc::clone(fragment));
                    tracing::debug!(%hash, "stored fragment");
                }
                Err(reason) => tracing::warn!(%hash, %reason, "fragment computation failed"),
            }
            inner.in_flight.lock().unwrap().remove(&hash);
            result
        }
        .boxed()
        .shared()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use geo::{polygon, MultiPolygon};
    use overlay_core::OverlayError;

    fn fragment(hash: &FragmentHash) -> Fragment {
        let geometry = MultiPolygon(vec![polygon![
            (x: 0.0, y: 0.0), (x: 1.0, y: 0.0), (x: 1.0, y: 1.0), (x: 0.0, y: 0.0)
        ]]);
        Fragment::new(hash.clone(), geometry, vec![2, 1])
    }

    #[tokio::test]
    async fn test_failure_is_not_cached() {
        let store = FragmentStore::new();
        let hash = FragmentHash::from("abc");

        let err = store
            .get_or_create(hash.clone(), || async { Err(OverlayError::Storage("disk full".into()).into()) })
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::FragmentFailed { .. }));
        assert!(store.get(&hash).is_none());

        let h = hash.clone();
        let created = store.get_or_create(hash.clone(), move || async move { Ok(fragment(&h)) }).await.unwrap();
        assert_eq!(created.geography_ids(), &[1, 2]);
        assert!(store.get(&hash).is_some());
    }
}

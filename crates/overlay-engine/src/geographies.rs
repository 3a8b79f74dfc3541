//! Geography lookup port.

use async_trait::async_trait;
use overlay_core::error::{OverlayError, Result};
use overlay_core::models::{Geography, GeographyId};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

/// Port for resolving geography definitions by id
#[async_trait]
pub trait GeographyResolver: Send + Sync {
    /// Get a geography, or `GeographyNotFound`
    async fn resolve(&self, id: GeographyId) -> Result<Geography>;
}

/// In-memory geographies for development and testing.
///
/// Uses `RwLock::unwrap()`; lock poisoning is unrecoverable here.
#[derive(Debug, Clone, Default)]
pub struct MemoryGeographyResolver {
    geographies: Arc<RwLock<HashMap<GeographyId, Geography>>>,
}

impl MemoryGeographyResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, geography: Geography) {
        self.geographies.write().unwrap().insert(geography.id, geography);
    }
}

impl FromIterator<Geography> for MemoryGeographyResolver {
    fn from_iter<T: IntoIterator<Item = Geography>>(iter: T) -> Self {
        let resolver = Self::new();
        for geography in iter {
            resolver.insert(geography);
        }
        resolver
    }
}

#[async_trait]
impl GeographyResolver for MemoryGeographyResolver {
    async fn resolve(&self, id: GeographyId) -> Result<Geography> {
        self.geographies.read().unwrap().get(&id).cloned().ok_or(OverlayError::GeographyNotFound { id })
    }
}

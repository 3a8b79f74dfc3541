//! Content-addressed clipped geometry.

use crate::models::geography::GeographyId;
use chrono::{DateTime, Utc};
use geo::MultiPolygon;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Hex-encoded SHA-256 of a fragment's canonical geometry and geography set
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FragmentHash(pub String);

impl FragmentHash {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for FragmentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for FragmentHash {
    fn from(s: &str) -> Self {
        FragmentHash(s.to_string())
    }
}

/// Immutable clipped geometry shared by every sketch that produces it.
///
/// Fields are private so a fragment cannot be modified after creation.
#[derive(Debug, Clone, PartialEq)]
pub struct Fragment {
    hash: FragmentHash,
    geometry: MultiPolygon<f64>,
    geography_ids: Vec<GeographyId>,
    created_at: DateTime<Utc>,
}

impl Fragment {
    pub fn new(
        hash: FragmentHash,
        geometry: MultiPolygon<f64>,
        mut geography_ids: Vec<GeographyId>,
    ) -> Self {
        geography_ids.sort_unstable();
        geography_ids.dedup();
        Self { hash, geometry, geography_ids, created_at: Utc::now() }
    }

    pub fn hash(&self) -> &FragmentHash {
        &self.hash
    }

    pub fn geometry(&self) -> &MultiPolygon<f64> {
        &self.geometry
    }

    pub fn geography_ids(&self) -> &[GeographyId] {
        &self.geography_ids
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }
}

//! Geographies and the clipping layers that define them.

use crate::filter::FilterExpr;
use serde::{Deserialize, Serialize};

pub type GeographyId = i64;

/// Clipping operation applied by a layer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ClipOp {
    /// Keep only the parts of the sketch covered by the layer's features
    Intersect,
    /// Remove the parts of the sketch covered by the layer's features
    Difference,
}

impl std::fmt::Display for ClipOp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ClipOp::Intersect => write!(f, "INTERSECT"),
            ClipOp::Difference => write!(f, "DIFFERENCE"),
        }
    }
}

/// Reference to a remote dataset plus the operation to apply with it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClippingLayer {
    /// Dataset URL or key
    pub source: String,

    pub op: ClipOp,

    /// Optional predicate over feature properties
    #[serde(default, skip_serializing_if = "Option::is_none", alias = "cql2Query")]
    pub filter: Option<FilterExpr>,

    /// Approximate dataset size in bytes, used to size the initial header fetch
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size_hint: Option<u64>,
}

impl ClippingLayer {
    pub fn new(source: impl Into<String>, op: ClipOp) -> Self {
        Self { source: source.into(), op, filter: None, size_hint: None }
    }

    pub fn intersect(source: impl Into<String>) -> Self {
        Self::new(source, ClipOp::Intersect)
    }

    pub fn difference(source: impl Into<String>) -> Self {
        Self::new(source, ClipOp::Difference)
    }

    /// Set the feature filter
    pub fn filter(mut self, filter: FilterExpr) -> Self {
        self.filter = Some(filter);
        self
    }
}

/// Named, ordered collection of clipping layers.
///
/// Layer order is significant and is preserved exactly as configured.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Geography {
    pub id: GeographyId,
    #[serde(default)]
    pub name: String,
    #[serde(default, alias = "clippingLayers")]
    pub clipping_layers: Vec<ClippingLayer>,
}

impl Geography {
    pub fn new(id: GeographyId, name: impl Into<String>) -> Self {
        Self { id, name: name.into(), clipping_layers: Vec::new() }
    }

    /// Append a clipping layer
    pub fn layer(mut self, layer: ClippingLayer) -> Self {
        self.clipping_layers.push(layer);
        self
    }

    pub fn has_intersect_layer(&self) -> bool {
        self.clipping_layers.iter().any(|l| l.op == ClipOp::Intersect)
    }
}

/// Encoding of a target dataset used for overlap calculations
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum DatasetFormat {
    /// Range-readable packed feature dataset with an embedded block index
    #[default]
    OverlayFgb,
    GeoJson,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clip_op_serialization() {
        assert_eq!(serde_json::to_string(&ClipOp::Intersect).unwrap(), "\"INTERSECT\"");
        let op: ClipOp = serde_json::from_str("\"DIFFERENCE\"").unwrap();
        assert_eq!(op, ClipOp::Difference);
    }

    #[test]
    fn test_geography_preserves_layer_order() {
        let toml_src = r#"
id = 7
name = "Offshore"

[[clipping_layers]]
source = "https://example.com/eez.fgb"
op = "INTERSECT"

[[clipping_layers]]
source = "https://example.com/territorial.fgb"
op = "DIFFERENCE"

[[clipping_layers]]
source = "https://example.com/reefs.fgb"
op = "INTERSECT"
"#;
        let geography: Geography = toml::from_str(toml_src).unwrap();
        let sources: Vec<&str> =
            geography.clipping_layers.iter().map(|l| l.source.as_str()).collect();
        assert_eq!(
            sources,
            vec![
                "https://example.com/eez.fgb",
                "https://example.com/territorial.fgb",
                "https://example.com/reefs.fgb"
            ]
        );
        assert!(geography.has_intersect_layer());
    }

    #[test]
    fn test_layer_accepts_cql2_alias() {
        let json = r#"{
            "source": "eez",
            "op": "INTERSECT",
            "cql2Query": { "op": "=", "args": [{ "property": "name" }, "US"] }
        }"#;
        let layer: ClippingLayer = serde_json::from_str(json).unwrap();
        assert!(layer.filter.is_some());
    }
}

//! Build packed datasets from GeoJSON features.

use crate::error::{Result, SourceError};
use crate::fetch::ByteRange;
use crate::format::{encode_record, BlockEntry, DatasetHeader, MAGIC};
use bytes::BufMut;
use geo::{BoundingRect, Coord, MultiPolygon, Rect};
use serde_json::{Map, Value};
use std::collections::BTreeSet;
use std::path::Path;

pub const DEFAULT_BLOCK_SIZE: usize = 64;

struct PendingFeature {
    properties: Map<String, Value>,
    bbox: Rect<f64>,
    geometry: MultiPolygon<f64>,
}

/// Accumulates polygonal features and writes them as one dataset.
///
/// Features are ordered along a Z-order curve of their bbox centres so that
/// each block covers a compact area.
pub struct DatasetWriter {
    name: String,
    block_size: usize,
    features: Vec<PendingFeature>,
}

impl DatasetWriter {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into(), block_size: DEFAULT_BLOCK_SIZE, features: Vec::new() }
    }

    /// Maximum features per block
    pub fn block_size(mut self, block_size: usize) -> Self {
        self.block_size = block_size.max(1);
        self
    }

    pub fn len(&self) -> usize {
        self.features.len()
    }

    pub fn is_empty(&self) -> bool {
        self.features.is_empty()
    }

    /// Add a Polygon or MultiPolygon feature
    pub fn add_feature(&mut self, feature: &geojson::Feature) -> Result<()> {
        let geometry = feature
            .geometry
            .as_ref()
            .ok_or_else(|| SourceError::format(&self.name, "feature has no geometry"))?;
        let geometry: geo::Geometry<f64> = geometry
            .clone()
            .try_into()
            .map_err(|e: geojson::Error| SourceError::format(&self.name, e.to_string()))?;
        let geometry = match geometry {
            geo::Geometry::Polygon(p) => MultiPolygon(vec![p]),
            geo::Geometry::MultiPolygon(mp) => mp,
            _ => {
                return Err(SourceError::format(
                    &self.name,
                    "only Polygon and MultiPolygon features can be packed",
                ))
            }
        };
        let properties = feature.properties.clone().unwrap_or_default();
        self.add(properties, geometry)
    }

    pub fn add(&mut self, properties: Map<String, Value>, geometry: MultiPolygon<f64>) -> Result<()> {
        let bbox = geometry
            .bounding_rect()
            .ok_or_else(|| SourceError::format(&self.name, "feature geometry is empty"))?;
        self.features.push(PendingFeature { properties, bbox, geometry });
        Ok(())
    }

    /// Serialize the dataset
    pub fn finish(mut self) -> Result<Vec<u8>> {
        let bounds = self.features.iter().map(|f| f.bbox).reduce(union_rect);
        if let Some(bounds) = bounds {
            self.features.sort_by_cached_key(|f| morton_code(&bounds, &f.bbox));
        }

        let mut data = Vec::new();
        let mut index = Vec::new();
        for block in self.features.chunks(self.block_size) {
            let start = data.len() as u64;
            for feature in block {
                encode_record(&mut data, &feature.properties, &feature.bbox, &feature.geometry)
                    .map_err(|e| SourceError::format(&self.name, e.to_string()))?;
            }
            let range = ByteRange::new(start, data.len() as u64);
            let bbox = block.iter().map(|f| f.bbox).reduce(union_rect).unwrap_or(bounds_or_zero(bounds));
            index.push(BlockEntry {
                bbox,
                offset: range.start,
                length: range.len() as u32,
                feature_count: block.len() as u32,
            });
        }

        let columns: BTreeSet<&String> =
            self.features.iter().flat_map(|f| f.properties.keys()).collect();
        let bounds = bounds_or_zero(bounds);
        let header = DatasetHeader {
            name: self.name.clone(),
            feature_count: self.features.len() as u64,
            block_count: index.len() as u32,
            bbox: [bounds.min().x, bounds.min().y, bounds.max().x, bounds.max().y],
            columns: columns.into_iter().cloned().collect(),
        };
        let header = serde_json::to_vec(&header)
            .map_err(|e| SourceError::format(&self.name, e.to_string()))?;

        let mut out = Vec::with_capacity(MAGIC.len() + 4 + header.len() + data.len());
        out.put_slice(MAGIC);
        out.put_u32_le(header.len() as u32);
        out.put_slice(&header);
        for entry in &index {
            entry.encode(&mut out);
        }
        out.put_slice(&data);

        tracing::info!(
            dataset = %self.name,
            features = self.features.len(),
            blocks = index.len(),
            bytes = out.len(),
            "packed dataset"
        );
        Ok(out)
    }

    /// Serialize the dataset to a file
    pub async fn write_to(self, path: impl AsRef<Path>) -> Result<u64> {
        let path = path.as_ref();
        let key = path.display().to_string();
        let bytes = self.finish()?;
        tokio::fs::write(path, &bytes).await.map_err(|e| SourceError::io(key, e))?;
        Ok(bytes.len() as u64)
    }
}

fn union_rect(a: Rect<f64>, b: Rect<f64>) -> Rect<f64> {
    Rect::new(
        Coord { x: a.min().x.min(b.min().x), y: a.min().y.min(b.min().y) },
        Coord { x: a.max().x.max(b.max().x), y: a.max().y.max(b.max().y) },
    )
}

fn bounds_or_zero(bounds: Option<Rect<f64>>) -> Rect<f64> {
    bounds.unwrap_or_else(|| Rect::new(Coord { x: 0.0, y: 0.0 }, Coord { x: 0.0, y: 0.0 }))
}

/// Interleave the bits of the bbox centre, normalized to 16 bits per axis
fn morton_code(bounds: &Rect<f64>, bbox: &Rect<f64>) -> u32 {
    let centre = bbox.center();
    let scale = |v: f64, min: f64, extent: f64| -> u32 {
        if extent <= 0.0 {
            return 0;
        }
        (((v - min) / extent).clamp(0.0, 1.0) * u16::MAX as f64) as u32
    };
    let x = scale(centre.x, bounds.min().x, bounds.width());
    let y = scale(centre.y, bounds.min().y, bounds.height());
    spread_bits(x) | (spread_bits(y) << 1)
}

fn spread_bits(v: u32) -> u32 {
    let mut v = v & 0x0000_ffff;
    v = (v | (v << 8)) & 0x00ff_00ff;
    v = (v | (v << 4)) & 0x0f0f_0f0f;
    v = (v | (v << 2)) & 0x3333_3333;
    (v | (v << 1)) & 0x5555_5555
}

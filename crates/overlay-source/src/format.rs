//! Binary layout of packed feature datasets.
//!
//! ```text
//! magic       8 bytes   b"OVLYFGB\x01"
//! header_len  u32 LE
//! header      JSON      { name, feature_count, block_count, bbox, columns }
//! index       block_count x 48 bytes
//!             min_x, min_y, max_x, max_y  f64 LE
//!             offset                      u64 LE, relative to data start
//!             length                      u32 LE
//!             feature_count               u32 LE
//! data        records, each prefixed with its byte length (u32 LE):
//!             props_len u32, props JSON object, bbox 4 x f64,
//!             polygon_count u32, per polygon ring_count u32,
//!             per ring coord_count u32 and coord_count x (f64, f64)
//! ```

use crate::error::{Result, SourceError};
use bytes::{Buf, BufMut, Bytes};
use geo::{Coord, LineString, MultiPolygon, Polygon, Rect};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

pub const MAGIC: &[u8; 8] = b"OVLYFGB\x01";

/// FlatGeobuf files start with `fgb`, a major version byte, `fgb`, a patch byte
fn is_flatgeobuf(bytes: &[u8]) -> bool {
    bytes.len() >= 8 && &bytes[..3] == b"fgb" && &bytes[4..7] == b"fgb"
}

/// Magic plus the header length prefix
pub const PREFIX_LEN: usize = MAGIC.len() + 4;

pub const INDEX_ENTRY_LEN: usize = 48;

/// Length prefix of each record
pub const RECORD_PREFIX_LEN: usize = 4;

/// Dataset-level metadata
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatasetHeader {
    pub name: String,
    pub feature_count: u64,
    pub block_count: u32,
    /// `[min_x, min_y, max_x, max_y]`
    pub bbox: [f64; 4],
    #[serde(default)]
    pub columns: Vec<String>,
}

impl DatasetHeader {
    pub fn index_len(&self) -> usize {
        self.block_count as usize * INDEX_ENTRY_LEN
    }
}

/// One entry of the block index
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BlockEntry {
    pub bbox: Rect<f64>,
    pub offset: u64,
    pub length: u32,
    pub feature_count: u32,
}

impl BlockEntry {
    pub fn end(&self) -> u64 {
        self.offset + self.length as u64
    }

    pub fn encode(&self, buf: &mut impl BufMut) {
        let (min, max) = (self.bbox.min(), self.bbox.max());
        buf.put_f64_le(min.x);
        buf.put_f64_le(min.y);
        buf.put_f64_le(max.x);
        buf.put_f64_le(max.y);
        buf.put_u64_le(self.offset);
        buf.put_u32_le(self.length);
        buf.put_u32_le(self.feature_count);
    }

    fn decode(mut buf: &[u8]) -> Self {
        let min = Coord { x: buf.get_f64_le(), y: buf.get_f64_le() };
        let max = Coord { x: buf.get_f64_le(), y: buf.get_f64_le() };
        Self {
            bbox: Rect::new(min, max),
            offset: buf.get_u64_le(),
            length: buf.get_u32_le(),
            feature_count: buf.get_u32_le(),
        }
    }
}

/// A decoded dataset feature
#[derive(Debug, Clone, PartialEq)]
pub struct DatasetFeature {
    /// Offset of the record relative to the start of the data section
    pub offset: u64,
    pub properties: Map<String, Value>,
    pub bbox: Rect<f64>,
    pub geometry: MultiPolygon<f64>,
}

/// Length of the header JSON, read from the fixed prefix
pub fn parse_prefix(key: &str, bytes: &[u8]) -> Result<usize> {
    if is_flatgeobuf(bytes) {
        return Err(SourceError::format(
            key,
            "FlatGeobuf files cannot be read directly; repack with `overlay pack`",
        ));
    }
    if bytes.len() < PREFIX_LEN {
        return Err(SourceError::format(key, "file is shorter than the header prefix"));
    }
    if &bytes[..MAGIC.len()] != MAGIC {
        return Err(SourceError::format(key, "magic bytes mismatch"));
    }
    let mut len = &bytes[MAGIC.len()..PREFIX_LEN];
    Ok(len.get_u32_le() as usize)
}

pub fn parse_header(key: &str, bytes: &[u8]) -> Result<DatasetHeader> {
    serde_json::from_slice(bytes)
        .map_err(|e| SourceError::format(key, format!("invalid header: {}", e)))
}

/// Decode and sanity-check the block index
pub fn parse_index(key: &str, header: &DatasetHeader, bytes: &[u8]) -> Result<Vec<BlockEntry>> {
    if bytes.len() != header.index_len() {
        return Err(SourceError::format(
            key,
            format!("index is {} bytes, expected {}", bytes.len(), header.index_len()),
        ));
    }

    let entries: Vec<BlockEntry> =
        bytes.chunks_exact(INDEX_ENTRY_LEN).map(BlockEntry::decode).collect();

    let mut expected_offset = 0;
    for (i, entry) in entries.iter().enumerate() {
        if entry.offset != expected_offset {
            return Err(SourceError::format(
                key,
                format!("block {} starts at {}, expected {}", i, entry.offset, expected_offset),
            ));
        }
        expected_offset = entry.end();
    }

    let features: u64 = entries.iter().map(|e| e.feature_count as u64).sum();
    if features != header.feature_count {
        return Err(SourceError::format(
            key,
            format!("index lists {} features, header {}", features, header.feature_count),
        ));
    }

    Ok(entries)
}

/// Append a length-prefixed record
pub fn encode_record(
    buf: &mut Vec<u8>,
    properties: &Map<String, Value>,
    bbox: &Rect<f64>,
    geometry: &MultiPolygon<f64>,
) -> std::result::Result<(), serde_json::Error> {
    let props = serde_json::to_vec(properties)?;

    let mut body = Vec::with_capacity(props.len() + 64);
    body.put_u32_le(props.len() as u32);
    body.put_slice(&props);
    body.put_f64_le(bbox.min().x);
    body.put_f64_le(bbox.min().y);
    body.put_f64_le(bbox.max().x);
    body.put_f64_le(bbox.max().y);
    body.put_u32_le(geometry.0.len() as u32);
    for polygon in &geometry.0 {
        body.put_u32_le(1 + polygon.interiors().len() as u32);
        for ring in std::iter::once(polygon.exterior()).chain(polygon.interiors()) {
            body.put_u32_le(ring.0.len() as u32);
            for c in &ring.0 {
                body.put_f64_le(c.x);
                body.put_f64_le(c.y);
            }
        }
    }

    buf.put_u32_le(body.len() as u32);
    buf.extend_from_slice(&body);
    Ok(())
}

/// Record body reader with explicit bounds checks
struct RecordReader<'a> {
    buf: &'a [u8],
}

impl RecordReader<'_> {
    fn need(&self, n: usize, what: &str) -> std::result::Result<(), String> {
        if self.buf.remaining() < n {
            Err(format!("truncated {}", what))
        } else {
            Ok(())
        }
    }

    fn u32(&mut self, what: &str) -> std::result::Result<u32, String> {
        self.need(4, what)?;
        Ok(self.buf.get_u32_le())
    }

    fn f64(&mut self, what: &str) -> std::result::Result<f64, String> {
        self.need(8, what)?;
        let v = self.buf.get_f64_le();
        if v.is_finite() {
            Ok(v)
        } else {
            Err(format!("non-finite {}", what))
        }
    }

    fn rect(&mut self) -> std::result::Result<Rect<f64>, String> {
        let min = Coord { x: self.f64("bbox")?, y: self.f64("bbox")? };
        let max = Coord { x: self.f64("bbox")?, y: self.f64("bbox")? };
        Ok(Rect::new(min, max))
    }

    fn geometry(&mut self) -> std::result::Result<MultiPolygon<f64>, String> {
        let polygon_count = self.u32("polygon count")?;
        let mut polygons = Vec::with_capacity(polygon_count.min(1024) as usize);
        for _ in 0..polygon_count {
            let ring_count = self.u32("ring count")?;
            if ring_count == 0 {
                return Err("polygon without rings".to_string());
            }
            let mut rings = Vec::with_capacity(ring_count.min(1024) as usize);
            for _ in 0..ring_count {
                let coord_count = self.u32("coordinate count")? as usize;
                self.need(coord_count.saturating_mul(16), "coordinates")?;
                if coord_count < 4 {
                    return Err(format!("ring with {} coordinates", coord_count));
                }
                let coords = (0..coord_count)
                    .map(|_| Ok(Coord { x: self.f64("coordinate")?, y: self.f64("coordinate")? }))
                    .collect::<std::result::Result<Vec<_>, String>>()?;
                rings.push(LineString(coords));
            }
            let mut rings = rings.into_iter();
            if let Some(exterior) = rings.next() {
                polygons.push(Polygon::new(exterior, rings.collect()));
            }
        }
        Ok(MultiPolygon(polygons))
    }
}

/// Read only the bbox of a record body, skipping the properties
pub fn record_bbox(body: &[u8]) -> std::result::Result<Rect<f64>, String> {
    let mut reader = RecordReader { buf: body };
    let props_len = reader.u32("properties length")? as usize;
    reader.need(props_len, "properties")?;
    reader.buf.advance(props_len);
    reader.rect()
}

/// Decode a record body (without its length prefix)
pub fn decode_record(offset: u64, body: &[u8]) -> Result<DatasetFeature> {
    let decode_err = |reason: String| SourceError::Decode { offset, reason };

    let mut reader = RecordReader { buf: body };
    let props_len = reader.u32("properties length").map_err(decode_err)? as usize;
    reader.need(props_len, "properties").map_err(decode_err)?;
    let properties: Map<String, Value> = serde_json::from_slice(&reader.buf[..props_len])
        .map_err(|e| decode_err(format!("invalid properties: {}", e)))?;
    reader.buf.advance(props_len);

    let bbox = reader.rect().map_err(decode_err)?;
    let geometry = reader.geometry().map_err(decode_err)?;
    if reader.buf.has_remaining() {
        return Err(decode_err(format!("{} trailing bytes", reader.buf.remaining())));
    }

    Ok(DatasetFeature { offset, properties, bbox, geometry })
}

/// Iterate length-prefixed records in a contiguous chunk of the data section.
///
/// Yields `(offset, body)` pairs; a length prefix running past the end of
/// the chunk yields one `Decode` error and ends iteration.
pub struct RecordChunks {
    data: Bytes,
    /// Offset of `data` within the data section
    base: u64,
    pos: usize,
    done: bool,
}

impl RecordChunks {
    pub fn new(data: Bytes, base: u64) -> Self {
        Self { data, base, pos: 0, done: false }
    }
}

impl Iterator for RecordChunks {
    type Item = Result<(u64, Bytes)>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done || self.pos >= self.data.len() {
            return None;
        }
        let offset = self.base + self.pos as u64;
        let remaining = self.data.len() - self.pos;
        if remaining < RECORD_PREFIX_LEN {
            self.done = true;
            return Some(Err(SourceError::Decode {
                offset,
                reason: "truncated record length".to_string(),
            }));
        }
        let mut prefix = &self.data[self.pos..self.pos + RECORD_PREFIX_LEN];
        let len = prefix.get_u32_le() as usize;
        let start = self.pos + RECORD_PREFIX_LEN;
        if len > self.data.len() - start {
            self.done = true;
            return Some(Err(SourceError::Decode {
                offset,
                reason: format!("record length {} exceeds fetched range", len),
            }));
        }
        self.pos = start + len;
        Some(Ok((offset, self.data.slice(start..start + len))))
    }
}

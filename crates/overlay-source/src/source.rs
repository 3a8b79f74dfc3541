//! Open dataset readers.

use crate::cache::{CacheStats, SharedCache};
use crate::error::{Result, SourceError};
use crate::fetch::{ByteRange, RangeFetcher};
use crate::format::{
    decode_record, parse_header, parse_index, parse_prefix, record_bbox, BlockEntry,
    DatasetFeature, DatasetHeader, RecordChunks, PREFIX_LEN,
};
use bytes::Bytes;
use futures::stream::{self, BoxStream, StreamExt};
use geo::{Coord, Intersects, Rect};
use overlay_core::filter::FilterExpr;
use serde_json::{Map, Value};
use std::sync::{Arc, Weak};

/// Bytes fetched up front when opening a source without a size hint
pub const DEFAULT_HEADER_FETCH: u64 = 64 * 1024;

/// Upper bound for one coalesced range request
pub const MAX_REQUEST_BYTES: u64 = 8 * 1024 * 1024;

/// Which features to stream
#[derive(Debug, Clone, Default)]
pub struct Query {
    /// A feature is selected when its bbox intersects any envelope
    pub envelopes: Vec<Rect<f64>>,
    pub filter: Option<FilterExpr>,
}

impl Query {
    pub fn new(envelopes: Vec<Rect<f64>>) -> Self {
        Self { envelopes, filter: None }
    }

    pub fn with_filter(mut self, filter: Option<FilterExpr>) -> Self {
        self.filter = filter;
        self
    }

    fn matches_bbox(&self, bbox: &Rect<f64>) -> bool {
        self.envelopes.iter().any(|envelope| envelope.intersects(bbox))
    }

    fn matches_properties(&self, properties: &Map<String, Value>) -> bool {
        self.filter.as_ref().map_or(true, |filter| filter.evaluate(properties))
    }
}

/// One coalesced range request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlannedRequest {
    /// Absolute range within the dataset
    pub range: ByteRange,
    /// Indexes into the block index
    pub blocks: Vec<usize>,
}

/// Estimated cost of a query
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueryPlan {
    pub requests: Vec<PlannedRequest>,
    /// Features in the selected blocks, an upper bound on what is yielded
    pub features: u64,
    pub bytes: u64,
}

/// An open dataset: header and block index in memory, records fetched on demand
pub struct Source {
    key: String,
    header: DatasetHeader,
    index: Vec<BlockEntry>,
    data_offset: u64,
    fetcher: Arc<dyn RangeFetcher>,
    cache: Weak<SharedCache>,
}

impl std::fmt::Debug for Source {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Source")
            .field("key", &self.key)
            .field("header", &self.header)
            .field("blocks", &self.index.len())
            .finish()
    }
}

impl Source {
    /// Fetch and parse the header and block index
    pub(crate) async fn open(
        key: &str,
        fetcher: Arc<dyn RangeFetcher>,
        cache: Weak<SharedCache>,
        size_hint: Option<u64>,
    ) -> Result<Self> {
        let initial = size_hint
            .map(|hint| hint.clamp(PREFIX_LEN as u64, DEFAULT_HEADER_FETCH))
            .unwrap_or(DEFAULT_HEADER_FETCH);
        let mut head = fetcher.fetch_range(key, ByteRange::new(0, initial)).await?;

        let header_end = PREFIX_LEN + parse_prefix(key, &head)?;
        head = ensure_len(&*fetcher, key, head, header_end, "header").await?;
        let header = parse_header(key, &head[PREFIX_LEN..header_end])?;

        let index_end = header_end + header.index_len();
        head = ensure_len(&*fetcher, key, head, index_end, "index").await?;
        let index = parse_index(key, &header, &head[header_end..index_end])?;

        tracing::info!(
            dataset = %key,
            features = header.feature_count,
            blocks = header.block_count,
            "opened source"
        );

        Ok(Self {
            key: key.to_string(),
            header,
            index,
            data_offset: index_end as u64,
            fetcher,
            cache,
        })
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn header(&self) -> &DatasetHeader {
        &self.header
    }

    pub fn blocks(&self) -> &[BlockEntry] {
        &self.index
    }

    /// Bytes held in memory for the header and index
    pub fn index_bytes(&self) -> u64 {
        self.data_offset
    }

    pub fn bounds(&self) -> Rect<f64> {
        let [min_x, min_y, max_x, max_y] = self.header.bbox;
        Rect::new(Coord { x: min_x, y: min_y }, Coord { x: max_x, y: max_y })
    }

    /// Range statistics for this source
    pub fn stats(&self) -> CacheStats {
        self.cache.upgrade().map(|cache| cache.stats_for(&self.key)).unwrap_or_default()
    }

    /// Select blocks intersecting any envelope and coalesce adjacent ones
    pub fn plan(&self, envelopes: &[Rect<f64>]) -> QueryPlan {
        let mut plan = QueryPlan::default();
        let mut current: Option<PlannedRequest> = None;

        for (i, block) in self.index.iter().enumerate() {
            if block.feature_count == 0 || !envelopes.iter().any(|e| e.intersects(&block.bbox)) {
                continue;
            }
            plan.features += block.feature_count as u64;
            plan.bytes += block.length as u64;

            let start = self.data_offset + block.offset;
            let end = self.data_offset + block.end();
            if let Some(request) = current.as_mut() {
                if request.range.end == start && end - request.range.start <= MAX_REQUEST_BYTES {
                    request.range.end = end;
                    request.blocks.push(i);
                    continue;
                }
            }
            plan.requests.extend(current.take());
            current = Some(PlannedRequest { range: ByteRange::new(start, end), blocks: vec![i] });
        }
        plan.requests.extend(current);
        plan
    }

    /// Fetch an absolute range through the shared range cache.
    ///
    /// Short reads are treated as transport errors and are not cached.
    pub async fn fetch_range(&self, range: ByteRange) -> Result<Bytes> {
        let cache = self.cache.upgrade();
        if let Some(bytes) = cache.as_ref().and_then(|c| c.lookup_range(&self.key, range)) {
            return Ok(bytes);
        }

        let fetched = self.fetcher.fetch_range(&self.key, range).await.and_then(|bytes| {
            if (bytes.len() as u64) < range.len() {
                Err(SourceError::io(
                    &self.key,
                    format!("short read: {} of {} bytes for {}", bytes.len(), range.len(), range),
                ))
            } else {
                Ok(bytes)
            }
        });

        match fetched {
            Ok(bytes) => {
                if let Some(cache) = &cache {
                    cache.insert_range(&self.key, range, bytes.clone());
                }
                Ok(bytes)
            }
            Err(e) => {
                tracing::warn!(dataset = %self.key, %range, error = %e, "range fetch failed");
                if let Some(cache) = &cache {
                    cache.record_error(&self.key);
                }
                Err(e)
            }
        }
    }

    /// Stream features matching the query.
    ///
    /// Nothing is fetched until the stream is polled. Each call plans afresh,
    /// so a stream can be restarted by calling this again.
    pub fn features(self: &Arc<Self>, query: Query) -> BoxStream<'static, Result<DatasetFeature>> {
        let plan = self.plan(&query.envelopes);
        let source = Arc::clone(self);
        let query = Arc::new(query);

        stream::iter(plan.requests)
            .then(move |request| {
                let source = Arc::clone(&source);
                async move {
                    let base = source.relative_offset(&request);
                    let data = source.fetch_range(request.range).await;
                    (base, data)
                }
            })
            .flat_map(move |(base, data)| stream::iter(RequestFeatures::new(data, base, Arc::clone(&query))))
            .boxed()
    }

    fn relative_offset(&self, request: &PlannedRequest) -> u64 {
        request.range.start - self.data_offset
    }
}

async fn ensure_len(
    fetcher: &dyn RangeFetcher,
    key: &str,
    head: Bytes,
    needed: usize,
    what: &str,
) -> Result<Bytes> {
    if head.len() >= needed {
        return Ok(head);
    }
    let head = fetcher.fetch_range(key, ByteRange::new(0, needed as u64)).await?;
    if head.len() < needed {
        return Err(SourceError::format(key, format!("truncated {}", what)));
    }
    Ok(head)
}

/// Records of one fetched request, screened by bbox before decoding
struct RequestFeatures {
    records: Option<RecordChunks>,
    error: Option<SourceError>,
    query: Arc<Query>,
}

impl RequestFeatures {
    fn new(data: Result<Bytes>, base: u64, query: Arc<Query>) -> Self {
        match data {
            Ok(bytes) => Self { records: Some(RecordChunks::new(bytes, base)), error: None, query },
            Err(e) => Self { records: None, error: Some(e), query },
        }
    }
}

impl Iterator for RequestFeatures {
    type Item = Result<DatasetFeature>;

    fn next(&mut self) -> Option<Self::Item> {
        if let Some(e) = self.error.take() {
            return Some(Err(e));
        }
        loop {
            let (offset, body) = match self.records.as_mut()?.next()? {
                Ok(record) => record,
                Err(e) => return Some(Err(e)),
            };
            match record_bbox(&body) {
                Ok(bbox) if !self.query.matches_bbox(&bbox) => continue,
                Ok(_) => {}
                Err(reason) => return Some(Err(SourceError::Decode { offset, reason })),
            }
            match decode_record(offset, &body) {
                Ok(feature) if self.query.matches_properties(&feature.properties) => {
                    return Some(Ok(feature))
                }
                Ok(_) => continue,
                Err(e) => return Some(Err(e)),
            }
        }
    }
}

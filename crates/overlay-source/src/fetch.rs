//! Byte-range fetchers.

use crate::error::{Result, SourceError};
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::HashMap;
use std::fmt;
use std::io::SeekFrom;
use std::path::PathBuf;
use std::sync::{Arc, RwLock};
use tokio::io::{AsyncReadExt, AsyncSeekExt};

/// Half-open byte range `[start, end)`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ByteRange {
    pub start: u64,
    pub end: u64,
}

impl ByteRange {
    pub fn new(start: u64, end: u64) -> Self {
        Self { start, end }
    }

    pub fn len(&self) -> u64 {
        self.end.saturating_sub(self.start)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Value for an HTTP `Range` header (inclusive end)
    pub fn http_header(&self) -> String {
        format!("bytes={}-{}", self.start, self.end.saturating_sub(1))
    }
}

impl fmt::Display for ByteRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}..{}", self.start, self.end)
    }
}

/// Port for reading byte ranges of a dataset.
///
/// A range extending past the end of the dataset returns the bytes that
/// exist; a range starting past the end returns an empty buffer.
#[async_trait]
pub trait RangeFetcher: Send + Sync {
    async fn fetch_range(&self, key: &str, range: ByteRange) -> Result<Bytes>;
}

/// Fetch ranges over HTTP with `Range` requests
#[derive(Debug, Clone, Default)]
pub struct HttpRangeFetcher {
    client: reqwest::Client,
}

impl HttpRangeFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl RangeFetcher for HttpRangeFetcher {
    async fn fetch_range(&self, key: &str, range: ByteRange) -> Result<Bytes> {
        if range.is_empty() {
            return Ok(Bytes::new());
        }

        let response = self
            .client
            .get(key)
            .header(reqwest::header::RANGE, range.http_header())
            .send()
            .await
            .map_err(|e| SourceError::io(key, e))?;

        let status = response.status();
        if status == reqwest::StatusCode::RANGE_NOT_SATISFIABLE {
            return Ok(Bytes::new());
        }
        if !status.is_success() {
            return Err(SourceError::io(key, format!("HTTP {} for range {}", status, range)));
        }
        let partial = status == reqwest::StatusCode::PARTIAL_CONTENT;

        let body = response.bytes().await.map_err(|e| SourceError::io(key, e))?;

        if partial {
            Ok(body)
        } else {
            // Server ignored the Range header and sent the whole file
            tracing::debug!(%key, "range request answered with full body");
            Ok(slice_range(&body, range))
        }
    }
}

fn slice_range(data: &Bytes, range: ByteRange) -> Bytes {
    let len = data.len() as u64;
    let start = range.start.min(len) as usize;
    let end = range.end.min(len) as usize;
    data.slice(start..end)
}

/// Fetch ranges from local files. Keys are paths, optionally relative to a root.
#[derive(Debug, Clone, Default)]
pub struct FileRangeFetcher {
    root: Option<PathBuf>,
}

impl FileRangeFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        Self { root: Some(root.into()) }
    }

    fn resolve(&self, key: &str) -> PathBuf {
        let path = key.strip_prefix("file://").unwrap_or(key);
        match &self.root {
            Some(root) => root.join(path),
            None => PathBuf::from(path),
        }
    }
}

#[async_trait]
impl RangeFetcher for FileRangeFetcher {
    async fn fetch_range(&self, key: &str, range: ByteRange) -> Result<Bytes> {
        let path = self.resolve(key);
        let mut file = tokio::fs::File::open(&path).await.map_err(|e| SourceError::io(key, e))?;
        file.seek(SeekFrom::Start(range.start)).await.map_err(|e| SourceError::io(key, e))?;

        let mut buf = Vec::with_capacity(range.len().min(16 * 1024 * 1024) as usize);
        file.take(range.len()).read_to_end(&mut buf).await.map_err(|e| SourceError::io(key, e))?;
        Ok(Bytes::from(buf))
    }
}

/// In-memory datasets, for tests and tooling.
///
/// Uses `RwLock::unwrap()`: a poisoned lock means another thread panicked
/// while inserting a dataset, which is unrecoverable for a test fixture.
#[derive(Debug, Clone, Default)]
pub struct MemoryRangeFetcher {
    datasets: Arc<RwLock<HashMap<String, Bytes>>>,
}

impl MemoryRangeFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, key: impl Into<String>, data: impl Into<Bytes>) {
        self.datasets.write().unwrap().insert(key.into(), data.into());
    }
}

#[async_trait]
impl RangeFetcher for MemoryRangeFetcher {
    async fn fetch_range(&self, key: &str, range: ByteRange) -> Result<Bytes> {
        let datasets = self.datasets.read().unwrap();
        let data = datasets.get(key).ok_or_else(|| SourceError::io(key, "dataset not found"))?;
        Ok(slice_range(data, range))
    }
}

/// Routes `http(s)://` keys to HTTP and everything else to the filesystem
#[derive(Debug, Clone, Default)]
pub struct DefaultRangeFetcher {
    http: HttpRangeFetcher,
    file: FileRangeFetcher,
}

impl DefaultRangeFetcher {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RangeFetcher for DefaultRangeFetcher {
    async fn fetch_range(&self, key: &str, range: ByteRange) -> Result<Bytes> {
        if key.starts_with("http://") || key.starts_with("https://") {
            self.http.fetch_range(key, range).await
        } else {
            self.file.fetch_range(key, range).await
        }
    }
}

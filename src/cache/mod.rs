// Copyright (c) 2025 Fabstir
// SPDX-License-Identifier: BUSL-1.1
//! Local result cache for finished artifacts. Keys are derived from the
//! remote URL; a cached copy is only trusted when it exists and exceeds a
//! minimum-sanity size, which rules out truncated downloads.

use async_trait::async_trait;
use bytes::Bytes;
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use url::Url;

/// Anything smaller is treated as a truncated download.
pub const MIN_ARTIFACT_BYTES: u64 = 1000;

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("invalid artifact URL '{0}'")]
    InvalidUrl(String),
    #[error("artifact download failed: {0}")]
    Download(String),
    /// The downloaded file failed verification; the partial copy was
    /// deleted and the fetch can be retried.
    #[error("downloaded artifact is corrupted ({size} bytes)")]
    Corrupted { size: u64 },
    #[error("cache I/O error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone, Default)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub downloads: u64,
}

/// Transport seam so tests can count downloads without a network.
#[async_trait]
pub trait ArtifactFetcher: Send + Sync {
    async fn fetch(&self, url: &str) -> Result<Bytes, CacheError>;
}

pub struct HttpFetcher {
    http: reqwest::Client,
}

impl HttpFetcher {
    pub fn new() -> Self {
        Self {
            http: reqwest::Client::new(),
        }
    }
}

impl Default for HttpFetcher {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ArtifactFetcher for HttpFetcher {
    async fn fetch(&self, url: &str) -> Result<Bytes, CacheError> {
        let response = self
            .http
            .get(url)
            .send()
            .await
            .map_err(|e| CacheError::Download(e.to_string()))?;
        if !response.status().is_success() {
            return Err(CacheError::Download(format!(
                "HTTP {} for {url}",
                response.status()
            )));
        }
        response
            .bytes()
            .await
            .map_err(|e| CacheError::Download(e.to_string()))
    }
}

pub struct ArtifactCache {
    root: PathBuf,
    fetcher: Arc<dyn ArtifactFetcher>,
    min_bytes: u64,
    stats: Mutex<CacheStats>,
}

impl ArtifactCache {
    pub fn new(root: impl Into<PathBuf>, fetcher: Arc<dyn ArtifactFetcher>) -> Self {
        Self {
            root: root.into(),
            fetcher,
            min_bytes: MIN_ARTIFACT_BYTES,
            stats: Mutex::new(CacheStats::default()),
        }
    }

    pub fn with_min_bytes(mut self, min_bytes: u64) -> Self {
        self.min_bytes = min_bytes;
        self
    }

    /// Return the local path for `remote_url`, downloading only when no
    /// verified copy exists.
    pub async fn get_or_fetch(&self, remote_url: &str) -> Result<PathBuf, CacheError> {
        let path = self.local_path(remote_url)?;

        if self.verify(&path).await {
            debug!(url = remote_url, "artifact cache hit");
            self.stats.lock().await.hits += 1;
            return Ok(path);
        }
        self.stats.lock().await.misses += 1;

        tokio::fs::create_dir_all(&self.root).await?;
        let partial = path.with_extension("part");
        let bytes = self.fetcher.fetch(remote_url).await?;
        self.stats.lock().await.downloads += 1;
        tokio::fs::write(&partial, &bytes).await?;

        let size = tokio::fs::metadata(&partial).await?.len();
        if size < self.min_bytes {
            warn!(url = remote_url, size, "downloaded artifact failed verification");
            let _ = tokio::fs::remove_file(&partial).await;
            return Err(CacheError::Corrupted { size });
        }

        tokio::fs::rename(&partial, &path).await?;
        info!(url = remote_url, size, path = %path.display(), "artifact cached");
        Ok(path)
    }

    pub async fn stats(&self) -> CacheStats {
        self.stats.lock().await.clone()
    }

    /// Cache key: digest of the full URL plus the original extension, so
    /// distinct URLs never collide and the file type stays recognizable.
    fn local_path(&self, remote_url: &str) -> Result<PathBuf, CacheError> {
        let parsed =
            Url::parse(remote_url).map_err(|_| CacheError::InvalidUrl(remote_url.to_string()))?;
        let ext = Path::new(parsed.path())
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or("bin")
            .to_string();
        let mut hasher = Sha256::new();
        hasher.update(remote_url.as_bytes());
        let key = hex::encode(hasher.finalize());
        Ok(self.root.join(format!("{key}.{ext}")))
    }

    async fn verify(&self, path: &Path) -> bool {
        match tokio::fs::metadata(path).await {
            Ok(meta) => meta.len() >= self.min_bytes,
            Err(_) => false,
        }
    }
}

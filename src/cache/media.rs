//! Download-once media cache
//!
//! `MediaCache` maps remote media URLs to flat local files and materializes
//! them on demand. Concurrent `ensure` calls for the same file share one
//! download; every waiter sees the same outcome. Successful downloads are
//! remembered in an in-memory index so repeat lookups skip the filesystem.
//! Failures are never remembered: the next `ensure` starts a fresh download.

use super::entry::{filename_for, CacheEntry, CacheState, LocalHandle, MediaKind};
use super::storage::LocalStorage;
use crate::config::MediaConfig;
use crate::error::{MediaDownloadError, Result};
use crate::remote::BlobSource;
use futures::future::{BoxFuture, FutureExt, Shared};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, RwLock};
use tokio::sync::Semaphore;

type DownloadOutcome = std::result::Result<LocalHandle, MediaDownloadError>;
type SharedDownload = Shared<BoxFuture<'static, DownloadOutcome>>;

/// Content-addressed local cache for images and audio
#[derive(Clone)]
pub struct MediaCache {
    inner: Arc<CacheInner>,
}

struct CacheInner {
    storage: Arc<dyn LocalStorage>,
    source: Arc<dyn BlobSource>,
    /// Filenames known to be present on disk
    present: RwLock<HashSet<String>>,
    /// Downloads currently running, keyed by filename
    in_flight: Mutex<HashMap<String, SharedDownload>>,
    permits: Arc<Semaphore>,
}

impl MediaCache {
    /// Create a cache over `storage`, fetching misses from `source` with at
    /// most `max_concurrent` downloads running at once.
    pub fn new(
        storage: Arc<dyn LocalStorage>,
        source: Arc<dyn BlobSource>,
        max_concurrent: usize,
    ) -> Self {
        Self {
            inner: Arc::new(CacheInner {
                storage,
                source,
                present: RwLock::new(HashSet::new()),
                in_flight: Mutex::new(HashMap::new()),
                permits: Arc::new(Semaphore::new(max_concurrent.max(1))),
            }),
        }
    }

    pub fn from_config(
        config: &MediaConfig,
        storage: Arc<dyn LocalStorage>,
        source: Arc<dyn BlobSource>,
    ) -> Self {
        Self::new(storage, source, config.max_concurrent_downloads)
    }

    /// Whether a materialized copy of `filename` exists locally
    pub async fn has(&self, filename: &str) -> bool {
        self.get(filename).await.is_some()
    }

    /// Local handle for `filename`, or `None` on a cache miss
    pub async fn get(&self, filename: &str) -> Option<LocalHandle> {
        if self.inner.is_indexed(filename) {
            return self.inner.handle(filename).ok();
        }
        if self.inner.storage.exists(filename).await {
            self.inner.mark_present(filename);
            return self.inner.handle(filename).ok();
        }
        None
    }

    /// Make sure the blob behind `url` is available locally.
    ///
    /// Returns immediately when the file is already present. Otherwise joins
    /// the running download for the same file or starts a new one.
    pub async fn ensure(&self, url: &str, kind: MediaKind) -> Result<LocalHandle> {
        let filename = filename_for(url, kind)?;
        if let Some(handle) = self.get(&filename).await {
            return Ok(handle);
        }
        let download = self.join_or_start(url, &filename);
        Ok(download.await?)
    }

    /// Current state of the cache entry for `url`
    pub async fn entry(&self, url: &str, kind: MediaKind) -> Result<CacheEntry> {
        let filename = filename_for(url, kind)?;
        let state = if self.has(&filename).await {
            CacheState::Present
        } else if self.inner.lock_in_flight().contains_key(&filename) {
            CacheState::Downloading
        } else {
            CacheState::Absent
        };
        Ok(CacheEntry {
            url: url.to_string(),
            filename,
            state,
        })
    }

    /// Read the bytes of a cached file
    pub async fn read(&self, filename: &str) -> Result<Vec<u8>> {
        self.inner.storage.read(filename).await
    }

    /// Names of every file currently in the cache directory
    pub async fn list(&self) -> Result<Vec<String>> {
        self.inner.storage.list().await
    }

    /// Forget the in-memory index. Files stay on disk and are picked up
    /// again by the next lookup.
    pub fn clear_index(&self) {
        let mut present = self
            .inner
            .present
            .write()
            .unwrap_or_else(|e| e.into_inner());
        let count = present.len();
        present.clear();
        tracing::debug!(entries = count, "Cleared media cache index");
    }

    /// Number of filenames in the in-memory index
    pub fn indexed_len(&self) -> usize {
        self.inner
            .present
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }

    fn join_or_start(&self, url: &str, filename: &str) -> SharedDownload {
        let mut in_flight = self.inner.lock_in_flight();

        // A download may have finished between the lookup and taking the lock
        if self.inner.is_indexed(filename) {
            let outcome = self
                .inner
                .handle(filename)
                .map_err(|e| MediaDownloadError::new(url, e.to_string()));
            return futures::future::ready(outcome).boxed().shared();
        }

        if let Some(existing) = in_flight.get(filename) {
            tracing::debug!(url, filename, "Joining in-flight download");
            return existing.clone();
        }

        let inner = Arc::clone(&self.inner);
        let task_url = url.to_string();
        let task_filename = filename.to_string();
        let task = tokio::spawn(async move {
            let outcome = inner.download(&task_url, &task_filename).await;
            match &outcome {
                Ok(_) => inner.mark_present(&task_filename),
                Err(e) => tracing::warn!(
                    url = %task_url,
                    filename = %task_filename,
                    error = %e.reason,
                    "Media download failed"
                ),
            }
            inner.lock_in_flight().remove(&task_filename);
            outcome
        });

        let join_url = url.to_string();
        let download = async move {
            match task.await {
                Ok(outcome) => outcome,
                Err(e) => Err(MediaDownloadError::new(
                    join_url,
                    format!("download task aborted: {}", e),
                )),
            }
        }
        .boxed()
        .shared();

        in_flight.insert(filename.to_string(), download.clone());
        download
    }
}

impl CacheInner {
    fn is_indexed(&self, filename: &str) -> bool {
        self.present
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .contains(filename)
    }

    fn mark_present(&self, filename: &str) {
        self.present
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(filename.to_string());
    }

    fn lock_in_flight(&self) -> std::sync::MutexGuard<'_, HashMap<String, SharedDownload>> {
        self.in_flight.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn handle(&self, filename: &str) -> Result<LocalHandle> {
        Ok(LocalHandle {
            filename: filename.to_string(),
            path: self.storage.path_for(filename)?,
        })
    }

    async fn download(&self, url: &str, filename: &str) -> DownloadOutcome {
        let fail = |reason: String| MediaDownloadError::new(url, reason);

        let _permit = self
            .permits
            .acquire()
            .await
            .map_err(|e| fail(e.to_string()))?;

        tracing::debug!(url, filename, "Downloading media");
        let stream = self
            .source
            .resolve_media_blob(url)
            .await
            .map_err(|e| fail(e.to_string()))?;
        let bytes = self
            .storage
            .install(filename, stream)
            .await
            .map_err(|e| fail(e.to_string()))?;

        tracing::info!(url, filename, bytes, "Cached media");
        self.handle(filename).map_err(|e| fail(e.to_string()))
    }
}

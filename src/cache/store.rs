//! Disk-backed cache store.
//!
//! Entries live directly under the cache root, one file per [`CacheKey`].
//! Writes go to a uniquely named temp file first and are renamed onto the
//! canonical path once complete, so readers only ever observe no file, the
//! previous complete entry, or the new complete entry.
//!
//! The entry's etag is not stored; it is derived from the file's
//! modification time as `mt_<epoch millis>`.

use std::io::{self, ErrorKind};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use futures::{StreamExt, stream::BoxStream};
use metrics::counter;
use thiserror::Error;
use tokio::{fs, io::AsyncWriteExt, task::JoinHandle};
use tracing::{debug, warn};

use super::keys::{CacheKey, TEMP_PREFIX};

const SOURCE: &str = "imagecache::cache::store";
const ETAG_PREFIX: &str = "mt_";

pub(crate) const METRIC_CACHE_HIT: &str = "imagecache_cache_hit_total";
pub(crate) const METRIC_CACHE_NOT_MODIFIED: &str = "imagecache_cache_not_modified_total";
pub(crate) const METRIC_CACHE_MISS: &str = "imagecache_cache_miss_total";
pub(crate) const METRIC_CACHE_WRITE: &str = "imagecache_cache_write_total";
pub(crate) const METRIC_CACHE_WRITE_FAILED: &str = "imagecache_cache_write_failed_total";

/// Result of a cache lookup.
#[derive(Debug)]
pub enum CacheLookup {
    Miss,
    /// The client's etag matches the entry; no payload is opened.
    NotModified { etag: String },
    Hit {
        etag: String,
        file: fs::File,
        len: u64,
    },
}

/// Data handed to the store for persisting.
pub enum CachePayload {
    Bytes(Bytes),
    /// Chunks are written as they arrive; an `Err` item aborts the write and
    /// leaves any previous entry untouched.
    Stream(BoxStream<'static, Result<Bytes, io::Error>>),
}

impl From<Bytes> for CachePayload {
    fn from(bytes: Bytes) -> Self {
        CachePayload::Bytes(bytes)
    }
}

#[derive(Debug, Error)]
pub enum CacheWriteError {
    #[error("failed to create temp file in `{}`", dir.display())]
    CreateTemp {
        dir: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to write cache temp file")]
    Write(#[source] io::Error),
    #[error("payload stream failed before completion")]
    Payload(#[source] io::Error),
    #[error("failed to move cache entry into `{}`", path.display())]
    Persist {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("cache write task failed: {0}")]
    Task(String),
}

/// Filesystem cache keyed by [`CacheKey`].
#[derive(Debug, Clone)]
pub struct DiskCacheStore {
    root: Arc<PathBuf>,
}

impl DiskCacheStore {
    /// Open a store rooted at `root`, creating the directory if necessary.
    pub fn new(root: PathBuf) -> Result<Self, io::Error> {
        std::fs::create_dir_all(&root)?;
        Ok(Self {
            root: Arc::new(root),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Canonical path of the entry for `key`.
    pub fn path_for(&self, key: &CacheKey) -> PathBuf {
        self.root.join(key.file_name())
    }

    /// Look up `key`, comparing the entry's etag with `client_etag`.
    ///
    /// Every filesystem failure is reported as a miss.
    pub async fn get(&self, key: &CacheKey, client_etag: &str) -> CacheLookup {
        let path = self.path_for(key);
        let lookup = match open_entry(&path).await {
            Ok(Some((file, etag, len))) => {
                if etag_matches(client_etag, &etag) {
                    CacheLookup::NotModified { etag }
                } else {
                    CacheLookup::Hit { etag, file, len }
                }
            }
            Ok(None) => CacheLookup::Miss,
            Err(err) => {
                debug!(
                    target = SOURCE,
                    key = %key,
                    path = %path.display(),
                    error = %err,
                    "cache entry unreadable; treating as miss"
                );
                CacheLookup::Miss
            }
        };

        match &lookup {
            CacheLookup::Miss => counter!(METRIC_CACHE_MISS).increment(1),
            CacheLookup::NotModified { .. } => counter!(METRIC_CACHE_NOT_MODIFIED).increment(1),
            CacheLookup::Hit { .. } => counter!(METRIC_CACHE_HIT).increment(1),
        }

        lookup
    }

    /// Current etag of the entry for `key`, if one exists.
    pub async fn etag(&self, key: &CacheKey) -> Option<String> {
        let metadata = fs::metadata(self.path_for(key)).await.ok()?;
        if !metadata.is_file() {
            return None;
        }
        etag_for(metadata.modified().ok()?)
    }

    /// Persist `payload` in the background. Failures are logged and dropped.
    ///
    /// The returned handle only matters to callers that need to observe
    /// completion (tests); request paths ignore it.
    pub fn put(&self, key: CacheKey, payload: CachePayload) -> JoinHandle<()> {
        let store = self.clone();
        tokio::spawn(async move {
            store.populate(&key, payload).await;
        })
    }

    /// Persist `payload` and wait for the rename, logging instead of failing.
    /// Returns whether the entry was written.
    pub async fn populate(&self, key: &CacheKey, payload: CachePayload) -> bool {
        match self.write(key, payload).await {
            Ok(bytes) => {
                counter!(METRIC_CACHE_WRITE).increment(1);
                debug!(target = SOURCE, key = %key, bytes, "cache entry written");
                true
            }
            Err(err) => {
                counter!(METRIC_CACHE_WRITE_FAILED).increment(1);
                warn!(
                    target = SOURCE,
                    key = %key,
                    error = %err,
                    "failed to populate cache entry"
                );
                false
            }
        }
    }

    /// Write `payload` to a temp file and atomically move it into place.
    /// Returns the number of bytes written.
    pub async fn write(
        &self,
        key: &CacheKey,
        payload: CachePayload,
    ) -> Result<u64, CacheWriteError> {
        let root = Arc::clone(&self.root);
        let temp = tokio::task::spawn_blocking(move || {
            tempfile::Builder::new()
                .prefix(TEMP_PREFIX)
                .tempfile_in(root.as_path())
                .map_err(|source| CacheWriteError::CreateTemp {
                    dir: root.to_path_buf(),
                    source,
                })
        })
        .await
        .map_err(|err| CacheWriteError::Task(err.to_string()))??;

        // Dropping `temp_path` on any early return removes the temp file.
        let (std_file, temp_path) = temp.into_parts();
        let mut file = fs::File::from_std(std_file);

        let written = match payload {
            CachePayload::Bytes(bytes) => {
                file.write_all(&bytes).await.map_err(CacheWriteError::Write)?;
                bytes.len() as u64
            }
            CachePayload::Stream(mut stream) => {
                let mut total = 0u64;
                while let Some(chunk) = stream.next().await {
                    let chunk = chunk.map_err(CacheWriteError::Payload)?;
                    file.write_all(&chunk).await.map_err(CacheWriteError::Write)?;
                    total += chunk.len() as u64;
                }
                total
            }
        };
        file.flush().await.map_err(CacheWriteError::Write)?;
        let std_file = file.into_std().await;

        let target = self.path_for(key);
        tokio::task::spawn_blocking(move || {
            advance_mtime(&std_file, &target).map_err(CacheWriteError::Write)?;
            drop(std_file);
            temp_path
                .persist(&target)
                .map_err(|err| CacheWriteError::Persist {
                    path: target,
                    source: err.error,
                })
        })
        .await
        .map_err(|err| CacheWriteError::Task(err.to_string()))??;

        Ok(written)
    }
}

async fn open_entry(path: &Path) -> Result<Option<(fs::File, String, u64)>, io::Error> {
    let file = match fs::File::open(path).await {
        Ok(file) => file,
        Err(err) if err.kind() == ErrorKind::NotFound => return Ok(None),
        Err(err) => return Err(err),
    };

    // Stat the open handle so the etag always describes the bytes we serve.
    let metadata = file.metadata().await?;
    if !metadata.is_file() {
        return Ok(None);
    }

    let etag = etag_for(metadata.modified()?)
        .ok_or_else(|| io::Error::other("modification time precedes the unix epoch"))?;
    Ok(Some((file, etag, metadata.len())))
}

fn epoch_millis(time: SystemTime) -> Option<u128> {
    time.duration_since(UNIX_EPOCH)
        .ok()
        .map(|elapsed| elapsed.as_millis())
}

fn etag_for(modified: SystemTime) -> Option<String> {
    epoch_millis(modified).map(|millis| format!("{ETAG_PREFIX}{millis}"))
}

/// Compare a client-supplied `If-None-Match` value with an entry etag.
/// Accepts the bare token as well as quoted and weak (`W/`) forms.
fn etag_matches(client_etag: &str, etag: &str) -> bool {
    let candidate = client_etag.trim();
    let candidate = candidate.strip_prefix("W/").unwrap_or(candidate);
    let candidate = candidate
        .strip_prefix('"')
        .and_then(|inner| inner.strip_suffix('"'))
        .unwrap_or(candidate);
    !candidate.is_empty() && candidate == etag
}

/// Make sure the replacement's mtime is strictly newer (at millisecond
/// resolution) than the entry it replaces, so its etag always changes.
fn advance_mtime(file: &std::fs::File, target: &Path) -> io::Result<()> {
    let previous = match std::fs::metadata(target) {
        Ok(metadata) => metadata.modified()?,
        Err(err) if err.kind() == ErrorKind::NotFound => return Ok(()),
        Err(err) => return Err(err),
    };
    let current = file.metadata()?.modified()?;

    let (Some(previous_ms), Some(current_ms)) = (epoch_millis(previous), epoch_millis(current))
    else {
        return Ok(());
    };

    if current_ms <= previous_ms {
        let bumped = u64::try_from(previous_ms + 1).map_err(io::Error::other)?;
        file.set_modified(UNIX_EPOCH + Duration::from_millis(bumped))?;
    }
    Ok(())
}

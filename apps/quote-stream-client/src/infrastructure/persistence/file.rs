//! JSON file cache.
//!
//! Callers only touch the in-memory map. A [`CacheWriter`] task rewrites the
//! whole file in the background through a sibling temp file and a rename, so
//! a crash never leaves a half-written cache behind. Bursts of changes
//! coalesce into one write.

use std::collections::HashMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

use crate::application::ports::{CacheError, CachedQuote, QuoteCache};

/// Cache stored as one JSON object keyed by canonical instrument key.
#[derive(Debug)]
pub struct FileQuoteCache {
    inner: Arc<Inner>,
    dirty: mpsc::Sender<()>,
}

/// Background task that makes cache changes durable.
///
/// Exits once every [`FileQuoteCache`] handle is dropped.
#[derive(Debug)]
pub struct CacheWriter {
    inner: Arc<Inner>,
    dirty: mpsc::Receiver<()>,
}

#[derive(Debug)]
struct Inner {
    path: PathBuf,
    entries: Mutex<HashMap<String, CachedQuote>>,
    // Serializes file rewrites between the writer task and `flush`.
    write_lock: tokio::sync::Mutex<()>,
}

impl FileQuoteCache {
    /// Open the cache at `path` and return it with its writer task.
    ///
    /// A missing file starts empty. An unreadable or corrupt file is
    /// logged and replaced on the next write. Nothing reaches disk until
    /// [`CacheWriter::run`] is spawned or [`flush`](Self::flush) is awaited.
    #[must_use]
    pub fn open(path: impl Into<PathBuf>) -> (Self, CacheWriter) {
        let path = path.into();
        let entries = match read_entries(&path) {
            Ok(entries) => entries,
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "Ignoring unreadable quote cache");
                HashMap::new()
            }
        };
        tracing::debug!(path = %path.display(), entries = entries.len(), "Opened quote cache");

        let inner = Arc::new(Inner {
            path,
            entries: Mutex::new(entries),
            write_lock: tokio::sync::Mutex::new(()),
        });
        let (tx, rx) = mpsc::channel(1);
        (
            Self {
                inner: Arc::clone(&inner),
                dirty: tx,
            },
            CacheWriter { inner, dirty: rx },
        )
    }

    /// Backing file location.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.inner.path
    }

    /// Write the current contents now.
    ///
    /// # Errors
    ///
    /// Returns `CacheError` if the file cannot be written.
    pub async fn flush(&self) -> Result<(), CacheError> {
        self.inner.persist().await
    }

    fn mark_dirty(&self) -> Result<(), CacheError> {
        match self.dirty.try_send(()) {
            // A full slot already guarantees a pending rewrite.
            Ok(()) | Err(TrySendError::Full(())) => Ok(()),
            Err(TrySendError::Closed(())) => Err(CacheError::WriterStopped),
        }
    }
}

impl QuoteCache for FileQuoteCache {
    fn load_all(&self) -> Result<HashMap<String, CachedQuote>, CacheError> {
        Ok(self.inner.entries.lock().clone())
    }

    fn put_many(&self, entries: Vec<(String, CachedQuote)>) -> Result<(), CacheError> {
        if entries.is_empty() {
            return Ok(());
        }
        self.inner.entries.lock().extend(entries);
        self.mark_dirty()
    }

    fn remove(&self, key: &str) -> Result<(), CacheError> {
        if self.inner.entries.lock().remove(key).is_none() {
            return Ok(());
        }
        self.mark_dirty()
    }
}

impl CacheWriter {
    /// Rewrite the file after each batch of changes until the cache is dropped.
    pub async fn run(mut self) {
        tracing::debug!(path = %self.inner.path.display(), "Quote cache writer started");
        while self.dirty.recv().await.is_some() {
            if let Err(e) = self.inner.persist().await {
                crate::infrastructure::metrics::record_cache_write_error();
                tracing::warn!(path = %self.inner.path.display(), error = %e, "Failed to write quote cache");
            }
        }
        tracing::debug!("Quote cache writer stopped");
    }
}

impl Inner {
    async fn persist(&self) -> Result<(), CacheError> {
        let _guard = self.write_lock.lock().await;
        let bytes = {
            let entries = self.entries.lock();
            serde_json::to_vec(&*entries)?
        };
        let path = self.path.clone();
        tokio::task::spawn_blocking(move || atomic_write(&path, &bytes))
            .await
            .map_err(|e| CacheError::Io(std::io::Error::other(e)))??;
        Ok(())
    }
}

fn read_entries(path: &Path) -> Result<HashMap<String, CachedQuote>, CacheError> {
    match fs::read(path) {
        Ok(bytes) if bytes.is_empty() => Ok(HashMap::new()),
        Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(HashMap::new()),
        Err(e) => Err(e.into()),
    }
}

fn atomic_write(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let file_name = path
        .file_name()
        .map_or_else(|| "quote-cache".into(), |n| n.to_string_lossy());
    let tmp = path.with_file_name(format!(".{file_name}.tmp"));

    {
        let mut file = fs::File::create(&tmp)?;
        file.write_all(bytes)?;
        file.sync_all()?;
    }

    fs::rename(&tmp, path)
}

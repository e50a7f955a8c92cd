//! Key/value entry stores the cache is layered on.
//!
//! An entry is addressed by a string key and holds two independent byte
//! streams. Stream 0 carries the serialized header record and stream 1 the
//! response body.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use thiserror::Error;

pub mod disk;
pub mod memory;

pub use disk::DiskBackend;
pub use memory::MemoryBackend;

/// Default capacity of a single origin's backing store.
pub const DEFAULT_MAX_BYTES: u64 = 512 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamIndex {
    Metadata = 0,
    Body = 1,
}

impl StreamIndex {
    pub(crate) fn slot(self) -> usize {
        self as usize
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    Memory,
    Disk,
}

#[derive(Debug, Error)]
pub enum BackendError {
    #[error("entry not found")]
    NotFound,
    #[error("entry is being created by another writer")]
    Conflict,
    #[error("entry has been doomed")]
    Doomed,
    #[error("offset {offset} is past the end of a {size} byte stream")]
    InvalidOffset { offset: u64, size: u64 },
    #[error("write would exceed the store capacity of {0} bytes")]
    CapacityExceeded(u64),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type BackendResult<T> = std::result::Result<T, BackendError>;

/// Handle to one open entry.
///
/// A handle returned by [`Backend::create_entry`] owns the entry's creation:
/// until [`Entry::commit`] is called, another create for the same key reports
/// [`BackendError::Conflict`], and dropping the handle uncommitted dooms it.
#[async_trait]
pub trait Entry: Send + Sync {
    fn key(&self) -> &str;

    fn size(&self, stream: StreamIndex) -> u64;

    /// Bytes of the committed entry this creation displaced. Zero for handles
    /// from [`Backend::open_entry`].
    fn replaced_size(&self) -> u64;

    /// Reads up to `buf.len()` bytes at `offset`. Returns 0 at end of stream.
    async fn read(&self, stream: StreamIndex, offset: u64, buf: &mut [u8]) -> BackendResult<usize>;

    /// Writes `data` at `offset`. With `truncate` the stream ends after the
    /// written bytes.
    async fn write(
        &self,
        stream: StreamIndex,
        offset: u64,
        data: &[u8],
        truncate: bool,
    ) -> BackendResult<usize>;

    async fn commit(&self) -> BackendResult<()>;

    /// Removes the entry from the store. Open handles keep working on their
    /// own view until dropped, but the key no longer resolves to it.
    async fn doom(&self);
}

#[async_trait]
pub trait EntryIterator: Send {
    /// Opens the next entry, or `None` once every entry has been visited.
    async fn open_next(&mut self) -> BackendResult<Option<Box<dyn Entry>>>;
}

#[async_trait]
pub trait Backend: Send + Sync {
    fn kind(&self) -> BackendKind;

    async fn open_entry(&self, key: &str) -> BackendResult<Box<dyn Entry>>;

    /// Creates an empty entry, replacing any committed entry under `key`.
    async fn create_entry(&self, key: &str) -> BackendResult<Box<dyn Entry>>;

    fn iter(&self) -> Box<dyn EntryIterator>;

    fn entry_count(&self) -> usize;
}

/// Produces the backend for a cache the first time it is needed.
#[async_trait]
pub trait BackendFactory: Send + Sync {
    async fn create(&self) -> Result<Arc<dyn Backend>>;
}

#[derive(Debug, Clone)]
pub enum BackendConfig {
    Memory { max_bytes: u64 },
    Disk { path: PathBuf, max_bytes: u64 },
}

#[async_trait]
impl BackendFactory for BackendConfig {
    async fn create(&self) -> Result<Arc<dyn Backend>> {
        match self {
            BackendConfig::Memory { max_bytes } => Ok(Arc::new(MemoryBackend::new(*max_bytes))),
            BackendConfig::Disk { path, max_bytes } => {
                let backend = DiskBackend::open(path.clone(), *max_bytes).await?;
                Ok(Arc::new(backend))
            }
        }
    }
}

/// Tracks bytes held by a store against its capacity.
#[derive(Debug)]
pub(crate) struct Capacity {
    used: parking_lot::Mutex<u64>,
    max_bytes: u64,
}

impl Capacity {
    pub(crate) fn new(max_bytes: u64) -> Self {
        Self {
            used: parking_lot::Mutex::new(0),
            max_bytes,
        }
    }

    /// Applies a size change, refusing growth past the limit.
    pub(crate) fn reserve(&self, old_size: u64, new_size: u64) -> BackendResult<()> {
        let mut used = self.used.lock();
        if new_size > old_size {
            let grown = used.saturating_add(new_size - old_size);
            if grown > self.max_bytes {
                return Err(BackendError::CapacityExceeded(self.max_bytes));
            }
            *used = grown;
        } else {
            *used = used.saturating_sub(old_size - new_size);
        }
        Ok(())
    }

    pub(crate) fn release(&self, bytes: u64) {
        let mut used = self.used.lock();
        *used = used.saturating_sub(bytes);
    }

    pub(crate) fn add(&self, bytes: u64) {
        let mut used = self.used.lock();
        *used = used.saturating_add(bytes);
    }

    pub(crate) fn used(&self) -> u64 {
        *self.used.lock()
    }
}

/// Checks a write against the current stream size and returns the resulting size.
pub(crate) fn size_after_write(
    current: u64,
    offset: u64,
    len: usize,
    truncate: bool,
) -> BackendResult<u64> {
    if offset > current {
        return Err(BackendError::InvalidOffset {
            offset,
            size: current,
        });
    }
    let end = offset + len as u64;
    Ok(if truncate { end } else { current.max(end) })
}

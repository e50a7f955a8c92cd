//! Entry store persisted under a directory.
//!
//! Each entry is a pair of stream files plus an index record written at
//! commit. Entries without an index record are discarded when the store is
//! reopened, so a crash mid-write never resurrects a partial entry.

use std::collections::BTreeMap;
use std::io::SeekFrom;
use std::ops::Bound;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::{Result, anyhow};
use async_trait::async_trait;
use blake3::Hasher;
use parking_lot::Mutex;
use tokio::fs as async_fs;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio::task;
use tracing::{debug, trace};

mod layout;
mod rebuild;

use layout::{EntryPaths, Layout, new_stem, prepare_versioned_dir, spawn_dir_cleanup};
use rebuild::{IndexRecord, RestoredEntry};

use super::{
    Backend, BackendError, BackendKind, BackendResult, Capacity, Entry, EntryIterator, StreamIndex,
    size_after_write,
};

#[derive(Debug, Clone)]
struct StreamState {
    size: u64,
    hasher: Option<Hasher>,
}

impl StreamState {
    fn empty() -> Self {
        Self {
            size: 0,
            hasher: Some(Hasher::new()),
        }
    }

    fn restored(size: u64) -> Self {
        // Hashes of restored streams are only tracked again after a rewrite.
        Self { size, hasher: None }
    }

    fn record_write(&mut self, offset: u64, data: &[u8], truncate: bool, new_size: u64) {
        if offset == self.size {
            if let Some(hasher) = self.hasher.as_mut() {
                hasher.update(data);
            }
        } else if offset == 0 && truncate {
            let mut hasher = Hasher::new();
            hasher.update(data);
            self.hasher = Some(hasher);
        } else {
            self.hasher = None;
        }
        self.size = new_size;
    }

    fn digest(&self) -> Option<String> {
        self.hasher
            .as_ref()
            .map(|hasher| hasher.finalize().to_hex().to_string())
    }
}

#[derive(Debug)]
struct EntryState {
    key: String,
    paths: EntryPaths,
    streams: Mutex<[StreamState; 2]>,
    write_lock: tokio::sync::Mutex<()>,
    creating: AtomicBool,
    doomed: AtomicBool,
}

impl EntryState {
    fn new(key: &str, paths: EntryPaths) -> Self {
        Self {
            key: key.to_string(),
            paths,
            streams: Mutex::new([StreamState::empty(), StreamState::empty()]),
            write_lock: tokio::sync::Mutex::new(()),
            creating: AtomicBool::new(true),
            doomed: AtomicBool::new(false),
        }
    }

    fn restored(entry: RestoredEntry, layout: &Layout) -> Self {
        let sizes = entry.record.sizes;
        Self {
            key: entry.record.key,
            paths: layout.paths(&entry.stem),
            streams: Mutex::new([StreamState::restored(sizes[0]), StreamState::restored(sizes[1])]),
            write_lock: tokio::sync::Mutex::new(()),
            creating: AtomicBool::new(false),
            doomed: AtomicBool::new(false),
        }
    }

    fn is_visible(&self) -> bool {
        !self.creating.load(Ordering::Acquire) && !self.doomed.load(Ordering::Acquire)
    }

    fn stream_size(&self, stream: StreamIndex) -> u64 {
        self.streams.lock()[stream.slot()].size
    }

    fn total_size(&self) -> u64 {
        let streams = self.streams.lock();
        streams[0].size + streams[1].size
    }
}

impl Drop for EntryState {
    fn drop(&mut self) {
        // Files of a doomed entry go away once the last handle is released.
        if *self.doomed.get_mut() {
            self.paths.remove_all();
        }
    }
}

#[derive(Debug)]
struct Shared {
    layout: Layout,
    entries: Mutex<BTreeMap<String, Arc<EntryState>>>,
    capacity: Capacity,
}

impl Shared {
    fn retire(&self, state: &EntryState) -> bool {
        if state.doomed.swap(true, Ordering::AcqRel) {
            return false;
        }
        self.capacity.release(state.total_size());
        true
    }

    fn doom(&self, state: &Arc<EntryState>) -> bool {
        if !self.retire(state) {
            return false;
        }
        let mut entries = self.entries.lock();
        if entries
            .get(&state.key)
            .is_some_and(|current| Arc::ptr_eq(current, state))
        {
            entries.remove(&state.key);
        }
        trace!(key = %state.key, "disk entry doomed");
        true
    }
}

/// Entry store rooted at a directory.
#[derive(Debug, Clone)]
pub struct DiskBackend {
    shared: Arc<Shared>,
}

impl DiskBackend {
    /// Opens (or creates) the store under `root`, restoring committed entries.
    pub async fn open(root: PathBuf, max_bytes: u64) -> Result<Self> {
        let (dir, cleanup) = prepare_versioned_dir(&root).await?;
        spawn_dir_cleanup(cleanup);

        let layout = Layout::new(dir);
        let restored = {
            let layout = layout.clone();
            task::spawn_blocking(move || rebuild::scan(&layout))
                .await
                .map_err(|err| anyhow!("store rebuild task failed: {err}"))??
        };

        let capacity = Capacity::new(max_bytes);
        let mut entries = BTreeMap::new();
        for entry in restored {
            let state = EntryState::restored(entry, &layout);
            capacity.add(state.total_size());
            entries.insert(state.key.clone(), Arc::new(state));
        }
        debug!(
            dir = %layout.dir().display(),
            entries = entries.len(),
            bytes = capacity.used(),
            "disk store opened"
        );

        Ok(Self {
            shared: Arc::new(Shared {
                layout,
                entries: Mutex::new(entries),
                capacity,
            }),
        })
    }

    pub fn bytes_in_use(&self) -> u64 {
        self.shared.capacity.used()
    }

    fn handle(
        &self,
        state: Arc<EntryState>,
        owns_creation: bool,
        replaced: u64,
    ) -> Box<dyn Entry> {
        Box::new(DiskEntry {
            state,
            shared: self.shared.clone(),
            owns_creation,
            replaced,
        })
    }
}

#[async_trait]
impl Backend for DiskBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Disk
    }

    async fn open_entry(&self, key: &str) -> BackendResult<Box<dyn Entry>> {
        let state = {
            let entries = self.shared.entries.lock();
            entries
                .get(key)
                .filter(|state| state.is_visible())
                .cloned()
        };
        match state {
            Some(state) => Ok(self.handle(state, false, 0)),
            None => Err(BackendError::NotFound),
        }
    }

    async fn create_entry(&self, key: &str) -> BackendResult<Box<dyn Entry>> {
        let paths = self.shared.layout.paths(&new_stem());
        async_fs::create_dir_all(&paths.shard).await?;

        let state = Arc::new(EntryState::new(key, paths));
        let mut replaced_size = 0;
        let replaced = {
            let mut entries = self.shared.entries.lock();
            if let Some(existing) = entries.get(key) {
                if existing.creating.load(Ordering::Acquire) {
                    return Err(BackendError::Conflict);
                }
                if self.shared.retire(existing) {
                    replaced_size = existing.total_size();
                }
            }
            entries.insert(key.to_string(), state.clone())
        };
        if let Some(replaced) = replaced {
            remove_index_record(&replaced.paths.index).await;
        }
        Ok(self.handle(state, true, replaced_size))
    }

    fn iter(&self) -> Box<dyn EntryIterator> {
        Box::new(DiskIterator {
            backend: self.clone(),
            cursor: None,
        })
    }

    fn entry_count(&self) -> usize {
        self.shared
            .entries
            .lock()
            .values()
            .filter(|state| state.is_visible())
            .count()
    }
}

struct DiskEntry {
    state: Arc<EntryState>,
    shared: Arc<Shared>,
    owns_creation: bool,
    replaced: u64,
}

#[async_trait]
impl Entry for DiskEntry {
    fn key(&self) -> &str {
        &self.state.key
    }

    fn replaced_size(&self) -> u64 {
        self.replaced
    }

    fn size(&self, stream: StreamIndex) -> u64 {
        self.state.stream_size(stream)
    }

    async fn read(&self, stream: StreamIndex, offset: u64, buf: &mut [u8]) -> BackendResult<usize> {
        let size = self.state.stream_size(stream);
        if offset >= size || buf.is_empty() {
            return Ok(0);
        }
        let len = buf.len().min(usize::try_from(size - offset).unwrap_or(usize::MAX));
        let mut file = async_fs::File::open(self.state.paths.stream(stream)).await?;
        file.seek(SeekFrom::Start(offset)).await?;
        let read = file.read(&mut buf[..len]).await?;
        Ok(read)
    }

    async fn write(
        &self,
        stream: StreamIndex,
        offset: u64,
        data: &[u8],
        truncate: bool,
    ) -> BackendResult<usize> {
        if self.state.doomed.load(Ordering::Acquire) {
            return Err(BackendError::Doomed);
        }
        let _guard = self.state.write_lock.lock().await;
        let old_size = self.state.stream_size(stream);
        let new_size = size_after_write(old_size, offset, data.len(), truncate)?;
        self.shared.capacity.reserve(old_size, new_size)?;

        let path = self.state.paths.stream(stream);
        if let Err(err) = write_stream_file(path, offset, data, truncate).await {
            // Shrinking back never fails.
            let _ = self.shared.capacity.reserve(new_size, old_size);
            return Err(err.into());
        }

        self.state.streams.lock()[stream.slot()].record_write(offset, data, truncate, new_size);
        Ok(data.len())
    }

    async fn commit(&self) -> BackendResult<()> {
        if self.state.doomed.load(Ordering::Acquire) {
            return Err(BackendError::Doomed);
        }
        let record = {
            let streams = self.state.streams.lock();
            IndexRecord {
                key: self.state.key.clone(),
                sizes: [streams[0].size, streams[1].size],
                hashes: [streams[0].digest(), streams[1].digest()],
            }
        };
        let data = serde_json::to_vec(&record).map_err(std::io::Error::other)?;

        let temp_path = self.shared.layout.temp_path();
        let mut options = async_fs::OpenOptions::new();
        options.create(true).truncate(true).write(true);
        #[cfg(unix)]
        {
            options.mode(0o600);
        }
        let mut file = options.open(&temp_path).await?;
        file.write_all(&data).await?;
        file.flush().await?;
        drop(file);
        if let Err(err) = async_fs::rename(&temp_path, &self.state.paths.index).await {
            let _ = async_fs::remove_file(&temp_path).await;
            return Err(err.into());
        }

        self.state.creating.store(false, Ordering::Release);
        Ok(())
    }

    async fn doom(&self) {
        if self.shared.doom(&self.state) {
            remove_index_record(&self.state.paths.index).await;
        }
    }
}

impl Drop for DiskEntry {
    fn drop(&mut self) {
        if self.owns_creation && self.state.creating.swap(false, Ordering::AcqRel) {
            self.shared.doom(&self.state);
        }
    }
}

async fn write_stream_file(
    path: &Path,
    offset: u64,
    data: &[u8],
    truncate: bool,
) -> std::io::Result<()> {
    let mut options = async_fs::OpenOptions::new();
    options.create(true).write(true);
    #[cfg(unix)]
    {
        options.mode(0o600);
    }
    let mut file = options.open(path).await?;
    if truncate {
        file.set_len(offset).await?;
    }
    file.seek(SeekFrom::Start(offset)).await?;
    file.write_all(data).await?;
    file.flush().await?;
    Ok(())
}

async fn remove_index_record(path: &Path) {
    if let Err(err) = async_fs::remove_file(path).await
        && err.kind() != std::io::ErrorKind::NotFound
    {
        tracing::warn!(error = %err, path = %path.display(), "failed to remove index record");
    }
}

struct DiskIterator {
    backend: DiskBackend,
    cursor: Option<String>,
}

#[async_trait]
impl EntryIterator for DiskIterator {
    async fn open_next(&mut self) -> BackendResult<Option<Box<dyn Entry>>> {
        let next = {
            let entries = self.backend.shared.entries.lock();
            let lower = match &self.cursor {
                Some(cursor) => Bound::Excluded(cursor.clone()),
                None => Bound::Unbounded,
            };
            entries
                .range((lower, Bound::Unbounded))
                .find(|(_, state)| state.is_visible())
                .map(|(key, state)| (key.clone(), state.clone()))
        };
        match next {
            Some((key, state)) => {
                self.cursor = Some(key);
                Ok(Some(self.backend.handle(state, false, 0)))
            }
            None => Ok(None),
        }
    }
}

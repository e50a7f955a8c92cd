use std::collections::BTreeMap;
use std::ops::Bound;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::trace;

use super::{
    Backend, BackendError, BackendKind, BackendResult, Capacity, Entry, EntryIterator, StreamIndex,
    size_after_write,
};

#[derive(Debug)]
struct EntryState {
    key: String,
    streams: Mutex<[Vec<u8>; 2]>,
    creating: AtomicBool,
    doomed: AtomicBool,
}

impl EntryState {
    fn new(key: &str) -> Self {
        Self {
            key: key.to_string(),
            streams: Mutex::new([Vec::new(), Vec::new()]),
            creating: AtomicBool::new(true),
            doomed: AtomicBool::new(false),
        }
    }

    fn is_visible(&self) -> bool {
        !self.creating.load(Ordering::Acquire) && !self.doomed.load(Ordering::Acquire)
    }

    fn total_size(&self) -> u64 {
        let streams = self.streams.lock();
        (streams[0].len() + streams[1].len()) as u64
    }
}

#[derive(Debug)]
struct Shared {
    entries: Mutex<BTreeMap<String, Arc<EntryState>>>,
    capacity: Capacity,
}

impl Shared {
    /// Marks an entry doomed and returns its bytes to the pool. Idempotent.
    fn retire(&self, state: &EntryState) -> bool {
        if state.doomed.swap(true, Ordering::AcqRel) {
            return false;
        }
        self.capacity.release(state.total_size());
        true
    }

    fn doom(&self, state: &Arc<EntryState>) {
        if !self.retire(state) {
            return;
        }
        let mut entries = self.entries.lock();
        if entries
            .get(&state.key)
            .is_some_and(|current| Arc::ptr_eq(current, state))
        {
            entries.remove(&state.key);
        }
        trace!(key = %state.key, "memory entry doomed");
    }
}

/// Entry store kept entirely in process memory.
#[derive(Debug, Clone)]
pub struct MemoryBackend {
    shared: Arc<Shared>,
}

impl MemoryBackend {
    pub fn new(max_bytes: u64) -> Self {
        Self {
            shared: Arc::new(Shared {
                entries: Mutex::new(BTreeMap::new()),
                capacity: Capacity::new(max_bytes),
            }),
        }
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
        Box::new(MemoryEntry {
            state,
            shared: self.shared.clone(),
            owns_creation,
            replaced,
        })
    }
}

#[async_trait]
impl Backend for MemoryBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Memory
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
        let state = Arc::new(EntryState::new(key));
        let mut replaced = 0;
        {
            let mut entries = self.shared.entries.lock();
            if let Some(existing) = entries.get(key) {
                if existing.creating.load(Ordering::Acquire) {
                    return Err(BackendError::Conflict);
                }
                if self.shared.retire(existing) {
                    replaced = existing.total_size();
                }
            }
            entries.insert(key.to_string(), state.clone());
        }
        Ok(self.handle(state, true, replaced))
    }

    fn iter(&self) -> Box<dyn EntryIterator> {
        Box::new(MemoryIterator {
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

struct MemoryEntry {
    state: Arc<EntryState>,
    shared: Arc<Shared>,
    owns_creation: bool,
    replaced: u64,
}

#[async_trait]
impl Entry for MemoryEntry {
    fn key(&self) -> &str {
        &self.state.key
    }

    fn replaced_size(&self) -> u64 {
        self.replaced
    }

    fn size(&self, stream: StreamIndex) -> u64 {
        self.state.streams.lock()[stream.slot()].len() as u64
    }

    async fn read(&self, stream: StreamIndex, offset: u64, buf: &mut [u8]) -> BackendResult<usize> {
        let streams = self.state.streams.lock();
        let data = &streams[stream.slot()];
        let Ok(start) = usize::try_from(offset) else {
            return Ok(0);
        };
        if start >= data.len() {
            return Ok(0);
        }
        let len = buf.len().min(data.len() - start);
        buf[..len].copy_from_slice(&data[start..start + len]);
        Ok(len)
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
        let mut streams = self.state.streams.lock();
        let target = &mut streams[stream.slot()];
        let old_size = target.len() as u64;
        let new_size = size_after_write(old_size, offset, data.len(), truncate)?;
        self.shared.capacity.reserve(old_size, new_size)?;

        let start = offset as usize;
        let end = start + data.len();
        if target.len() < end {
            target.resize(end, 0);
        }
        target[start..end].copy_from_slice(data);
        if truncate {
            target.truncate(end);
        }
        Ok(data.len())
    }

    async fn commit(&self) -> BackendResult<()> {
        if self.state.doomed.load(Ordering::Acquire) {
            return Err(BackendError::Doomed);
        }
        self.state.creating.store(false, Ordering::Release);
        Ok(())
    }

    async fn doom(&self) {
        self.shared.doom(&self.state);
    }
}

impl Drop for MemoryEntry {
    fn drop(&mut self) {
        if self.owns_creation && self.state.creating.swap(false, Ordering::AcqRel) {
            self.shared.doom(&self.state);
        }
    }
}

struct MemoryIterator {
    backend: MemoryBackend,
    cursor: Option<String>,
}

#[async_trait]
impl EntryIterator for MemoryIterator {
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

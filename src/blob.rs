//! Opaque body storage shared with the cache's callers.
//!
//! Response bodies travel in and out of the cache as blob handles. The cache
//! streams a put body out of a resolved blob and materializes a matched body
//! into a fresh blob created through a [`BlobSink`].

use std::collections::HashMap;
use std::fmt;
use std::io::{self, Cursor};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite};
use uuid::Uuid;

pub type BlobReader = Box<dyn AsyncRead + Send + Unpin>;

/// Byte content behind a blob handle.
pub trait BlobData: Send + Sync + fmt::Debug {
    fn size(&self) -> u64;

    /// Starts a new read from the first byte.
    fn reader(&self) -> BlobReader;
}

/// Reference-counted handle to a blob.
#[derive(Clone)]
pub struct BlobHandle {
    id: Uuid,
    data: Arc<dyn BlobData>,
}

impl BlobHandle {
    pub fn new(id: Uuid, data: Arc<dyn BlobData>) -> Self {
        Self { id, data }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn size(&self) -> u64 {
        self.data.size()
    }

    pub fn reader(&self) -> BlobReader {
        self.data.reader()
    }

    pub async fn read_to_vec(&self) -> io::Result<Vec<u8>> {
        let mut out = Vec::with_capacity(self.size() as usize);
        self.reader().read_to_end(&mut out).await?;
        Ok(out)
    }
}

impl fmt::Debug for BlobHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BlobHandle")
            .field("id", &self.id)
            .field("size", &self.size())
            .finish()
    }
}

/// Write side of a blob under construction.
pub trait BlobSink: AsyncWrite + Send + Unpin {
    /// Seals the written bytes into a readable blob.
    fn finish(self: Box<Self>) -> BlobHandle;
}

pub trait BlobStorage: Send + Sync {
    fn resolve(&self, id: Uuid) -> Option<BlobHandle>;

    fn create_sink(&self) -> Box<dyn BlobSink>;
}

#[derive(Debug)]
struct MemoryBlob(Bytes);

impl BlobData for MemoryBlob {
    fn size(&self) -> u64 {
        self.0.len() as u64
    }

    fn reader(&self) -> BlobReader {
        Box::new(Cursor::new(self.0.clone()))
    }
}

/// In-process blob registry.
#[derive(Debug, Clone, Default)]
pub struct MemoryBlobStorage {
    blobs: Arc<Mutex<HashMap<Uuid, Arc<dyn BlobData>>>>,
}

impl MemoryBlobStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `bytes` as a new blob.
    pub fn put_bytes(&self, bytes: impl Into<Bytes>) -> BlobHandle {
        let id = Uuid::new_v4();
        let data: Arc<dyn BlobData> = Arc::new(MemoryBlob(bytes.into()));
        self.blobs.lock().insert(id, data.clone());
        BlobHandle::new(id, data)
    }

    /// Forgets a blob. Handles already handed out stay readable.
    pub fn release(&self, id: Uuid) -> bool {
        self.blobs.lock().remove(&id).is_some()
    }

    pub fn len(&self) -> usize {
        self.blobs.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.blobs.lock().is_empty()
    }
}

impl BlobStorage for MemoryBlobStorage {
    fn resolve(&self, id: Uuid) -> Option<BlobHandle> {
        let data = self.blobs.lock().get(&id).cloned()?;
        Some(BlobHandle::new(id, data))
    }

    fn create_sink(&self) -> Box<dyn BlobSink> {
        Box::new(MemoryBlobSink {
            storage: self.clone(),
            buf: BytesMut::new(),
        })
    }
}

struct MemoryBlobSink {
    storage: MemoryBlobStorage,
    buf: BytesMut,
}

impl AsyncWrite for MemoryBlobSink {
    fn poll_write(
        mut self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        data: &[u8],
    ) -> Poll<io::Result<usize>> {
        self.buf.extend_from_slice(data);
        Poll::Ready(Ok(data.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}

impl BlobSink for MemoryBlobSink {
    fn finish(self: Box<Self>) -> BlobHandle {
        let MemoryBlobSink { storage, buf } = *self;
        storage.put_bytes(buf.freeze())
    }
}

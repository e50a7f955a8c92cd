#![allow(dead_code)]

use std::collections::HashMap;
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::task::{Context, Poll};

use anyhow::{Result, anyhow};
use async_trait::async_trait;
use http::Uri;
use parking_lot::Mutex;
use tokio::io::{AsyncRead, ReadBuf};
use tokio::sync::Notify;
use uuid::Uuid;

use fetchcache::{
    backend::{Backend, BackendFactory, MemoryBackend},
    blob::{BlobData, BlobHandle, BlobReader, BlobSink, BlobStorage, MemoryBlobStorage},
    cache::{CacheRequest, CacheResponse, CachedResponse, Collaborators, OriginCache},
    quota::QuotaClient,
};

pub const ORIGIN: &str = "https://example.test";

pub fn url(path: &str) -> Uri {
    format!("{ORIGIN}{path}")
        .parse()
        .unwrap_or_else(|err| panic!("bad test url {path}: {err}"))
}

pub fn get(path: &str) -> CacheRequest {
    CacheRequest::get(url(path))
}

/// Quota client that keeps every notification it receives.
#[derive(Debug, Default)]
pub struct RecordingQuota {
    events: Mutex<Vec<(String, i64)>>,
}

impl RecordingQuota {
    pub fn events(&self) -> Vec<(String, i64)> {
        self.events.lock().clone()
    }

    pub fn total(&self) -> i64 {
        self.events.lock().iter().map(|(_, delta)| delta).sum()
    }
}

impl QuotaClient for RecordingQuota {
    fn notify_storage_modified(&self, origin: &str, delta: i64) {
        self.events.lock().push((origin.to_string(), delta));
    }
}

/// Blob whose reader yields `good_bytes` bytes and then fails.
#[derive(Debug)]
pub struct FailingBlob {
    pub size: u64,
    pub good_bytes: usize,
}

impl BlobData for FailingBlob {
    fn size(&self) -> u64 {
        self.size
    }

    fn reader(&self) -> BlobReader {
        Box::new(FailingReader {
            remaining: self.good_bytes,
        })
    }
}

struct FailingReader {
    remaining: usize,
}

impl AsyncRead for FailingReader {
    fn poll_read(
        mut self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        if self.remaining == 0 {
            return Poll::Ready(Err(io::Error::other("blob source failed")));
        }
        let n = self.remaining.min(buf.remaining());
        buf.put_slice(&vec![b'x'; n]);
        self.remaining -= n;
        Poll::Ready(Ok(()))
    }
}

/// Blob storage that can also hand out custom blob sources.
#[derive(Debug, Default)]
pub struct FixtureBlobs {
    memory: MemoryBlobStorage,
    custom: Mutex<HashMap<Uuid, Arc<dyn BlobData>>>,
}

impl FixtureBlobs {
    pub fn put_bytes(&self, bytes: impl Into<bytes::Bytes>) -> BlobHandle {
        self.memory.put_bytes(bytes)
    }

    pub fn put_custom(&self, data: Arc<dyn BlobData>) -> BlobHandle {
        let id = Uuid::new_v4();
        self.custom.lock().insert(id, data.clone());
        BlobHandle::new(id, data)
    }
}

impl BlobStorage for FixtureBlobs {
    fn resolve(&self, id: Uuid) -> Option<BlobHandle> {
        if let Some(data) = self.custom.lock().get(&id).cloned() {
            return Some(BlobHandle::new(id, data));
        }
        self.memory.resolve(id)
    }

    fn create_sink(&self) -> Box<dyn BlobSink> {
        self.memory.create_sink()
    }
}

/// Backend factory that counts calls and can hold creation until released.
pub struct CountingFactory {
    backend: Option<Arc<dyn Backend>>,
    calls: AtomicUsize,
    hold: bool,
    release: Notify,
}

impl CountingFactory {
    pub fn new(backend: Arc<dyn Backend>) -> Arc<Self> {
        Arc::new(Self {
            backend: Some(backend),
            calls: AtomicUsize::new(0),
            hold: false,
            release: Notify::new(),
        })
    }

    /// Creation waits for [`CountingFactory::release`].
    pub fn held(backend: Arc<dyn Backend>) -> Arc<Self> {
        Arc::new(Self {
            backend: Some(backend),
            calls: AtomicUsize::new(0),
            hold: true,
            release: Notify::new(),
        })
    }

    pub fn failing() -> Arc<Self> {
        Arc::new(Self {
            backend: None,
            calls: AtomicUsize::new(0),
            hold: false,
            release: Notify::new(),
        })
    }

    pub fn memory() -> Arc<Self> {
        Self::new(Arc::new(MemoryBackend::new(u64::MAX)))
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn release(&self) {
        self.release.notify_one();
    }
}

#[async_trait]
impl BackendFactory for CountingFactory {
    async fn create(&self) -> Result<Arc<dyn Backend>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.hold {
            self.release.notified().await;
        }
        self.backend
            .clone()
            .ok_or_else(|| anyhow!("backend creation refused"))
    }
}

/// A cache wired to recording collaborators.
pub struct Fixture {
    pub cache: OriginCache,
    pub quota: Arc<RecordingQuota>,
    pub blobs: Arc<FixtureBlobs>,
}

impl Fixture {
    pub fn with_factory(factory: Arc<dyn BackendFactory>) -> Self {
        let quota = Arc::new(RecordingQuota::default());
        let blobs = Arc::new(FixtureBlobs::default());
        let cache = OriginCache::with_factory(
            ORIGIN,
            factory,
            Collaborators::new().with_quota(&quota).with_blobs(&blobs),
        );
        Self {
            cache,
            quota,
            blobs,
        }
    }

    pub fn memory() -> Self {
        let quota = Arc::new(RecordingQuota::default());
        let blobs = Arc::new(FixtureBlobs::default());
        let cache = OriginCache::memory(
            ORIGIN,
            Collaborators::new().with_quota(&quota).with_blobs(&blobs),
        );
        Self {
            cache,
            quota,
            blobs,
        }
    }

    pub fn persistent(path: &std::path::Path) -> Self {
        let quota = Arc::new(RecordingQuota::default());
        let blobs = Arc::new(FixtureBlobs::default());
        let cache = OriginCache::persistent(
            ORIGIN,
            path,
            Collaborators::new().with_quota(&quota).with_blobs(&blobs),
        );
        Self {
            cache,
            quota,
            blobs,
        }
    }

    pub fn response(&self, status: u16, body: &[u8]) -> CacheResponse {
        let response = CacheResponse::new(status, "OK");
        if body.is_empty() {
            return response;
        }
        response.with_blob(&self.blobs.put_bytes(body.to_vec()))
    }

    pub async fn store(&self, path: &str, body: &[u8]) -> CachedResponse {
        self.cache
            .put(get(path), self.response(200, body))
            .await
            .unwrap_or_else(|err| panic!("put {path} failed: {err}"))
    }
}

pub async fn body_of(cached: &CachedResponse) -> Vec<u8> {
    match &cached.blob {
        Some(blob) => blob
            .read_to_vec()
            .await
            .unwrap_or_else(|err| panic!("blob read failed: {err}")),
        None => Vec::new(),
    }
}

//! Origin-scoped request/response cache.
//!
//! An [`OriginCache`] owns a lazily created [`Backend`]. Operations submitted
//! before the backend exists are queued behind an [`InitGate`] and replayed in
//! submission order once creation finishes. A failed creation is not retried;
//! every operation then reports [`CacheError::Storage`].

use std::future::Future;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Instant;

use parking_lot::RwLock;
use tokio::sync::oneshot;
use tracing::{debug, trace, warn};

use crate::backend::{
    Backend, BackendConfig, BackendFactory, BackendKind, DEFAULT_MAX_BYTES, StreamIndex,
};
use crate::blob::{BlobHandle, BlobStorage};
use crate::init_gate::{Admission, Deferred, DeferredFuture, InitGate};
use crate::logging::{CacheOp, CacheOpBuilder};
use crate::quota::{self, QuotaClient};

mod error;
mod keys;
mod metadata;
mod model;
mod reader;
mod vary;
mod writer;

pub use error::{CacheError, CacheResult};
pub use metadata::{Metadata, MetadataError};
pub use model::{
    CacheRequest, CacheResponse, CachedResponse, HeaderList, ResponseBody, ResponseType,
    origin_of,
};
pub use vary::vary_matches;

/// Chunk size used when streaming bodies in and out of an entry.
pub(crate) const BODY_CHUNK_SIZE: usize = 512 * 1024;

/// Services a cache reports to. Both are held weakly; a collaborator that
/// has gone away is skipped for notifications and fails blob operations.
#[derive(Clone, Default)]
pub struct Collaborators {
    quota: Option<Weak<dyn QuotaClient>>,
    blobs: Option<Weak<dyn BlobStorage>>,
}

impl Collaborators {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_quota<Q: QuotaClient + 'static>(mut self, quota: &Arc<Q>) -> Self {
        let weak: Weak<Q> = Arc::downgrade(quota);
        let weak: Weak<dyn QuotaClient> = weak;
        self.quota = Some(weak);
        self
    }

    pub fn with_blobs<B: BlobStorage + 'static>(mut self, blobs: &Arc<B>) -> Self {
        let weak: Weak<B> = Arc::downgrade(blobs);
        let weak: Weak<dyn BlobStorage> = weak;
        self.blobs = Some(weak);
        self
    }
}

pub(crate) struct CacheInner {
    origin: String,
    factory: Arc<dyn BackendFactory>,
    gate: InitGate<()>,
    backend: RwLock<Option<Arc<dyn Backend>>>,
    closed: AtomicBool,
    collaborators: Collaborators,
}

impl CacheInner {
    fn backend(&self) -> CacheResult<Arc<dyn Backend>> {
        self.backend.read().clone().ok_or(CacheError::Storage)
    }

    fn blobs(&self) -> Option<Arc<dyn BlobStorage>> {
        self.collaborators.blobs.as_ref()?.upgrade()
    }

    fn notify_quota(&self, delta: i64) {
        match self
            .collaborators
            .quota
            .as_ref()
            .and_then(|quota| quota.upgrade())
        {
            Some(quota) => quota.notify_storage_modified(&self.origin, delta),
            None => trace!(origin = %self.origin, delta, "no quota client; usage change dropped"),
        }
    }
}

/// Handle to one origin's cache. Clones share the same backend.
#[derive(Clone)]
pub struct OriginCache {
    inner: Arc<CacheInner>,
}

impl OriginCache {
    pub fn memory(origin: impl Into<String>, collaborators: Collaborators) -> Self {
        Self::with_factory(
            origin,
            Arc::new(BackendConfig::Memory {
                max_bytes: u64::MAX,
            }),
            collaborators,
        )
    }

    pub fn persistent(
        origin: impl Into<String>,
        path: impl Into<PathBuf>,
        collaborators: Collaborators,
    ) -> Self {
        Self::with_factory(
            origin,
            Arc::new(BackendConfig::Disk {
                path: path.into(),
                max_bytes: DEFAULT_MAX_BYTES,
            }),
            collaborators,
        )
    }

    pub fn with_factory(
        origin: impl Into<String>,
        factory: Arc<dyn BackendFactory>,
        collaborators: Collaborators,
    ) -> Self {
        Self {
            inner: Arc::new(CacheInner {
                origin: origin.into(),
                factory,
                gate: InitGate::new(),
                backend: RwLock::new(None),
                closed: AtomicBool::new(false),
                collaborators,
            }),
        }
    }

    pub fn origin(&self) -> &str {
        &self.inner.origin
    }

    /// Whether backend creation has finished, successfully or not.
    pub fn is_initialized(&self) -> bool {
        self.inner.gate.is_ready()
    }

    /// Stores `response` under the request's URL.
    ///
    /// A body blob is resolved before anything else; an unresolvable blob
    /// fails with [`CacheError::Storage`] without touching the backend.
    pub async fn put(
        &self,
        request: CacheRequest,
        response: CacheResponse,
    ) -> CacheResult<CachedResponse> {
        let started = Instant::now();
        let deferred = !self.is_initialized();
        let url = request.store_key();

        let result = match self.resolve_body(&response) {
            Ok(source) => {
                self.dispatch(move |inner| async move {
                    writer::put(inner, request, response, source).await
                })
                .await
            }
            Err(err) => Err(err),
        };

        let body_bytes = result
            .as_ref()
            .map(|cached| cached.response.body_size())
            .unwrap_or(0);
        CacheOpBuilder::new(CacheOp::Put, self.origin())
            .url(url)
            .result(result_label(&result))
            .body_bytes(body_bytes)
            .deferred(deferred)
            .elapsed(started.elapsed())
            .log();
        result
    }

    /// Looks up the response stored for `request`, honoring Vary.
    pub async fn match_request(&self, request: CacheRequest) -> CacheResult<CachedResponse> {
        let started = Instant::now();
        let deferred = !self.is_initialized();
        let url = request.store_key();

        let result = self
            .dispatch(move |inner| async move { reader::match_request(inner, request).await })
            .await;

        let body_bytes = result
            .as_ref()
            .map(|cached| cached.response.body_size())
            .unwrap_or(0);
        CacheOpBuilder::new(CacheOp::Match, self.origin())
            .url(url)
            .result(result_label(&result))
            .body_bytes(body_bytes)
            .deferred(deferred)
            .elapsed(started.elapsed())
            .log();
        result
    }

    /// Removes the entry stored for `request`'s URL.
    pub async fn delete(&self, request: &CacheRequest) -> CacheResult<()> {
        let started = Instant::now();
        let deferred = !self.is_initialized();
        let url = request.store_key();
        let key = url.clone();

        let result = self
            .dispatch(move |inner| async move { delete_entry(inner, key).await })
            .await;

        CacheOpBuilder::new(CacheOp::Delete, self.origin())
            .url(url)
            .result(result_label(&result))
            .deferred(deferred)
            .elapsed(started.elapsed())
            .log();
        result
    }

    /// Lists the requests of every stored entry.
    pub async fn keys(&self) -> CacheResult<Vec<CacheRequest>> {
        let started = Instant::now();
        let deferred = !self.is_initialized();

        let result = self
            .dispatch(|inner| async move { keys::collect(inner).await })
            .await;

        let mut event = CacheOpBuilder::new(CacheOp::Keys, self.origin())
            .result(result_label(&result))
            .deferred(deferred)
            .elapsed(started.elapsed());
        if let Ok(requests) = &result {
            event = event.entries(requests.len());
        }
        event.log();
        result
    }

    /// Releases the backend. Operations issued afterwards fail with
    /// [`CacheError::Storage`]; entries already committed to a disk store stay
    /// on disk.
    pub fn close(&self) {
        self.inner.closed.store(true, Ordering::Release);
        if self.inner.backend.write().take().is_some() {
            debug!(origin = %self.inner.origin, "cache backend released");
        }
    }

    /// Total bytes held by a memory backend. Zero for disk stores and before
    /// the backend exists.
    pub async fn memory_backed_size(&self) -> u64 {
        let Ok(backend) = self.inner.backend() else {
            return 0;
        };
        if backend.kind() != BackendKind::Memory {
            return 0;
        }
        let mut total = 0u64;
        let mut iter = backend.iter();
        while let Ok(Some(entry)) = iter.open_next().await {
            total += entry.size(StreamIndex::Metadata) + entry.size(StreamIndex::Body);
        }
        total
    }

    fn resolve_body(&self, response: &CacheResponse) -> CacheResult<Option<BlobHandle>> {
        let ResponseBody::Blob { id, .. } = response.body else {
            return Ok(None);
        };
        let Some(blobs) = self.inner.blobs() else {
            warn!(origin = %self.inner.origin, "blob storage unavailable for put body");
            return Err(CacheError::Storage);
        };
        match blobs.resolve(id) {
            Some(handle) => Ok(Some(handle)),
            None => {
                warn!(origin = %self.inner.origin, blob = %id, "put body blob not found");
                Err(CacheError::Storage)
            }
        }
    }

    /// Runs `op` once the backend exists, queuing it behind creation when
    /// needed.
    async fn dispatch<R, F, Fut>(&self, op: F) -> CacheResult<R>
    where
        F: FnOnce(Arc<CacheInner>) -> Fut + Send + 'static,
        Fut: Future<Output = CacheResult<R>> + Send + 'static,
        R: Send + 'static,
    {
        if self.inner.gate.is_ready() {
            return op(self.inner.clone()).await;
        }

        let (tx, rx) = oneshot::channel();
        let weak = Arc::downgrade(&self.inner);
        let work: Deferred<()> = Box::new(move |()| -> DeferredFuture {
            Box::pin(async move {
                let Some(inner) = weak.upgrade() else {
                    trace!("cache dropped before queued operation ran");
                    return;
                };
                let _ = tx.send(op(inner).await);
            })
        });

        match self.inner.gate.admit(work) {
            Admission::Run(work, ()) => work(()).await,
            Admission::Start => self.spawn_backend_creation(),
            Admission::Queued => trace!(origin = %self.inner.origin, "operation queued"),
        }

        rx.await.unwrap_or(Err(CacheError::Storage))
    }

    fn spawn_backend_creation(&self) {
        let weak = Arc::downgrade(&self.inner);
        let factory = self.inner.factory.clone();
        let origin = self.inner.origin.clone();
        debug!(origin = %origin, "creating cache backend");

        tokio::spawn(async move {
            let created = factory.create().await;
            crate::metrics::record_backend_creation(created.is_ok());

            let Some(inner) = weak.upgrade() else {
                debug!(origin = %origin, "cache dropped during backend creation");
                return;
            };
            match created {
                Ok(backend) if !inner.closed.load(Ordering::Acquire) => {
                    *inner.backend.write() = Some(backend);
                }
                Ok(_) => debug!(origin = %origin, "cache closed during backend creation"),
                Err(err) => warn!(origin = %origin, error = %err, "cache backend creation failed"),
            }
            let queue = inner.gate.complete(());
            drop(inner);
            InitGate::replay(queue, ()).await;
        });
    }
}

impl std::fmt::Debug for OriginCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OriginCache")
            .field("origin", &self.inner.origin)
            .field("gate", &self.inner.gate)
            .finish()
    }
}

async fn delete_entry(inner: Arc<CacheInner>, key: String) -> CacheResult<()> {
    let backend = inner.backend()?;
    let entry = backend.open_entry(&key).await.map_err(CacheError::from)?;
    let size = entry.size(StreamIndex::Metadata) + entry.size(StreamIndex::Body);
    inner.notify_quota(-quota::delta(size));
    entry.doom().await;
    crate::metrics::record_doom("deleted");
    trace!(key, size, "entry deleted");
    Ok(())
}

fn result_label<T>(result: &CacheResult<T>) -> &'static str {
    match result {
        Ok(_) => "ok",
        Err(err) => err.as_str(),
    }
}

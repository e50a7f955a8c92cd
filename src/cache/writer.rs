use std::sync::Arc;

use tokio::io::AsyncReadExt;
use tracing::{debug, trace, warn};

use super::metadata::Metadata;
use super::model::{CacheRequest, CacheResponse, CachedResponse, ResponseBody};
use super::{BODY_CHUNK_SIZE, CacheError, CacheInner, CacheResult};
use crate::backend::{BackendError, Entry, StreamIndex};
use crate::blob::BlobHandle;
use crate::quota;

pub(super) async fn put(
    inner: Arc<CacheInner>,
    request: CacheRequest,
    mut response: CacheResponse,
    source: Option<BlobHandle>,
) -> CacheResult<CachedResponse> {
    let backend = inner.backend()?;
    let key = request.store_key();
    let metadata = Metadata::from_parts(&request, &response)
        .encode()
        .map_err(|err| {
            warn!(key, error = %err, "failed to encode cache metadata");
            CacheError::Storage
        })?;

    let entry = backend
        .create_entry(&key)
        .await
        .map_err(|err| match err {
            BackendError::Conflict => {
                debug!(key, "put collided with an in-flight write");
                CacheError::Exists
            }
            err => {
                warn!(key, error = %err, "failed to create cache entry");
                CacheError::Storage
            }
        })?;

    // The displaced entry is gone whether or not this write completes.
    let replaced = entry.replaced_size();
    if replaced > 0 {
        debug!(key, bytes = replaced, "replaced committed entry");
        inner.notify_quota(-quota::delta(replaced));
    }

    match entry
        .write(StreamIndex::Metadata, 0, &metadata, true)
        .await
    {
        Ok(written) if written == metadata.len() => {}
        Ok(written) => {
            return Err(abandon(entry, "short metadata write", written).await);
        }
        Err(err) => return Err(abandon(entry, "metadata write failed", err).await),
    }
    let metadata_len = metadata.len() as u64;
    trace!(key, bytes = metadata_len, "metadata written");

    let Some(source) = source else {
        commit(&*entry).await?;
        inner.notify_quota(quota::delta(metadata_len));
        return Ok(CachedResponse {
            response,
            blob: None,
        });
    };

    let body_len = match stream_body(&*entry, &source).await {
        Ok(len) => len,
        Err(reason) => return Err(abandon(entry, "body write failed", reason).await),
    };
    commit(&*entry).await?;
    crate::metrics::record_body_written(body_len);
    inner.notify_quota(quota::delta(metadata_len + body_len));
    trace!(key, bytes = body_len, "body committed");

    response.body = ResponseBody::Blob {
        id: source.id(),
        size: body_len,
    };
    Ok(CachedResponse {
        response,
        blob: Some(source),
    })
}

/// Copies the blob into the body stream. Only the first write truncates so
/// the stream grows chunk by chunk.
async fn stream_body(entry: &dyn Entry, source: &BlobHandle) -> Result<u64, String> {
    let mut reader = source.reader();
    let mut buf = vec![0u8; BODY_CHUNK_SIZE];
    let mut offset = 0u64;
    loop {
        let read = reader
            .read(&mut buf)
            .await
            .map_err(|err| format!("blob read: {err}"))?;
        if read == 0 {
            return Ok(offset);
        }
        let written = entry
            .write(StreamIndex::Body, offset, &buf[..read], offset == 0)
            .await
            .map_err(|err| err.to_string())?;
        if written != read {
            return Err(format!("short write of {written} of {read} bytes"));
        }
        offset += read as u64;
    }
}

async fn commit(entry: &dyn Entry) -> CacheResult<()> {
    entry.commit().await.map_err(|err| {
        warn!(key = entry.key(), error = %err, "failed to commit cache entry");
        CacheError::Storage
    })
}

async fn abandon(
    entry: Box<dyn Entry>,
    reason: &'static str,
    detail: impl std::fmt::Display,
) -> CacheError {
    warn!(key = entry.key(), detail = %detail, "{reason}; dooming entry");
    entry.doom().await;
    crate::metrics::record_doom("write_failed");
    CacheError::Storage
}

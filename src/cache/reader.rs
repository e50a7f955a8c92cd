use std::sync::Arc;

use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tracing::{debug, trace, warn};

use super::metadata::{Metadata, MetadataError};
use super::model::{CacheRequest, CachedResponse, ResponseBody};
use super::vary::vary_matches;
use super::{BODY_CHUNK_SIZE, CacheError, CacheInner, CacheResult};
use crate::backend::{BackendError, Entry, StreamIndex};
use crate::blob::BlobHandle;

#[derive(Debug, Error)]
pub(super) enum MetadataReadError {
    #[error("metadata read failed: {0}")]
    Backend(#[from] BackendError),
    #[error("metadata stream ended after {read} of {expected} bytes")]
    Short { read: usize, expected: usize },
    #[error(transparent)]
    Decode(#[from] MetadataError),
}

/// Reads and decodes the whole header record of `entry`.
pub(super) async fn read_metadata(entry: &dyn Entry) -> Result<Metadata, MetadataReadError> {
    let expected = entry.size(StreamIndex::Metadata) as usize;
    let mut buf = vec![0u8; expected];
    let mut read = 0;
    while read < expected {
        let n = entry
            .read(StreamIndex::Metadata, read as u64, &mut buf[read..])
            .await?;
        if n == 0 {
            return Err(MetadataReadError::Short { read, expected });
        }
        read += n;
    }
    Ok(Metadata::decode(&buf)?)
}

pub(super) async fn match_request(
    inner: Arc<CacheInner>,
    request: CacheRequest,
) -> CacheResult<CachedResponse> {
    let backend = inner.backend()?;
    let key = request.store_key();

    let entry = match backend.open_entry(&key).await {
        Ok(entry) => entry,
        Err(BackendError::NotFound) => {
            trace!(key, "no entry for key");
            return Err(CacheError::NotFound);
        }
        Err(err) => {
            warn!(key, error = %err, "failed to open cache entry");
            return Err(CacheError::Storage);
        }
    };

    let metadata = read_metadata(&*entry).await.map_err(|err| {
        warn!(key, error = %err, "unreadable cache entry");
        CacheError::Storage
    })?;

    let mut response = metadata.to_response();
    response.url = Some(request.url.clone());

    if !vary_matches(&request.headers, &metadata.request_headers, &response.headers) {
        debug!(key, "stored response varies from request");
        return Err(CacheError::NotFound);
    }

    let body_size = entry.size(StreamIndex::Body);
    if body_size == 0 {
        return Ok(CachedResponse {
            response,
            blob: None,
        });
    }

    let Some(blobs) = inner.blobs() else {
        warn!(key, "blob storage unavailable for matched body");
        return Err(CacheError::Storage);
    };
    let blob = copy_body(&*entry, blobs.create_sink()).await.map_err(|err| {
        warn!(key, error = %err, "failed to read cached body");
        CacheError::Storage
    })?;

    crate::metrics::record_body_read(blob.size());
    response.body = ResponseBody::Blob {
        id: blob.id(),
        size: blob.size(),
    };
    Ok(CachedResponse {
        response,
        blob: Some(blob),
    })
}

async fn copy_body(
    entry: &dyn Entry,
    mut sink: Box<dyn crate::blob::BlobSink>,
) -> anyhow::Result<BlobHandle> {
    let mut buf = vec![0u8; BODY_CHUNK_SIZE];
    let mut offset = 0u64;
    loop {
        let read = entry.read(StreamIndex::Body, offset, &mut buf).await?;
        if read == 0 {
            break;
        }
        sink.write_all(&buf[..read]).await?;
        offset += read as u64;
    }
    sink.shutdown().await?;
    Ok(sink.finish())
}

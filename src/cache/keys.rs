use std::sync::Arc;

use http::{Method, Uri};
use tracing::{trace, warn};

use super::model::CacheRequest;
use super::reader::read_metadata;
use super::{CacheError, CacheInner, CacheResult};
use crate::backend::Entry;

/// Opens every entry first, then decodes them one by one. Entries that no
/// longer decode into a request are doomed and left out.
pub(super) async fn collect(inner: Arc<CacheInner>) -> CacheResult<Vec<CacheRequest>> {
    let backend = inner.backend()?;

    let mut entries = Vec::new();
    let mut iter = backend.iter();
    loop {
        match iter.open_next().await {
            Ok(Some(entry)) => entries.push(entry),
            Ok(None) => break,
            Err(err) => {
                warn!(error = %err, "entry enumeration failed");
                return Err(CacheError::Storage);
            }
        }
    }
    drop(iter);
    trace!(count = entries.len(), "entries opened for enumeration");

    let mut requests = Vec::with_capacity(entries.len());
    for entry in entries {
        match request_for(&*entry).await {
            Ok(request) => requests.push(request),
            Err(reason) => {
                warn!(key = entry.key(), reason = %reason, "dropping undecodable entry");
                entry.doom().await;
                crate::metrics::record_doom("undecodable");
            }
        }
    }
    Ok(requests)
}

async fn request_for(entry: &dyn Entry) -> Result<CacheRequest, String> {
    let metadata = read_metadata(entry).await.map_err(|err| err.to_string())?;
    let url: Uri = entry
        .key()
        .parse()
        .map_err(|err| format!("invalid key url: {err}"))?;
    let method = Method::from_bytes(metadata.method.as_bytes())
        .map_err(|err| format!("invalid method: {err}"))?;

    let mut request = CacheRequest::new(method, url);
    request.headers = metadata.request_headers;
    Ok(request)
}

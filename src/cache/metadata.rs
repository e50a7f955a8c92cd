//! Header record stored in an entry's first stream.
//!
//! The record is the magic `FCM` and a version byte followed by the bincode
//! encoding of [`Metadata`] (fixed-width big-endian integers).

use bincode::Options;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::model::{CacheRequest, CacheResponse, HeaderList, ResponseBody, ResponseType};

const MAGIC: &[u8; 3] = b"FCM";
const VERSION: u8 = 1;

#[derive(Debug, Error)]
pub enum MetadataError {
    #[error("metadata truncated before payload")]
    Truncated,
    #[error("bad metadata magic")]
    BadMagic,
    #[error("unsupported metadata version {0}")]
    UnsupportedVersion(u8),
    #[error("{0} trailing bytes after metadata")]
    TrailingBytes(usize),
    #[error("malformed metadata: {0}")]
    Malformed(#[from] bincode::Error),
}

/// Request and response header record persisted per entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Metadata {
    pub method: String,
    pub status: u16,
    pub status_text: String,
    pub response_type: ResponseType,
    pub request_headers: HeaderList,
    pub response_headers: HeaderList,
}

fn codec() -> impl Options {
    bincode::DefaultOptions::new()
        .with_fixint_encoding()
        .with_big_endian()
        .allow_trailing_bytes()
}

impl Metadata {
    pub fn from_parts(request: &CacheRequest, response: &CacheResponse) -> Self {
        Self {
            method: request.method.as_str().to_string(),
            status: response.status,
            status_text: response.status_text.clone(),
            response_type: response.response_type,
            request_headers: request.headers.clone(),
            response_headers: response.headers.clone(),
        }
    }

    pub fn to_response(&self) -> CacheResponse {
        CacheResponse {
            url: None,
            status: self.status,
            status_text: self.status_text.clone(),
            response_type: self.response_type,
            headers: self.response_headers.clone(),
            body: ResponseBody::Empty,
        }
    }

    pub fn encode(&self) -> Result<Bytes, MetadataError> {
        let payload_len = codec().serialized_size(self)? as usize;
        let mut buf = Vec::with_capacity(MAGIC.len() + 1 + payload_len);
        buf.extend_from_slice(MAGIC);
        buf.push(VERSION);
        codec().serialize_into(&mut buf, self)?;
        Ok(Bytes::from(buf))
    }

    pub fn decode(data: &[u8]) -> Result<Self, MetadataError> {
        if data.len() < MAGIC.len() + 1 {
            return Err(MetadataError::Truncated);
        }
        let (magic, rest) = data.split_at(MAGIC.len());
        if magic != MAGIC {
            return Err(MetadataError::BadMagic);
        }
        if rest[0] != VERSION {
            return Err(MetadataError::UnsupportedVersion(rest[0]));
        }

        // The limit keeps length prefixes from allocating past the input.
        let mut payload = &rest[1..];
        let metadata: Metadata = codec()
            .with_limit(payload.len() as u64)
            .deserialize_from(&mut payload)?;
        if !payload.is_empty() {
            return Err(MetadataError::TrailingBytes(payload.len()));
        }
        Ok(metadata)
    }
}

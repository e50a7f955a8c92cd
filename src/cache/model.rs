use std::fmt;

use http::{Method, Uri};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::blob::BlobHandle;

/// Ordered list of header pairs.
///
/// Names are kept exactly as supplied and duplicates are preserved in
/// insertion order. Lookups ignore ASCII case.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeaderList {
    pairs: Vec<(String, String)>,
}

impl HeaderList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn append(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.pairs.push((name.into(), value.into()));
    }

    /// Replaces the value of the first pair with exactly this name, or appends.
    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into();
        let value = value.into();
        match self.pairs.iter_mut().find(|(existing, _)| *existing == name) {
            Some(pair) => pair.1 = value,
            None => self.pairs.push((name, value)),
        }
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.pairs
            .iter()
            .find(|(existing, _)| existing.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    pub fn get_all<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.pairs
            .iter()
            .filter(move |(existing, _)| existing.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.pairs
            .iter()
            .map(|(name, value)| (name.as_str(), value.as_str()))
    }

    pub fn len(&self) -> usize {
        self.pairs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }
}

impl<N, V> FromIterator<(N, V)> for HeaderList
where
    N: Into<String>,
    V: Into<String>,
{
    fn from_iter<I: IntoIterator<Item = (N, V)>>(iter: I) -> Self {
        Self {
            pairs: iter
                .into_iter()
                .map(|(name, value)| (name.into(), value.into()))
                .collect(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResponseType {
    Basic,
    Cors,
    Default,
    Error,
    Opaque,
}

impl ResponseType {
    pub fn as_str(self) -> &'static str {
        match self {
            ResponseType::Basic => "basic",
            ResponseType::Cors => "cors",
            ResponseType::Default => "default",
            ResponseType::Error => "error",
            ResponseType::Opaque => "opaque",
        }
    }
}

impl fmt::Display for ResponseType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ResponseType {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.to_ascii_lowercase().as_str() {
            "basic" => Ok(ResponseType::Basic),
            "cors" => Ok(ResponseType::Cors),
            "default" => Ok(ResponseType::Default),
            "error" => Ok(ResponseType::Error),
            "opaque" => Ok(ResponseType::Opaque),
            other => Err(format!("unknown response type '{other}'")),
        }
    }
}

#[derive(Debug, Clone)]
pub struct CacheRequest {
    pub url: Uri,
    pub method: Method,
    pub headers: HeaderList,
    pub referrer: Option<Uri>,
    /// Set for navigation (reload) fetches.
    pub is_reload: bool,
}

impl CacheRequest {
    pub fn new(method: Method, url: Uri) -> Self {
        Self {
            url,
            method,
            headers: HeaderList::new(),
            referrer: None,
            is_reload: false,
        }
    }

    pub fn get(url: Uri) -> Self {
        Self::new(Method::GET, url)
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name, value);
        self
    }

    /// Backing-store key. Only the URL participates.
    pub fn store_key(&self) -> String {
        self.url.to_string()
    }
}

/// `scheme://authority` of an absolute URI.
pub fn origin_of(uri: &Uri) -> Option<String> {
    let scheme = uri.scheme_str()?;
    let authority = uri.authority()?;
    Some(format!("{scheme}://{authority}"))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseBody {
    Empty,
    Blob { id: Uuid, size: u64 },
}

#[derive(Debug, Clone)]
pub struct CacheResponse {
    pub url: Option<Uri>,
    /// Zero for opaque and network-error responses.
    pub status: u16,
    pub status_text: String,
    pub response_type: ResponseType,
    pub headers: HeaderList,
    pub body: ResponseBody,
}

impl CacheResponse {
    pub fn new(status: u16, status_text: impl Into<String>) -> Self {
        Self {
            url: None,
            status,
            status_text: status_text.into(),
            response_type: ResponseType::Default,
            headers: HeaderList::new(),
            body: ResponseBody::Empty,
        }
    }

    pub fn with_type(mut self, response_type: ResponseType) -> Self {
        self.response_type = response_type;
        self
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.append(name, value);
        self
    }

    pub fn with_blob(mut self, blob: &BlobHandle) -> Self {
        self.body = ResponseBody::Blob {
            id: blob.id(),
            size: blob.size(),
        };
        self
    }

    pub fn body_size(&self) -> u64 {
        match self.body {
            ResponseBody::Empty => 0,
            ResponseBody::Blob { size, .. } => size,
        }
    }
}

/// Result payload of Put and Match.
#[derive(Debug, Clone)]
pub struct CachedResponse {
    pub response: CacheResponse,
    pub blob: Option<BlobHandle>,
}

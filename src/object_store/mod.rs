mod gcs;
mod local;
mod s3;
mod set;

pub use gcs::{GcsAuth, GcsStore, ServiceAccountKey};
pub use local::LocalStore;
pub use s3::{S3Credentials, S3Store};
pub use set::StoreSet;

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;

use crate::object::StoreObject;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Object not found: {0}")]
    NotFound(String),
    #[error("Backend write failed: {0}")]
    Write(String),
    #[error("Backend query failed: {0}")]
    Query(String),
    #[error("Invalid object name: {0}")]
    InvalidName(String),
}

impl StoreError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound(_))
    }
}

/// The capability set every image store backend provides.
///
/// Names are identifiers, not paths: each backend routes every operation
/// through its own `PathMapper`, so `exists` and `save` always look at the
/// same location for the same name.
#[async_trait]
pub trait ImageStore: Send + Sync {
    /// Write `data` under the object's name and return its public URL.
    async fn save(&self, object: &StoreObject, data: Bytes) -> Result<String, StoreError>;
    /// `Ok(false)` for absent objects; errors only on backend failure.
    async fn exists(&self, name: &str) -> Result<bool, StoreError>;
    async fn get(&self, name: &str) -> Result<Bytes, StoreError>;
    async fn delete(&self, name: &str) -> Result<(), StoreError>;
    /// Computed locally, no backend round-trip.
    fn url_for(&self, name: &str) -> String;
}

/// Limits on remote backend calls. A backend that accepts a connection and
/// never answers surfaces as a `Query` or `Write` error once these elapse.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HttpTimeouts {
    pub connect: Duration,
    /// Whole request, including reading the response body.
    pub request: Duration,
}

impl Default for HttpTimeouts {
    fn default() -> Self {
        Self {
            connect: Duration::from_secs(10),
            request: Duration::from_secs(30),
        }
    }
}

impl HttpTimeouts {
    pub(crate) fn client(&self) -> reqwest::Result<reqwest::Client> {
        reqwest::Client::builder()
            .connect_timeout(self.connect)
            .timeout(self.request)
            .build()
    }
}

/// Join a store root and a mapped path into an object key.
/// An empty root contributes no segment.
pub(crate) fn join_key(root: &str, path: &str) -> String {
    let root = root.trim_matches('/');
    if root.is_empty() {
        path.to_string()
    } else {
        format!("{root}/{path}")
    }
}

/// Percent-encode an object key for use in a URL path: everything except
/// unreserved characters and `/` is escaped. This is also the SigV4
/// canonical URI encoding.
pub(crate) fn uri_encode(key: &str) -> String {
    let mut out = String::with_capacity(key.len());
    for byte in key.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' | b'/' => {
                out.push(byte as char)
            }
            _ => out.push_str(&format!("%{byte:02X}")),
        }
    }
    out
}

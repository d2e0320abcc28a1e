//! Cache store layer.
//!
//! The resolver talks to the object store only through [`CacheStore`], so
//! any blob API with get/head/put by key can back the cache.  [`s3`] is the
//! production implementation.

#[cfg(test)]
pub mod memory;
pub mod s3;

use anyhow::Result;
use bytes::Bytes;
use futures::stream::BoxStream;

pub use s3::S3CacheStore;

/// Streaming object body.
pub type ObjectStream = BoxStream<'static, std::io::Result<Bytes>>;

/// Metadata returned by a HEAD on a cached object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectMeta {
    pub length: u64,
    pub content_type: Option<String>,
}

/// Result of a guarded write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PutOutcome {
    Written,
    /// Another writer got there first; the existing object is kept.
    AlreadyExists,
}

#[async_trait::async_trait]
pub trait CacheStore: Send + Sync {
    /// HEAD the object at `path`.  `Ok(None)` when it does not exist.
    async fn head_object(&self, path: &str) -> Result<Option<ObjectMeta>>;

    /// Open the object body.  `Ok(None)` when it does not exist.
    async fn get_object_stream(&self, path: &str) -> Result<Option<ObjectStream>>;

    /// Write `body` at `path` unless an object is already there.
    async fn put_object(
        &self,
        path: &str,
        body: Bytes,
        content_type: Option<&str>,
    ) -> Result<PutOutcome>;

    async fn exists(&self, path: &str) -> Result<bool> {
        Ok(self.head_object(path).await?.is_some())
    }

    /// Cheap reachability probe for the health endpoint.
    async fn check(&self) -> Result<()>;

    /// Human-readable location, e.g. `s3://bucket/prefix`.
    fn describe(&self) -> String;
}

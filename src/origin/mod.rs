//! Origin symbol server abstraction.
//!
//! The resolver only needs headers-first GETs: status and content length must
//! be inspectable before the body has been received.

pub mod http;

use anyhow::Result;
use axum::http::StatusCode;

use crate::storage::ObjectStream;

pub use self::http::HttpOrigin;

/// A response whose headers have arrived and whose body has not been read.
pub struct OriginResponse {
    pub status: StatusCode,
    pub content_length: Option<u64>,
    pub content_type: Option<String>,
    pub body: ObjectStream,
}

impl std::fmt::Debug for OriginResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OriginResponse")
            .field("status", &self.status)
            .field("content_length", &self.content_length)
            .field("content_type", &self.content_type)
            .finish_non_exhaustive()
    }
}

#[async_trait::async_trait]
pub trait OriginClient: Send + Sync {
    /// Base URI that symbol paths are appended to.  Ends with `/`.
    fn base_uri(&self) -> &str;

    /// Send one GET to `url` and return as soon as headers are in.
    ///
    /// Each call builds a fresh request.
    async fn get(&self, url: &str) -> Result<OriginResponse>;

    /// Reachability probe for the health endpoint.
    async fn check(&self) -> Result<()>;
}

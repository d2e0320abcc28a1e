use anyhow::{Context, Result};
use aws_sdk_s3::Client;
use aws_sdk_s3::primitives::ByteStream;
use bytes::Bytes;
use futures::StreamExt;
use tokio_util::io::ReaderStream;
use tracing::{debug, instrument};

use super::{CacheStore, ObjectMeta, ObjectStream, PutOutcome};
use crate::config::S3StorageConfig;

/// S3 bucket used as the symbol cache.  Symbol paths map to keys as
/// `{prefix}{path}`.
#[derive(Clone)]
pub struct S3CacheStore {
    pub client: Client,
    pub bucket: String,
    pub prefix: String,
}

impl S3CacheStore {
    pub fn new(client: Client, bucket: String, prefix: String) -> Self {
        Self {
            client,
            bucket,
            prefix,
        }
    }

    /// Build the SDK client from the ambient AWS environment plus the
    /// storage section.
    pub async fn from_config(config: &S3StorageConfig) -> Result<Self> {
        let aws_config = aws_config::from_env()
            .region(aws_config::Region::new(config.region.clone()))
            .load()
            .await;

        let mut builder =
            aws_sdk_s3::config::Builder::from(&aws_config).force_path_style(config.force_path_style);
        if let Some(endpoint) = &config.endpoint_url {
            builder = builder.endpoint_url(endpoint);
        }
        let client = Client::from_conf(builder.build());

        tracing::info!(
            bucket = %config.bucket,
            region = %config.region,
            prefix = %config.prefix,
            "S3 cache store initialised"
        );
        Ok(Self::new(client, config.bucket.clone(), config.prefix.clone()))
    }

    fn key(&self, path: &str) -> String {
        object_key(&self.prefix, path)
    }
}

/// Join a key prefix and a symbol path without doubling the separator.
pub fn object_key(prefix: &str, path: &str) -> String {
    if prefix.is_empty() {
        return path.to_string();
    }
    format!("{}/{}", prefix.trim_end_matches('/'), path.trim_start_matches('/'))
}

#[async_trait::async_trait]
impl CacheStore for S3CacheStore {
    #[instrument(skip(self), fields(bucket = %self.bucket))]
    async fn head_object(&self, path: &str) -> Result<Option<ObjectMeta>> {
        let key = self.key(path);
        match self
            .client
            .head_object()
            .bucket(&self.bucket)
            .key(&key)
            .send()
            .await
        {
            Ok(out) => Ok(Some(ObjectMeta {
                length: out.content_length().unwrap_or(0).max(0) as u64,
                content_type: out.content_type().map(str::to_string),
            })),
            Err(err) => {
                if err.as_service_error().is_some_and(|e| e.is_not_found()) {
                    debug!(%key, "cache object not found");
                    Ok(None)
                } else {
                    Err(err).context("S3 HeadObject")
                }
            }
        }
    }

    #[instrument(skip(self), fields(bucket = %self.bucket))]
    async fn get_object_stream(&self, path: &str) -> Result<Option<ObjectStream>> {
        let key = self.key(path);
        match self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(&key)
            .send()
            .await
        {
            Ok(out) => {
                let stream = ReaderStream::new(out.body.into_async_read());
                Ok(Some(stream.boxed()))
            }
            Err(err) => {
                if err.as_service_error().is_some_and(|e| e.is_no_such_key()) {
                    debug!(%key, "cache object vanished before download");
                    Ok(None)
                } else {
                    Err(err).context("S3 GetObject")
                }
            }
        }
    }

    #[instrument(skip(self, body), fields(bucket = %self.bucket, len = body.len()))]
    async fn put_object(
        &self,
        path: &str,
        body: Bytes,
        content_type: Option<&str>,
    ) -> Result<PutOutcome> {
        let key = self.key(path);
        let result = self
            .client
            .put_object()
            .bucket(&self.bucket)
            .key(&key)
            .body(ByteStream::from(body))
            .set_content_type(content_type.map(str::to_string))
            // Conditional write: never clobber an object a concurrent request
            // already stored.
            .if_none_match("*")
            .send()
            .await;

        match result {
            Ok(_) => {
                debug!(%key, "object cached");
                Ok(PutOutcome::Written)
            }
            Err(err) => {
                let status = err.raw_response().map(|r| r.status().as_u16());
                if matches!(status, Some(409 | 412)) {
                    debug!(%key, "object already cached by another writer");
                    Ok(PutOutcome::AlreadyExists)
                } else {
                    Err(err).context("S3 PutObject")
                }
            }
        }
    }

    async fn check(&self) -> Result<()> {
        self.client
            .head_bucket()
            .bucket(&self.bucket)
            .send()
            .await
            .context("S3 HeadBucket")?;
        Ok(())
    }

    fn describe(&self) -> String {
        format!("s3://{}/{}", self.bucket, self.prefix)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_without_prefix_is_the_path() {
        assert_eq!(object_key("", "a/b/c.pdb"), "a/b/c.pdb");
    }

    #[test]
    fn key_with_prefix_joins_once() {
        assert_eq!(object_key("symbols", "a/b/c.pdb"), "symbols/a/b/c.pdb");
        assert_eq!(object_key("symbols/", "a/b/c.pdb"), "symbols/a/b/c.pdb");
        assert_eq!(object_key("symbols/", "/a/b/c.pdb"), "symbols/a/b/c.pdb");
    }
}

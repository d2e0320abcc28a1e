//! Tiered symbol resolution: cache store, then origin with retry, with
//! write-back of anything small enough to buffer.

use std::sync::Arc;
use std::time::Instant;

use anyhow::Result;
use axum::{
    body::Body,
    http::{HeaderValue, StatusCode, header},
    response::Response,
};
use bytes::{Bytes, BytesMut};
use futures::StreamExt;
use prometheus_client::encoding::EncodeLabelValue;
use tracing::{debug, info, instrument, warn};

use super::symbol_path::SymbolPath;
use crate::metrics::{MetricsRegistry, OutcomeLabels, ServedFrom, SourceLabels};
use crate::origin::{OriginClient, OriginResponse};
use crate::storage::{CacheStore, ObjectStream, PutOutcome};

/// Largest origin body that is buffered in memory and written back to the
/// cache store.  Anything bigger is streamed straight through.
pub const BUFFER_CEILING: u64 = 2_000_000_000;

/// Upper bound on the up-front buffer allocation; the buffer grows past it.
const MAX_PREALLOC: u64 = 64 * 1024 * 1024;

const OCTET_STREAM: &str = "application/octet-stream";

#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq, EncodeLabelValue)]
pub enum Outcome {
    ServedFromCache,
    ServedFromOrigin,
    NotFound,
    Failed,
}

impl Outcome {
    pub fn is_served(self) -> bool {
        matches!(self, Outcome::ServedFromCache | Outcome::ServedFromOrigin)
    }
}

/// Outcome of a resolution plus the response to send to the caller.
#[derive(Debug)]
pub struct Resolution {
    pub outcome: Outcome,
    pub response: Response,
}

impl Resolution {
    fn not_found() -> Self {
        Self::empty(Outcome::NotFound, StatusCode::NOT_FOUND)
    }

    fn failed(status: StatusCode) -> Self {
        Self::empty(Outcome::Failed, status)
    }

    fn empty(outcome: Outcome, status: StatusCode) -> Self {
        let mut response = Response::new(Body::empty());
        *response.status_mut() = status;
        Self { outcome, response }
    }
}

pub struct Resolver {
    /// `None` when no cache store is configured; treated exactly like a
    /// store that never has the object and never accepts writes.
    store: Option<Arc<dyn CacheStore>>,
    origin: Arc<dyn OriginClient>,
    metrics: MetricsRegistry,
}

impl Resolver {
    pub fn new(
        store: Option<Arc<dyn CacheStore>>,
        origin: Arc<dyn OriginClient>,
        metrics: MetricsRegistry,
    ) -> Self {
        Self {
            store,
            origin,
            metrics,
        }
    }

    pub fn store(&self) -> Option<&Arc<dyn CacheStore>> {
        self.store.as_ref()
    }

    pub fn origin(&self) -> &Arc<dyn OriginClient> {
        &self.origin
    }

    /// Resolve `request_path`, trying the origin at most `retry_limit` times
    /// (and at least once).
    ///
    /// Never fails: every error condition maps to an [`Outcome`] and a
    /// response status.
    #[instrument(skip(self))]
    pub async fn resolve(&self, request_path: &str, retry_limit: u32) -> Resolution {
        let started = Instant::now();

        let resolution = match SymbolPath::parse(request_path) {
            None => {
                debug!("not a servable symbol path");
                Resolution::not_found()
            }
            Some(path) => match self.resolve_servable(&path, retry_limit).await {
                Ok(resolution) => resolution,
                Err(e) => {
                    warn!(error = %format_args!("{e:#}"), %path, "symbol resolution failed");
                    Resolution::failed(StatusCode::INTERNAL_SERVER_ERROR)
                }
            },
        };

        let m = &self.metrics.metrics;
        m.requests_total
            .get_or_create(&OutcomeLabels {
                outcome: resolution.outcome,
            })
            .inc();
        m.request_duration_seconds
            .observe(started.elapsed().as_secs_f64());

        resolution
    }

    async fn resolve_servable(&self, path: &SymbolPath, retry_limit: u32) -> Result<Resolution> {
        if let Some(resolution) = self.serve_from_cache(path).await {
            return Ok(resolution);
        }
        self.fetch_from_origin(path, retry_limit).await
    }

    // -----------------------------------------------------------------------
    // Cache store
    // -----------------------------------------------------------------------

    /// Stream the object from the cache store if it is there and non-empty.
    /// Absence and store errors both mean "miss".
    async fn serve_from_cache(&self, path: &SymbolPath) -> Option<Resolution> {
        let store = self.store.as_ref()?;

        let meta = match store.head_object(path.as_str()).await {
            Ok(Some(meta)) if meta.length > 0 => meta,
            Ok(_) => {
                debug!(%path, "cache miss");
                return None;
            }
            Err(e) => {
                warn!(error = %e, %path, "cache store lookup failed, falling back to origin");
                return None;
            }
        };

        let stream = match store.get_object_stream(path.as_str()).await {
            Ok(Some(stream)) => stream,
            Ok(None) => return None,
            Err(e) => {
                warn!(error = %e, %path, "cache store download failed, falling back to origin");
                return None;
            }
        };

        debug!(%path, length = meta.length, "cache hit");
        self.count_bytes(ServedFrom::Cache, meta.length);

        let content_type = meta.content_type.as_deref().unwrap_or(OCTET_STREAM);
        Some(Resolution {
            outcome: Outcome::ServedFromCache,
            response: body_response(
                StatusCode::OK,
                content_type,
                meta.length,
                Body::from_stream(stream),
            ),
        })
    }

    /// Write `body` to the cache store unless an object already exists.
    /// Failures are logged and never affect the response.
    async fn populate_cache(&self, path: &SymbolPath, body: Bytes, content_type: &str) {
        let Some(store) = &self.store else {
            return;
        };
        let m = &self.metrics.metrics;

        match store.exists(path.as_str()).await {
            Ok(true) => {
                debug!(%path, "already cached, skipping write");
                m.cache_write_skips_total.inc();
                return;
            }
            Ok(false) => {}
            Err(e) => {
                warn!(error = %e, %path, "cache existence check failed, skipping write");
                m.cache_write_errors_total.inc();
                return;
            }
        }

        debug!(%path, len = body.len(), "caching symbol");
        match store
            .put_object(path.as_str(), body, Some(content_type))
            .await
        {
            Ok(PutOutcome::Written) => m.cache_writes_total.inc(),
            Ok(PutOutcome::AlreadyExists) => m.cache_write_skips_total.inc(),
            Err(e) => {
                warn!(error = %e, %path, "cache write failed");
                m.cache_write_errors_total.inc()
            }
        };
    }

    // -----------------------------------------------------------------------
    // Origin
    // -----------------------------------------------------------------------

    async fn fetch_from_origin(&self, path: &SymbolPath, retry_limit: u32) -> Result<Resolution> {
        let url = format!("{}{}", self.origin.base_uri(), path);
        let attempts = retry_limit.max(1);
        let m = &self.metrics.metrics;

        let mut last_status = None;
        let mut last_err = None;
        for attempt in 1..=attempts {
            m.origin_attempts_total.inc();

            let resp = match self.origin.get(&url).await {
                Ok(resp) => resp,
                Err(e) => {
                    m.origin_failures_total.inc();
                    debug!(attempt, attempts, error = %e, %url, "origin attempt failed");
                    last_err = Some(e);
                    continue;
                }
            };

            if !resp.status.is_success() {
                m.origin_failures_total.inc();
                debug!(attempt, attempts, status = %resp.status, %url, "origin returned non-success");
                last_status = Some(resp.status);
                continue;
            }

            return Ok(self.serve_origin_response(path, resp).await);
        }

        info!(%path, attempts, ?last_status, "origin attempts exhausted");
        match (last_status, last_err) {
            (Some(status), _) => Ok(Resolution::failed(status)),
            (None, Some(e)) => {
                Err(e.context(format!("origin unreachable after {attempts} attempts")))
            }
            (None, None) => anyhow::bail!("no origin attempt was made"),
        }
    }

    /// Turn a successful origin response into the caller's response.
    async fn serve_origin_response(&self, path: &SymbolPath, resp: OriginResponse) -> Resolution {
        let length = match resp.content_length {
            Some(length) if length > 0 => length,
            _ => {
                warn!(%path, "origin response carries no content length");
                return Resolution::failed(StatusCode::LENGTH_REQUIRED);
            }
        };
        let content_type = resp
            .content_type
            .clone()
            .unwrap_or_else(|| OCTET_STREAM.to_string());

        if !is_bufferable(length) {
            // Too large to buffer: pass straight through, never cached.
            debug!(%path, length, "streaming oversized symbol without caching");
            self.count_bytes(ServedFrom::Origin, length);
            return Resolution {
                outcome: Outcome::ServedFromOrigin,
                response: body_response(
                    resp.status,
                    &content_type,
                    length,
                    Body::from_stream(resp.body),
                ),
            };
        }

        let buffered = match collect_body(resp.body, length).await {
            Ok(buffered) => buffered,
            Err(e) => {
                warn!(error = %e, %path, "origin body unreadable");
                return Resolution::failed(StatusCode::INSUFFICIENT_STORAGE);
            }
        };

        self.populate_cache(path, buffered.clone(), &content_type)
            .await;

        let len = buffered.len() as u64;
        self.count_bytes(ServedFrom::Origin, len);
        Resolution {
            outcome: Outcome::ServedFromOrigin,
            response: body_response(StatusCode::OK, &content_type, len, Body::from(buffered)),
        }
    }

    fn count_bytes(&self, source: ServedFrom, bytes: u64) {
        self.metrics
            .metrics
            .served_bytes_total
            .get_or_create(&SourceLabels { source })
            .inc_by(bytes);
    }
}

fn is_bufferable(length: u64) -> bool {
    length <= BUFFER_CEILING
}

/// Read an entire body into memory.  A body that does not match the
/// declared length is an error, so a truncated transfer never reaches the
/// cache store.
async fn collect_body(mut body: ObjectStream, expected: u64) -> std::io::Result<Bytes> {
    let mut buf = BytesMut::with_capacity(expected.min(MAX_PREALLOC) as usize);
    while let Some(chunk) = body.next().await {
        buf.extend_from_slice(&chunk?);
    }
    if buf.len() as u64 != expected {
        return Err(std::io::Error::new(
            std::io::ErrorKind::UnexpectedEof,
            format!("origin sent {} bytes, declared {expected}", buf.len()),
        ));
    }
    Ok(buf.freeze())
}

fn body_response(status: StatusCode, content_type: &str, length: u64, body: Body) -> Response {
    let mut response = Response::new(body);
    *response.status_mut() = status;
    let headers = response.headers_mut();
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_str(content_type)
            .unwrap_or_else(|_| HeaderValue::from_static(OCTET_STREAM)),
    );
    headers.insert(header::CONTENT_LENGTH, HeaderValue::from(length));
    response
}

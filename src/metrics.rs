use std::sync::Arc;

use prometheus_client::encoding::{EncodeLabelSet, EncodeLabelValue};
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::histogram::{Histogram, exponential_buckets};
use prometheus_client::registry::Registry;

use crate::http::resolver::Outcome;

// ---------------------------------------------------------------------------
// Label types
// ---------------------------------------------------------------------------

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct OutcomeLabels {
    pub outcome: Outcome,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelValue)]
pub enum ServedFrom {
    Cache,
    Origin,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct SourceLabels {
    pub source: ServedFrom,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelValue)]
pub enum TokenResult {
    Cached,
    Issued,
    Unavailable,
    Failed,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct TokenLabels {
    pub source: &'static str,
    pub result: TokenResult,
}

// ---------------------------------------------------------------------------
// Metrics struct
// ---------------------------------------------------------------------------

/// Central container for every Prometheus metric exposed by the proxy.
pub struct Metrics {
    // -- requests --
    pub requests_total: Family<OutcomeLabels, Counter>,
    pub request_duration_seconds: Histogram,

    // -- origin --
    pub origin_attempts_total: Counter,
    pub origin_failures_total: Counter,

    // -- cache store --
    pub cache_writes_total: Counter,
    pub cache_write_skips_total: Counter,
    pub cache_write_errors_total: Counter,

    // -- payload --
    pub served_bytes_total: Family<SourceLabels, Counter>,

    // -- credentials --
    pub token_requests_total: Family<TokenLabels, Counter>,
}

impl Metrics {
    /// Create a new [`Metrics`] instance and register every metric with the
    /// supplied `registry`.
    pub fn new(registry: &mut Registry) -> Self {
        let requests_total = Family::<OutcomeLabels, Counter>::default();
        registry.register(
            "symproxy_requests",
            "Symbol requests by resolution outcome",
            requests_total.clone(),
        );

        let request_duration_seconds = Histogram::new(exponential_buckets(0.005, 2.0, 16));
        registry.register(
            "symproxy_request_duration_seconds",
            "Time to resolve a symbol request, excluding body streaming",
            request_duration_seconds.clone(),
        );

        let origin_attempts_total = Counter::default();
        registry.register(
            "symproxy_origin_attempts",
            "Requests sent to the origin symbol server",
            origin_attempts_total.clone(),
        );

        let origin_failures_total = Counter::default();
        registry.register(
            "symproxy_origin_failures",
            "Origin attempts that errored or returned a non-success status",
            origin_failures_total.clone(),
        );

        let cache_writes_total = Counter::default();
        registry.register(
            "symproxy_cache_writes",
            "Objects written to the cache store",
            cache_writes_total.clone(),
        );

        let cache_write_skips_total = Counter::default();
        registry.register(
            "symproxy_cache_write_skips",
            "Cache writes skipped because the object already existed",
            cache_write_skips_total.clone(),
        );

        let cache_write_errors_total = Counter::default();
        registry.register(
            "symproxy_cache_write_errors",
            "Cache writes that failed",
            cache_write_errors_total.clone(),
        );

        let served_bytes_total = Family::<SourceLabels, Counter>::default();
        registry.register(
            "symproxy_served_bytes",
            "Declared bytes served to clients by source",
            served_bytes_total.clone(),
        );

        let token_requests_total = Family::<TokenLabels, Counter>::default();
        registry.register(
            "symproxy_token_requests",
            "Bearer token lookups by credential source and result",
            token_requests_total.clone(),
        );

        Self {
            requests_total,
            request_duration_seconds,
            origin_attempts_total,
            origin_failures_total,
            cache_writes_total,
            cache_write_skips_total,
            cache_write_errors_total,
            served_bytes_total,
            token_requests_total,
        }
    }
}

// ---------------------------------------------------------------------------
// Shared handle
// ---------------------------------------------------------------------------

/// Thread-safe wrapper for the metrics registry, used in [`AppState`].
///
/// [`AppState`]: crate::AppState
#[derive(Clone)]
pub struct MetricsRegistry {
    pub registry: Arc<Registry>,
    pub metrics: Arc<Metrics>,
}

impl Default for MetricsRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricsRegistry {
    /// Build a fresh registry and pre-register all proxy metrics.
    pub fn new() -> Self {
        let mut registry = Registry::default();
        let metrics = Metrics::new(&mut registry);
        Self {
            registry: Arc::new(registry),
            metrics: Arc::new(metrics),
        }
    }

    /// Render the registry in OpenMetrics text format.
    pub fn encode(&self) -> Result<String, std::fmt::Error> {
        let mut buf = String::new();
        prometheus_client::encoding::text::encode(&mut buf, &self.registry)?;
        Ok(buf)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encoded_output_contains_registered_metrics() {
        let registry = MetricsRegistry::new();
        registry.metrics.origin_attempts_total.inc();
        registry
            .metrics
            .requests_total
            .get_or_create(&OutcomeLabels {
                outcome: Outcome::ServedFromCache,
            })
            .inc();

        let text = registry.encode().unwrap();
        assert!(text.contains("symproxy_origin_attempts_total 1"));
        assert!(text.contains("outcome=\"ServedFromCache\""));
        assert!(text.ends_with("# EOF\n"));
    }
}

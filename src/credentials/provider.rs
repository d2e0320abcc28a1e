use std::sync::Arc;

use anyhow::Result;
use tracing::{debug, info, instrument, warn};

use crate::config::IdentityConfig;
use crate::metrics::{MetricsRegistry, TokenLabels, TokenResult};

use super::ambient::AmbientCredential;
use super::client_credentials::ClientCredentials;
use super::{TokenCache, TokenSource, default_scope};

/// Hands out bearer tokens for origin requests, authenticating at most once
/// per token lifetime.
pub struct CredentialProvider {
    cache: Arc<TokenCache>,
    source: Box<dyn TokenSource>,
    /// Serialises refreshes so concurrent misses share one round trip.
    refresh: tokio::sync::Mutex<()>,
    metrics: MetricsRegistry,
}

impl CredentialProvider {
    pub fn new(
        cache: Arc<TokenCache>,
        source: Box<dyn TokenSource>,
        metrics: MetricsRegistry,
    ) -> Self {
        Self {
            cache,
            source,
            refresh: tokio::sync::Mutex::new(()),
            metrics,
        }
    }

    /// Build a provider whose source is picked from the identity section.
    pub fn from_config(
        identity: &IdentityConfig,
        http: reqwest::Client,
        cache: Arc<TokenCache>,
        metrics: MetricsRegistry,
    ) -> Self {
        let source = select_source(identity, identity.client_secret(), http);
        info!(source = source.name(), tenant = %identity.tenant_id, "credential provider initialised");
        Self::new(cache, source, metrics)
    }

    pub fn source_name(&self) -> &'static str {
        self.source.name()
    }

    /// Return a usable bearer token, authenticating only when the cache holds
    /// no valid entry.
    ///
    /// `Ok(None)` means no credential source is available.  Errors are never
    /// cached; the next call authenticates again.
    #[instrument(skip(self), fields(source = self.source.name()))]
    pub async fn acquire_token(&self) -> Result<Option<String>> {
        if let Some(token) = self.cached() {
            return Ok(Some(token));
        }

        let _guard = self.refresh.lock().await;

        // Another task may have refreshed while we waited.
        if let Some(token) = self.cached() {
            return Ok(Some(token));
        }

        match self.source.fetch_token().await {
            Ok(Some(token)) => {
                self.cache.put(&token.secret, token.expires_at);
                self.record(TokenResult::Issued);
                debug!(expires_at = %token.expires_at, "access token acquired");
                Ok(Some(token.secret))
            }
            Ok(None) => {
                self.record(TokenResult::Unavailable);
                warn!("no credential source available");
                Ok(None)
            }
            Err(e) => {
                self.record(TokenResult::Failed);
                warn!(error = %e, "error acquiring access token");
                Err(e.context("failed to acquire access token"))
            }
        }
    }

    fn cached(&self) -> Option<String> {
        if !self.cache.has_any() {
            return None;
        }
        let token = self.cache.find_valid()?;
        self.record(TokenResult::Cached);
        Some(token.secret)
    }

    fn record(&self, result: TokenResult) {
        self.metrics
            .metrics
            .token_requests_total
            .get_or_create(&TokenLabels {
                source: self.source.name(),
                result,
            })
            .inc();
    }
}

/// Client credentials when id, secret and audience are all present, the
/// ambient chain otherwise.
pub fn select_source(
    identity: &IdentityConfig,
    client_secret: Option<String>,
    http: reqwest::Client,
) -> Box<dyn TokenSource> {
    let audience = identity.audience.as_deref().unwrap_or_default();
    let client_id = identity.client_id.as_deref().unwrap_or_default();
    let secret = client_secret.unwrap_or_default();

    if !client_id.is_empty() && !secret.is_empty() && !audience.is_empty() {
        Box::new(ClientCredentials::new(
            http,
            &identity.authority_host,
            &identity.tenant_id,
            client_id,
            &secret,
            &default_scope(audience),
        ))
    } else {
        Box::new(AmbientCredential::from_env(
            http,
            &identity.authority_host,
            audience,
        ))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration as StdDuration;

    use chrono::{Duration, Utc};

    use super::*;
    use crate::credentials::AccessToken;

    /// Source that issues a new token per call and counts the calls.
    struct Counting {
        calls: Arc<AtomicUsize>,
        lifetime: Duration,
        fail: bool,
    }

    #[async_trait::async_trait]
    impl TokenSource for Counting {
        fn name(&self) -> &'static str {
            "counting"
        }

        async fn fetch_token(&self) -> Result<Option<AccessToken>> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(StdDuration::from_millis(10)).await;
            if self.fail {
                anyhow::bail!("authority unavailable");
            }
            Ok(Some(AccessToken::new(
                format!("token-{n}"),
                Utc::now() + self.lifetime,
            )))
        }
    }

    fn provider(lifetime: Duration, fail: bool) -> (CredentialProvider, Arc<AtomicUsize>) {
        let calls = Arc::new(AtomicUsize::new(0));
        let source = Counting {
            calls: Arc::clone(&calls),
            lifetime,
            fail,
        };
        let provider = CredentialProvider::new(
            Arc::new(TokenCache::new()),
            Box::new(source),
            MetricsRegistry::new(),
        );
        (provider, calls)
    }

    fn identity() -> IdentityConfig {
        IdentityConfig {
            tenant_id: "contoso".to_string(),
            audience: Some("api://symbols".to_string()),
            client_id: Some("app-id".to_string()),
            client_secret_env: "UNUSED".to_string(),
            authority_host: "https://login.example.com".to_string(),
        }
    }

    #[tokio::test]
    async fn second_call_reuses_cached_token() {
        let (provider, calls) = provider(Duration::hours(1), false);
        let first = provider.acquire_token().await.unwrap().unwrap();
        let second = provider.acquire_token().await.unwrap().unwrap();
        assert_eq!(first, second);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn expired_token_triggers_new_authentication() {
        let (provider, calls) = provider(Duration::seconds(-1), false);
        let first = provider.acquire_token().await.unwrap().unwrap();
        let second = provider.acquire_token().await.unwrap().unwrap();
        assert_ne!(first, second);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        // The stale entry was reaped during the second lookup.
        assert_eq!(provider.cache.len(), 1);
    }

    #[tokio::test]
    async fn failures_are_surfaced_and_not_cached() {
        let (provider, calls) = provider(Duration::hours(1), true);
        assert!(provider.acquire_token().await.is_err());
        assert!(provider.acquire_token().await.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert!(!provider.cache.has_any());
    }

    #[tokio::test]
    async fn unavailable_source_yields_none() {
        struct Nothing;

        #[async_trait::async_trait]
        impl TokenSource for Nothing {
            fn name(&self) -> &'static str {
                "nothing"
            }

            async fn fetch_token(&self) -> Result<Option<AccessToken>> {
                Ok(None)
            }
        }

        let provider = CredentialProvider::new(
            Arc::new(TokenCache::new()),
            Box::new(Nothing),
            MetricsRegistry::new(),
        );
        assert!(provider.acquire_token().await.unwrap().is_none());
        assert!(!provider.cache.has_any());
    }

    #[tokio::test]
    async fn concurrent_misses_authenticate_once() {
        let (provider, calls) = provider(Duration::hours(1), false);
        let provider = Arc::new(provider);

        let tasks: Vec<_> = (0..16)
            .map(|_| {
                let provider = Arc::clone(&provider);
                tokio::spawn(async move { provider.acquire_token().await.unwrap().unwrap() })
            })
            .collect();

        let mut tokens = Vec::new();
        for task in tasks {
            tokens.push(task.await.unwrap());
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(tokens.iter().all(|t| t == &tokens[0]));
    }

    #[test]
    fn full_triple_selects_client_credentials() {
        let source = select_source(&identity(), Some("secret".to_string()), reqwest::Client::new());
        assert_eq!(source.name(), "client_credentials");
    }

    #[test]
    fn missing_secret_falls_back_to_ambient() {
        let source = select_source(&identity(), None, reqwest::Client::new());
        assert_eq!(source.name(), "ambient");
    }

    #[test]
    fn missing_audience_falls_back_to_ambient() {
        let mut identity = identity();
        identity.audience = None;
        let source = select_source(&identity, Some("secret".to_string()), reqwest::Client::new());
        assert_eq!(source.name(), "ambient");
    }
}

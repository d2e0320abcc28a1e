//! OAuth2 client-credentials exchange against a tenant-scoped authority.

use anyhow::{Context, Result};
use chrono::{Duration, Utc};
use serde::Deserialize;
use tracing::{debug, instrument, warn};

use super::{AccessToken, TokenSource};

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    expires_in: i64,
}

#[derive(Debug, Default, Deserialize)]
struct TokenErrorResponse {
    #[serde(default)]
    error: String,
    #[serde(default)]
    error_description: String,
}

/// Confidential client that trades an id/secret pair for an app token.
pub struct ClientCredentials {
    http: reqwest::Client,
    token_url: String,
    client_id: String,
    client_secret: String,
    scope: String,
}

impl ClientCredentials {
    pub fn new(
        http: reqwest::Client,
        authority_host: &str,
        tenant_id: &str,
        client_id: &str,
        client_secret: &str,
        scope: &str,
    ) -> Self {
        Self {
            http,
            token_url: format!(
                "{}/{}/oauth2/v2.0/token",
                authority_host.trim_end_matches('/'),
                tenant_id
            ),
            client_id: client_id.to_string(),
            client_secret: client_secret.to_string(),
            scope: scope.to_string(),
        }
    }

    pub fn token_url(&self) -> &str {
        &self.token_url
    }
}

#[async_trait::async_trait]
impl TokenSource for ClientCredentials {
    fn name(&self) -> &'static str {
        "client_credentials"
    }

    #[instrument(skip(self), fields(token_url = %self.token_url, scope = %self.scope))]
    async fn fetch_token(&self) -> Result<Option<AccessToken>> {
        let params = [
            ("grant_type", "client_credentials"),
            ("client_id", self.client_id.as_str()),
            ("client_secret", self.client_secret.as_str()),
            ("scope", self.scope.as_str()),
        ];

        let resp = self
            .http
            .post(&self.token_url)
            .form(&params)
            .send()
            .await
            .context("failed to reach token endpoint")?;

        let status = resp.status();
        if !status.is_success() {
            let body: TokenErrorResponse = resp.json().await.unwrap_or_default();
            warn!(%status, error = %body.error, "client credentials exchange rejected");
            anyhow::bail!(
                "token endpoint returned {status}: {} {}",
                body.error,
                body.error_description
            );
        }

        let body: TokenResponse = resp
            .json()
            .await
            .context("failed to parse token endpoint response")?;

        let expires_at = Utc::now() + Duration::seconds(body.expires_in);
        debug!(%expires_at, "client credentials token issued");
        Ok(Some(AccessToken::new(body.access_token, expires_at)))
    }
}

#[cfg(test)]
mod tests {
    use wiremock::matchers::{body_string_contains, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use super::*;

    fn client(server: &MockServer) -> ClientCredentials {
        ClientCredentials::new(
            reqwest::Client::new(),
            &server.uri(),
            "contoso",
            "app-id",
            "app-secret",
            "api://symbols/.default",
        )
    }

    #[test]
    fn token_url_is_tenant_scoped() {
        let cc = ClientCredentials::new(
            reqwest::Client::new(),
            "https://login.example.com/",
            "tenant-1",
            "id",
            "secret",
            "scope",
        );
        assert_eq!(
            cc.token_url(),
            "https://login.example.com/tenant-1/oauth2/v2.0/token"
        );
    }

    #[tokio::test]
    async fn successful_exchange_returns_token() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/contoso/oauth2/v2.0/token"))
            .and(body_string_contains("grant_type=client_credentials"))
            .and(body_string_contains("client_id=app-id"))
            .and(body_string_contains("scope=api%3A%2F%2Fsymbols%2F.default"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "token_type": "Bearer",
                "expires_in": 3599,
                "access_token": "eyJ0eXAi",
            })))
            .expect(1)
            .mount(&server)
            .await;

        let before = Utc::now();
        let token = client(&server).fetch_token().await.unwrap().unwrap();
        assert_eq!(token.secret, "eyJ0eXAi");
        assert!(token.expires_at > before + Duration::seconds(3500));
    }

    #[tokio::test]
    async fn rejected_exchange_is_an_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(401).set_body_json(serde_json::json!({
                "error": "invalid_client",
                "error_description": "AADSTS7000215: Invalid client secret provided.",
            })))
            .mount(&server)
            .await;

        let err = client(&server).fetch_token().await.unwrap_err();
        assert!(err.to_string().contains("invalid_client"));
    }

    #[tokio::test]
    async fn provider_exchanges_once_for_back_to_back_calls() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/contoso/oauth2/v2.0/token"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "expires_in": 3599,
                "access_token": "shared-token",
            })))
            .expect(1)
            .mount(&server)
            .await;

        let provider = crate::credentials::CredentialProvider::new(
            std::sync::Arc::new(crate::credentials::TokenCache::new()),
            Box::new(client(&server)),
            crate::metrics::MetricsRegistry::new(),
        );
        let first = provider.acquire_token().await.unwrap();
        let second = provider.acquire_token().await.unwrap();
        assert_eq!(first.as_deref(), Some("shared-token"));
        assert_eq!(second, first);
    }
}

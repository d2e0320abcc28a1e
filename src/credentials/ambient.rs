//! Ambient credential chain.
//!
//! Used when no explicit client id/secret pair is configured.  Sources are
//! tried in order (environment, managed identity, Azure CLI) and the first
//! one that yields a token wins.

use std::time::Duration as StdDuration;

use anyhow::{Context, Result};
use chrono::{DateTime, Local, NaiveDateTime, TimeZone, Utc};
use serde::Deserialize;
use tokio::process::Command;
use tracing::{debug, instrument, warn};

use super::client_credentials::ClientCredentials;
use super::{AccessToken, TokenSource, default_scope, epoch_seconds, resource_for};

const IMDS_ENDPOINT: &str = "http://169.254.169.254/metadata/identity/oauth2/token";
const IMDS_API_VERSION: &str = "2018-02-01";
const APP_SERVICE_API_VERSION: &str = "2019-08-01";
const IMDS_PROBE_TIMEOUT: StdDuration = StdDuration::from_secs(2);

// ---------------------------------------------------------------------------
// Chain
// ---------------------------------------------------------------------------

/// Ordered list of ambient sources.
pub struct AmbientCredential {
    sources: Vec<Box<dyn TokenSource>>,
}

impl AmbientCredential {
    pub fn new(sources: Vec<Box<dyn TokenSource>>) -> Self {
        Self { sources }
    }

    /// Build the default chain for `audience` from the process environment.
    pub fn from_env(http: reqwest::Client, authority_host: &str, audience: &str) -> Self {
        let mut sources: Vec<Box<dyn TokenSource>> = Vec::new();
        if let Some(env) = environment_credential(http.clone(), authority_host, audience) {
            sources.push(Box::new(env));
        }
        sources.push(Box::new(ManagedIdentityCredential::from_env(http, audience)));
        sources.push(Box::new(AzureCliCredential::new(audience)));
        Self { sources }
    }
}

#[async_trait::async_trait]
impl TokenSource for AmbientCredential {
    fn name(&self) -> &'static str {
        "ambient"
    }

    async fn fetch_token(&self) -> Result<Option<AccessToken>> {
        let mut last_err = None;
        for source in &self.sources {
            match source.fetch_token().await {
                Ok(Some(token)) => {
                    debug!(source = source.name(), "ambient credential resolved");
                    return Ok(Some(token));
                }
                Ok(None) => debug!(source = source.name(), "ambient source unavailable"),
                Err(e) => {
                    warn!(source = source.name(), error = %e, "ambient source failed");
                    last_err = Some(e);
                }
            }
        }
        match last_err {
            Some(e) => Err(e.context("no ambient credential source produced a token")),
            None => Ok(None),
        }
    }
}

// ---------------------------------------------------------------------------
// Environment
// ---------------------------------------------------------------------------

/// Client credentials taken from `AZURE_TENANT_ID`, `AZURE_CLIENT_ID` and
/// `AZURE_CLIENT_SECRET`.  `AZURE_AUTHORITY_HOST` overrides the authority.
fn environment_credential(
    http: reqwest::Client,
    authority_host: &str,
    audience: &str,
) -> Option<ClientCredentials> {
    let var = |name: &str| std::env::var(name).ok().filter(|v| !v.is_empty());
    let tenant = var("AZURE_TENANT_ID")?;
    let client_id = var("AZURE_CLIENT_ID")?;
    let secret = var("AZURE_CLIENT_SECRET")?;
    let authority = var("AZURE_AUTHORITY_HOST").unwrap_or_else(|| authority_host.to_string());
    Some(ClientCredentials::new(
        http,
        &authority,
        &tenant,
        &client_id,
        &secret,
        &default_scope(resource_for(audience)),
    ))
}

// ---------------------------------------------------------------------------
// Managed identity
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct ManagedIdentityResponse {
    access_token: String,
    #[serde(deserialize_with = "epoch_seconds")]
    expires_on: DateTime<Utc>,
}

/// Token from the host's managed identity endpoint.
pub struct ManagedIdentityCredential {
    http: reqwest::Client,
    endpoint: String,
    api_version: &'static str,
    /// Secret header required by App Service style endpoints.
    identity_header: Option<String>,
    resource: String,
}

impl ManagedIdentityCredential {
    /// App Service endpoint when `IDENTITY_ENDPOINT`/`IDENTITY_HEADER` are
    /// present, the instance metadata service otherwise.
    pub fn from_env(http: reqwest::Client, audience: &str) -> Self {
        let endpoint = std::env::var("IDENTITY_ENDPOINT").ok();
        let header = std::env::var("IDENTITY_HEADER").ok();
        match (endpoint, header) {
            (Some(endpoint), Some(header)) => {
                Self::new(http, endpoint, APP_SERVICE_API_VERSION, Some(header), audience)
            }
            _ => Self::new(http, IMDS_ENDPOINT.to_string(), IMDS_API_VERSION, None, audience),
        }
    }

    pub fn new(
        http: reqwest::Client,
        endpoint: String,
        api_version: &'static str,
        identity_header: Option<String>,
        audience: &str,
    ) -> Self {
        Self {
            http,
            endpoint,
            api_version,
            identity_header,
            resource: resource_for(audience).to_string(),
        }
    }
}

#[async_trait::async_trait]
impl TokenSource for ManagedIdentityCredential {
    fn name(&self) -> &'static str {
        "managed_identity"
    }

    #[instrument(skip(self), fields(endpoint = %self.endpoint, resource = %self.resource))]
    async fn fetch_token(&self) -> Result<Option<AccessToken>> {
        let mut req = self
            .http
            .get(&self.endpoint)
            .query(&[("api-version", self.api_version), ("resource", self.resource.as_str())]);
        req = match &self.identity_header {
            Some(secret) => req.header("X-IDENTITY-HEADER", secret),
            None => req.header("Metadata", "true").timeout(IMDS_PROBE_TIMEOUT),
        };

        let resp = match req.send().await {
            Ok(resp) => resp,
            Err(e) if e.is_connect() || e.is_timeout() => {
                debug!(error = %e, "managed identity endpoint unreachable");
                return Ok(None);
            }
            Err(e) => return Err(e).context("managed identity request failed"),
        };

        let status = resp.status();
        // 400 means the host has no identity assigned; 404 means no endpoint.
        if status == reqwest::StatusCode::BAD_REQUEST || status == reqwest::StatusCode::NOT_FOUND {
            debug!(%status, "no managed identity assigned");
            return Ok(None);
        }
        if !status.is_success() {
            anyhow::bail!("managed identity endpoint returned {status}");
        }

        let body: ManagedIdentityResponse = resp
            .json()
            .await
            .context("failed to parse managed identity response")?;
        Ok(Some(AccessToken::new(body.access_token, body.expires_on)))
    }
}

// ---------------------------------------------------------------------------
// Azure CLI
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct CliTokenResponse {
    #[serde(rename = "accessToken")]
    access_token: String,
    /// Present in newer CLI releases.
    #[serde(default)]
    expires_on: Option<i64>,
    /// Local wall-clock time, e.g. `2024-05-01 13:45:12.000000`.
    #[serde(rename = "expiresOn", default)]
    expires_on_local: Option<String>,
}

/// Token borrowed from a logged-in `az` session.
pub struct AzureCliCredential {
    resource: String,
}

impl AzureCliCredential {
    pub fn new(audience: &str) -> Self {
        Self {
            resource: resource_for(audience).to_string(),
        }
    }
}

#[async_trait::async_trait]
impl TokenSource for AzureCliCredential {
    fn name(&self) -> &'static str {
        "azure_cli"
    }

    #[instrument(skip(self), fields(resource = %self.resource))]
    async fn fetch_token(&self) -> Result<Option<AccessToken>> {
        let output = match Command::new("az")
            .args(["account", "get-access-token", "--output", "json", "--resource"])
            .arg(&self.resource)
            .output()
            .await
        {
            Ok(output) => output,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("az not installed");
                return Ok(None);
            }
            Err(e) => return Err(e).context("failed to spawn az"),
        };

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            if stderr.contains("az login") {
                debug!("az has no logged-in session");
                return Ok(None);
            }
            anyhow::bail!("az get-access-token failed: {}", stderr.trim());
        }

        parse_cli_token(&output.stdout).map(Some)
    }
}

fn parse_cli_token(stdout: &[u8]) -> Result<AccessToken> {
    let body: CliTokenResponse =
        serde_json::from_slice(stdout).context("failed to parse az output")?;

    let expires_at = match (body.expires_on, body.expires_on_local.as_deref()) {
        (Some(secs), _) => Utc
            .timestamp_opt(secs, 0)
            .single()
            .context("az expires_on out of range")?,
        (None, Some(local)) => {
            let naive = NaiveDateTime::parse_from_str(local, "%Y-%m-%d %H:%M:%S%.f")
                .with_context(|| format!("unrecognised az expiresOn: {local}"))?;
            Local
                .from_local_datetime(&naive)
                .earliest()
                .context("az expiresOn is not a valid local time")?
                .with_timezone(&Utc)
        }
        (None, None) => anyhow::bail!("az output carries no expiry"),
    };

    Ok(AccessToken::new(body.access_token, expires_at))
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use wiremock::matchers::{header, method, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use super::*;

    struct Scripted {
        name: &'static str,
        result: fn() -> Result<Option<AccessToken>>,
        calls: Arc<AtomicUsize>,
    }

    #[async_trait::async_trait]
    impl TokenSource for Scripted {
        fn name(&self) -> &'static str {
            self.name
        }

        async fn fetch_token(&self) -> Result<Option<AccessToken>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            (self.result)()
        }
    }

    fn scripted(
        name: &'static str,
        result: fn() -> Result<Option<AccessToken>>,
    ) -> (Box<dyn TokenSource>, Arc<AtomicUsize>) {
        let calls = Arc::new(AtomicUsize::new(0));
        let source = Scripted {
            name,
            result,
            calls: Arc::clone(&calls),
        };
        (Box::new(source), calls)
    }

    fn some_token() -> Result<Option<AccessToken>> {
        Ok(Some(AccessToken::new(
            "ambient-token",
            Utc::now() + chrono::Duration::hours(1),
        )))
    }

    #[tokio::test]
    async fn chain_stops_at_first_token() {
        let (unavailable, first_calls) = scripted("none", || Ok(None));
        let (working, second_calls) = scripted("ok", some_token);
        let (never, third_calls) = scripted("never", some_token);
        let chain = AmbientCredential::new(vec![unavailable, working, never]);

        let token = chain.fetch_token().await.unwrap().unwrap();
        assert_eq!(token.secret, "ambient-token");
        assert_eq!(first_calls.load(Ordering::SeqCst), 1);
        assert_eq!(second_calls.load(Ordering::SeqCst), 1);
        assert_eq!(third_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn chain_with_nothing_available_is_absent() {
        let (a, _) = scripted("a", || Ok(None));
        let (b, _) = scripted("b", || Ok(None));
        let chain = AmbientCredential::new(vec![a, b]);
        assert!(chain.fetch_token().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn chain_surfaces_failure_when_nothing_succeeds() {
        let (broken, _) = scripted("broken", || Err(anyhow::anyhow!("denied")));
        let (absent, _) = scripted("absent", || Ok(None));
        let chain = AmbientCredential::new(vec![broken, absent]);
        assert!(chain.fetch_token().await.is_err());
    }

    #[tokio::test]
    async fn chain_recovers_after_failing_source() {
        let (broken, _) = scripted("broken", || Err(anyhow::anyhow!("denied")));
        let (working, _) = scripted("ok", some_token);
        let chain = AmbientCredential::new(vec![broken, working]);
        assert!(chain.fetch_token().await.unwrap().is_some());
    }

    #[tokio::test]
    async fn imds_token_is_parsed() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(header("Metadata", "true"))
            .and(query_param("resource", "api://symbols"))
            .and(query_param("api-version", IMDS_API_VERSION))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "access_token": "imds-token",
                "expires_on": "1900000000",
                "resource": "api://symbols",
                "token_type": "Bearer",
            })))
            .mount(&server)
            .await;

        let cred = ManagedIdentityCredential::new(
            reqwest::Client::new(),
            server.uri(),
            IMDS_API_VERSION,
            None,
            "api://symbols/.default",
        );
        let token = cred.fetch_token().await.unwrap().unwrap();
        assert_eq!(token.secret, "imds-token");
        assert_eq!(token.expires_at.timestamp(), 1_900_000_000);
    }

    #[tokio::test]
    async fn app_service_endpoint_sends_identity_header() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(header("X-IDENTITY-HEADER", "s3cret"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "access_token": "app-service-token",
                "expires_on": 1900000000,
            })))
            .expect(1)
            .mount(&server)
            .await;

        let cred = ManagedIdentityCredential::new(
            reqwest::Client::new(),
            server.uri(),
            APP_SERVICE_API_VERSION,
            Some("s3cret".to_string()),
            "api://symbols",
        );
        let token = cred.fetch_token().await.unwrap().unwrap();
        assert_eq!(token.secret, "app-service-token");
    }

    #[tokio::test]
    async fn missing_identity_is_unavailable() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(400))
            .mount(&server)
            .await;

        let cred = ManagedIdentityCredential::new(
            reqwest::Client::new(),
            server.uri(),
            IMDS_API_VERSION,
            None,
            "api://symbols",
        );
        assert!(cred.fetch_token().await.unwrap().is_none());
    }

    #[test]
    fn cli_output_with_epoch_expiry() {
        let out = br#"{"accessToken":"cli-token","expiresOn":"2030-01-01 00:00:00.000000","expires_on":1893456000,"tokenType":"Bearer"}"#;
        let token = parse_cli_token(out).unwrap();
        assert_eq!(token.secret, "cli-token");
        assert_eq!(token.expires_at.timestamp(), 1_893_456_000);
    }

    #[test]
    fn cli_output_with_local_expiry_only() {
        let out = br#"{"accessToken":"cli-token","expiresOn":"2030-01-01 00:00:00.000000"}"#;
        let token = parse_cli_token(out).unwrap();
        let expected = Local
            .with_ymd_and_hms(2030, 1, 1, 0, 0, 0)
            .earliest()
            .unwrap()
            .with_timezone(&Utc);
        assert_eq!(token.expires_at, expected);
    }

    #[test]
    fn cli_output_without_expiry_is_rejected() {
        assert!(parse_cli_token(br#"{"accessToken":"x"}"#).is_err());
    }
}

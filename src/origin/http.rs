use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use futures::StreamExt;
use reqwest::header;
use tracing::{debug, instrument};

use super::{OriginClient, OriginResponse};
use crate::config::OriginConfig;
use crate::credentials::CredentialProvider;

/// Build the shared outbound client used for origin and identity traffic.
pub fn build_client(config: &OriginConfig) -> Result<reqwest::Client> {
    reqwest::Client::builder()
        .user_agent(&config.user_agent)
        .connect_timeout(Duration::from_secs(config.connect_timeout_secs))
        .pool_idle_timeout(Duration::from_secs(config.pool_idle_timeout_secs))
        .tcp_keepalive(Duration::from_secs(60))
        .build()
        .context("failed to build reqwest client")
}

/// Origin reached over HTTP(S), optionally with a bearer token.
#[derive(Clone)]
pub struct HttpOrigin {
    http: reqwest::Client,
    base_uri: String,
    credentials: Option<Arc<CredentialProvider>>,
}

impl HttpOrigin {
    pub fn new(
        http: reqwest::Client,
        base_uri: String,
        credentials: Option<Arc<CredentialProvider>>,
    ) -> Self {
        Self {
            http,
            base_uri,
            credentials,
        }
    }
}

#[async_trait::async_trait]
impl OriginClient for HttpOrigin {
    fn base_uri(&self) -> &str {
        &self.base_uri
    }

    #[instrument(skip(self))]
    async fn get(&self, url: &str) -> Result<OriginResponse> {
        let mut req = self.http.get(url);

        if let Some(credentials) = &self.credentials {
            match credentials.acquire_token().await? {
                Some(token) => req = req.bearer_auth(token),
                None => debug!("no bearer token available, sending unauthenticated"),
            }
        }

        // `send` resolves once the status line and headers are in.
        let resp = req.send().await.context("failed to reach origin")?;

        let status = resp.status();
        let content_length = resp.content_length();
        let content_type = resp
            .headers()
            .get(header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        debug!(%status, ?content_length, "origin responded");

        let body = resp
            .bytes_stream()
            .map(|chunk| chunk.map_err(std::io::Error::other))
            .boxed();

        Ok(OriginResponse {
            status,
            content_length,
            content_type,
            body,
        })
    }

    async fn check(&self) -> Result<()> {
        let resp = self
            .http
            .head(&self.base_uri)
            .send()
            .await
            .with_context(|| format!("HEAD {} failed", self.base_uri))?;
        anyhow::ensure!(
            !resp.status().is_server_error(),
            "HEAD {} returned {}",
            self.base_uri,
            resp.status()
        );
        Ok(())
    }
}

//! Outbound credential acquisition.
//!
//! Bearer tokens for origin requests come from either a client-credentials
//! exchange or an ambient credential chain, and are amortised through a
//! shared [`TokenCache`].

pub mod ambient;
pub mod client_credentials;
pub mod provider;
pub mod token_cache;

use anyhow::Result;
use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Deserializer};

pub use provider::CredentialProvider;
pub use token_cache::{AccessToken, TokenCache};

/// Anything that can mint a bearer token for the configured audience.
#[async_trait::async_trait]
pub trait TokenSource: Send + Sync {
    /// Short label used in logs and metrics.
    fn name(&self) -> &'static str;

    /// Request a fresh token.
    ///
    /// `Ok(None)` means the source is not available in this environment
    /// (no credentials configured, endpoint unreachable); `Err` means it is
    /// available but refused or failed.
    async fn fetch_token(&self) -> Result<Option<AccessToken>>;
}

/// Scope requested from a tenant-scoped authority for `audience`.
pub fn default_scope(audience: &str) -> String {
    format!("{}/.default", audience.trim_end_matches('/'))
}

/// Resource identifier for token endpoints that predate scopes.
pub fn resource_for(audience: &str) -> &str {
    audience.strip_suffix("/.default").unwrap_or(audience)
}

/// Token endpoints disagree on whether `expires_on` is a number or a string.
pub(crate) fn epoch_seconds<'de, D>(deserializer: D) -> Result<DateTime<Utc>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Int(i64),
        Str(String),
    }

    let secs = match Raw::deserialize(deserializer)? {
        Raw::Int(n) => n,
        Raw::Str(s) => s.trim().parse::<i64>().map_err(serde::de::Error::custom)?,
    };
    Utc.timestamp_opt(secs, 0)
        .single()
        .ok_or_else(|| serde::de::Error::custom(format!("expiry out of range: {secs}")))
}

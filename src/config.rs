use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Deserializer};

/// Retry count used when `origin.retry_count` is unset or unusable.
pub const DEFAULT_RETRY_COUNT: u32 = 2;

// ---------------------------------------------------------------------------
// Top-level config
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub origin: OriginConfig,
    pub proxy: ProxyConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    /// Outbound identity.  When absent, origin requests are sent without a
    /// bearer token.
    #[serde(default)]
    pub identity: Option<IdentityConfig>,
    /// Emit per-request diagnostics.
    #[serde(default)]
    pub verbose: bool,
}

// ---------------------------------------------------------------------------
// Origin
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct OriginConfig {
    /// Base URI of the authoritative symbol server.  Always ends with `/`
    /// once loaded.
    pub uri: String,
    /// Maximum number of attempts per symbol request.  Accepts integers or
    /// numeric strings; anything else falls back to [`DEFAULT_RETRY_COUNT`].
    #[serde(default, deserialize_with = "lenient_retry_count")]
    pub retry_count: Option<u32>,
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
    /// TCP connect timeout (seconds) for origin and identity requests.
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
    /// How long (seconds) an idle pooled connection is kept open.
    #[serde(default = "default_pool_idle_timeout")]
    pub pool_idle_timeout_secs: u64,
}

impl OriginConfig {
    /// Number of origin attempts per request, never less than one.
    pub fn effective_retry_count(&self) -> u32 {
        self.retry_count.unwrap_or(DEFAULT_RETRY_COUNT)
    }
}

fn default_user_agent() -> String {
    concat!("symproxy/", env!("CARGO_PKG_VERSION")).to_string()
}

fn default_connect_timeout() -> u64 {
    30
}

fn default_pool_idle_timeout() -> u64 {
    300
}

/// Accept `3`, `"3"`, or garbage.  Garbage and non-positive values map to
/// `None` so the default applies instead of failing the whole config.
fn lenient_retry_count<'de, D>(deserializer: D) -> Result<Option<u32>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = Option::<serde_yaml::Value>::deserialize(deserializer)?;
    let parsed = match raw {
        Some(serde_yaml::Value::Number(n)) => n.as_i64(),
        Some(serde_yaml::Value::String(s)) => s.trim().parse::<i64>().ok(),
        _ => None,
    };
    Ok(parsed
        .filter(|n| *n > 0)
        .map(|n| u32::try_from(n).unwrap_or(u32::MAX)))
}

// ---------------------------------------------------------------------------
// Proxy listener
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct ProxyConfig {
    pub listen_port: u16,
    #[serde(default = "default_listen_host")]
    pub listen_host: String,
}

impl ProxyConfig {
    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.listen_host, self.listen_port)
    }
}

fn default_listen_host() -> String {
    "127.0.0.1".to_string()
}

// ---------------------------------------------------------------------------
// Cache store
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Deserialize)]
pub struct StorageConfig {
    /// Object store used as the fast-path cache.  Absent means every request
    /// goes to the origin and nothing is written back.
    #[serde(default)]
    pub s3: Option<S3StorageConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct S3StorageConfig {
    pub bucket: String,
    pub region: String,
    /// Key prefix prepended to every symbol path.
    #[serde(default)]
    pub prefix: String,
    /// Custom endpoint for S3-compatible stores (MinIO, Ceph, ...).
    #[serde(default)]
    pub endpoint_url: Option<String>,
    #[serde(default = "bool_true")]
    pub force_path_style: bool,
}

fn bool_true() -> bool {
    true
}

// ---------------------------------------------------------------------------
// Identity
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct IdentityConfig {
    #[serde(default)]
    pub tenant_id: String,
    /// Token audience.  The client-credentials scope is `{audience}/.default`.
    #[serde(default)]
    pub audience: Option<String>,
    #[serde(default)]
    pub client_id: Option<String>,
    /// Name of the environment variable that holds the client secret.
    #[serde(default = "default_client_secret_env")]
    pub client_secret_env: String,
    #[serde(default = "default_authority_host")]
    pub authority_host: String,
}

impl IdentityConfig {
    /// Read the client secret from the configured environment variable.
    pub fn client_secret(&self) -> Option<String> {
        std::env::var(&self.client_secret_env)
            .ok()
            .filter(|s| !s.is_empty())
    }
}

fn default_client_secret_env() -> String {
    "SYMPROXY_CLIENT_SECRET".to_string()
}

fn default_authority_host() -> String {
    "https://login.microsoftonline.com".to_string()
}

// ---------------------------------------------------------------------------
// Loader
// ---------------------------------------------------------------------------

/// Load and validate a [`Config`] from a YAML file at `path`.
pub fn load_config<P: AsRef<Path>>(path: P) -> Result<Config> {
    let path = path.as_ref();
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config file: {}", path.display()))?;
    parse_config(&contents)
        .with_context(|| format!("failed to load config file: {}", path.display()))
}

/// Parse, normalise and validate YAML config text.
pub fn parse_config(contents: &str) -> Result<Config> {
    let mut config: Config = serde_yaml::from_str(contents).context("invalid YAML config")?;
    normalize_config(&mut config);
    validate_config(&config)?;
    Ok(config)
}

fn normalize_config(config: &mut Config) {
    let uri = config.origin.uri.trim();
    config.origin.uri = if uri.is_empty() || uri.ends_with('/') {
        uri.to_string()
    } else {
        format!("{uri}/")
    };
}

/// Basic sanity checks that cannot be expressed purely with serde.
fn validate_config(config: &Config) -> Result<()> {
    anyhow::ensure!(!config.origin.uri.is_empty(), "origin.uri is required");
    anyhow::ensure!(
        config.origin.uri.starts_with("http://") || config.origin.uri.starts_with("https://"),
        "origin.uri must be an http(s) URI"
    );
    anyhow::ensure!(config.proxy.listen_port != 0, "proxy.listen_port is required");
    if let Some(s3) = &config.storage.s3 {
        anyhow::ensure!(!s3.bucket.is_empty(), "storage.s3.bucket must not be empty");
    }
    Ok(())
}

mod config;
mod credentials;
mod health;
mod http;
mod metrics;
mod origin;
mod storage;

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::signal;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use crate::config::Config;
use crate::credentials::{CredentialProvider, TokenCache};
use crate::http::resolver::Resolver;
use crate::metrics::MetricsRegistry;
use crate::origin::{HttpOrigin, OriginClient};
use crate::storage::{CacheStore, S3CacheStore};

/// Exit status reserved for unusable configuration.
const EXIT_CONFIG_ERROR: i32 = 87;

// ---------------------------------------------------------------------------
// CLI
// ---------------------------------------------------------------------------

#[derive(Parser, Debug)]
#[command(name = "symproxy", about = "Read-through caching proxy for symbol servers")]
struct Cli {
    /// Path to the YAML configuration file.
    #[arg(short, long, default_value = "/etc/symproxy/config.yaml")]
    config: String,
}

// ---------------------------------------------------------------------------
// Shared application state
// ---------------------------------------------------------------------------

/// Global state shared across all request handlers.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub metrics: MetricsRegistry,
    pub resolver: Arc<Resolver>,
}

// ---------------------------------------------------------------------------
// Collaborator setup
// ---------------------------------------------------------------------------

async fn build_store(config: &Config) -> Result<Option<Arc<dyn CacheStore>>> {
    let Some(s3) = &config.storage.s3 else {
        tracing::info!("no cache store configured, running as a passthrough proxy");
        return Ok(None);
    };
    let store = S3CacheStore::from_config(s3)
        .await
        .with_context(|| format!("failed to set up cache store s3://{}", s3.bucket))?;
    Ok(Some(Arc::new(store)))
}

async fn build_credentials(
    config: &Config,
    http_client: &reqwest::Client,
    metrics: &MetricsRegistry,
) -> Option<Arc<CredentialProvider>> {
    let identity = config.identity.as_ref()?;
    let provider = Arc::new(CredentialProvider::from_config(
        identity,
        http_client.clone(),
        Arc::new(TokenCache::new()),
        metrics.clone(),
    ));

    // Warm the token cache so the first symbol request does not pay for it.
    match provider.acquire_token().await {
        Ok(Some(_)) => tracing::info!(source = provider.source_name(), "bearer token acquired"),
        Ok(None) => tracing::warn!(
            source = provider.source_name(),
            "no credential available at startup, origin requests will be unauthenticated until one is"
        ),
        Err(e) => tracing::warn!(
            source = provider.source_name(),
            error = %e,
            "initial token acquisition failed"
        ),
    }

    Some(provider)
}

// ---------------------------------------------------------------------------
// HTTP server (axum)
// ---------------------------------------------------------------------------

async fn run_http_server(state: AppState) -> Result<()> {
    let app = http::handler::create_router(Arc::new(state.clone()));

    let listen_addr = state.config.proxy.listen_addr();
    let listener = tokio::net::TcpListener::bind(&listen_addr)
        .await
        .with_context(|| format!("failed to bind HTTP listener on {listen_addr}"))?;

    tracing::info!(%listen_addr, "HTTP server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("HTTP server error")?;

    Ok(())
}

// ---------------------------------------------------------------------------
// Graceful shutdown
// ---------------------------------------------------------------------------

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => tracing::info!("received SIGINT"),
        () = terminate => tracing::info!("received SIGTERM"),
    }
}

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() -> Result<()> {
    // ---- CLI ----
    let cli = Cli::parse();

    // ---- Config ----
    let config = match config::load_config(&cli.config) {
        Ok(config) => Arc::new(config),
        Err(e) => {
            eprintln!("symproxy: configuration error: {e:#}");
            std::process::exit(EXIT_CONFIG_ERROR);
        }
    };

    // ---- Tracing ----
    let default_level = if config.verbose { "info,symproxy=debug" } else { "info" };
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    tracing::info!(config_path = %cli.config, origin = %config.origin.uri, "starting symproxy");
    if config.origin.retry_count.is_none() {
        tracing::warn!(
            retry_count = config.origin.effective_retry_count(),
            "origin.retry_count unset or invalid, using default"
        );
    }

    // ---- Infrastructure clients ----
    let http_client = origin::http::build_client(&config.origin)?;
    let metrics = MetricsRegistry::new();
    let store = build_store(&config).await?;
    let credentials = build_credentials(&config, &http_client, &metrics).await;
    if credentials.is_none() {
        tracing::info!("no identity configured, origin requests carry no bearer token");
    }

    // ---- Resolver ----
    let origin: Arc<dyn OriginClient> = Arc::new(HttpOrigin::new(
        http_client,
        config.origin.uri.clone(),
        credentials,
    ));
    let resolver = Resolver::new(store, origin, metrics.clone());

    // ---- App state ----
    let state = AppState {
        config: Arc::clone(&config),
        metrics,
        resolver: Arc::new(resolver),
    };

    run_http_server(state).await?;

    tracing::info!("symproxy shut down cleanly");
    Ok(())
}

mod blob_store;
mod config;
mod engine;
mod error;
mod ledger;

use chrono::Duration as ChronoDuration;
use tracing::info;
use tracing_subscriber::EnvFilter;

use parlo_auth::TokenService;
use parlo_session::{KvClient, SessionStore};
use parlo_store::Database;

use crate::blob_store::BlobStore;
use crate::config::{Environment, ServerConfig};
use crate::engine::UdpServer;
use crate::ledger::MessageLedger;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,parlo_server=debug")),
        )
        .init();

    info!("Starting Parlo relay server v{}", env!("CARGO_PKG_VERSION"));

    let config = ServerConfig::from_env();
    config.validate().map_err(|e| {
        tracing::error!(error = %e, "invalid configuration");
        anyhow::anyhow!(e)
    })?;

    info!(
        env = ?config.env,
        udp_addr = %config.udp_addr,
        db_path = %config.db_path.display(),
        blob_bucket = %config.blob_bucket,
        "Configuration loaded"
    );

    let database = Database::open_at(&config.db_path)?;
    let ledger = MessageLedger::new(database);
    info!("Message ledger opened");

    let tokens = TokenService::new(
        &config.token_secret,
        chrono_duration(config.access_token_ttl),
        chrono_duration(config.refresh_token_ttl),
    );

    let kv = match (&config.kv_addr, config.env) {
        (Some(addr), _) => KvClient::connect(addr, config.kv_password.as_deref()).await?,
        (None, Environment::Test) => KvClient::memory(),
        (None, _) => anyhow::bail!("key/value address is required outside the test environment"),
    };
    let sessions = SessionStore::new(kv);
    info!("Session store connected");

    let blobs = BlobStore::new(
        config.blob_root.clone(),
        &config.blob_bucket,
        &config.blob_public_url,
    )
    .await?;

    let server = UdpServer::bind(&config.udp_addr, sessions, tokens, ledger, blobs).await?;
    server.start();

    wait_for_shutdown().await?;

    server.shutdown().await;
    info!("All servers stopped gracefully");

    Ok(())
}

/// Block until an interrupt or SIGTERM arrives.
#[cfg(unix)]
async fn wait_for_shutdown() -> std::io::Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = signal(SignalKind::terminate())?;
    tokio::select! {
        _ = tokio::signal::ctrl_c() => info!("Interrupt received"),
        _ = sigterm.recv() => info!("SIGTERM received"),
    }
    Ok(())
}

#[cfg(not(unix))]
async fn wait_for_shutdown() -> std::io::Result<()> {
    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received");
    Ok(())
}

fn chrono_duration(d: std::time::Duration) -> ChronoDuration {
    ChronoDuration::from_std(d).unwrap_or_else(|_| ChronoDuration::minutes(15))
}

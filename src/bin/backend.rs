#![forbid(unsafe_code)]

//! HTTP entry point for the media relay.
//!
//! Resolves a public video page URL into a direct media URL (yt-dlp first,
//! then the mirror pool) and streams the bytes back as an attachment.

use std::{
    net::{IpAddr, SocketAddr},
    path::PathBuf,
};

use anyhow::{Context, Result};
use clap::Parser;
use media_relay::config::{RuntimeOverrides, resolve_runtime_config};
use media_relay::server::{AppState, router};
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Parser)]
#[command(name = "media-relay", about = "Resolve and relay video downloads")]
struct Args {
    /// Port to listen on (overrides PORT).
    #[arg(long)]
    port: Option<u16>,

    /// Address to bind (overrides HOST).
    #[arg(long)]
    host: Option<String>,

    /// Directory of static web assets to serve (overrides WWW_ROOT).
    #[arg(long)]
    www_root: Option<PathBuf>,

    /// Env file with KEY=value lines.
    #[arg(long, default_value = media_relay::config::DEFAULT_ENV_PATH)]
    env_file: PathBuf,
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let Args {
        port,
        host,
        www_root,
        env_file,
    } = Args::parse();

    let config = resolve_runtime_config(RuntimeOverrides {
        port,
        host,
        www_root,
        env_path: Some(env_file),
    })
    .context("loading runtime config")?;

    let host: IpAddr = config
        .host
        .parse()
        .with_context(|| format!("invalid listen address {:?}", config.host))?;

    info!(
        ytdlp = %config.ytdlp_bin.display(),
        mirrors = config.mirrors.len(),
        www_root = ?config.www_root,
        "configuration loaded"
    );

    let app = router(AppState::from_config(&config));

    let addr = SocketAddr::new(host, config.port);
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding to {}", addr))?;
    info!("listening on http://{}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("running HTTP server")?;

    info!("server stopped");
    Ok(())
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}

async fn shutdown_signal() {
    // Only graceful shutdown is lost here; Ctrl+C still terminates the process.
    if let Err(err) = signal::ctrl_c().await {
        warn!(error = %err, "failed to install Ctrl+C handler");
    }
}

#![forbid(unsafe_code)]

use anyhow::Result;
use clap::Parser;
use pairchatd::config::{Args, ServerConfig};
use pairchatd::http::{install_recorder, start_http_server, HttpRateLimiter, HttpState};
use pairchatd::metrics::HealthState;
use pairchatd::moderation::ModerationGate;
use pairchatd::run_with_shutdown;
use pairchatd::server::ServerState;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    let args = Args::parse();
    let config: ServerConfig = args.into();

    // Validate configuration before starting
    if let Err(e) = config.validate() {
        anyhow::bail!("configuration error: {}", e);
    }

    let moderation = ModerationGate::from_config(&config)?;
    if moderation.is_enabled() {
        info!("moderation enabled via {}", config.moderation_url);
    } else {
        warn!("no moderation key configured, messages are relayed unchecked");
    }

    let state = Arc::new(ServerState::new(config.clone(), moderation));

    let listener = TcpListener::bind(config.listen).await?;
    info!("bound to {}", config.listen);

    let health_state = HealthState::new();
    let http_state = HttpState::new(
        health_state.clone(),
        HttpRateLimiter::new(
            Duration::from_secs(config.http_rate_window),
            config.http_rate_max,
        ),
        config.trust_proxy,
        install_recorder()?,
    )
    .with_chat_port(config.listen.port());
    let http_listener = TcpListener::bind(config.http_listen).await?;
    tokio::spawn({
        let static_dir = config.static_dir.clone();
        async move {
            if let Err(e) = start_http_server(http_listener, http_state, static_dir).await {
                warn!("http server error: {}", e);
            }
        }
    });

    let (shutdown_tx, shutdown_rx) = watch::channel(());
    let mut server = tokio::spawn(run_with_shutdown(listener, state, shutdown_rx));

    tokio::select! {
        result = &mut server => {
            match result {
                Ok(Err(e)) => tracing::error!("server error: {}", e),
                Err(e) => tracing::error!("server task failed: {}", e),
                Ok(Ok(())) => {}
            }
            return Ok(());
        }
        _ = tokio::signal::ctrl_c() => {
            info!("received shutdown signal");
        }
    }

    health_state.set_ready(false);
    let _ = shutdown_tx.send(());
    if let Err(e) = server.await {
        tracing::error!("server task failed: {}", e);
    }

    Ok(())
}

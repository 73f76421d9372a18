//! Binary entry point: loads config, selects a container runtime, starts the
//! HTTP/HTTPS listeners and (if enabled) the SOCKS5 front-door, then waits
//! for `Ctrl-C` to drive a graceful shutdown. Grounded on the teacher's
//! `cmux-proxy` binary wiring (`clap` CLI, `tracing-subscriber` init,
//! `Notify`-based shutdown signal shared across every listener).

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tokio::sync::Notify;
use tracing::{error, info};

use relaykeep::handlers::proxy::ProxyClient;
use relaykeep::state::AppState;
use relaykeep::{config, runtime, server, socks5};

/// A developer-facing HTTP mock/proxy server.
#[derive(Parser, Debug)]
#[command(name = "relaykeepd", version, about)]
struct Cli {
    /// Path to the JSON configuration document.
    #[arg(long, env = "RELAYKEEP_CONFIG")]
    config: Option<PathBuf>,

    /// Override the configured HTTP port.
    #[arg(long, env = "RELAYKEEP_HTTP_PORT")]
    http_port: Option<u16>,

    /// Override the configured HTTPS port.
    #[arg(long, env = "RELAYKEEP_HTTPS_PORT")]
    https_port: Option<u16>,

    /// Override the configured SOCKS5 port.
    #[arg(long, env = "RELAYKEEP_SOCKS5_PORT")]
    socks5_port: Option<u16>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    let mut cfg = match &cli.config {
        Some(path) => {
            let raw = tokio::fs::read_to_string(path).await?;
            config::load(&raw)?
        }
        None => {
            let mut cfg = config::Config::default();
            config::migrate(&mut cfg);
            cfg
        }
    };

    if let Some(port) = cli.http_port {
        cfg.http_port = port;
    }
    if let Some(port) = cli.https_port {
        cfg.tls.https_port = port;
    }
    if let Some(port) = cli.socks5_port {
        cfg.socks5.port = port;
    }

    let container_runtime = runtime::select_runtime().await;
    if container_runtime.is_none() {
        let needs_runtime = cfg
            .endpoints
            .iter()
            .any(|e| matches!(e.config, config::EndpointConfig::Container { .. }));
        if needs_runtime {
            error!("a container endpoint is configured but no container runtime is available");
        }
    }

    let socks5_cfg = cfg.socks5.clone();
    let state = AppState::new(cfg, container_runtime)?;
    let proxy_client = ProxyClient::new();
    let shutdown = Arc::new(Notify::new());

    let handles = server::start(state.clone(), proxy_client.clone(), shutdown.clone()).await?;
    info!(http = %handles.http_addr, https = ?handles.https_addr, "relaykeepd listening");

    let socks5_handles = if socks5_cfg.enabled {
        let h = socks5::start(
            state.clone(),
            socks5_cfg.port,
            socks5_cfg.username.clone(),
            socks5_cfg.password.clone(),
            handles.loopback_http_addr,
            handles.loopback_https_addr,
            shutdown.clone(),
        )
        .await?;
        info!(addr = %h.addr, "socks5 front-door listening");
        Some(h)
    } else {
        None
    };

    tokio::signal::ctrl_c().await?;
    info!("shutdown signal received");

    server::shutdown(&state, &shutdown, handles).await;
    if let Some(h) = socks5_handles {
        h.join().await;
    }

    Ok(())
}

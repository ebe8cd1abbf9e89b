//! toolgate — orchestration gateway for sandboxed tool-calling code.
//!
//! Serves the execute operation over stdio (and optionally HTTP), brokers
//! sandbox tool calls to downstream servers, and shuts down gracefully on
//! SIGINT/SIGTERM.

use std::sync::Arc;

use anyhow::{Context, Result};
use toolgate_config::GatewayConfig;
use toolgate_server::{frontend, GatewayServer};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    let args: Vec<String> = std::env::args().collect();
    if args.iter().any(|a| a == "--version" || a == "-V") {
        println!("toolgate {}", env!("CARGO_PKG_VERSION"));
        return Ok(());
    }

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let config = match toolgate_config::find_config_file() {
        Some(path) => {
            tracing::info!(path = %path.display(), "loading config");
            GatewayConfig::from_file(&path)
                .with_context(|| format!("failed to load config from {}", path.display()))?
        }
        None => {
            tracing::info!("no config file found, starting with no downstream servers");
            GatewayConfig::from_json_with_env("{}")?
        }
    };

    // Bind the HTTP front-end before anything else so a taken port fails
    // startup with a non-zero exit.
    let http_listener = match &config.http_listen {
        Some(addr) => Some(
            tokio::net::TcpListener::bind(addr)
                .await
                .with_context(|| format!("cannot bind HTTP front-end on {addr}"))?,
        ),
        None => None,
    };

    let server =
        Arc::new(GatewayServer::from_config(&config).context("failed to assemble gateway")?);
    server.start().await;

    tracing::info!(
        servers = server.pool().health().len(),
        http = config.http_listen.is_some(),
        "toolgate gateway starting"
    );

    let http_task = http_listener.map(|listener| {
        let server = server.clone();
        tokio::spawn(async move {
            if let Err(e) = frontend::serve_http_listener(server, listener).await {
                tracing::error!(error = %e, "HTTP front-end exited with error");
            }
        })
    });

    let stdio_task = tokio::spawn(frontend::serve_stdio(server.clone()));

    tokio::select! {
        result = stdio_task => {
            if let Err(e) = result {
                tracing::warn!(error = %e, "stdio front-end task failed");
            }
        }
        _ = terminate_signal() => {
            tracing::info!("received shutdown signal, draining");
        }
    }

    server.shutdown().await;
    if let Some(task) = http_task {
        task.abort();
    }
    Ok(())
}

/// Resolves on SIGINT or, on Unix, SIGTERM.
async fn terminate_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = match signal(SignalKind::terminate()) {
            Ok(s) => s,
            Err(e) => {
                tracing::warn!(error = %e, "cannot install SIGTERM handler");
                let _ = tokio::signal::ctrl_c().await;
                return;
            }
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}

//! cadence server binary.
//!
//! Starts the axum server with structured logging, database initialization
//! and graceful shutdown on SIGTERM/SIGINT. Live sessions are stopped before
//! the process exits.

use cadence_server::{app, build_state, config};
use std::net::SocketAddr;
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;

/// Config file path and where it came from: the first CLI argument, then
/// `CADENCE_CONFIG_PATH`, then `config.toml` in the working directory.
fn resolve_config_path() -> (String, &'static str) {
    let arg = std::env::args().nth(1);
    let env = std::env::var("CADENCE_CONFIG_PATH").ok();
    [(arg, "cli-arg"), (env, "env-var")]
        .into_iter()
        .find_map(|(path, source)| {
            path.filter(|p| !p.trim().is_empty())
                .map(|p| (p, source))
        })
        .unwrap_or_else(|| ("config.toml".to_string(), "default"))
}

#[tokio::main]
async fn main() {
    let (config_path, config_source) = resolve_config_path();
    let config = config::load_config(Some(config_path.as_str()))
        .expect("failed to load configuration; the server cannot start without valid config");

    let filter =
        EnvFilter::try_new(&config.logging.level).unwrap_or_else(|_| EnvFilter::new("info"));

    if config.logging.json {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .json()
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }

    tracing::info!(
        source = config_source,
        path = %config_path,
        "configuration loaded"
    );
    tracing::debug!(llm = ?config.llm, livekit = ?config.livekit, "effective configuration");

    let state = build_state(&config).expect("failed to initialize server state");
    let manager = state.manager.clone();

    let addr = SocketAddr::new(config.server.host, config.server.port);
    tracing::info!(%addr, "starting cadence server");

    let listener = TcpListener::bind(addr)
        .await
        .expect("failed to bind to address; is another process using this port?");

    axum::serve(listener, app(state))
        .with_graceful_shutdown(shutdown_signal())
        .await
        .expect("server error");

    manager.shutdown().await;
    tracing::info!("cadence server shut down");
}

/// Resolves on SIGINT, or SIGTERM on unix.
async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut terminate =
            signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
        tokio::select! {
            result = tokio::signal::ctrl_c() => {
                result.expect("failed to install Ctrl+C handler");
                tracing::info!("received SIGINT, shutting down");
            }
            _ = terminate.recv() => tracing::info!("received SIGTERM, shutting down"),
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
        tracing::info!("received SIGINT, shutting down");
    }
}

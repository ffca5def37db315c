//! sandboxd — containerized code-execution sandbox service.
//!
//! One port serves the HTTP API, MCP (JSON-RPC) tools, the sandboxed
//! filesystem and a WebSocket terminal. Startup restores a prior migration
//! checkpoint (or installs the requested environment), runs the user init
//! script, then flips readiness; an idle monitor shuts the container down
//! when nobody is using it.

mod config;
mod constants;
mod error;
mod executor;
mod fsops;
mod http;
mod kv;
mod lifecycle;
mod mcp;
mod migration;
mod paths;
mod runner;
mod setup;
mod shell;
mod state;
mod types;

use std::net::SocketAddr;

use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cfg = config::Config::from_env();
    info!(
        port = cfg.port,
        local_mode = cfg.local_mode,
        sandbox_root = %cfg.sandbox_root.display(),
        version = constants::VERSION,
        "starting sandbox service"
    );

    if !cfg.local_mode {
        tokio::fs::create_dir_all(&cfg.sandbox_root).await?;
    }

    let state = state::AppState::new(cfg);
    state.touch_activity();

    // Startup runs in the background: requests are admitted immediately and
    // /health reports initializing until the lifecycle completes.
    tokio::spawn(lifecycle::start(state.clone()));
    tokio::spawn(state::run_idle_monitor(state.clone()));
    if !state.config.local_mode {
        tokio::spawn(shell::run_terminal_supervisor(state.clone()));
    }

    let addr = SocketAddr::from(([0, 0, 0, 0], state.config.port));
    let router = http::build_router(state);
    info!(%addr, "listening");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, router).await?;
    Ok(())
}

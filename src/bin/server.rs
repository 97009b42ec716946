//! Gatehouse server binary
//!
//! Loads and validates configuration, wires the auth engines, and serves
//! the REST API until terminated.

use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use gatehouse::auth::ephemeral::EphemeralStore;
use gatehouse::config::Config;
use gatehouse::http_server::{build_router, AppState};

/// Gatehouse - a strict, explicit authentication and session core
#[derive(Parser, Debug)]
#[command(name = "gatehouse")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(long, default_value = "./gatehouse.toml")]
    config: PathBuf,

    /// Override the configured bind port
    #[arg(long)]
    port: Option<u16>,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "gatehouse=info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    if let Err(e) = run(cli).await {
        eprintln!("Server error: {}", e);
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<(), Box<dyn std::error::Error>> {
    let mut config = Config::load(&cli.config)?;
    if let Some(port) = cli.port {
        config.server.port = port;
    }

    let state = Arc::new(AppState::from_config(&config)?);
    spawn_ephemeral_sweeper(Arc::clone(&state));

    let router = build_router(Arc::clone(&state));
    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!(%addr, "gatehouse listening");
    axum::serve(listener, router).await?;
    Ok(())
}

/// Periodically drop expired blacklist entries, pending markers, and
/// setup stashes so the ephemeral store does not grow without bound
fn spawn_ephemeral_sweeper(state: Arc<AppState>) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(std::time::Duration::from_secs(60));
        loop {
            interval.tick().await;
            match state.ephemeral.purge_expired(chrono::Utc::now()) {
                Ok(purged) if purged > 0 => debug!(purged, "swept expired ephemeral entries"),
                Ok(_) => {}
                Err(e) => warn!(error = %e, "ephemeral sweep failed"),
            }
        }
    });
}

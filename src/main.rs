use std::{path::PathBuf, sync::Arc};

use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use mcphub::{build_router, Hub, SettingsStore};

#[derive(Parser, Debug)]
#[command(name = "mcp-hub", version, about = "Aggregating hub for MCP tool servers")]
struct Cli {
    /// Path to the settings document.
    #[arg(short, long, env = "MCPHUB_SETTINGS_PATH", default_value = "mcp_settings.json")]
    config: PathBuf,

    /// Listen host.
    #[arg(long, env = "MCPHUB_HOST", default_value = "0.0.0.0")]
    host: String,

    /// Listen port.
    #[arg(short, long, env = "MCPHUB_PORT", default_value_t = 3000)]
    port: u16,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();

    let store = Arc::new(SettingsStore::load(&cli.config).await?);
    let hub = Hub::new(store).await?;

    let router = build_router(Arc::clone(&hub));
    let listener = tokio::net::TcpListener::bind((cli.host.as_str(), cli.port)).await?;
    info!(host = %cli.host, port = cli.port, "MCP hub listening");

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    hub.shutdown().await;
    info!("Bye");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to install ctrl-c handler");
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}

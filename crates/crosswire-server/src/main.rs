//! `crosswire-server` binary: configuration from the environment, the
//! broadcast server on the configured transport and the admin API.

use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use crosswire_server::api::{self, AppState};
use crosswire_server::{Server, ServerConfig};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                EnvFilter::new("info,crosswire_server=debug,crosswire_transport=debug")
            }),
        )
        .init();

    info!("Starting crosswire server v{}", env!("CARGO_PKG_VERSION"));

    let config = ServerConfig::from_env();
    info!(?config, "Loaded configuration");

    let admin_addr = config.admin_addr;
    let server = Server::open(config).await?;
    server.start().await?;

    let state = AppState {
        server: server.clone(),
    };

    tokio::select! {
        result = api::serve(state, admin_addr) => {
            if let Err(e) = result {
                error!(error = %e, "admin API failed");
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down");
        }
    }

    server.shutdown().await;
    Ok(())
}

mod config;
mod logging;
mod server;

use anyhow::Result;
use clap::Parser;
use huddle_sfu::{LocalEngine, SignalingService};
use std::sync::Arc;
use tracing::info;

use config::Config;
use server::AppState;

#[derive(Parser, Debug)]
#[command(name = "huddle")]
#[command(about = "Huddle video conferencing SFU", long_about = None)]
struct Args {
    /// Configuration file (YAML or TOML)
    #[arg(long, env = "HUDDLE_CONFIG")]
    config: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // 1. Load configuration
    let config = Config::load(args.config.as_deref())?;

    // 2. Validate (fail fast on misconfigurations)
    if let Err(errors) = config.validate() {
        for e in &errors {
            eprintln!("Config validation error: {e}");
        }
        return Err(anyhow::anyhow!(
            "Configuration validation failed with {} error(s)",
            errors.len()
        ));
    }

    // 3. Initialize logging
    logging::init_logging(&config.logging)?;
    info!("Huddle server starting...");

    // 4. Signaling core
    let engine = Arc::new(LocalEngine::new(&config.sfu));
    let service = SignalingService::new(config.sfu.clone(), engine);
    info!(
        max_rooms = config.sfu.max_rooms,
        max_peers_per_room = config.sfu.max_peers_per_room,
        codecs = config.sfu.media_codecs.len(),
        "SFU initialized"
    );

    // 5. HTTP server
    let address = config.http_address();
    let state = AppState {
        service,
        server: Arc::new(config.server.clone()),
    };
    let app = server::router(state);
    let listener = tokio::net::TcpListener::bind(&address).await?;
    info!(address = %address, ws_path = %config.server.ws_path, "Listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("Huddle server stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}

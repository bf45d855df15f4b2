//! Relay entry point. Listens on `WS_PORT` (default 1234).

use env_logger::Env;
use whiteboard_relay::{RelayError, RelayServer, ServerConfig};

#[tokio::main]
async fn main() -> Result<(), RelayError> {
    dotenvy::dotenv().ok();
    env_logger::Builder::from_env(Env::default().default_filter_or("info")).init();

    let config = ServerConfig::from_env();
    let server = RelayServer::bind(config).await?;

    server
        .serve(async {
            let _ = tokio::signal::ctrl_c().await;
            log::info!("Shutting down server...");
        })
        .await
}

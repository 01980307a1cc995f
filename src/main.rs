//! Synclog Server Entry Point
//!
//! Boots a server node from environment configuration. Without a
//! `BACKEND_URL` the node has no business logic of its own, so the binary
//! is mostly useful in proxy mode, with auth/access/process delegated to
//! an HTTP backend.

use synclog::server::{Server, ServerEvent, ServerOptions};

#[tokio::main]
async fn main() {
    // Load environment variables from .env file if present
    dotenv::dotenv().ok();

    let env_filter = std::env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string());
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::new(&env_filter))
        .init();

    let options = ServerOptions {
        subprotocol: std::env::var("SUBPROTOCOL").ok(),
        supports: std::env::var("SUPPORTS").ok(),
        ..ServerOptions::default()
    }
    .load_env();

    let server = match Server::new(options) {
        Ok(server) => server,
        Err(error) => {
            tracing::error!("[Server] Invalid options ({}): {}", error.kind(), error);
            std::process::exit(1);
        }
    };

    match server.listen().await {
        Ok(info) => {
            tracing::info!("[Server] Node {} is up on {}", server.node_id(), info.addr);
        }
        Err(error) => {
            server.events().emit(ServerEvent::Fatal {
                message: error.to_string(),
            });
            server.destroy().await;
            std::process::exit(1);
        }
    }

    match tokio::signal::ctrl_c().await {
        Ok(()) => {
            tracing::info!("[Server] Shutting down");
            server.destroy().await;
        }
        Err(error) => {
            tracing::error!("[Server] Signal handling failed: {}", error);
            server.destroy().await;
            std::process::exit(1);
        }
    }
}

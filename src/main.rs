//! Secure TCP echo server.
//!
//! # Architecture Overview
//!
//! ```text
//! Client ──▶ net::Listener ──▶ pool::ConnectionPool
//!                                ├─ run    ──▶ Worker ──▶ HandlerService
//!                                ├─ queue  ──▶ parked until promoted
//!                                └─ reject ──▶ closed
//!
//! HandlerService ──▶ tls::ServerTlsContext (handshake, SessionCache)
//!                ──▶ ConnectionHandler (echo)
//! ```

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;

use secure_tcp_server::config::{load_config, ServerConfig};
use secure_tcp_server::lifecycle::signals::wait_for_signal;
use secure_tcp_server::observability::{logging, metrics};
use secure_tcp_server::{EchoHandler, ServerTlsContext, TcpServer};

#[derive(Parser)]
#[command(name = "secure-tcp-server")]
#[command(about = "Concurrent TCP echo server with optional TLS", long_about = None)]
struct Cli {
    /// Path to the TOML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Override the bind address
    #[arg(long)]
    bind: Option<String>,

    /// Override the maximum number of running connections
    #[arg(long)]
    max_threads: Option<usize>,

    /// Override the maximum number of queued connections
    #[arg(long)]
    max_queued: Option<usize>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => load_config(path)?,
        None => ServerConfig::default(),
    };
    if let Some(bind) = cli.bind {
        config.listener.bind_address = bind;
    }
    if let Some(max_threads) = cli.max_threads {
        config.pool.max_threads = max_threads;
    }
    if let Some(max_queued) = cli.max_queued {
        config.pool.max_queued = max_queued;
    }

    logging::init_logging(&config.observability);
    tracing::info!(version = env!("CARGO_PKG_VERSION"), "secure-tcp-server starting");

    if config.observability.metrics_enabled {
        match config.observability.metrics_address.parse() {
            Ok(addr) => metrics::init_metrics(addr),
            Err(_) => tracing::error!(
                metrics_address = %config.observability.metrics_address,
                "Failed to parse metrics address"
            ),
        }
    }

    let tls = config
        .tls
        .as_ref()
        .map(ServerTlsContext::from_config)
        .transpose()?;

    let server = TcpServer::bind(&config, Arc::new(EchoHandler), tls).await?;
    server.start()?;

    wait_for_signal().await;
    tracing::info!("Shutdown signal received");

    let stats = server.stop().await?;
    tracing::info!(
        total_connections = stats.total_connections,
        "Shutdown complete"
    );
    Ok(())
}

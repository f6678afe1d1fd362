use clap::Parser;
use log::{error, info};
use server::hub::HubConfig;
use server::network::{Server, ServerConfig};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Command line arguments
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Server IP address to bind to
    #[arg(short = 'H', long, default_value = "127.0.0.1")]
    host: String,

    /// Server port to listen on
    #[arg(short, long, default_value = "8080")]
    port: u16,

    /// Messages buffered per client before the hub waits on it
    #[arg(long, default_value = "16")]
    outbox_capacity: usize,

    /// Messages buffered in the shared publish queue
    #[arg(long, default_value = "64")]
    publish_queue: usize,

    /// Seconds a new connection may take to identify itself
    #[arg(long, default_value = "10")]
    handshake_timeout_secs: u64,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    if std::env::var("RUST_LOG").is_err() {
        eprintln!("Set RUST_LOG=info for detailed logging");
    }

    let args = Args::parse();

    let config = ServerConfig {
        hub: HubConfig {
            outbox_capacity: args.outbox_capacity,
            publish_queue: args.publish_queue,
            ..HubConfig::default()
        },
        handshake_timeout: Duration::from_secs(args.handshake_timeout_secs),
    };

    let shutdown = CancellationToken::new();
    let address = format!("{}:{}", args.host, args.port);
    let server = Server::bind(&address, config, shutdown.clone()).await?;

    // Handle shutdown gracefully
    let signal_token = shutdown.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("Received Ctrl+C, shutting down gracefully...");
                signal_token.cancel();
            }
            Err(e) => error!("Failed to listen for Ctrl+C: {}", e),
        }
    });

    server.run().await?;
    info!("Server stopped");

    Ok(())
}

use clap::Parser;
use client::input::LineInput;
use client::network::ChatClient;
use log::info;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Server address to connect to
    #[arg(short = 's', long, default_value = "127.0.0.1:8080")]
    server: String,

    /// User name announced to the server
    #[arg(short = 'u', long, default_value = "anonym")]
    user: String,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    let args = Args::parse();

    info!("Connecting to: {}", args.server);
    let client = ChatClient::connect(&args.server, &args.user).await?;

    tokio::select! {
        result = client.run(LineInput::stdin(), tokio::io::stdout()) => result?,
        _ = tokio::signal::ctrl_c() => info!("Received Ctrl+C, disconnecting"),
    }

    Ok(())
}

use anyhow::Result;
use clap::Parser;

use voxloop::config::Config;
use voxloop::gateway;

#[derive(Parser)]
#[command(name = "voxloop", version, about = "Streaming voice-to-voice chat server")]
struct Cli {
    /// Path to a TOML config file.
    #[arg(long)]
    config: Option<std::path::PathBuf>,
    /// Override the bind host.
    #[arg(long)]
    host: Option<String>,
    /// Override the bind port.
    #[arg(long)]
    port: Option<u16>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let mut config = Config::load(cli.config.as_deref())?;
    if let Some(host) = cli.host {
        config.server.host = host;
    }
    if let Some(port) = cli.port {
        config.server.port = port;
    }

    gateway::run_gateway(config).await
}

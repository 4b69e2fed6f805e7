use clap::Parser;
use rasd::{Config, Server};
use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

#[derive(Parser)]
#[command(name = "rasd")]
#[command(about = "ShareFS/Freeway file and printer server for RISC OS clients")]
struct Cli {
    /// IP address to bind the UDP sockets to (all interfaces by default)
    #[arg(short, long)]
    bind: Option<IpAddr>,

    /// Configuration file path
    #[arg(value_name = "CONFIG", default_value = "rasd.toml")]
    config: PathBuf,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let config = Arc::new(Config::load(&cli.config)?);

    // RUST_LOG overrides the configured level.
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(config.server.log_level.clone()));
    tracing_subscriber::fmt().with_env_filter(env_filter).init();

    info!(config = %cli.config.display(), "starting");
    if let Some(ip) = cli.bind {
        info!(%ip, "binding to specific address");
    }

    let server = Server::bind(config, cli.bind)?;
    server.run().await?;
    Ok(())
}

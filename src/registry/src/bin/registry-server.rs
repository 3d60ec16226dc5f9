use clap::Parser;
use docker_registry::{start_server, Config};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "registry-server", version, about = "Docker registry with a pull-through cache")]
struct Args {
    /// Path to the TOML configuration file
    #[arg(short, long, default_value = "configuration.toml")]
    config: PathBuf,

    /// Override the listen address, e.g. 127.0.0.1:5000
    #[arg(long)]
    bind: Option<String>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,tower_http=debug")),
        )
        .init();

    let args = Args::parse();
    let mut config = Config::load(&args.config)?;

    if let Some(bind) = args.bind {
        let (address, port) = bind
            .rsplit_once(':')
            .ok_or_else(|| format!("--bind expects <address>:<port>, got {}", bind))?;
        config.server.bind_address = address.to_string();
        config.server.port = port.parse()?;
    }

    tracing::info!(config = %args.config.display(), "Starting registry server");
    let handle = start_server(config).await?;
    tracing::info!("  API: http://{}/v2/", handle.local_addr);
    tracing::info!("  Health: http://{}/health", handle.local_addr);

    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutting down");
    handle.abort();

    Ok(())
}

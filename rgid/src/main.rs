use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use rgi_core::Server;
use tracing::info;

mod config;
mod executor;

#[derive(Parser)]
#[command(name = "rgid", about = "FastCGI gateway daemon for CGI programs")]
struct Cli {
    /// Listen address (TCP "host:port" or Unix socket path prefixed with
    /// "unix://"). Overrides the config file's `listen` field.
    #[arg(short, long)]
    listen: Option<String>,

    /// Path to configuration file.
    #[arg(short, long)]
    config: PathBuf,

    /// CGI script root directory. Overrides config.
    #[arg(short, long)]
    root: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let mut cfg = config::load_config(&cli.config)?;
    if let Some(listen) = cli.listen {
        cfg.listen = listen;
    }
    if let Some(root) = cli.root {
        cfg.scripts.root = root;
    }
    cfg.validate()?;

    let handler = Arc::new(executor::ScriptHandler::new(&cfg.scripts)?);
    let server = Server::bind(cfg.server_config())
        .await?
        .on_shutdown(|| info!("all connections closed"));
    let shutdown = server.shutdown_handle();

    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("interrupt received; shutting down");
            shutdown.shutdown();
        }
    });

    info!(root = %cfg.scripts.root.display(), "serving CGI scripts");
    server.serve(handler).await
}

use anyhow::{Context, Result};
use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};

use smart_launch::{logging, server, SmartConfig, SmartSession};

/// Loopback SMART-on-FHIR launch client
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Config file (defaults to ~/.smart-launch/config.json)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// OAuth client ID registered with the EHR
    #[arg(long)]
    client_id: Option<String>,

    /// Redirect URI registered with the EHR
    #[arg(long)]
    redirect_uri: Option<String>,

    /// Address for the launch/callback server
    #[arg(short, long)]
    listen: Option<String>,

    /// Directory for persisted session state
    #[arg(long)]
    state_dir: Option<PathBuf>,

    /// Directory for log files
    #[arg(long)]
    log_dir: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => SmartConfig::load_from(path)?,
        None => SmartConfig::load_or_default(),
    };
    if let Some(client_id) = args.client_id {
        config.client_id = client_id;
    }
    if let Some(redirect_uri) = args.redirect_uri {
        config.redirect_uri = redirect_uri;
    }
    if let Some(listen) = args.listen {
        config.listen_addr = listen;
    }
    if args.state_dir.is_some() {
        config.state_dir = args.state_dir;
    }
    if args.log_dir.is_some() {
        config.log_dir = args.log_dir;
    }
    config.validate().context("Invalid configuration")?;

    logging::init_logging(&config.log_dir()?)?;
    info!("SMART launch client starting...");

    let addr: SocketAddr = config
        .listen_addr
        .parse()
        .with_context(|| format!("Invalid listen address: {}", config.listen_addr))?;

    let session = Arc::new(SmartSession::from_config(config)?);
    match session.restore() {
        Ok(Some(_)) => info!("Resumed previous session"),
        Ok(None) => {}
        Err(e) => warn!("Stored session could not be restored, relaunch required: {}", e),
    }

    server::serve(session, addr).await?;
    info!("Shutdown complete");
    Ok(())
}

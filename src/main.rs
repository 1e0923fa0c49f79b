use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;

use loadshare::runtime::enforce::{ChargerPort, LogChargerPort};
use loadshare::runtime::{start_agent, NodeIdentity, SharedState};
use loadshare::{api, applog};

#[derive(Parser, Debug)]
#[command(name = "loadshare", version, about = "Cooperative EVSE load-sharing agent")]
struct Args {
    /// Directory for the persisted documents (peers and group config)
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// Port for the HTTP API
    #[arg(long, default_value_t = 8081)]
    http_port: u16,

    /// Stable device identifier; defaults to the hostname
    #[arg(long)]
    device_id: Option<String>,

    /// Host name this node is reachable under; defaults to `<hostname>.local`
    #[arg(long)]
    host: Option<String>,

    /// Also write a debug-level log file
    #[arg(long)]
    log_file: Option<PathBuf>,

    /// Debug-level terminal output
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    applog::setup_logger(args.verbose, args.log_file.as_deref())?;

    let data_dir = args.data_dir.unwrap_or_else(|| {
        dirs::data_local_dir()
            .map(|dir| dir.join("loadshare"))
            .unwrap_or_else(|| PathBuf::from("."))
    });
    std::fs::create_dir_all(&data_dir)
        .with_context(|| format!("failed to create data dir {}", data_dir.display()))?;

    let identity = NodeIdentity::resolve(args.device_id, args.host, args.http_port);
    let charger: Arc<dyn ChargerPort> = Arc::new(LogChargerPort::new());
    let (state, sync_rx) = SharedState::new(&data_dir, identity, charger)?;

    let tasks = start_agent(state.clone(), sync_rx);

    let listener = tokio::net::TcpListener::bind(("0.0.0.0", args.http_port))
        .await
        .with_context(|| format!("failed to bind HTTP port {}", args.http_port))?;
    log::info!("HTTP API listening on port {}", args.http_port);

    let shutdown = tasks.cancel.clone();
    axum::serve(listener, api::router(state))
        .with_graceful_shutdown(async move {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => log::info!("shutdown requested"),
                _ = shutdown.cancelled() => {}
            }
        })
        .await
        .context("HTTP server failed")?;

    tasks.shutdown().await;
    log::info!("shutdown complete");
    Ok(())
}

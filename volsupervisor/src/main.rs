use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use libstorage::{CephDriver, StorageDriver};
use libvolstore::{Client, StoreConfig, fetch_global, load_config, spawn_global_watch};
use log::{error, info};
use tokio::signal;
use tokio_util::sync::CancellationToken;
use volsupervisor::Supervisor;

#[derive(Parser, Debug)]
#[command(name = "volsupervisor", version, about = "Snapshot supervisor for volplugin volumes")]
struct Args {
    /// YAML file with the config store settings
    #[arg(short, long, env = "VOLPLUGIN_CONFIG")]
    config: Option<PathBuf>,

    /// Comma-separated etcd endpoints; overrides the config file
    #[arg(long, env = "ETCD_ENDPOINTS", value_delimiter = ',')]
    etcd: Vec<String>,

    #[arg(long, env = "VOLPLUGIN_PREFIX")]
    prefix: Option<String>,

    #[arg(short, long, env = "VOLPLUGIN_DEBUG")]
    debug: bool,

    /// Timeout for each `rbd` command
    #[arg(long, default_value = "60s", value_parser = humantime::parse_duration)]
    command_timeout: Duration,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("debug"))
        .format_timestamp_secs()
        .init();
    libvolstore::set_debug(args.debug);

    if let Err(e) = run(args).await {
        error!("{e:#}");
        std::process::exit(1);
    }
    Ok(())
}

async fn run(args: Args) -> anyhow::Result<()> {
    let mut store = match &args.config {
        Some(path) => load_config::<StoreConfig>(path)?,
        None => StoreConfig::default(),
    };
    if !args.etcd.is_empty() {
        store.endpoints = args.etcd.clone();
    }
    if let Some(prefix) = &args.prefix {
        store.prefix = prefix.clone();
    }

    let client = Client::connect(&store).await;
    let global = fetch_global(&client).await;

    let cancel = CancellationToken::new();
    let (global_rx, _global_task) =
        spawn_global_watch(&client, global, args.debug, cancel.clone());

    let host = gethostname::gethostname().to_string_lossy().into_owned();
    let holder = format!("{host}-{}", uuid::Uuid::new_v4());
    let driver: Arc<dyn StorageDriver> = Arc::new(CephDriver::new(args.command_timeout));
    info!("Starting volsupervisor {holder}");

    let shutdown = cancel.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        shutdown.cancel();
    });

    Supervisor::new(client, driver, holder, global_rx)
        .run(cancel)
        .await;
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("failed to listen for Ctrl+C: {e}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                error!("failed to install SIGTERM handler: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Shutting down...");
}

use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use libstorage::{CephDriver, FakeDriver, StorageDriver};
use libvolstore::{Client, StoreConfig, fetch_global, load_config, spawn_global_watch};
use log::{error, info};
use tokio::signal;
use tokio_util::sync::CancellationToken;
use volplugin::config::{Args, DriverKind, socket_path};
use volplugin::{AppState, Reconciler, Volumes, create_router, server};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // the global config decides the effective level at runtime
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
    let socket = socket_path(&args.plugin_dir, &args.plugin_name)
        .context("invalid plugin name")?;

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

    let host = match args.host_label {
        Some(label) => label,
        None => gethostname::gethostname().to_string_lossy().into_owned(),
    };
    let instance = format!("{host}-{}", uuid::Uuid::new_v4());
    let driver: Arc<dyn StorageDriver> = match args.driver {
        DriverKind::Ceph => Arc::new(CephDriver::new(args.command_timeout)),
        DriverKind::Fake => Arc::new(FakeDriver::new()),
    };
    info!("Starting volplugin {instance} on {host}");

    let volumes = Arc::new(Volumes::new(client, driver, host, instance, global_rx));
    let listener = server::bind(&socket).await?;

    let reconciler = Reconciler::new(volumes.clone(), args.reconcile_interval);
    let reconcile_task = tokio::spawn(reconciler.run(cancel.clone()));

    let router = create_router(Arc::new(AppState { volumes }));

    let shutdown = cancel.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        shutdown.cancel();
    });

    let served = server::serve(listener, &socket, router, cancel.clone()).await;
    cancel.cancel();
    let _ = reconcile_task.await;
    served
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

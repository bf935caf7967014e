use std::io;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use libstorage::{CephDriver, FakeDriver, StorageDriver};
use libvolstore::{Client, StoreConfig, XlineBackend, fetch_global, load_config};
use tokio::sync::watch;
use volcli::cli::{
    Cli, Commands, DriverArgs, DriverKind, GlobalCommand, MountCommand, PolicyCommand,
    VolumeCommand,
};
use volcli::commands;
use volplugin::Volumes;

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn"))
        .format_timestamp_secs()
        .init();
    let cli = Cli::parse();

    let mut store = match &cli.config {
        Some(path) => load_config::<StoreConfig>(path)?,
        None => StoreConfig::default(),
    };
    if !cli.etcd.is_empty() {
        store.endpoints = cli.etcd.clone();
    }
    if let Some(prefix) = &cli.prefix {
        store.prefix = prefix.clone();
    }
    let backend = XlineBackend::connect(&store)
        .await
        .with_context(|| format!("Failed to connect to etcd at {:?}", store.endpoints))?;
    let client = Client::new(Arc::new(backend), &store.prefix);

    let mut out = io::stdout().lock();
    match cli.command {
        Commands::Policy(cmd) => match cmd {
            PolicyCommand::Upload { name, file } => {
                let text = commands::read_source(&file)?;
                commands::policy_upload(&client, &name, &text, &mut out).await
            }
            PolicyCommand::Get { name } => commands::policy_get(&client, &name, &mut out).await,
            PolicyCommand::List => commands::policy_list(&client, &mut out).await,
            PolicyCommand::Delete { name } => {
                commands::policy_delete(&client, &name, &mut out).await
            }
        },
        Commands::Volume(cmd) => match cmd {
            VolumeCommand::Create { name, size, driver } => {
                let volumes = volumes(client, &driver).await;
                commands::volume_create(&volumes, &name, size, &mut out).await
            }
            VolumeCommand::Remove { name, driver } => {
                let volumes = volumes(client, &driver).await;
                commands::volume_remove(&volumes, &name, &mut out).await
            }
            VolumeCommand::Get { name } => commands::volume_get(&client, &name, &mut out).await,
            VolumeCommand::List => commands::volume_list(&client, &mut out).await,
        },
        Commands::Global(cmd) => match cmd {
            GlobalCommand::Get => commands::global_get(&client, &mut out).await,
            GlobalCommand::Set {
                debug,
                ttl,
                mount_base,
            } => commands::global_set(&client, debug, ttl, mount_base, &mut out).await,
        },
        Commands::Mount(MountCommand::List { host }) => {
            commands::mount_list(&client, host.as_deref(), &mut out).await
        }
    }
}

/// The same volume manager the daemon runs, acting as this host.
async fn volumes(client: Client, args: &DriverArgs) -> Volumes {
    let driver: Arc<dyn StorageDriver> = match args.driver {
        DriverKind::Ceph => Arc::new(CephDriver::new(args.command_timeout)),
        DriverKind::Fake => Arc::new(FakeDriver::new()),
    };
    let global = fetch_global(&client).await;
    let (_, global) = watch::channel(global.config);
    let host = gethostname::gethostname().to_string_lossy().into_owned();
    let instance = format!("volcli-{host}-{}", uuid::Uuid::new_v4());
    Volumes::new(client, driver, host, instance, global)
}

use std::path::PathBuf;
use std::time::Duration;

use clap::{Args, Parser, Subcommand, ValueEnum};

#[derive(Parser, Debug)]
#[command(name = "volcli")]
#[command(about = "Manage volplugin policies, volumes and mounts", long_about = None)]
pub struct Cli {
    /// YAML file with the config store settings
    #[arg(short, long, global = true, env = "VOLPLUGIN_CONFIG")]
    pub config: Option<PathBuf>,

    /// Comma-separated etcd endpoints; overrides the config file
    #[arg(long, global = true, env = "ETCD_ENDPOINTS", value_delimiter = ',')]
    pub etcd: Vec<String>,

    #[arg(long, global = true, env = "VOLPLUGIN_PREFIX")]
    pub prefix: Option<String>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    #[command(subcommand, about = "Upload, inspect and delete policies")]
    Policy(PolicyCommand),
    #[command(subcommand, about = "Create, inspect and remove volumes")]
    Volume(VolumeCommand),
    #[command(subcommand, about = "Read or change the cluster-wide settings")]
    Global(GlobalCommand),
    #[command(subcommand, about = "Inspect mount records")]
    Mount(MountCommand),
}

#[derive(Subcommand, Debug)]
pub enum PolicyCommand {
    #[command(about = "Validate an intent document and store it as a policy")]
    Upload {
        #[arg(value_name = "POLICY")]
        name: String,
        /// YAML or JSON intent; `-` reads standard input
        #[arg(value_name = "FILE")]
        file: PathBuf,
    },
    Get {
        #[arg(value_name = "POLICY")]
        name: String,
    },
    List,
    Delete {
        #[arg(value_name = "POLICY")]
        name: String,
    },
}

#[derive(Subcommand, Debug)]
pub enum VolumeCommand {
    Create {
        /// `policy/volume`
        #[arg(value_name = "NAME")]
        name: String,
        /// Size in MB; the policy's size when omitted
        #[arg(long)]
        size: Option<u64>,
        #[command(flatten)]
        driver: DriverArgs,
    },
    Remove {
        #[arg(value_name = "NAME")]
        name: String,
        #[command(flatten)]
        driver: DriverArgs,
    },
    Get {
        #[arg(value_name = "NAME")]
        name: String,
    },
    List,
}

#[derive(Subcommand, Debug)]
pub enum GlobalCommand {
    Get,
    Set {
        #[arg(long)]
        debug: Option<bool>,
        /// Lifetime of supervisor ownership claims, e.g. `30s`
        #[arg(long, value_parser = humantime::parse_duration)]
        ttl: Option<Duration>,
        #[arg(long)]
        mount_base: Option<PathBuf>,
    },
}

#[derive(Subcommand, Debug)]
pub enum MountCommand {
    List {
        /// Only mounts held by this host
        #[arg(long)]
        host: Option<String>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum DriverKind {
    Ceph,
    Fake,
}

#[derive(Args, Debug, Clone)]
pub struct DriverArgs {
    #[arg(long, value_enum, default_value_t = DriverKind::Ceph)]
    pub driver: DriverKind,

    /// Timeout for each storage backend command
    #[arg(long, default_value = "60s", value_parser = humantime::parse_duration)]
    pub command_timeout: Duration,
}

use std::path::{Path, PathBuf};
use std::time::Duration;

use clap::{Parser, ValueEnum};
use thiserror::Error;

pub const DEFAULT_PLUGIN_DIR: &str = "/run/docker/plugins";

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum DriverKind {
    /// Ceph RBD through the `rbd` CLI
    Ceph,
    /// In-memory driver, for trying the daemon without a storage cluster
    Fake,
}

#[derive(Parser, Debug)]
#[command(
    name = "volplugin",
    version,
    about = "Docker volume plugin for policy-managed Ceph volumes"
)]
pub struct Args {
    /// YAML file with the config store settings (endpoints, prefix, credentials)
    #[arg(short, long, env = "VOLPLUGIN_CONFIG")]
    pub config: Option<PathBuf>,

    /// Comma-separated etcd endpoints; overrides the config file
    #[arg(long, env = "ETCD_ENDPOINTS", value_delimiter = ',')]
    pub etcd: Vec<String>,

    /// Key prefix in the config store; overrides the config file
    #[arg(long, env = "VOLPLUGIN_PREFIX")]
    pub prefix: Option<String>,

    /// Name this host records on its mounts; defaults to the hostname
    #[arg(long, env = "VOLPLUGIN_HOST_LABEL")]
    pub host_label: Option<String>,

    /// Plugin name; the socket is <plugin-dir>/<plugin-name>.sock
    #[arg(long, env = "VOLPLUGIN_NAME", default_value = "volplugin")]
    pub plugin_name: String,

    #[arg(long, env = "VOLPLUGIN_PLUGIN_DIR", default_value = DEFAULT_PLUGIN_DIR)]
    pub plugin_dir: PathBuf,

    /// Turn on debug logging regardless of the global config
    #[arg(short, long, env = "VOLPLUGIN_DEBUG")]
    pub debug: bool,

    /// How often mounts are reconciled against the store
    #[arg(long, default_value = "10s", value_parser = humantime_duration)]
    pub reconcile_interval: Duration,

    /// Timeout for each storage backend command
    #[arg(long, default_value = "60s", value_parser = humantime_duration)]
    pub command_timeout: Duration,

    #[arg(long, value_enum, default_value_t = DriverKind::Ceph)]
    pub driver: DriverKind,
}

pub fn humantime_duration(s: &str) -> Result<Duration, String> {
    humantime::parse_duration(s).map_err(|e| e.to_string())
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("plugin name must not be empty")]
    EmptyPluginName,
    #[error("plugin name {0:?} must not contain a path separator")]
    PluginNameSeparator(String),
}

/// Path of the plugin socket, refusing names that would escape `plugin_dir`.
pub fn socket_path(plugin_dir: &Path, plugin_name: &str) -> Result<PathBuf, ConfigError> {
    if plugin_name.is_empty() {
        return Err(ConfigError::EmptyPluginName);
    }
    if plugin_name.contains(std::path::is_separator) {
        return Err(ConfigError::PluginNameSeparator(plugin_name.to_string()));
    }
    Ok(plugin_dir.join(format!("{plugin_name}.sock")))
}

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use common::DriverOptions;
use log::{debug, info, warn};
use serde::Deserialize;
use tokio::process::Command;
use tokio::time::timeout;

use crate::{DriverError, MountInfo, StorageDriver};

pub const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(60);

const PROC_MOUNTS: &str = "/proc/mounts";

/// Drives Ceph RBD images through the `rbd` CLI and the host's mount tools.
///
/// Every command runs under `command_timeout`; a command that overruns is
/// killed and reported as [`DriverError::Timeout`].
#[derive(Debug, Clone)]
pub struct CephDriver {
    rbd: PathBuf,
    command_timeout: Duration,
}

impl Default for CephDriver {
    fn default() -> Self {
        Self::new(DEFAULT_COMMAND_TIMEOUT)
    }
}

impl CephDriver {
    pub fn new(command_timeout: Duration) -> Self {
        Self {
            rbd: PathBuf::from("rbd"),
            command_timeout,
        }
    }

    pub fn with_rbd_binary(mut self, rbd: impl Into<PathBuf>) -> Self {
        self.rbd = rbd.into();
        self
    }

    async fn exec(&self, program: &Path, args: &[&str]) -> Result<Vec<u8>, DriverError> {
        let command = format!("{} {}", program.display(), args.join(" "));
        debug!("exec: {command}");

        let mut cmd = Command::new(program);
        cmd.args(args).kill_on_drop(true);
        let output = match timeout(self.command_timeout, cmd.output()).await {
            Err(_) => {
                return Err(DriverError::Timeout {
                    command,
                    after: self.command_timeout,
                });
            }
            Ok(Err(source)) => return Err(DriverError::Spawn { command, source }),
            Ok(Ok(output)) => output,
        };

        if !output.status.success() {
            return Err(DriverError::Failed {
                command,
                code: output.status.code(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(output.stdout)
    }

    /// Runs `rbd`, mapping "no such image" failures to [`DriverError::NotFound`].
    async fn rbd(&self, image: &str, args: &[&str]) -> Result<Vec<u8>, DriverError> {
        match self.exec(&self.rbd, args).await {
            Err(DriverError::Failed { stderr, .. })
                if stderr.contains("No such file or directory") =>
            {
                Err(DriverError::NotFound(image.to_string()))
            }
            other => other,
        }
    }

    async fn map(&self, image: &str) -> Result<String, DriverError> {
        let out = self.rbd(image, &["map", image]).await?;
        let device = String::from_utf8_lossy(&out).trim().to_string();
        if device.is_empty() {
            return Err(DriverError::Failed {
                command: format!("{} map {image}", self.rbd.display()),
                code: Some(0),
                stderr: "no device reported".to_string(),
            });
        }
        Ok(device)
    }

    async fn unmap(&self, image: &str) -> Result<(), DriverError> {
        match self.rbd(image, &["unmap", image]).await {
            Err(DriverError::Failed { stderr, .. }) if stderr.contains("not a mapped") => Ok(()),
            Err(DriverError::NotFound(_)) => Ok(()),
            other => other.map(|_| ()),
        }
    }
}

fn image_spec(name: &str, opts: &DriverOptions) -> String {
    format!("{}/{name}", opts.pool)
}

#[async_trait]
impl StorageDriver for CephDriver {
    async fn create(
        &self,
        name: &str,
        opts: &DriverOptions,
        size_mb: u64,
    ) -> Result<(), DriverError> {
        let image = image_spec(name, opts);
        let size = size_mb.to_string();
        self.rbd(&image, &["create", &image, "--size", &size]).await?;

        let device = self.map(&image).await?;
        let mkfs = PathBuf::from(format!("mkfs.{}", opts.filesystem));
        let formatted = self.exec(&mkfs, &[&device]).await;
        if let Err(e) = self.unmap(&image).await {
            warn!("Failed to unmap {image} after formatting: {e}");
        }
        if let Err(e) = formatted {
            warn!("Formatting {image} failed, removing it: {e}");
            if let Err(rm) = self.rbd(&image, &["rm", &image]).await {
                warn!("Failed to remove {image}: {rm}");
            }
            return Err(e);
        }
        info!("Created image {image} ({size_mb} MB, {})", opts.filesystem);
        Ok(())
    }

    async fn remove(&self, name: &str, opts: &DriverOptions) -> Result<(), DriverError> {
        let image = image_spec(name, opts);
        self.rbd(&image, &["snap", "purge", &image]).await?;
        self.rbd(&image, &["rm", &image]).await?;
        info!("Removed image {image}");
        Ok(())
    }

    async fn mount(
        &self,
        name: &str,
        opts: &DriverOptions,
        mountpoint: &Path,
    ) -> Result<MountInfo, DriverError> {
        let image = image_spec(name, opts);
        let device = self.map(&image).await?;

        let target = mountpoint.to_string_lossy().to_string();
        let mounted = match tokio::fs::create_dir_all(mountpoint).await {
            Ok(()) => self.exec(Path::new("mount"), &[&device, &target]).await,
            Err(e) => Err(e.into()),
        };
        if let Err(e) = mounted {
            if let Err(unmap) = self.unmap(&image).await {
                warn!("Failed to unmap {image} after failed mount: {unmap}");
            }
            return Err(e);
        }

        Ok(MountInfo {
            name: name.to_string(),
            pool: opts.pool.clone(),
            device,
            mountpoint: mountpoint.to_path_buf(),
        })
    }

    async fn unmount(
        &self,
        name: &str,
        opts: &DriverOptions,
        mountpoint: &Path,
    ) -> Result<(), DriverError> {
        let target = mountpoint.to_string_lossy().to_string();
        match self.exec(Path::new("umount"), &[&target]).await {
            Ok(_) => {}
            Err(DriverError::Failed { stderr, .. })
                if stderr.contains("not mounted") || stderr.contains("no mount point") => {}
            Err(e) => return Err(e),
        }
        self.unmap(&image_spec(name, opts)).await
    }

    async fn snapshot(
        &self,
        name: &str,
        opts: &DriverOptions,
        snap: &str,
    ) -> Result<(), DriverError> {
        let image = image_spec(name, opts);
        let spec = format!("{image}@{snap}");
        self.rbd(&image, &["snap", "create", &spec]).await?;
        Ok(())
    }

    async fn list_snapshots(
        &self,
        name: &str,
        opts: &DriverOptions,
    ) -> Result<Vec<String>, DriverError> {
        let image = image_spec(name, opts);
        let out = self
            .rbd(&image, &["snap", "ls", &image, "--format", "json"])
            .await?;
        parse_snapshots(&out).map_err(|source| DriverError::Parse {
            command: format!("rbd snap ls {image}"),
            source,
        })
    }

    async fn delete_snapshot(
        &self,
        name: &str,
        opts: &DriverOptions,
        snap: &str,
    ) -> Result<(), DriverError> {
        let image = image_spec(name, opts);
        let spec = format!("{image}@{snap}");
        self.rbd(&image, &["snap", "rm", &spec]).await?;
        Ok(())
    }

    async fn mounted(&self) -> Result<Vec<MountInfo>, DriverError> {
        let out = self
            .exec(&self.rbd, &["showmapped", "--format", "json"])
            .await?;
        let mapped = parse_showmapped(&out).map_err(|source| DriverError::Parse {
            command: "rbd showmapped".to_string(),
            source,
        })?;
        let mounts = tokio::fs::read_to_string(PROC_MOUNTS).await?;

        let mut result = Vec::with_capacity(mapped.len());
        for m in mapped {
            match mountpoint_of(&mounts, &m.device) {
                Some(mountpoint) => result.push(MountInfo {
                    name: m.name,
                    pool: m.pool,
                    device: m.device,
                    mountpoint,
                }),
                None => debug!("{} is mapped at {} but not mounted", m.name, m.device),
            }
        }
        Ok(result)
    }
}

#[derive(Debug, Deserialize)]
struct SnapEntry {
    id: u64,
    name: String,
}

/// Parses `rbd snap ls --format json`, oldest (lowest id) first.
fn parse_snapshots(out: &[u8]) -> Result<Vec<String>, serde_json::Error> {
    let mut entries: Vec<SnapEntry> = serde_json::from_slice(out)?;
    entries.sort_by_key(|e| e.id);
    Ok(entries.into_iter().map(|e| e.name).collect())
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
struct Mapped {
    pool: String,
    name: String,
    device: String,
    #[serde(default)]
    snap: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum Showmapped {
    List(Vec<Mapped>),
    /// Older releases key the entries by mapping id.
    ById(BTreeMap<String, Mapped>),
}

fn parse_showmapped(out: &[u8]) -> Result<Vec<Mapped>, serde_json::Error> {
    let all = match serde_json::from_slice(out)? {
        Showmapped::List(list) => list,
        Showmapped::ById(map) => map.into_values().collect(),
    };
    Ok(all
        .into_iter()
        .filter(|m| m.snap.as_deref().is_none_or(|s| s == "-"))
        .collect())
}

fn mountpoint_of(proc_mounts: &str, device: &str) -> Option<PathBuf> {
    proc_mounts.lines().find_map(|line| {
        let mut fields = line.split_whitespace();
        let dev = fields.next()?;
        let target = fields.next()?;
        (dev == device).then(|| PathBuf::from(target.replace("\\040", " ")))
    })
}

use std::collections::HashMap;
use std::fs;
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail};
use common::{Intent, MountState, VolumeName};
use libvolstore::Client;
use tabwriter::TabWriter;
use volplugin::Volumes;

/// Reads an intent document from `path`, or from stdin when it is `-`.
pub fn read_source(path: &Path) -> Result<String> {
    if path == Path::new("-") {
        let mut text = String::new();
        io::stdin()
            .read_to_string(&mut text)
            .context("Failed to read intent from stdin")?;
        return Ok(text);
    }
    fs::read_to_string(path)
        .with_context(|| format!("Failed to read intent from {}", path.display()))
}

/// JSON documents are accepted as well, being valid YAML.
pub fn parse_intent(text: &str) -> Result<Intent> {
    serde_yaml::from_str(text).context("Failed to parse intent document")
}

pub async fn policy_upload(
    client: &Client,
    name: &str,
    text: &str,
    out: &mut impl Write,
) -> Result<()> {
    let intent = parse_intent(text)?;
    let policy = client.upload_intent(name, intent).await?;
    writeln!(out, "Uploaded policy {}", policy.name)?;
    Ok(())
}

pub async fn policy_get(client: &Client, name: &str, out: &mut impl Write) -> Result<()> {
    let policy = client
        .get_policy(name)
        .await?
        .ok_or_else(|| anyhow!("policy {name} does not exist"))?;
    writeln!(out, "{}", serde_json::to_string_pretty(&policy)?)?;
    Ok(())
}

pub async fn policy_list(client: &Client, out: &mut impl Write) -> Result<()> {
    let (policies, _) = client.list_policies().await?;
    let mut tw = TabWriter::new(out);
    writeln!(tw, "NAME\tSNAPSHOTS\tFREQUENCY\tKEEP\tPOOL\tSIZE(MB)")?;
    for policy in policies {
        let snap = &policy.snapshot;
        writeln!(
            tw,
            "{}\t{}\t{}\t{}-{}\t{}\t{}",
            policy.name,
            if snap.enabled { "on" } else { "off" },
            humantime::format_duration(snap.frequency),
            snap.keep_min,
            snap.keep_max,
            policy.driver.pool,
            policy.driver.size_mb
        )?;
    }
    tw.flush()?;
    Ok(())
}

pub async fn policy_delete(client: &Client, name: &str, out: &mut impl Write) -> Result<()> {
    if client.delete_policy(name).await?.is_none() {
        bail!("policy {name} does not exist");
    }
    writeln!(out, "Deleted policy {name}")?;
    Ok(())
}

pub async fn volume_create(
    volumes: &Volumes,
    name: &str,
    size: Option<u64>,
    out: &mut impl Write,
) -> Result<()> {
    let mut opts = HashMap::new();
    if let Some(size) = size {
        opts.insert("size".to_string(), size.to_string());
    }
    let volume = volumes.create(name, &opts).await?;
    writeln!(out, "Created volume {} ({} MB)", volume.volume_name(), volume.size_mb)?;
    Ok(())
}

pub async fn volume_remove(volumes: &Volumes, name: &str, out: &mut impl Write) -> Result<()> {
    let volume = volumes.remove(name).await?;
    writeln!(out, "Removed volume {}", volume.volume_name())?;
    Ok(())
}

/// Prints the volume record with every host's mount of it.
pub async fn volume_get(client: &Client, name: &str, out: &mut impl Write) -> Result<()> {
    let name = VolumeName::parse(name)?;
    let volume = client
        .get_volume(&name)
        .await?
        .ok_or_else(|| anyhow!("volume {name} does not exist"))?;
    let mounts = client.volume_mounts(&name).await?;
    let doc = serde_json::json!({ "volume": volume, "mounts": mounts });
    writeln!(out, "{}", serde_json::to_string_pretty(&doc)?)?;
    Ok(())
}

pub async fn volume_list(client: &Client, out: &mut impl Write) -> Result<()> {
    let (volumes, _) = client.list_volumes().await?;
    let mut tw = TabWriter::new(out);
    writeln!(tw, "NAME\tSIZE(MB)\tCREATED")?;
    for volume in volumes {
        writeln!(
            tw,
            "{}\t{}\t{}",
            volume.volume_name(),
            volume.size_mb,
            volume.created_at.to_rfc3339_opts(chrono::SecondsFormat::Secs, true)
        )?;
    }
    tw.flush()?;
    Ok(())
}

pub async fn global_get(client: &Client, out: &mut impl Write) -> Result<()> {
    let global = client.get_global().await?.unwrap_or_default();
    writeln!(out, "{}", serde_json::to_string_pretty(&global)?)?;
    Ok(())
}

/// Changes only the given fields; the rest keep their stored values.
pub async fn global_set(
    client: &Client,
    debug: Option<bool>,
    ttl: Option<Duration>,
    mount_base: Option<PathBuf>,
    out: &mut impl Write,
) -> Result<()> {
    let mut global = client.get_global().await?.unwrap_or_default();
    if let Some(debug) = debug {
        global.debug = debug;
    }
    if let Some(ttl) = ttl {
        if ttl.as_secs() == 0 {
            bail!("ttl must be at least one second");
        }
        global.ttl_secs = ttl.as_secs();
    }
    if let Some(base) = mount_base {
        global.mount_base = base;
    }
    client.set_global(&global).await?;
    writeln!(out, "{}", serde_json::to_string_pretty(&global)?)?;
    Ok(())
}

pub async fn mount_list(client: &Client, host: Option<&str>, out: &mut impl Write) -> Result<()> {
    let mounts: Vec<(VolumeName, MountState)> = match host {
        Some(host) => client.host_mounts(host).await?,
        None => {
            let keys = client.keys();
            let (entries, _) = client.list::<MountState>(&keys.mounts()).await?;
            entries
                .into_iter()
                .filter_map(|(key, state)| keys.parse_mount(&key).map(|(name, _)| (name, state)))
                .collect()
        }
    };

    let mut tw = TabWriter::new(out);
    writeln!(tw, "VOLUME\tHOST\tMOUNTPOINT\tIDS\tMOUNTED")?;
    for (name, state) in mounts {
        writeln!(
            tw,
            "{}\t{}\t{}\t{}\t{}",
            name,
            state.host,
            state.mountpoint.display(),
            state.mount_ids.join(","),
            state.mounted_at.to_rfc3339_opts(chrono::SecondsFormat::Secs, true)
        )?;
    }
    tw.flush()?;
    Ok(())
}

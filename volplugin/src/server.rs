use std::io::ErrorKind;
use std::path::Path;

use anyhow::{Context, Result};
use axum::Router;
use log::{info, warn};
use tokio::net::UnixListener;
use tokio_util::sync::CancellationToken;

/// Binds the plugin socket, replacing one left behind by an earlier run.
pub async fn bind(socket: &Path) -> Result<UnixListener> {
    match tokio::fs::remove_file(socket).await {
        Ok(()) => warn!("Removed stale socket {}", socket.display()),
        Err(e) if e.kind() == ErrorKind::NotFound => {}
        Err(e) => {
            return Err(e).with_context(|| format!("removing stale socket {}", socket.display()));
        }
    }
    if let Some(dir) = socket.parent() {
        create_private_dir(dir)
            .await
            .with_context(|| format!("creating plugin directory {}", dir.display()))?;
    }
    UnixListener::bind(socket).with_context(|| format!("binding {}", socket.display()))
}

#[cfg(unix)]
async fn create_private_dir(dir: &Path) -> std::io::Result<()> {
    let mut builder = tokio::fs::DirBuilder::new();
    builder.recursive(true).mode(0o700);
    builder.create(dir).await
}

#[cfg(not(unix))]
async fn create_private_dir(dir: &Path) -> std::io::Result<()> {
    tokio::fs::create_dir_all(dir).await
}

/// Serves `router` on `listener` until `shutdown` fires, then removes the
/// socket file.
pub async fn serve(
    listener: UnixListener,
    socket: &Path,
    router: Router,
    shutdown: CancellationToken,
) -> Result<()> {
    info!("Listening on {}", socket.display());
    let served = axum::serve(listener, router)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
        .context("serving plugin protocol");

    match tokio::fs::remove_file(socket).await {
        Ok(()) => info!("Removed socket {}", socket.display()),
        Err(e) if e.kind() == ErrorKind::NotFound => {}
        Err(e) => warn!("Could not remove socket {}: {e}", socket.display()),
    }
    served
}

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tokio::process::Command;
use tracing::{debug, info};

const SSH_SCHEME: &str = "ssh:";

/// Where an artifact should land: a local path or a remote host path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Destination {
    Local(PathBuf),
    Remote { host: String, path: String },
}

impl Destination {
    /// Parses a destination spec. `ssh:<host>:<path>` selects remote copy,
    /// anything else is a local filesystem path.
    ///
    /// # Errors
    /// Returns error if an `ssh:` spec is missing the host or path part.
    pub fn parse(spec: &str) -> Result<Self> {
        if let Some(rest) = spec.strip_prefix(SSH_SCHEME) {
            let (host, path) = rest
                .split_once(':')
                .ok_or_else(|| anyhow::anyhow!("Bad ssh destination (want ssh:host:path): {spec}"))?;
            if host.is_empty() || path.is_empty() {
                anyhow::bail!("Bad ssh destination (want ssh:host:path): {spec}");
            }
            Ok(Self::Remote {
                host: host.to_string(),
                path: path.to_string(),
            })
        } else {
            Ok(Self::Local(PathBuf::from(spec)))
        }
    }

    /// The destination with `name` appended as a final path component.
    #[must_use]
    pub fn join(&self, name: &str) -> Self {
        match self {
            Self::Local(path) => Self::Local(path.join(name)),
            Self::Remote { host, path } => Self::Remote {
                host: host.clone(),
                path: format!("{}/{name}", path.trim_end_matches('/')),
            },
        }
    }
}

/// Copies `src` to `dest`. An empty destination spec is a no-op. A failed
/// copy (local or remote) is a fatal deployment error.
///
/// # Errors
/// Returns error if directory creation, the copy, or the remote transfer fails.
pub async fn place(label: &str, src: &Path, dest: &str) -> Result<()> {
    if dest.is_empty() {
        return Ok(());
    }
    match Destination::parse(dest)? {
        Destination::Local(target) => {
            if let Some(parent) = target.parent() {
                tokio::fs::create_dir_all(parent).await.with_context(|| {
                    format!("Failed to create directory {}", parent.display())
                })?;
            }
            tokio::fs::copy(src, &target).await.with_context(|| {
                format!("Failed to copy {label} to {}", target.display())
            })?;
            info!("Copied {label} to {}", target.display());
        }
        Destination::Remote { host, path } => {
            let target = format!("{host}:{path}");
            let status = Command::new("scp")
                .arg("-q")
                .arg(src)
                .arg(&target)
                .status()
                .await
                .with_context(|| format!("Failed to run scp for {label}"))?;
            if !status.success() {
                anyhow::bail!("Remote copy of {label} to {target} failed: {status}");
            }
            info!("Copied {label} to {target}");
        }
    }
    Ok(())
}

/// Removes `name` from underneath a destination spec. Used to tear down
/// challenge tokens; failures are reported but callers typically only log
/// them.
///
/// # Errors
/// Returns error if the local unlink or remote removal fails.
pub async fn remove(label: &str, dest: &str, name: &str) -> Result<()> {
    if dest.is_empty() {
        return Ok(());
    }
    match Destination::parse(dest)?.join(name) {
        Destination::Local(target) => {
            tokio::fs::remove_file(&target)
                .await
                .with_context(|| format!("Failed to remove {label} {}", target.display()))?;
            debug!("Removed {label} {}", target.display());
        }
        Destination::Remote { host, path } => {
            let status = Command::new("ssh")
                .arg(&host)
                .arg(format!("rm -f {path}"))
                .status()
                .await
                .with_context(|| format!("Failed to run ssh for {label} removal"))?;
            if !status.success() {
                anyhow::bail!("Remote removal of {label} {host}:{path} failed: {status}");
            }
            debug!("Removed {label} {host}:{path}");
        }
    }
    Ok(())
}

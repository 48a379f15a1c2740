use std::os::unix::fs::PermissionsExt;
use std::path::Path;

use anyhow::{Context, Result};
use tokio::fs;

const KEY_FILE_MODE: u32 = 0o600;
const TOKEN_FILE_MODE: u32 = 0o644;

/// Creates a directory and all parents.
///
/// # Errors
/// Returns an error if the directory cannot be created.
pub async fn ensure_dir(path: &Path) -> Result<()> {
    fs::create_dir_all(path)
        .await
        .with_context(|| format!("Failed to create directory {}", path.display()))
}

/// Writes a private key file with mode 0600.
///
/// # Errors
/// Returns an error if the file cannot be written or permissions set.
pub async fn write_private(path: &Path, contents: &str) -> Result<()> {
    if let Some(parent) = path.parent() {
        ensure_dir(parent).await?;
    }
    fs::write(path, contents)
        .await
        .with_context(|| format!("Failed to write {}", path.display()))?;
    fs::set_permissions(path, std::fs::Permissions::from_mode(KEY_FILE_MODE))
        .await
        .with_context(|| format!("Failed to set permissions on {}", path.display()))?;
    Ok(())
}

/// Writes a world-readable file regardless of the process umask. Challenge
/// tokens must be readable by the web server that serves them.
///
/// # Errors
/// Returns an error if the file cannot be written or permissions set.
pub async fn write_world_readable(path: &Path, contents: &str) -> Result<()> {
    if let Some(parent) = path.parent() {
        ensure_dir(parent).await?;
    }
    fs::write(path, contents)
        .await
        .with_context(|| format!("Failed to write {}", path.display()))?;
    fs::set_permissions(path, std::fs::Permissions::from_mode(TOKEN_FILE_MODE))
        .await
        .with_context(|| format!("Failed to set permissions on {}", path.display()))?;
    Ok(())
}

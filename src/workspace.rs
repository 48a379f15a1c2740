use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use nix::sys::stat::{Mode, umask};
use time::OffsetDateTime;
use time::macros::format_description;
use tracing::{debug, error, info, warn};

use crate::config::CONFIG_FILE_NAME;
use crate::hooks;

const TMP_DIR: &str = "tmp";
const DNS_VERIFY_DIR: &str = "dns_verify";
const ACCOUNT_KEY_FILE: &str = "account.key";
const CHAIN_FILE: &str = "chain.crt";

/// Restores the original process umask when dropped. Key material created
/// during a run must never be group or world readable.
pub struct UmaskGuard {
    original: Mode,
}

impl UmaskGuard {
    #[must_use]
    pub fn strict() -> Self {
        let original = umask(Mode::from_bits_truncate(0o077));
        Self { original }
    }
}

impl Drop for UmaskGuard {
    fn drop(&mut self) {
        umask(self.original);
    }
}

/// The per-domain on-disk layout under the working directory.
#[derive(Debug, Clone)]
pub struct Workspace {
    work_dir: PathBuf,
    domain: String,
}

impl Workspace {
    #[must_use]
    pub fn new(work_dir: PathBuf, domain: &str) -> Self {
        Self {
            work_dir,
            domain: domain.to_string(),
        }
    }

    #[must_use]
    pub fn work_dir(&self) -> &Path {
        &self.work_dir
    }

    #[must_use]
    pub fn domain(&self) -> &str {
        &self.domain
    }

    #[must_use]
    pub fn domain_dir(&self) -> PathBuf {
        self.work_dir.join(&self.domain)
    }

    #[must_use]
    pub fn tmp_dir(&self) -> PathBuf {
        self.domain_dir().join(TMP_DIR)
    }

    #[must_use]
    pub fn dns_verify_dir(&self) -> PathBuf {
        self.tmp_dir().join(DNS_VERIFY_DIR)
    }

    #[must_use]
    pub fn account_key_path(&self) -> PathBuf {
        self.work_dir.join(ACCOUNT_KEY_FILE)
    }

    #[must_use]
    pub fn domain_key_path(&self) -> PathBuf {
        self.domain_dir().join(format!("{}.key", self.domain))
    }

    #[must_use]
    pub fn csr_path(&self) -> PathBuf {
        self.domain_dir().join(format!("{}.csr", self.domain))
    }

    #[must_use]
    pub fn cert_path(&self) -> PathBuf {
        self.domain_dir().join(format!("{}.crt", self.domain))
    }

    #[must_use]
    pub fn chain_cert_path(&self) -> PathBuf {
        self.domain_dir().join(CHAIN_FILE)
    }

    #[must_use]
    pub fn global_config_path(&self) -> PathBuf {
        self.work_dir.join(CONFIG_FILE_NAME)
    }

    #[must_use]
    pub fn domain_config_path(&self) -> PathBuf {
        self.domain_dir().join(CONFIG_FILE_NAME)
    }

    /// Creates the working directory, domain directory, and a fresh tmp
    /// directory.
    ///
    /// # Errors
    /// Returns error if any directory cannot be created.
    pub async fn ensure_layout(&self) -> Result<()> {
        crate::fs_util::ensure_dir(&self.domain_dir()).await?;
        crate::fs_util::ensure_dir(&self.tmp_dir()).await?;
        Ok(())
    }

    /// Renames a certificate file aside as `<name>_<start>_<end>` before it
    /// is overwritten.
    ///
    /// # Errors
    /// Returns error if the rename fails.
    pub fn archive_cert(
        &self,
        path: &Path,
        not_before: OffsetDateTime,
        not_after: OffsetDateTime,
    ) -> Result<()> {
        if !path.exists() {
            return Ok(());
        }
        let date_format = format_description!("[year]-[month]-[day]");
        let start = not_before
            .format(&date_format)
            .context("Failed to format archive start date")?;
        let end = not_after
            .format(&date_format)
            .context("Failed to format archive end date")?;
        let file_name = path
            .file_name()
            .and_then(|name| name.to_str())
            .ok_or_else(|| anyhow::anyhow!("Bad certificate path {}", path.display()))?;
        let archived = path.with_file_name(format!("{file_name}_{start}_{end}"));
        std::fs::rename(path, &archived)
            .with_context(|| format!("Failed to archive {}", path.display()))?;
        info!("Archived {} to {}", path.display(), archived.display());
        Ok(())
    }
}

/// A DNS record that is live at the CA's resolvers and must be deleted on
/// every exit path.
#[derive(Debug, Clone)]
struct LiveDnsRecord {
    identifier: String,
    del_command: String,
}

/// One run's mutable state: the workspace plus everything that has to be
/// released on exit. Cleanup is idempotent and also runs from `Drop` so
/// the temp directory and DNS records are released when the run future is
/// cancelled by a signal or a panic unwinds.
pub struct Session {
    workspace: Workspace,
    live_dns: Vec<LiveDnsRecord>,
    cleaned: bool,
}

impl Session {
    #[must_use]
    pub fn new(workspace: Workspace) -> Self {
        Self {
            workspace,
            live_dns: Vec::new(),
            cleaned: false,
        }
    }

    #[must_use]
    pub fn workspace(&self) -> &Workspace {
        &self.workspace
    }

    /// Registers a DNS record for teardown.
    pub fn track_dns_record(&mut self, identifier: &str, del_command: &str) {
        self.live_dns.push(LiveDnsRecord {
            identifier: identifier.to_string(),
            del_command: del_command.to_string(),
        });
    }

    /// Removes one identifier from the teardown list after its record was
    /// deleted in the normal flow.
    pub fn untrack_dns_record(&mut self, identifier: &str) {
        self.live_dns
            .retain(|record| record.identifier != identifier);
    }

    /// Tears down everything the run acquired: live DNS records and the
    /// temp directory. Safe to call more than once; failures are logged,
    /// never raised.
    pub fn cleanup(&mut self) {
        if self.cleaned {
            return;
        }
        self.cleaned = true;

        for record in std::mem::take(&mut self.live_dns) {
            debug!("Tearing down DNS record for {}", record.identifier);
            if let Err(err) = hooks::run_blocking(
                "dns del",
                &record.del_command,
                &[record.identifier.as_str()],
            ) {
                error!(
                    "DNS teardown for {} failed: {err}",
                    record.identifier
                );
            }
        }

        let tmp = self.workspace.tmp_dir();
        if tmp.exists() {
            if let Err(err) = std::fs::remove_dir_all(&tmp) {
                warn!("Failed to remove {}: {err}", tmp.display());
            }
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.cleanup();
    }
}

#[cfg(test)]
mod tests {
    use tempfile::tempdir;
    use time::macros::datetime;

    use super::*;

    fn workspace(dir: &Path) -> Workspace {
        Workspace::new(dir.to_path_buf(), "example.com")
    }

    #[test]
    fn test_layout_paths() {
        let dir = tempdir().unwrap();
        let ws = workspace(dir.path());
        assert_eq!(ws.account_key_path(), dir.path().join("account.key"));
        assert_eq!(
            ws.domain_key_path(),
            dir.path().join("example.com").join("example.com.key")
        );
        assert_eq!(
            ws.cert_path(),
            dir.path().join("example.com").join("example.com.crt")
        );
        assert_eq!(
            ws.chain_cert_path(),
            dir.path().join("example.com").join("chain.crt")
        );
        assert_eq!(
            ws.dns_verify_dir(),
            dir.path()
                .join("example.com")
                .join("tmp")
                .join("dns_verify")
        );
    }

    #[tokio::test]
    async fn test_ensure_layout_creates_directories() {
        let dir = tempdir().unwrap();
        let ws = workspace(dir.path());
        ws.ensure_layout().await.unwrap();
        assert!(ws.domain_dir().is_dir());
        assert!(ws.tmp_dir().is_dir());
    }

    #[test]
    fn test_archive_cert_renames_with_dates() {
        let dir = tempdir().unwrap();
        let ws = workspace(dir.path());
        std::fs::create_dir_all(ws.domain_dir()).unwrap();
        let cert = ws.cert_path();
        std::fs::write(&cert, "old cert").unwrap();

        ws.archive_cert(
            &cert,
            datetime!(2026-01-01 00:00 UTC),
            datetime!(2026-03-31 12:30 UTC),
        )
        .unwrap();

        assert!(!cert.exists());
        let archived = ws
            .domain_dir()
            .join("example.com.crt_2026-01-01_2026-03-31");
        assert_eq!(std::fs::read_to_string(archived).unwrap(), "old cert");
    }

    #[test]
    fn test_archive_cert_missing_file_is_noop() {
        let dir = tempdir().unwrap();
        let ws = workspace(dir.path());
        ws.archive_cert(
            &ws.cert_path(),
            datetime!(2026-01-01 00:00 UTC),
            datetime!(2026-03-31 00:00 UTC),
        )
        .unwrap();
    }

    #[tokio::test]
    async fn test_session_cleanup_removes_tmp() {
        let dir = tempdir().unwrap();
        let ws = workspace(dir.path());
        ws.ensure_layout().await.unwrap();
        std::fs::write(ws.tmp_dir().join("token"), "data").unwrap();

        let mut session = Session::new(ws.clone());
        session.cleanup();
        assert!(!ws.tmp_dir().exists());
        assert!(ws.domain_dir().exists());
    }

    #[tokio::test]
    async fn test_session_drop_cleans_tmp() {
        let dir = tempdir().unwrap();
        let ws = workspace(dir.path());
        ws.ensure_layout().await.unwrap();
        {
            let _session = Session::new(ws.clone());
        }
        assert!(!ws.tmp_dir().exists());
    }

    #[tokio::test]
    async fn test_session_runs_dns_teardown_once() {
        let dir = tempdir().unwrap();
        let ws = workspace(dir.path());
        ws.ensure_layout().await.unwrap();
        let marker = dir.path().join("deleted.txt");

        let mut session = Session::new(ws);
        session.track_dns_record(
            "a.example.com",
            &format!("printf '%s' >> {}", marker.display()),
        );
        session.cleanup();
        session.cleanup();

        assert_eq!(
            std::fs::read_to_string(&marker).unwrap(),
            "a.example.com"
        );
    }

    #[tokio::test]
    async fn test_untracked_record_is_not_torn_down() {
        let dir = tempdir().unwrap();
        let ws = workspace(dir.path());
        ws.ensure_layout().await.unwrap();
        let marker = dir.path().join("deleted.txt");

        let mut session = Session::new(ws);
        session.track_dns_record(
            "a.example.com",
            &format!("printf '%s' >> {}", marker.display()),
        );
        session.untrack_dns_record("a.example.com");
        session.cleanup();

        assert!(!marker.exists());
    }
}

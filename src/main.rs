use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::Parser;
use getssl::acme::flow;
use getssl::config::{self, Settings};
use getssl::workspace::{Session, UmaskGuard, Workspace};
use getssl::{Args, crypto, fs_util, probe};
use tokio::signal::unix::{SignalKind, signal};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

const DEFAULT_WORKDIR: &str = ".getssl";

fn init_tracing(args: &Args) {
    let default_level = if args.debug {
        "debug"
    } else if args.quiet {
        "error"
    } else {
        "info"
    };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn resolve_work_dir(args: &Args) -> Result<PathBuf> {
    if let Some(dir) = &args.working_dir {
        return Ok(dir.clone());
    }
    let home = std::env::var_os("HOME").context("HOME is not set; use -w to pick a workspace")?;
    Ok(PathBuf::from(home).join(DEFAULT_WORKDIR))
}

#[tokio::main(flavor = "current_thread")]
async fn main() {
    let args = Args::parse();
    init_tracing(&args);

    match run(args).await {
        Ok(()) => {}
        Err(err) => {
            error!("{err:#}");
            std::process::exit(1);
        }
    }
}

async fn run(args: Args) -> Result<()> {
    if args.all && args.create {
        anyhow::bail!("--all cannot be combined with --create");
    }
    if args.all && args.force {
        anyhow::bail!("--all cannot be combined with --force");
    }

    let work_dir = resolve_work_dir(&args)?;
    let _umask = UmaskGuard::strict();

    let mut sigint = signal(SignalKind::interrupt()).context("Failed to install SIGINT handler")?;
    let mut sigterm =
        signal(SignalKind::terminate()).context("Failed to install SIGTERM handler")?;
    let mut sighup = signal(SignalKind::hangup()).context("Failed to install SIGHUP handler")?;

    tokio::select! {
        result = dispatch(&args, &work_dir) => result,
        _ = sigint.recv() => {
            warn!("Interrupted; cleaning up");
            anyhow::bail!("interrupted")
        }
        _ = sigterm.recv() => {
            info!("Termination requested; cleaning up");
            Ok(())
        }
        _ = sighup.recv() => {
            info!("Hangup received; cleaning up");
            Ok(())
        }
    }
}

async fn dispatch(args: &Args, work_dir: &Path) -> Result<()> {
    if args.create {
        let domain = args
            .domain
            .as_deref()
            .context("--create needs a domain")?;
        return create_configs(work_dir, domain).await;
    }

    if let Some(cert_path) = &args.revoke {
        let domain = args
            .domain
            .as_deref()
            .context("--revoke needs a domain (its workspace supplies the account key)")?;
        let settings = Settings::load(work_dir, domain)?;
        let session = Session::new(Workspace::new(work_dir.to_path_buf(), domain));
        return flow::revoke_certificate(&settings, &session, cert_path).await;
    }

    if args.all {
        return run_all(work_dir).await;
    }

    let domain = args.domain.as_deref().context("a domain is required")?;
    run_one(work_dir, domain, args.force).await
}

async fn run_one(work_dir: &Path, domain: &str, force: bool) -> Result<()> {
    info!("Processing {domain}");
    let settings = Settings::load(work_dir, domain)?;
    let workspace = Workspace::new(work_dir.to_path_buf(), domain);
    let mut session = Session::new(workspace);
    let result = flow::run_domain(&settings, &mut session, force).await;
    session.cleanup();
    result
}

/// Runs every domain directory under the working directory. A failure in
/// one domain never aborts the others, but the process reports failure if
/// any domain failed.
async fn run_all(work_dir: &Path) -> Result<()> {
    let entries = std::fs::read_dir(work_dir)
        .with_context(|| format!("Failed to read {}", work_dir.display()))?;
    let mut domains: Vec<String> = entries
        .filter_map(std::result::Result::ok)
        .filter(|entry| entry.path().is_dir())
        .filter_map(|entry| entry.file_name().into_string().ok())
        .filter(|name| !name.starts_with('.'))
        .collect();
    domains.sort();

    let mut failed = Vec::new();
    for domain in &domains {
        if let Err(err) = run_one(work_dir, domain, false).await {
            error!("{domain} failed: {err:#}");
            failed.push(domain.clone());
        }
    }

    if failed.is_empty() {
        Ok(())
    } else {
        anyhow::bail!("{} domain(s) failed: {}", failed.len(), failed.join(", "))
    }
}

/// `--create`: materializes default configuration for the workspace and
/// the domain, seeding `sans` from the live certificate when the host is
/// reachable.
async fn create_configs(work_dir: &Path, domain: &str) -> Result<()> {
    let workspace = Workspace::new(work_dir.to_path_buf(), domain);
    fs_util::ensure_dir(&workspace.domain_dir()).await?;

    let global = workspace.global_config_path();
    if global.exists() {
        info!("Keeping existing {}", global.display());
    } else {
        tokio::fs::write(&global, config::default_global_config())
            .await
            .with_context(|| format!("Failed to write {}", global.display()))?;
        info!("Wrote {}", global.display());
    }

    let domain_config = workspace.domain_config_path();
    if domain_config.exists() {
        info!("Keeping existing {}", domain_config.display());
        return Ok(());
    }

    let seeded_sans = match probe::fetch_remote_leaf(domain, 443).await {
        Ok(der) => match crypto::parse_cert_der(&der) {
            Ok(cert) => cert
                .sans
                .into_iter()
                .filter(|name| name != domain)
                .collect(),
            Err(err) => {
                warn!("Could not parse the served certificate: {err}");
                Vec::new()
            }
        },
        Err(err) => {
            info!("No live certificate to seed sans from: {err}");
            Vec::new()
        }
    };

    tokio::fs::write(
        &domain_config,
        config::default_domain_config(domain, &seeded_sans),
    )
    .await
    .with_context(|| format!("Failed to write {}", domain_config.display()))?;
    info!("Wrote {}", domain_config.display());
    Ok(())
}

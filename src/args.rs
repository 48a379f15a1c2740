use std::path::PathBuf;

use clap::Parser;

/// Obtains and renews certificates from an ACME v1 certificate authority.
///
/// Without further configuration the client talks to the Let's Encrypt
/// STAGING environment; point `ca` at the production endpoint once a
/// domain issues correctly.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Enable debug output
    #[arg(short, long)]
    pub debug: bool,

    /// Create default configuration files for the workspace and domain,
    /// then exit
    #[arg(short, long)]
    pub create: bool,

    /// Force renewal even when the certificate is not close to expiry
    #[arg(short, long)]
    pub force: bool,

    /// Run for every domain directory in the working directory
    #[arg(short, long)]
    pub all: bool,

    /// Only log errors
    #[arg(short, long)]
    pub quiet: bool,

    /// Working directory holding the account key and per-domain state
    #[arg(short = 'w', long, env = "GETSSL_WORKDIR")]
    pub working_dir: Option<PathBuf>,

    /// Revoke the given certificate (PEM) with the account key, then exit
    #[arg(long, value_name = "CERT")]
    pub revoke: Option<PathBuf>,

    /// Domain to obtain a certificate for
    pub domain: Option<String>,
}

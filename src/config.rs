use std::path::Path;

use anyhow::{Context, Result};
use config::{Config, Environment, File, FileFormat};
use serde::Deserialize;

use crate::crypto::KeyAlg;

pub const DEFAULT_CA: &str = "https://acme-staging.api.letsencrypt.org";
pub const CONFIG_FILE_NAME: &str = "getssl.cfg";

const DEFAULT_ACCOUNT_KEY_LENGTH: u32 = 4096;
const DEFAULT_DOMAIN_KEY_LENGTH: u32 = 4096;
const DEFAULT_RENEW_ALLOW_DAYS: i64 = 30;
const DEFAULT_SERVER_TYPE: &str = "webserver";
const ENV_PREFIX: &str = "GETSSL";

const PORT_HTTPS: u16 = 443;
const PORT_LDAPS: u16 = 636;

/// The merged configuration for one domain run: defaults, then the
/// workspace-global file, then the per-domain file, then `GETSSL_*`
/// environment variables.
#[derive(Debug, Deserialize, Clone)]
pub struct Settings {
    pub ca: String,
    pub agreement: Option<String>,
    pub account_email: Option<String>,
    pub account_key: Option<String>,
    pub account_key_length: u32,
    pub private_key_alg: KeyAlg,
    pub domain_key_length: u32,
    /// Comma-separated additional names.
    pub sans: String,
    /// Per-identifier HTTP-01 challenge roots, positional by name index.
    pub acl: Vec<String>,
    pub validate_via_dns: bool,
    pub dns_add_command: Option<String>,
    pub dns_del_command: Option<String>,
    pub dns_extra_wait: u64,
    pub server_type: String,
    pub check_remote: bool,
    pub renew_allow: i64,
    pub reload_cmd: Option<String>,
    pub domain_cert_location: Option<String>,
    pub domain_key_location: Option<String>,
    pub ca_cert_location: Option<String>,
    pub domain_chain_location: Option<String>,
    pub domain_pem_location: Option<String>,
    pub skip_http_token_check: bool,
}

impl Settings {
    /// Loads the layered configuration for `domain`.
    ///
    /// # Errors
    /// Returns error if a present config file fails to parse.
    pub fn load(work_dir: &Path, domain: &str) -> Result<Self> {
        let global = work_dir.join(CONFIG_FILE_NAME);
        let per_domain = work_dir.join(domain).join(CONFIG_FILE_NAME);

        let builder = Config::builder()
            .set_default("ca", DEFAULT_CA)?
            .set_default("account_key_length", DEFAULT_ACCOUNT_KEY_LENGTH)?
            .set_default("private_key_alg", "rsa")?
            .set_default("domain_key_length", DEFAULT_DOMAIN_KEY_LENGTH)?
            .set_default("sans", "")?
            .set_default("acl", Vec::<String>::new())?
            .set_default("validate_via_dns", false)?
            .set_default("dns_extra_wait", 0)?
            .set_default("server_type", DEFAULT_SERVER_TYPE)?
            .set_default("check_remote", true)?
            .set_default("renew_allow", DEFAULT_RENEW_ALLOW_DAYS)?
            .set_default("skip_http_token_check", false)?
            .add_source(
                File::from(global)
                    .format(FileFormat::Toml)
                    .required(false),
            )
            .add_source(
                File::from(per_domain)
                    .format(FileFormat::Toml)
                    .required(false),
            )
            .add_source(Environment::with_prefix(ENV_PREFIX));

        builder
            .build()
            .context("Failed to load configuration")?
            .try_deserialize()
            .context("Invalid configuration")
    }

    /// The additional names, split out of the comma-separated `sans` value.
    #[must_use]
    pub fn sans_list(&self) -> Vec<String> {
        self.sans
            .split(',')
            .map(str::trim)
            .filter(|name| !name.is_empty())
            .map(ToString::to_string)
            .collect()
    }

    /// Every name the certificate must carry: the primary first, then the
    /// additional names in configured order.
    #[must_use]
    pub fn all_names(&self, domain: &str) -> Vec<String> {
        let mut names = vec![domain.to_string()];
        names.extend(self.sans_list());
        names
    }

    /// Maps `server_type` to the TLS port used for remote probes.
    ///
    /// # Errors
    /// Returns error for anything that is not `webserver`, `ldaps`, or a
    /// bare port number.
    pub fn server_port(&self) -> Result<u16> {
        match self.server_type.as_str() {
            "webserver" => Ok(PORT_HTTPS),
            "ldaps" => Ok(PORT_LDAPS),
            other => other
                .parse::<u16>()
                .map_err(|_| anyhow::anyhow!("Unknown server_type: {other}")),
        }
    }

    /// Validates the settings for an issuance run of `domain`.
    ///
    /// # Errors
    /// Returns error for an unusable server type, an ACL list whose length
    /// does not match the name count, or a DNS-01 setup without hook
    /// commands.
    pub fn validate(&self, domain: &str) -> Result<()> {
        self.server_port()?;
        let name_count = self.all_names(domain).len();
        if self.validate_via_dns {
            if self.dns_add_command.is_none() {
                anyhow::bail!("validate_via_dns requires dns_add_command");
            }
            if self.dns_del_command.is_none() {
                anyhow::bail!("validate_via_dns requires dns_del_command");
            }
        } else if self.acl.len() != name_count {
            anyhow::bail!(
                "acl must list one challenge location per name ({} configured, {} names)",
                self.acl.len(),
                name_count
            );
        }
        if self.renew_allow < 0 {
            anyhow::bail!("renew_allow must not be negative");
        }
        Ok(())
    }
}

/// Default workspace-global config written by `--create`.
#[must_use]
pub fn default_global_config() -> String {
    format!(
        r#"# Workspace defaults. Per-domain files override these values.
# The default CA is the Let's Encrypt STAGING environment; switch to
# production deliberately once a domain issues correctly.
ca = "{DEFAULT_CA}"

# account_email = "certs@example.com"
account_key_length = {DEFAULT_ACCOUNT_KEY_LENGTH}
private_key_alg = "rsa"
domain_key_length = {DEFAULT_DOMAIN_KEY_LENGTH}
renew_allow = {DEFAULT_RENEW_ALLOW_DAYS}
server_type = "{DEFAULT_SERVER_TYPE}"
check_remote = true
"#
    )
}

/// Default per-domain config written by `--create`, seeding `sans` from a
/// reachable live certificate when one was found.
#[must_use]
pub fn default_domain_config(domain: &str, seeded_sans: &[String]) -> String {
    let sans = seeded_sans.join(",");
    format!(
        r#"# Configuration for {domain}.
sans = "{sans}"

# One challenge location per name, primary first. Local path or ssh:host:path.
acl = []

# validate_via_dns = true
# dns_add_command = "/usr/local/bin/dns-add"
# dns_del_command = "/usr/local/bin/dns-del"
# dns_extra_wait = 0

# reload_cmd = "systemctl reload nginx"
# domain_cert_location = "/etc/ssl/{domain}.crt"
# domain_key_location = "/etc/ssl/private/{domain}.key"
# ca_cert_location = "/etc/ssl/chain.crt"
# domain_chain_location = ""
# domain_pem_location = ""
"#
    )
}

#[cfg(test)]
mod tests {
    use tempfile::tempdir;

    use super::*;

    fn load_defaults(dir: &Path) -> Settings {
        Settings::load(dir, "example.com").unwrap()
    }

    #[test]
    fn test_defaults_point_at_staging() {
        let dir = tempdir().unwrap();
        let settings = load_defaults(dir.path());
        assert_eq!(settings.ca, DEFAULT_CA);
        assert!(settings.ca.contains("staging"));
        assert_eq!(settings.account_key_length, 4096);
        assert_eq!(settings.renew_allow, 30);
        assert!(settings.check_remote);
    }

    #[test]
    fn test_per_domain_file_overrides_global() {
        let dir = tempdir().unwrap();
        std::fs::write(
            dir.path().join(CONFIG_FILE_NAME),
            "renew_allow = 10\nserver_type = \"ldaps\"\n",
        )
        .unwrap();
        let domain_dir = dir.path().join("example.com");
        std::fs::create_dir_all(&domain_dir).unwrap();
        std::fs::write(domain_dir.join(CONFIG_FILE_NAME), "renew_allow = 20\n").unwrap();

        let settings = load_defaults(dir.path());
        assert_eq!(settings.renew_allow, 20);
        assert_eq!(settings.server_type, "ldaps");
    }

    #[test]
    fn test_sans_list_splits_and_trims() {
        let dir = tempdir().unwrap();
        let mut settings = load_defaults(dir.path());
        settings.sans = "www.example.com, mail.example.com,".to_string();
        assert_eq!(
            settings.sans_list(),
            vec!["www.example.com".to_string(), "mail.example.com".to_string()]
        );
        assert_eq!(
            settings.all_names("example.com"),
            vec![
                "example.com".to_string(),
                "www.example.com".to_string(),
                "mail.example.com".to_string(),
            ]
        );
    }

    #[test]
    fn test_empty_sans_yields_primary_only() {
        let dir = tempdir().unwrap();
        let settings = load_defaults(dir.path());
        assert_eq!(settings.all_names("example.com"), vec!["example.com"]);
    }

    #[test]
    fn test_server_port_mapping() {
        let dir = tempdir().unwrap();
        let mut settings = load_defaults(dir.path());

        settings.server_type = "webserver".to_string();
        assert_eq!(settings.server_port().unwrap(), 443);

        settings.server_type = "ldaps".to_string();
        assert_eq!(settings.server_port().unwrap(), 636);

        settings.server_type = "443".to_string();
        assert_eq!(settings.server_port().unwrap(), 443);

        settings.server_type = "8443".to_string();
        assert_eq!(settings.server_port().unwrap(), 8443);

        settings.server_type = "abc".to_string();
        assert!(settings.server_port().is_err());
    }

    #[test]
    fn test_validate_checks_acl_length() {
        let dir = tempdir().unwrap();
        let mut settings = load_defaults(dir.path());
        settings.sans = "www.example.com".to_string();
        settings.acl = vec!["/srv/a".to_string()];
        let err = settings.validate("example.com").unwrap_err();
        assert!(err.to_string().contains("acl"));

        settings.acl.push("/srv/b".to_string());
        settings.validate("example.com").unwrap();
    }

    #[test]
    fn test_validate_requires_dns_hooks() {
        let dir = tempdir().unwrap();
        let mut settings = load_defaults(dir.path());
        settings.validate_via_dns = true;
        assert!(settings.validate("example.com").is_err());

        settings.dns_add_command = Some("dns-add".to_string());
        settings.dns_del_command = Some("dns-del".to_string());
        settings.validate("example.com").unwrap();
    }

    #[test]
    fn test_default_domain_config_seeds_sans() {
        let rendered = default_domain_config(
            "example.com",
            &["www.example.com".to_string(), "mail.example.com".to_string()],
        );
        assert!(rendered.contains("sans = \"www.example.com,mail.example.com\""));
    }
}

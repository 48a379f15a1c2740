use std::collections::BTreeSet;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use time::OffsetDateTime;
use tracing::{info, warn};

use crate::acme::challenge::{self, ChallengeContext, DnsChallenge};
use crate::acme::client::{AcmeClient, AcmeError};
use crate::acme::types::{Authorization, ChallengeKind};
use crate::config::Settings;
use crate::crypto::{self, AccountKey, CertInfo};
use crate::workspace::Session;
use crate::{dns, fs_util, hooks, probe, transfer};

const STATUS_CREATED: u16 = 201;
const STATUS_CONFLICT: u16 = 409;
const FORCE_RENEW_ALLOW_DAYS: i64 = 365;
const RELOAD_SETTLE: Duration = Duration::from_secs(2);
const PEM_CERTIFICATE: &str = "CERTIFICATE";
const PEM_CERTIFICATE_REQUEST: &str = "CERTIFICATE REQUEST";
const TMP_CHAIN_FILE: &str = "chain.pem";
const TMP_PEM_FILE: &str = "domain.pem";

/// Drives the full lifecycle for one domain: reconcile against the
/// remote, gate on expiry, materialize keys and CSR, register, authorize
/// every name, finalize, deploy, reload, and verify.
///
/// # Errors
/// Returns error on any fatal step; the session cleans up on unwind.
pub async fn run_domain(settings: &Settings, session: &mut Session, force: bool) -> Result<()> {
    let domain = session.workspace().domain().to_string();
    settings.validate(&domain)?;
    let port = settings.server_port()?;
    session.workspace().ensure_layout().await?;

    if settings.check_remote && !force {
        reconcile_remote(settings, session, &domain, port).await?;
    }

    let renew_allow = if force {
        FORCE_RENEW_ALLOW_DAYS
    } else {
        settings.renew_allow
    };
    let cert_path = session.workspace().cert_path();
    if cert_path.exists() {
        let local = crypto::parse_cert_file(&cert_path)?;
        if OffsetDateTime::now_utc() + time::Duration::days(renew_allow) < local.not_after {
            info!(
                "Certificate for {domain} valid until {}; nothing to do",
                local.not_after
            );
            return Ok(());
        }
        session
            .workspace()
            .archive_cert(&cert_path, local.not_before, local.not_after)?;
    }

    let account = materialize_account_key(settings, session).await?;
    let domain_key_pem = materialize_domain_key(settings, session).await?;

    let names = settings.all_names(&domain);
    if !settings.validate_via_dns {
        dns::ensure_resolvable(&names).await?;
    }

    let csr_der = materialize_csr(settings, session, &domain_key_pem, &names).await?;

    let mut client = AcmeClient::new(settings.ca.clone(), account)?;
    register_account(&mut client, settings).await?;
    authorize_all(&mut client, settings, session, &names).await?;

    let (leaf_der, issuer_der) = finalize_order(&mut client, &csr_der).await?;
    let leaf_pem = crypto::pem_from_der(PEM_CERTIFICATE, &leaf_der);
    let issuer_pem = crypto::pem_from_der(PEM_CERTIFICATE, &issuer_der);
    tokio::fs::write(&cert_path, &leaf_pem)
        .await
        .with_context(|| format!("Failed to write {}", cert_path.display()))?;
    let chain_path = session.workspace().chain_cert_path();
    tokio::fs::write(&chain_path, &issuer_pem)
        .await
        .with_context(|| format!("Failed to write {}", chain_path.display()))?;
    info!("Certificate for {domain} written to {}", cert_path.display());

    deploy_artifacts(settings, session).await?;
    reload_services(settings).await?;
    if settings.check_remote {
        post_deploy_verify(session, &domain, port).await?;
    }

    Ok(())
}

/// Whether a certificate names the domain at all. Issued certificates
/// carry an empty subject, so this is answered by the SAN list; the
/// subject CN is a fallback for certificates from other tooling.
fn covers_domain(info: &CertInfo, domain: &str) -> bool {
    info.sans.iter().any(|name| name == domain)
        || info.subject_cn.as_deref() == Some(domain)
}

/// Pre-issuance reconciliation against the certificate actually served at
/// `domain:port`. The probe failing to connect is not fatal; a served
/// certificate drives one of: adopt (no local copy, or remote is newer),
/// ignore (a certificate that does not name the domain), or repair
/// (remote is older: re-deploy local artifacts).
async fn reconcile_remote(
    settings: &Settings,
    session: &mut Session,
    domain: &str,
    port: u16,
) -> Result<()> {
    let remote_der = match probe::fetch_remote_leaf(domain, port).await {
        Ok(der) => der,
        Err(err) => {
            warn!("Remote probe of {domain}:{port} failed: {err}");
            return Ok(());
        }
    };
    let remote = crypto::parse_cert_der(&remote_der)?;
    let cert_path = session.workspace().cert_path();

    if !cert_path.exists() {
        info!("No local certificate for {domain}; saving the served one");
        session.workspace().ensure_layout().await?;
        tokio::fs::write(&cert_path, crypto::pem_from_der(PEM_CERTIFICATE, &remote_der))
            .await
            .with_context(|| format!("Failed to write {}", cert_path.display()))?;
        return Ok(());
    }

    let local = crypto::parse_cert_file(&cert_path)?;
    if local.sha256_fingerprint == remote.sha256_fingerprint {
        return Ok(());
    }
    if !covers_domain(&remote, domain) {
        info!("Served certificate does not name {domain}; ignoring it");
        return Ok(());
    }
    if remote.not_after > local.not_after {
        info!("Served certificate for {domain} is newer; adopting it");
        session
            .workspace()
            .archive_cert(&cert_path, local.not_before, local.not_after)?;
        tokio::fs::write(&cert_path, crypto::pem_from_der(PEM_CERTIFICATE, &remote_der))
            .await
            .with_context(|| format!("Failed to write {}", cert_path.display()))?;
        return Ok(());
    }

    info!("Served certificate for {domain} is older than the local one; re-deploying");
    deploy_artifacts(settings, session).await?;
    reload_services(settings).await?;
    post_deploy_verify(session, domain, port).await?;
    Ok(())
}

async fn materialize_account_key(
    settings: &Settings,
    session: &Session,
) -> Result<AccountKey> {
    let path = settings
        .account_key
        .as_ref()
        .map_or_else(|| session.workspace().account_key_path(), Into::into);
    if path.exists() {
        let pem = tokio::fs::read_to_string(&path)
            .await
            .with_context(|| format!("Failed to read {}", path.display()))?;
        return AccountKey::from_pem(&pem);
    }
    info!(
        "Generating {}-bit RSA account key at {}",
        settings.account_key_length,
        path.display()
    );
    let account = AccountKey::generate(settings.account_key_length)?;
    fs_util::write_private(&path, &account.to_pem()?).await?;
    Ok(account)
}

async fn materialize_domain_key(settings: &Settings, session: &Session) -> Result<String> {
    let path = session.workspace().domain_key_path();
    if path.exists() {
        return tokio::fs::read_to_string(&path)
            .await
            .with_context(|| format!("Failed to read {}", path.display()));
    }
    info!("Generating domain key at {}", path.display());
    let pem = crypto::generate_domain_key(settings.private_key_alg, settings.domain_key_length)?;
    fs_util::write_private(&path, &pem).await?;
    Ok(pem)
}

/// Ensures the on-disk CSR carries exactly `{primary} ∪ sans`; anything
/// else (or no CSR at all) regenerates it.
async fn materialize_csr(
    settings: &Settings,
    session: &Session,
    domain_key_pem: &str,
    names: &[String],
) -> Result<Vec<u8>> {
    let path = session.workspace().csr_path();
    let wanted: BTreeSet<&str> = names.iter().map(String::as_str).collect();

    if path.exists() {
        let pem = tokio::fs::read(&path)
            .await
            .with_context(|| format!("Failed to read {}", path.display()))?;
        match crypto::pem_to_der(&pem).and_then(|der| {
            crypto::inspect_csr(&der).map(|csr_names| (der, csr_names))
        }) {
            Ok((der, csr_names)) => {
                let existing: BTreeSet<&str> =
                    csr_names.iter().map(String::as_str).collect();
                if existing == wanted {
                    return Ok(der);
                }
                info!(
                    "CSR names {csr_names:?} do not match configuration; regenerating"
                );
            }
            Err(err) => warn!("Existing CSR unreadable ({err}); regenerating"),
        }
    }

    let der = crypto::build_csr(domain_key_pem, settings.private_key_alg, names)?;
    tokio::fs::write(&path, crypto::pem_from_der(PEM_CERTIFICATE_REQUEST, &der))
        .await
        .with_context(|| format!("Failed to write {}", path.display()))?;
    info!("CSR written for {names:?}");
    Ok(der)
}

/// Registers the account. HTTP 201 is a fresh registration, 409 means the
/// key is already registered; both continue the run.
async fn register_account(client: &mut AcmeClient, settings: &Settings) -> Result<()> {
    let url = client.resource_url("new-reg").await;
    let mut payload = serde_json::json!({ "resource": "new-reg" });
    if let Some(email) = &settings.account_email {
        payload["contact"] = serde_json::json!([format!("mailto:{email}")]);
    }
    if let Some(agreement) = &settings.agreement {
        payload["agreement"] = serde_json::json!(agreement);
    }

    let response = client.send_signed(&url, &payload).await?;
    match response.status {
        STATUS_CREATED => {
            info!("Account registered");
            Ok(())
        }
        STATUS_CONFLICT => {
            info!("Account already registered");
            Ok(())
        }
        status => Err(AcmeError::Status {
            url,
            status,
            body: response.body_str(),
        }
        .into()),
    }
}

async fn new_authorization(
    client: &mut AcmeClient,
    identifier: &str,
) -> Result<Authorization> {
    let url = client.resource_url("new-authz").await;
    let payload = serde_json::json!({
        "resource": "new-authz",
        "identifier": { "type": "dns", "value": identifier },
    });
    let response = client.send_signed(&url, &payload).await?;
    AcmeClient::expect_status(&url, &response, STATUS_CREATED)?;
    response.json()
}

/// Proves control of every name. HTTP-01 handles each identifier
/// end-to-end in turn; DNS-01 provisions all records first so propagation
/// waits overlap, then notifies each.
async fn authorize_all(
    client: &mut AcmeClient,
    settings: &Settings,
    session: &mut Session,
    names: &[String],
) -> Result<()> {
    if settings.validate_via_dns {
        let mut provisioned: Vec<DnsChallenge> = Vec::with_capacity(names.len());
        for name in names {
            let authz = new_authorization(client, name).await?;
            let context: ChallengeContext =
                challenge::select_challenge(client, name, &authz, ChallengeKind::Dns01)?;
            provisioned.push(challenge::provision_dns01(settings, session, &context).await?);
        }

        let result = async {
            challenge::await_dns_propagation(settings, &provisioned).await?;
            for record in &provisioned {
                challenge::notify_and_poll(client, &record.context).await?;
            }
            Ok::<(), anyhow::Error>(())
        }
        .await;

        for record in &provisioned {
            challenge::teardown_dns01(settings, session, &record.context.identifier).await;
        }
        result
    } else {
        for (index, name) in names.iter().enumerate() {
            let authz = new_authorization(client, name).await?;
            let context =
                challenge::select_challenge(client, name, &authz, ChallengeKind::Http01)?;
            challenge::validate_http01(client, settings, session, index, &context).await?;
        }
        Ok(())
    }
}

/// Submits the CSR and downloads the leaf and its issuer: POST `new-cert`,
/// follow `Location` for the leaf DER, follow `Link: rel="up"` for the
/// issuer DER.
async fn finalize_order(
    client: &mut AcmeClient,
    csr_der: &[u8],
) -> Result<(Vec<u8>, Vec<u8>)> {
    let url = client.resource_url("new-cert").await;
    let payload = serde_json::json!({
        "resource": "new-cert",
        "csr": crypto::b64url(csr_der),
    });
    let response = client.send_signed(&url, &payload).await?;
    AcmeClient::expect_status(&url, &response, STATUS_CREATED)?;

    let cert_url = response
        .location
        .clone()
        .ok_or(AcmeError::MissingHeader {
            url: url.clone(),
            header: "Location",
        })?;
    let issuer_url = response.link_up.clone().ok_or(AcmeError::MissingHeader {
        url: url.clone(),
        header: "Link",
    })?;

    info!("Downloading certificate from {cert_url}");
    let leaf = client.get(&cert_url).await?;
    if leaf.body.is_empty() {
        anyhow::bail!("Certificate download from {cert_url} returned an empty body");
    }
    info!("Downloading issuer certificate from {issuer_url}");
    let issuer = client.get(&issuer_url).await?;
    if issuer.body.is_empty() {
        anyhow::bail!("Issuer download from {issuer_url} returned an empty body");
    }

    Ok((leaf.body, issuer.body))
}

async fn concat_files(sources: &[&Path], target: &Path) -> Result<()> {
    let mut combined = String::new();
    for source in sources {
        let contents = tokio::fs::read_to_string(source)
            .await
            .with_context(|| format!("Failed to read {}", source.display()))?;
        combined.push_str(&contents);
        if !combined.ends_with('\n') {
            combined.push('\n');
        }
    }
    tokio::fs::write(target, combined)
        .await
        .with_context(|| format!("Failed to write {}", target.display()))
}

/// Copies every configured artifact to its destination: the domain
/// certificate and key, the CA certificate, the leaf+issuer chain, and
/// the single-file key+leaf+issuer bundle.
async fn deploy_artifacts(settings: &Settings, session: &Session) -> Result<()> {
    let workspace = session.workspace();
    let cert = workspace.cert_path();
    let key = workspace.domain_key_path();
    let ca_cert = workspace.chain_cert_path();

    if let Some(dest) = &settings.domain_cert_location {
        transfer::place("domain certificate", &cert, dest).await?;
    }
    if let Some(dest) = &settings.domain_key_location {
        transfer::place("domain key", &key, dest).await?;
    }
    if let Some(dest) = &settings.ca_cert_location {
        transfer::place("CA certificate", &ca_cert, dest).await?;
    }
    if let Some(dest) = &settings.domain_chain_location {
        let chain = workspace.tmp_dir().join(TMP_CHAIN_FILE);
        concat_files(&[&cert, &ca_cert], &chain).await?;
        transfer::place("certificate chain", &chain, dest).await?;
    }
    if let Some(dest) = &settings.domain_pem_location {
        let bundle = workspace.tmp_dir().join(TMP_PEM_FILE);
        concat_files(&[&key, &cert, &ca_cert], &bundle).await?;
        transfer::place("combined pem", &bundle, dest).await?;
    }
    Ok(())
}

async fn reload_services(settings: &Settings) -> Result<()> {
    if let Some(command) = &settings.reload_cmd {
        hooks::run("reload", command, &[]).await?;
        tokio::time::sleep(RELOAD_SETTLE).await;
    }
    Ok(())
}

/// Re-probes the domain and requires the served leaf to match the local
/// one byte for byte (by SHA-256 fingerprint).
async fn post_deploy_verify(session: &Session, domain: &str, port: u16) -> Result<()> {
    let local: CertInfo = crypto::parse_cert_file(&session.workspace().cert_path())?;
    let remote_der = probe::fetch_remote_leaf(domain, port)
        .await
        .context("Post-deploy verification probe failed")?;
    let remote = crypto::parse_cert_der(&remote_der)?;
    if local.sha256_fingerprint != remote.sha256_fingerprint {
        anyhow::bail!(
            "Post-deploy verification failed: {domain}:{port} is not serving the deployed certificate"
        );
    }
    info!("Post-deploy verification passed for {domain}:{port}");
    Ok(())
}

/// Revokes a certificate with the account key.
///
/// # Errors
/// Returns error if the certificate cannot be read or the CA rejects the
/// revocation.
pub async fn revoke_certificate(
    settings: &Settings,
    session: &Session,
    cert_path: &Path,
) -> Result<()> {
    let pem = tokio::fs::read(cert_path)
        .await
        .with_context(|| format!("Failed to read {}", cert_path.display()))?;
    let der = crypto::pem_to_der(&pem)?;

    let account = materialize_account_key(settings, session).await?;
    let mut client = AcmeClient::new(settings.ca.clone(), account)?;
    let url = client.resource_url("revoke-cert").await;
    let payload = serde_json::json!({
        "resource": "revoke-cert",
        "certificate": crypto::b64url(&der),
    });
    let response = client.send_signed(&url, &payload).await?;
    if response.status >= 300 {
        return Err(AcmeError::Status {
            url,
            status: response.status,
            body: response.body_str(),
        }
        .into());
    }
    info!("Certificate {} revoked", cert_path.display());
    Ok(())
}

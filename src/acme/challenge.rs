use std::time::Duration;

use anyhow::{Context, Result};
use tracing::{debug, info, warn};

use crate::acme::client::{AcmeClient, SignedResponse};
use crate::acme::types::{
    Authorization, Challenge, ChallengeKind, ChallengePoll, ChallengeStatus, DnsVerifyRecord,
};
use crate::config::Settings;
use crate::workspace::Session;
use crate::{crypto, dns, fs_util, hooks, transfer};

const STATUS_ACCEPTED: u16 = 202;
const CHALLENGE_POLL_INTERVAL: Duration = Duration::from_secs(5);
const CHALLENGE_POLL_LIMIT: u32 = 30;
const DNS_TXT_POLL_INTERVAL: Duration = Duration::from_secs(10);
const DNS_TXT_POLL_LIMIT: u32 = 100;
const WELL_KNOWN_PATH: &str = ".well-known/acme-challenge";
const TXT_RECORD_PREFIX: &str = "_acme-challenge";

/// Per-identifier in-flight challenge state.
#[derive(Debug, Clone)]
pub struct ChallengeContext {
    pub identifier: String,
    pub uri: String,
    pub token: String,
    pub key_authorization: String,
    pub auth_key: String,
}

/// Selects the configured challenge out of an authorization and derives
/// the key authorization material.
///
/// # Errors
/// Returns error if the authorization carries no challenge of `kind`.
pub fn select_challenge(
    client: &AcmeClient,
    identifier: &str,
    authz: &Authorization,
    kind: ChallengeKind,
) -> Result<ChallengeContext> {
    let challenge: &Challenge = authz
        .challenges
        .iter()
        .find(|challenge| challenge.kind == kind)
        .ok_or_else(|| {
            anyhow::anyhow!("No {kind:?} challenge offered for {identifier}")
        })?;
    let key_authorization = client.key_authorization(&challenge.token)?;
    let auth_key = crypto::b64url(&crypto::sha256(key_authorization.as_bytes()));
    Ok(ChallengeContext {
        identifier: identifier.to_string(),
        uri: challenge.uri.clone(),
        token: challenge.token.clone(),
        key_authorization,
        auth_key,
    })
}

/// Notifies the CA that the challenge is provisioned and polls until it
/// verifies. `invalid` and poll exhaustion are fatal.
///
/// # Errors
/// Returns error if notification is rejected or verification fails.
pub async fn notify_and_poll(client: &mut AcmeClient, context: &ChallengeContext) -> Result<()> {
    info!("Notifying CA for {}", context.identifier);
    let payload = serde_json::json!({
        "resource": "challenge",
        "keyAuthorization": context.key_authorization,
    });
    let response = client.send_signed(&context.uri, &payload).await?;
    AcmeClient::expect_status(&context.uri, &response, STATUS_ACCEPTED)?;

    for attempt in 1..=CHALLENGE_POLL_LIMIT {
        tokio::time::sleep(CHALLENGE_POLL_INTERVAL).await;
        let response: SignedResponse = client.get(&context.uri).await?;
        let poll: ChallengePoll = response.json()?;
        debug!(
            "Challenge {} poll {attempt}: {:?}",
            context.identifier, poll.status
        );
        match poll.status {
            ChallengeStatus::Valid => {
                info!("Challenge verified for {}", context.identifier);
                return Ok(());
            }
            ChallengeStatus::Invalid => {
                let detail = poll
                    .error
                    .map_or_else(|| "no error detail".to_string(), |err| err.to_string());
                anyhow::bail!("Challenge for {} failed: {detail}", context.identifier);
            }
            ChallengeStatus::Pending | ChallengeStatus::Processing => {}
        }
    }
    anyhow::bail!(
        "Challenge for {} did not verify within {} polls",
        context.identifier,
        CHALLENGE_POLL_LIMIT
    )
}

fn token_destination(acl: &str, token: &str) -> String {
    format!("{}/{token}", acl.trim_end_matches('/'))
}

async fn self_check_http01(context: &ChallengeContext) -> Result<()> {
    let url = format!(
        "http://{}/{WELL_KNOWN_PATH}/{}",
        context.identifier, context.token
    );
    debug!("Self-check {url}");
    let body = reqwest::get(&url)
        .await
        .with_context(|| format!("Self-check request to {url} failed"))?
        .text()
        .await
        .context("Self-check response unreadable")?;
    if body.trim_end() != context.key_authorization {
        anyhow::bail!(
            "Self-check mismatch for {}: the token served at {url} does not match",
            context.identifier
        );
    }
    Ok(())
}

/// Runs the full HTTP-01 cycle for one identifier: provision the token at
/// its challenge location, self-check through the public URL, notify the
/// CA, poll to `valid`, and tear the token down again. Teardown runs on
/// the failure paths too.
///
/// # Errors
/// Returns error if provisioning, the self-check, or verification fails.
pub async fn validate_http01(
    client: &mut AcmeClient,
    settings: &Settings,
    session: &Session,
    index: usize,
    context: &ChallengeContext,
) -> Result<()> {
    let acl = settings
        .acl
        .get(index)
        .ok_or_else(|| {
            anyhow::anyhow!("No acl entry for {} (index {index})", context.identifier)
        })?
        .clone();

    let token_file = session.workspace().tmp_dir().join(&context.token);
    fs_util::write_world_readable(&token_file, &context.key_authorization).await?;
    transfer::place(
        "challenge token",
        &token_file,
        &token_destination(&acl, &context.token),
    )
    .await?;

    let result = async {
        if settings.skip_http_token_check {
            warn!(
                "Skipping HTTP self-check for {} (skip_http_token_check)",
                context.identifier
            );
        } else {
            self_check_http01(context).await?;
        }
        notify_and_poll(client, context).await
    }
    .await;

    if let Err(err) = transfer::remove("challenge token", &acl, &context.token).await {
        warn!("Token teardown for {} failed: {err}", context.identifier);
    }
    if let Err(err) = tokio::fs::remove_file(&token_file).await {
        debug!("Temp token removal failed: {err}");
    }

    result
}

/// One provisioned DNS-01 record waiting for propagation.
#[derive(Debug, Clone)]
pub struct DnsChallenge {
    pub context: ChallengeContext,
    pub primary_ns: String,
}

/// Provisions the TXT record for one identifier: runs the add hook,
/// registers teardown with the session, discovers the authoritative
/// nameserver, and spools the in-flight state.
///
/// # Errors
/// Returns error if the hook fails or no authoritative NS is found.
pub async fn provision_dns01(
    settings: &Settings,
    session: &mut Session,
    context: &ChallengeContext,
) -> Result<DnsChallenge> {
    let add_command = settings
        .dns_add_command
        .as_deref()
        .ok_or_else(|| anyhow::anyhow!("dns_add_command is not configured"))?;
    let del_command = settings
        .dns_del_command
        .as_deref()
        .ok_or_else(|| anyhow::anyhow!("dns_del_command is not configured"))?;

    hooks::run(
        "dns add",
        add_command,
        &[context.identifier.as_str(), context.auth_key.as_str()],
    )
    .await?;
    session.track_dns_record(&context.identifier, del_command);

    let primary_ns = dns::authoritative_ns(&context.identifier).await?;

    let record = DnsVerifyRecord {
        token: context.token.clone(),
        uri: context.uri.clone(),
        key_authorization: context.key_authorization.clone(),
        identifier: context.identifier.clone(),
        primary_ns: primary_ns.clone(),
        auth_key: context.auth_key.clone(),
    };
    let spool_path = session.workspace().dns_verify_dir().join(&context.identifier);
    fs_util::ensure_dir(&session.workspace().dns_verify_dir()).await?;
    tokio::fs::write(&spool_path, serde_json::to_string_pretty(&record)?)
        .await
        .with_context(|| format!("Failed to write {}", spool_path.display()))?;

    Ok(DnsChallenge {
        context: context.clone(),
        primary_ns,
    })
}

/// Waits until every provisioned TXT record is visible at its
/// authoritative nameserver, then pads with the configured extra wait.
/// Runs after *all* records are added so propagation waits amortize
/// across identifiers.
///
/// # Errors
/// Returns error if any record is not observed within the poll budget.
pub async fn await_dns_propagation(
    settings: &Settings,
    records: &[DnsChallenge],
) -> Result<()> {
    for record in records {
        let name = format!("{TXT_RECORD_PREFIX}.{}", record.context.identifier);
        let mut observed = false;
        for attempt in 1..=DNS_TXT_POLL_LIMIT {
            let values = dns::txt_values(&record.primary_ns, &name).await?;
            if values.iter().any(|value| value == &record.context.auth_key) {
                info!("TXT record for {} observed", record.context.identifier);
                observed = true;
                break;
            }
            debug!(
                "TXT for {} not visible yet (attempt {attempt}/{DNS_TXT_POLL_LIMIT})",
                record.context.identifier
            );
            tokio::time::sleep(DNS_TXT_POLL_INTERVAL).await;
        }
        if !observed {
            anyhow::bail!(
                "TXT record for {} did not propagate within {} attempts",
                record.context.identifier,
                DNS_TXT_POLL_LIMIT
            );
        }
    }

    if settings.dns_extra_wait > 0 {
        info!("Waiting {}s for DNS propagation", settings.dns_extra_wait);
        tokio::time::sleep(Duration::from_secs(settings.dns_extra_wait)).await;
    }
    Ok(())
}

/// Deletes one identifier's TXT record and drops it from the session's
/// teardown list.
pub async fn teardown_dns01(settings: &Settings, session: &mut Session, identifier: &str) {
    if let Some(del_command) = settings.dns_del_command.as_deref() {
        if let Err(err) = hooks::run("dns del", del_command, &[identifier]).await {
            warn!("DNS teardown for {identifier} failed: {err}");
        }
    }
    session.untrack_dns_record(identifier);
}

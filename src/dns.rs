use std::net::IpAddr;

use anyhow::{Context, Result};
use hickory_resolver::Resolver;
use hickory_resolver::config::{NameServerConfigGroup, ResolverConfig};
use hickory_resolver::name_server::TokioConnectionProvider;
use tracing::{debug, warn};

const DNS_PORT: u16 = 53;

fn system_resolver() -> Result<hickory_resolver::TokioResolver> {
    Ok(Resolver::builder_tokio()
        .unwrap_or_else(|_| {
            Resolver::builder_with_config(
                ResolverConfig::default(),
                TokioConnectionProvider::default(),
            )
        })
        .build())
}

/// Checks that every name resolves to at least one address. Used before
/// HTTP-01 issuance; an unresolvable name is fatal.
///
/// # Errors
/// Returns error naming the first identifier that fails to resolve.
pub async fn ensure_resolvable(names: &[String]) -> Result<()> {
    let resolver = system_resolver()?;
    for name in names {
        let lookup = resolver
            .lookup_ip(name.as_str())
            .await
            .with_context(|| format!("DNS resolution failed for {name}"))?;
        if lookup.iter().next().is_none() {
            anyhow::bail!("DNS resolution returned no addresses for {name}");
        }
        debug!("Resolved {name}");
    }
    Ok(())
}

async fn soa_primary_ns(identifier: &str) -> Result<Option<String>> {
    let resolver = system_resolver()?;
    let labels: Vec<&str> = identifier.trim_end_matches('.').split('.').collect();
    for start in 0..labels.len() {
        let zone = format!("{}.", labels[start..].join("."));
        if let Ok(lookup) = resolver.soa_lookup(zone.clone()).await {
            if let Some(soa) = lookup.iter().next() {
                let mname = soa.mname().to_utf8();
                let mname = mname.trim_end_matches('.').to_string();
                debug!("SOA for {identifier}: zone {zone}, primary {mname}");
                return Ok(Some(mname));
            }
        }
    }
    Ok(None)
}

/// Finds the primary authoritative nameserver for an identifier by walking
/// SOA records up the name hierarchy, retrying once on an empty answer.
///
/// # Errors
/// Returns error if no SOA record can be found for any parent zone.
pub async fn authoritative_ns(identifier: &str) -> Result<String> {
    if let Some(ns) = soa_primary_ns(identifier).await? {
        return Ok(ns);
    }
    warn!("No SOA found for {identifier}, retrying lookup");
    soa_primary_ns(identifier)
        .await?
        .ok_or_else(|| anyhow::anyhow!("No authoritative nameserver found for {identifier}"))
}

async fn resolver_for_host(ns_host: &str) -> Result<hickory_resolver::TokioResolver> {
    let ips: Vec<IpAddr> = if let Ok(ip) = ns_host.parse::<IpAddr>() {
        vec![ip]
    } else {
        let resolver = system_resolver()?;
        resolver
            .lookup_ip(ns_host)
            .await
            .with_context(|| format!("Failed to resolve nameserver {ns_host}"))?
            .iter()
            .collect()
    };
    if ips.is_empty() {
        anyhow::bail!("Nameserver {ns_host} has no addresses");
    }
    let group = NameServerConfigGroup::from_ips_clear(&ips, DNS_PORT, true);
    let config = ResolverConfig::from_parts(None, Vec::new(), group);
    Ok(Resolver::builder_with_config(config, TokioConnectionProvider::default()).build())
}

/// Fetches the TXT values for `name` directly from the given nameserver.
/// A lookup failure (including NXDOMAIN while the record propagates) is
/// reported as an empty list so callers can keep polling.
///
/// # Errors
/// Returns error if the nameserver itself cannot be resolved.
pub async fn txt_values(ns_host: &str, name: &str) -> Result<Vec<String>> {
    let resolver = resolver_for_host(ns_host).await?;
    match resolver.txt_lookup(name).await {
        Ok(lookup) => Ok(lookup
            .iter()
            .map(|txt| {
                txt.txt_data()
                    .iter()
                    .map(|chunk| String::from_utf8_lossy(chunk).to_string())
                    .collect::<String>()
            })
            .collect()),
        Err(err) => {
            debug!("TXT lookup for {name} at {ns_host}: {err}");
            Ok(Vec::new())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_ensure_resolvable_fails_for_invalid_name() {
        let names = vec!["definitely-not-a-real-host.invalid".to_string()];
        assert!(ensure_resolvable(&names).await.is_err());
    }

    #[tokio::test]
    async fn test_resolver_for_host_accepts_literal_ip() {
        // Building a resolver pointed at a literal address needs no network.
        assert!(resolver_for_host("127.0.0.1").await.is_ok());
    }
}

use serde::{Deserialize, Serialize};

/// The ACME v1 directory document. Servers expose the mutating resources
/// under stable keys; older deployments may omit the document entirely, in
/// which case the client falls back to conventional `/acme/<resource>`
/// paths.
#[derive(Debug, Deserialize, Clone, Default)]
pub struct Directory {
    #[serde(rename = "new-reg")]
    pub new_reg: Option<String>,
    #[serde(rename = "new-authz")]
    pub new_authz: Option<String>,
    #[serde(rename = "new-cert")]
    pub new_cert: Option<String>,
    #[serde(rename = "revoke-cert")]
    pub revoke_cert: Option<String>,
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ChallengeStatus {
    Pending,
    Processing,
    Valid,
    Invalid,
}

/// Challenge kinds are a heterogeneous list; anything the client does not
/// drive collapses to `Other`.
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
pub enum ChallengeKind {
    #[serde(rename = "http-01")]
    Http01,
    #[serde(rename = "dns-01")]
    Dns01,
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize, Clone)]
pub struct Challenge {
    #[serde(rename = "type")]
    pub kind: ChallengeKind,
    pub uri: String,
    pub token: String,
    pub status: ChallengeStatus,
    pub error: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct Identifier {
    #[serde(rename = "type")]
    pub kind: String,
    pub value: String,
}

#[derive(Debug, Deserialize)]
pub struct Authorization {
    pub identifier: Identifier,
    pub status: Option<String>,
    pub challenges: Vec<Challenge>,
}

/// Status document returned when polling a challenge URI.
#[derive(Debug, Deserialize)]
pub struct ChallengePoll {
    pub status: ChallengeStatus,
    pub error: Option<serde_json::Value>,
}

/// In-flight DNS-01 state persisted to `tmp/dns_verify/<identifier>` so an
/// operator can inspect what the run is waiting on.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct DnsVerifyRecord {
    pub token: String,
    pub uri: String,
    pub key_authorization: String,
    pub identifier: String,
    pub primary_ns: String,
    pub auth_key: String,
}

use anyhow::{Context, Result};
use reqwest::Client;
use reqwest::header::HeaderMap;
use serde::de::DeserializeOwned;
use tracing::{debug, info};

use crate::acme::types::Directory;
use crate::crypto::{self, AccountKey};

const ALG_RS256: &str = "RS256";
const CONTENT_TYPE_JOSE_JSON: &str = "application/jose+json";
const HEADER_REPLAY_NONCE: &str = "replay-nonce";
const HEADER_LOCATION: &str = "location";
const HEADER_LINK: &str = "link";

/// Protocol-level failures the lifecycle controller branches on.
#[derive(Debug, thiserror::Error)]
pub enum AcmeError {
    #[error("unexpected status {status} from {url}: {body}")]
    Status {
        url: String,
        status: u16,
        body: String,
    },
    #[error("missing {header} header in response from {url}")]
    MissingHeader { url: String, header: &'static str },
}

/// Everything a caller needs from one ACME round-trip: the status code,
/// the interesting response headers, and the body.
#[derive(Debug)]
pub struct SignedResponse {
    pub status: u16,
    pub location: Option<String>,
    pub link_up: Option<String>,
    pub body: Vec<u8>,
}

impl SignedResponse {
    /// Body decoded as UTF-8, lossily. ACME error documents are JSON text.
    #[must_use]
    pub fn body_str(&self) -> String {
        String::from_utf8_lossy(&self.body).to_string()
    }

    /// Deserializes the body as JSON.
    ///
    /// # Errors
    /// Returns error if the body is not valid JSON for `T`.
    pub fn json<T: DeserializeOwned>(&self) -> Result<T> {
        serde_json::from_slice(&self.body).context("Failed to parse ACME response body")
    }
}

/// Extracts the `rel="up"` target from `Link` headers.
fn link_up_target(headers: &HeaderMap) -> Option<String> {
    for value in headers.get_all(HEADER_LINK) {
        let Ok(value) = value.to_str() else { continue };
        for part in value.split(',') {
            if !part.contains("rel=\"up\"") {
                continue;
            }
            let start = part.find('<')?;
            let end = part.find('>')?;
            if start < end {
                return Some(part[start + 1..end].to_string());
            }
        }
    }
    None
}

/// ACME v1 transport. Owns the HTTP client, the cached directory, the
/// account key, and the current replay nonce. Nonce usage is serial: every
/// signed request consumes the banked nonce (or fetches a fresh one) and
/// the response's `Replay-Nonce` is banked for the next request.
pub struct AcmeClient {
    http: Client,
    ca: String,
    directory: Option<Directory>,
    nonce: Option<String>,
    account: AccountKey,
}

impl AcmeClient {
    /// Creates a client for the given CA base URL.
    ///
    /// # Errors
    /// Returns error if the HTTP client cannot be built.
    pub fn new(ca: String, account: AccountKey) -> Result<Self> {
        Ok(Self {
            http: Client::builder()
                .build()
                .context("Failed to build HTTP client")?,
            ca: ca.trim_end_matches('/').to_string(),
            directory: None,
            nonce: None,
            account,
        })
    }

    #[must_use]
    pub fn directory_url(&self) -> String {
        format!("{}/directory", self.ca)
    }

    /// `token "." thumbprint` for a challenge token.
    ///
    /// # Errors
    /// Returns error if the thumbprint cannot be computed.
    pub fn key_authorization(&self, token: &str) -> Result<String> {
        let thumbprint = self.account.thumbprint()?;
        Ok(format!("{token}.{thumbprint}"))
    }

    /// Fetches and caches the v1 directory document. A missing or
    /// unparsable directory is tolerated; resource URLs then fall back to
    /// the conventional `/acme/<resource>` layout.
    pub async fn fetch_directory(&mut self) {
        if self.directory.is_some() {
            return;
        }
        let url = self.directory_url();
        info!("Fetching ACME directory from {url}");
        match self.http.get(&url).send().await {
            Ok(resp) => {
                self.remember_nonce(resp.headers());
                match resp.json::<Directory>().await {
                    Ok(directory) => self.directory = Some(directory),
                    Err(err) => {
                        debug!("Directory parse failed ({err}), using conventional paths");
                        self.directory = Some(Directory::default());
                    }
                }
            }
            Err(err) => {
                debug!("Directory fetch failed ({err}), using conventional paths");
                self.directory = Some(Directory::default());
            }
        }
    }

    /// The URL for a v1 resource (`new-reg`, `new-authz`, `new-cert`,
    /// `revoke-cert`).
    pub async fn resource_url(&mut self, resource: &str) -> String {
        self.fetch_directory().await;
        let from_directory = self.directory.as_ref().and_then(|d| match resource {
            "new-reg" => d.new_reg.clone(),
            "new-authz" => d.new_authz.clone(),
            "new-cert" => d.new_cert.clone(),
            "revoke-cert" => d.revoke_cert.clone(),
            _ => None,
        });
        from_directory.unwrap_or_else(|| format!("{}/acme/{resource}", self.ca))
    }

    fn remember_nonce(&mut self, headers: &HeaderMap) {
        if let Some(nonce) = headers
            .get(HEADER_REPLAY_NONCE)
            .and_then(|value| value.to_str().ok())
        {
            self.nonce = Some(nonce.to_string());
        }
    }

    /// Takes the banked nonce or fetches a fresh one with a HEAD request
    /// to the directory. Each nonce is consumed by exactly one signed
    /// request.
    ///
    /// # Errors
    /// Returns error if no nonce can be obtained.
    async fn take_nonce(&mut self) -> Result<String> {
        if let Some(nonce) = self.nonce.take() {
            return Ok(nonce);
        }
        let url = self.directory_url();
        let resp = self
            .http
            .head(&url)
            .send()
            .await
            .context("Nonce request failed")?;
        let nonce = resp
            .headers()
            .get(HEADER_REPLAY_NONCE)
            .context("Missing Replay-Nonce header")?
            .to_str()?
            .to_string();
        Ok(nonce)
    }

    fn envelope(&self, nonce: &str, payload: &serde_json::Value) -> Result<serde_json::Value> {
        let jwk = self.account.jwk();
        let protected = serde_json::json!({
            "alg": ALG_RS256,
            "jwk": jwk,
            "nonce": nonce,
        });
        let protected64 = crypto::b64url(serde_json::to_string(&protected)?.as_bytes());
        let payload64 = crypto::b64url(serde_json::to_string(payload)?.as_bytes());
        let signature = self
            .account
            .sign(&format!("{protected64}.{payload64}"));

        Ok(serde_json::json!({
            "header": { "alg": ALG_RS256, "jwk": jwk },
            "protected": protected64,
            "payload": payload64,
            "signature": signature,
        }))
    }

    async fn post_signed(
        &mut self,
        url: &str,
        payload: &serde_json::Value,
        body_as_b64: bool,
    ) -> Result<SignedResponse> {
        let nonce = self.take_nonce().await?;
        let envelope = self.envelope(&nonce, payload)?;
        debug!("POST {url}");

        let resp = self
            .http
            .post(url)
            .header(reqwest::header::CONTENT_TYPE, CONTENT_TYPE_JOSE_JSON)
            .json(&envelope)
            .send()
            .await
            .with_context(|| format!("POST {url} failed"))?;

        self.remember_nonce(resp.headers());
        let status = resp.status().as_u16();
        let location = resp
            .headers()
            .get(HEADER_LOCATION)
            .and_then(|value| value.to_str().ok())
            .map(ToString::to_string);
        let link_up = link_up_target(resp.headers());
        let raw = resp.bytes().await.context("Failed to read response body")?;
        let body = if body_as_b64 {
            crypto::b64url(&raw).into_bytes()
        } else {
            raw.to_vec()
        };

        Ok(SignedResponse {
            status,
            location,
            link_up,
            body,
        })
    }

    /// Sends a signed v1 request. The payload must already carry its
    /// `resource` field.
    ///
    /// # Errors
    /// Returns error on transport failure; status policing is the
    /// caller's decision.
    pub async fn send_signed(
        &mut self,
        url: &str,
        payload: &serde_json::Value,
    ) -> Result<SignedResponse> {
        self.post_signed(url, payload, false).await
    }

    /// `send_signed` with the response body base64-encoded, for endpoints
    /// that answer with DER.
    ///
    /// # Errors
    /// Returns error on transport failure.
    pub async fn send_signed_b64(
        &mut self,
        url: &str,
        payload: &serde_json::Value,
    ) -> Result<SignedResponse> {
        self.post_signed(url, payload, true).await
    }

    /// Plain GET, capturing the same header set as signed requests (and
    /// banking any nonce the server exposes).
    ///
    /// # Errors
    /// Returns error on transport failure.
    pub async fn get(&mut self, url: &str) -> Result<SignedResponse> {
        debug!("GET {url}");
        let resp = self
            .http
            .get(url)
            .send()
            .await
            .with_context(|| format!("GET {url} failed"))?;
        self.remember_nonce(resp.headers());
        let status = resp.status().as_u16();
        let location = resp
            .headers()
            .get(HEADER_LOCATION)
            .and_then(|value| value.to_str().ok())
            .map(ToString::to_string);
        let link_up = link_up_target(resp.headers());
        let body = resp
            .bytes()
            .await
            .context("Failed to read response body")?
            .to_vec();
        Ok(SignedResponse {
            status,
            location,
            link_up,
            body,
        })
    }

    /// Fails unless `response.status` equals `expected`.
    ///
    /// # Errors
    /// Returns `AcmeError::Status` carrying the body for diagnostics.
    pub fn expect_status(
        url: &str,
        response: &SignedResponse,
        expected: u16,
    ) -> Result<()> {
        if response.status == expected {
            Ok(())
        } else {
            Err(AcmeError::Status {
                url: url.to_string(),
                status: response.status,
                body: response.body_str(),
            }
            .into())
        }
    }
}

#[cfg(test)]
mod tests {
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, Request, ResponseTemplate};

    use super::*;

    const TEST_BITS: u32 = 1024;

    async fn client_for(server: &MockServer) -> AcmeClient {
        let account = AccountKey::generate(TEST_BITS).unwrap();
        AcmeClient::new(server.uri(), account).unwrap()
    }

    fn parse_envelope(request: &Request) -> serde_json::Value {
        serde_json::from_slice(&request.body).unwrap()
    }

    fn decode_protected(envelope: &serde_json::Value) -> serde_json::Value {
        let protected64 = envelope["protected"].as_str().unwrap();
        let bytes = crypto::b64url_decode(protected64).unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_take_nonce_heads_directory() {
        let server = MockServer::start().await;
        Mock::given(method("HEAD"))
            .and(path("/directory"))
            .respond_with(ResponseTemplate::new(200).insert_header("replay-nonce", "nonce-1"))
            .mount(&server)
            .await;

        let mut client = client_for(&server).await;
        let nonce = client.take_nonce().await.unwrap();
        assert_eq!(nonce, "nonce-1");
    }

    #[tokio::test]
    async fn test_envelope_is_flattened_v1_jws() {
        let account = AccountKey::generate(TEST_BITS).unwrap();
        let client = AcmeClient::new("https://ca.example".to_string(), account).unwrap();

        let payload = serde_json::json!({"resource": "new-reg"});
        let envelope = client.envelope("nonce-xyz", &payload).unwrap();

        assert_eq!(envelope["header"]["alg"], "RS256");
        assert!(envelope["header"]["jwk"]["n"].is_string());
        assert_eq!(envelope["header"]["jwk"]["kty"], "RSA");

        let protected = decode_protected(&envelope);
        assert_eq!(protected["alg"], "RS256");
        assert_eq!(protected["nonce"], "nonce-xyz");
        assert!(protected.get("url").is_none());
        assert_eq!(protected["jwk"], envelope["header"]["jwk"]);

        let payload_bytes =
            crypto::b64url_decode(envelope["payload"].as_str().unwrap()).unwrap();
        let decoded: serde_json::Value = serde_json::from_slice(&payload_bytes).unwrap();
        assert_eq!(decoded["resource"], "new-reg");
        assert!(!envelope["signature"].as_str().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_send_signed_uses_and_banks_nonces() {
        let server = MockServer::start().await;
        Mock::given(method("HEAD"))
            .and(path("/directory"))
            .respond_with(ResponseTemplate::new(200).insert_header("replay-nonce", "head-nonce"))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/acme/new-reg"))
            .and(header("content-type", CONTENT_TYPE_JOSE_JSON))
            .respond_with(
                ResponseTemplate::new(201).insert_header("replay-nonce", "post-nonce"),
            )
            .expect(2)
            .mount(&server)
            .await;

        let mut client = client_for(&server).await;
        let url = format!("{}/acme/new-reg", server.uri());
        let payload = serde_json::json!({"resource": "new-reg"});

        client.send_signed(&url, &payload).await.unwrap();
        client.send_signed(&url, &payload).await.unwrap();

        let requests = server.received_requests().await.unwrap();
        let posts: Vec<_> = requests
            .iter()
            .filter(|request| request.method.as_str() == "POST")
            .collect();
        assert_eq!(posts.len(), 2);

        let first = decode_protected(&parse_envelope(posts[0]));
        let second = decode_protected(&parse_envelope(posts[1]));
        assert_eq!(first["nonce"], "head-nonce");
        assert_eq!(second["nonce"], "post-nonce");
        assert_ne!(first["nonce"], second["nonce"]);
    }

    #[tokio::test]
    async fn test_send_signed_captures_location_and_link() {
        let server = MockServer::start().await;
        Mock::given(method("HEAD"))
            .and(path("/directory"))
            .respond_with(ResponseTemplate::new(200).insert_header("replay-nonce", "n"))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/acme/new-cert"))
            .respond_with(
                ResponseTemplate::new(201)
                    .insert_header("replay-nonce", "n2")
                    .insert_header("location", "https://ca.example/cert/123")
                    .insert_header(
                        "link",
                        "<https://ca.example/acme/issuer-cert>;rel=\"up\"",
                    ),
            )
            .mount(&server)
            .await;

        let mut client = client_for(&server).await;
        let url = format!("{}/acme/new-cert", server.uri());
        let response = client
            .send_signed(&url, &serde_json::json!({"resource": "new-cert"}))
            .await
            .unwrap();

        assert_eq!(response.status, 201);
        assert_eq!(
            response.location.as_deref(),
            Some("https://ca.example/cert/123")
        );
        assert_eq!(
            response.link_up.as_deref(),
            Some("https://ca.example/acme/issuer-cert")
        );
    }

    #[tokio::test]
    async fn test_send_signed_b64_encodes_binary_body() {
        let server = MockServer::start().await;
        Mock::given(method("HEAD"))
            .and(path("/directory"))
            .respond_with(ResponseTemplate::new(200).insert_header("replay-nonce", "n"))
            .mount(&server)
            .await;
        let der = vec![0x30u8, 0x82, 0x01, 0x00, 0xff];
        Mock::given(method("POST"))
            .and(path("/acme/new-cert"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("replay-nonce", "n2")
                    .set_body_bytes(der.clone()),
            )
            .mount(&server)
            .await;

        let mut client = client_for(&server).await;
        let url = format!("{}/acme/new-cert", server.uri());
        let response = client
            .send_signed_b64(&url, &serde_json::json!({"resource": "new-cert"}))
            .await
            .unwrap();

        let decoded = crypto::b64url_decode(&response.body_str()).unwrap();
        assert_eq!(decoded, der);
    }

    #[tokio::test]
    async fn test_resource_url_prefers_directory() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/directory"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "new-reg": "https://ca.example/custom/new-reg"
            })))
            .mount(&server)
            .await;

        let mut client = client_for(&server).await;
        assert_eq!(
            client.resource_url("new-reg").await,
            "https://ca.example/custom/new-reg"
        );
        // Not present in the directory: conventional path.
        assert_eq!(
            client.resource_url("new-authz").await,
            format!("{}/acme/new-authz", server.uri())
        );
    }

    #[tokio::test]
    async fn test_resource_url_falls_back_without_directory() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/directory"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let mut client = client_for(&server).await;
        assert_eq!(
            client.resource_url("new-cert").await,
            format!("{}/acme/new-cert", server.uri())
        );
    }

    #[test]
    fn test_link_up_target_parsing() {
        let mut headers = HeaderMap::new();
        headers.append(
            HEADER_LINK,
            "<https://ca.example/terms>;rel=\"terms-of-service\""
                .parse()
                .unwrap(),
        );
        headers.append(
            HEADER_LINK,
            "<https://ca.example/acme/issuer-cert>;rel=\"up\""
                .parse()
                .unwrap(),
        );
        assert_eq!(
            link_up_target(&headers).as_deref(),
            Some("https://ca.example/acme/issuer-cert")
        );

        let empty = HeaderMap::new();
        assert!(link_up_target(&empty).is_none());
    }

    #[tokio::test]
    async fn test_expect_status_reports_body() {
        let response = SignedResponse {
            status: 400,
            location: None,
            link_up: None,
            body: b"{\"detail\":\"boom\"}".to_vec(),
        };
        let err =
            AcmeClient::expect_status("https://ca.example/acme/new-authz", &response, 201)
                .unwrap_err();
        let message = err.to_string();
        assert!(message.contains("400"));
        assert!(message.contains("boom"));
    }
}

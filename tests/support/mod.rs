use std::path::Path;

use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

pub const TEST_DOMAIN: &str = "localhost";
pub const LEAF_DER: &[u8] = &[0x30, 0x82, 0x01, 0x0a, 0xaa, 0xbb];
pub const ISSUER_DER: &[u8] = &[0x30, 0x82, 0x02, 0x0b, 0xcc, 0xdd];
pub const CHALLENGE_TOKEN: &str = "tok-e2e-1";

/// Mounts a complete ACME v1 server: directory, nonces, registration,
/// authorization with an `http-01` challenge, challenge notification and
/// polling, and certificate issuance with `Location` and `Link` headers.
pub async fn mount_acme_v1(server: &MockServer) {
    let base = server.uri();

    Mock::given(method("GET"))
        .and(path("/directory"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("replay-nonce", "dir-nonce")
                .set_body_json(serde_json::json!({
                    "new-reg": format!("{base}/acme/new-reg"),
                    "new-authz": format!("{base}/acme/new-authz"),
                    "new-cert": format!("{base}/acme/new-cert"),
                    "revoke-cert": format!("{base}/acme/revoke-cert"),
                })),
        )
        .mount(server)
        .await;

    Mock::given(method("HEAD"))
        .and(path("/directory"))
        .respond_with(ResponseTemplate::new(200).insert_header("replay-nonce", "head-nonce"))
        .mount(server)
        .await;

    Mock::given(method("POST"))
        .and(path("/acme/new-reg"))
        .respond_with(ResponseTemplate::new(201).insert_header("replay-nonce", "reg-nonce"))
        .mount(server)
        .await;

    Mock::given(method("POST"))
        .and(path("/acme/new-authz"))
        .respond_with(
            ResponseTemplate::new(201)
                .insert_header("replay-nonce", "authz-nonce")
                .set_body_json(serde_json::json!({
                    "identifier": {"type": "dns", "value": TEST_DOMAIN},
                    "status": "pending",
                    "challenges": [
                        {
                            "type": "tls-sni-01",
                            "status": "pending",
                            "uri": format!("{base}/acme/challenge/0"),
                            "token": "unused",
                        },
                        {
                            "type": "http-01",
                            "status": "pending",
                            "uri": format!("{base}/acme/challenge/1"),
                            "token": CHALLENGE_TOKEN,
                        }
                    ],
                })),
        )
        .mount(server)
        .await;

    Mock::given(method("POST"))
        .and(path("/acme/challenge/1"))
        .respond_with(ResponseTemplate::new(202).insert_header("replay-nonce", "chal-nonce"))
        .mount(server)
        .await;

    Mock::given(method("GET"))
        .and(path("/acme/challenge/1"))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(serde_json::json!({"status": "valid"})),
        )
        .mount(server)
        .await;

    Mock::given(method("POST"))
        .and(path("/acme/new-cert"))
        .respond_with(
            ResponseTemplate::new(201)
                .insert_header("replay-nonce", "cert-nonce")
                .insert_header("location", format!("{base}/cert/1").as_str())
                .insert_header("link", format!("<{base}/issuer>;rel=\"up\"").as_str()),
        )
        .mount(server)
        .await;

    Mock::given(method("GET"))
        .and(path("/cert/1"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(LEAF_DER.to_vec()))
        .mount(server)
        .await;

    Mock::given(method("GET"))
        .and(path("/issuer"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(ISSUER_DER.to_vec()))
        .mount(server)
        .await;
}

/// Writes a workspace-global config aimed at the mock server. Small keys
/// keep the test suite fast; the production defaults stay 4096.
pub fn write_test_config(work_dir: &Path, ca: &str, acl_dir: &Path) {
    let config = format!(
        r#"ca = "{ca}"
check_remote = false
skip_http_token_check = true
account_key_length = 1024
private_key_alg = "prime256v1"
renew_allow = 30
acl = ["{acl}"]
"#,
        acl = acl_dir.display()
    );
    std::fs::write(work_dir.join("getssl.cfg"), config).unwrap();
}

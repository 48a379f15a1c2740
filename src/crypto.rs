use std::path::Path;

use anyhow::{Context, Result};
use base64::Engine;
use rcgen::{CertificateParams, KeyPair, SanType};
use ring::digest::{SHA256, digest};
use rsa::RsaPrivateKey;
use rsa::pkcs1v15::SigningKey;
use rsa::pkcs8::{DecodePrivateKey, EncodePrivateKey, LineEnding};
use rsa::sha2::Sha256;
use rsa::signature::{SignatureEncoding, Signer};
use rsa::traits::PublicKeyParts;
use serde::Serialize;
use x509_parser::certification_request::X509CertificationRequest;
use x509_parser::extensions::{GeneralName, ParsedExtension};
use x509_parser::prelude::{FromDer, X509Certificate, parse_x509_pem};

const PEM_LINE_WIDTH: usize = 64;

/// Encodes bytes with the URL-safe base64 variant used for every ACME
/// field: no padding, no `+`, no `/`, no whitespace.
#[must_use]
pub fn b64url(data: &[u8]) -> String {
    base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(data)
}

/// Decodes the URL-safe no-padding base64 variant.
///
/// # Errors
/// Returns error if the input is not valid URL-safe base64.
pub fn b64url_decode(data: &str) -> Result<Vec<u8>> {
    base64::engine::general_purpose::URL_SAFE_NO_PAD
        .decode(data)
        .context("Invalid URL-safe base64")
}

#[must_use]
pub fn sha256(data: &[u8]) -> Vec<u8> {
    digest(&SHA256, data).as_ref().to_vec()
}

/// JWK representation of an RSA account key. Fields are ordered so that
/// serializing the struct yields the canonical `{"e":..,"kty":..,"n":..}`
/// form the thumbprint is computed over.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct Jwk {
    pub e: String,
    pub kty: String,
    pub n: String,
}

/// Big-endian magnitude bytes with a leading zero byte when the high bit
/// is set, matching the DER integer convention the CA expects.
fn jwk_int(bytes: &[u8]) -> Vec<u8> {
    let stripped: Vec<u8> = bytes.iter().copied().skip_while(|&b| b == 0).collect();
    if stripped.first().is_some_and(|&b| b & 0x80 != 0) {
        let mut padded = Vec::with_capacity(stripped.len() + 1);
        padded.push(0);
        padded.extend_from_slice(&stripped);
        padded
    } else {
        stripped
    }
}

/// The account keypair: an RSA key plus its derived JWK and thumbprint.
pub struct AccountKey {
    key: RsaPrivateKey,
    jwk: Jwk,
}

impl AccountKey {
    /// Generates a fresh RSA account key.
    ///
    /// # Errors
    /// Returns error if RSA key generation fails.
    pub fn generate(bits: u32) -> Result<Self> {
        let mut rng = rand::thread_rng();
        let key = RsaPrivateKey::new(&mut rng, bits as usize)
            .context("Failed to generate RSA account key")?;
        Ok(Self::from_key(key))
    }

    /// Loads an account key from PKCS#8 PEM.
    ///
    /// # Errors
    /// Returns error if the PEM cannot be parsed as an RSA private key.
    pub fn from_pem(pem: &str) -> Result<Self> {
        let key =
            RsaPrivateKey::from_pkcs8_pem(pem).context("Failed to parse account key PEM")?;
        Ok(Self::from_key(key))
    }

    fn from_key(key: RsaPrivateKey) -> Self {
        let jwk = Jwk {
            e: b64url(&jwk_int(&key.e().to_bytes_be())),
            kty: "RSA".to_string(),
            n: b64url(&jwk_int(&key.n().to_bytes_be())),
        };
        Self { key, jwk }
    }

    /// Serializes the key as PKCS#8 PEM.
    ///
    /// # Errors
    /// Returns error if PKCS#8 encoding fails.
    pub fn to_pem(&self) -> Result<String> {
        let pem = self
            .key
            .to_pkcs8_pem(LineEnding::LF)
            .context("Failed to encode account key")?;
        Ok(pem.to_string())
    }

    #[must_use]
    pub fn jwk(&self) -> &Jwk {
        &self.jwk
    }

    /// SHA-256 thumbprint of the canonical JWK, URL-safe base64.
    ///
    /// # Errors
    /// Returns error if JWK serialization fails.
    pub fn thumbprint(&self) -> Result<String> {
        let canonical = serde_json::to_string(&self.jwk)?;
        Ok(b64url(&sha256(canonical.as_bytes())))
    }

    /// RS256 signature over `protected64 "." payload64`, URL-safe base64.
    #[must_use]
    pub fn sign(&self, signing_input: &str) -> String {
        let signer = SigningKey::<Sha256>::new(self.key.clone());
        let signature = signer.sign(signing_input.as_bytes());
        b64url(&signature.to_vec())
    }
}

/// Key algorithm for the per-domain key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Deserialize)]
pub enum KeyAlg {
    #[serde(rename = "rsa")]
    Rsa,
    #[serde(rename = "prime256v1")]
    Prime256v1,
}

/// Generates a per-domain private key as PKCS#8 PEM.
///
/// # Errors
/// Returns error if key generation fails.
pub fn generate_domain_key(alg: KeyAlg, rsa_bits: u32) -> Result<String> {
    match alg {
        KeyAlg::Rsa => {
            let mut rng = rand::thread_rng();
            let key = RsaPrivateKey::new(&mut rng, rsa_bits as usize)
                .context("Failed to generate RSA domain key")?;
            let pem = key
                .to_pkcs8_pem(LineEnding::LF)
                .context("Failed to encode domain key")?;
            Ok(pem.to_string())
        }
        KeyAlg::Prime256v1 => {
            let key = KeyPair::generate_for(&rcgen::PKCS_ECDSA_P256_SHA256)
                .context("Failed to generate ECDSA domain key")?;
            Ok(key.serialize_pem())
        }
    }
}

fn csr_key_pair(key_pem: &str, alg: KeyAlg) -> Result<KeyPair> {
    match alg {
        KeyAlg::Rsa => KeyPair::from_pem_and_sign_algo(key_pem, &rcgen::PKCS_RSA_SHA256)
            .context("Failed to load RSA domain key for CSR"),
        KeyAlg::Prime256v1 => {
            KeyPair::from_pem(key_pem).context("Failed to load ECDSA domain key for CSR")
        }
    }
}

/// Builds a DER CSR with an empty subject and a `DNS:` subjectAltName
/// entry for every name. Identity lives solely in the SAN list.
///
/// # Errors
/// Returns error if the key cannot be loaded or CSR serialization fails.
pub fn build_csr(key_pem: &str, alg: KeyAlg, names: &[String]) -> Result<Vec<u8>> {
    if names.is_empty() {
        anyhow::bail!("CSR requires at least one name");
    }
    let mut params = CertificateParams::default();

    let mut sans = Vec::with_capacity(names.len());
    for name in names {
        let dns_name = name
            .clone()
            .try_into()
            .with_context(|| format!("Invalid DNS name: {name}"))?;
        sans.push(SanType::DnsName(dns_name));
    }
    params.subject_alt_names = sans;

    let key_pair = csr_key_pair(key_pem, alg)?;
    let csr = params
        .serialize_request(&key_pair)
        .context("Failed to serialize CSR")?;
    Ok(csr.der().to_vec())
}

/// Parses the SAN list out of a DER CSR.
///
/// # Errors
/// Returns error if the bytes are not a valid CSR.
pub fn inspect_csr(der: &[u8]) -> Result<Vec<String>> {
    let (_, csr) =
        X509CertificationRequest::from_der(der).map_err(|e| anyhow::anyhow!("Bad CSR: {e}"))?;
    let mut names = Vec::new();
    if let Some(extensions) = csr.requested_extensions() {
        for extension in extensions {
            if let ParsedExtension::SubjectAlternativeName(san) = extension {
                for general_name in &san.general_names {
                    if let GeneralName::DNSName(dns) = general_name {
                        names.push((*dns).to_string());
                    }
                }
            }
        }
    }
    Ok(names)
}

/// Parsed facts about an X.509 certificate.
#[derive(Debug, Clone)]
pub struct CertInfo {
    pub subject_cn: Option<String>,
    pub sans: Vec<String>,
    pub not_before: time::OffsetDateTime,
    pub not_after: time::OffsetDateTime,
    pub sha256_fingerprint: Vec<u8>,
}

fn cert_info(x509: &X509Certificate<'_>, der: &[u8]) -> CertInfo {
    let subject_cn = x509
        .subject()
        .iter_common_name()
        .next()
        .and_then(|attr| attr.as_str().ok())
        .map(ToString::to_string);

    let sans = x509
        .subject_alternative_name()
        .ok()
        .flatten()
        .map(|ext| {
            ext.value
                .general_names
                .iter()
                .filter_map(|general_name| match general_name {
                    GeneralName::DNSName(dns) => Some((*dns).to_string()),
                    _ => None,
                })
                .collect()
        })
        .unwrap_or_default();

    CertInfo {
        subject_cn,
        sans,
        not_before: x509.validity().not_before.to_datetime(),
        not_after: x509.validity().not_after.to_datetime(),
        sha256_fingerprint: sha256(der),
    }
}

/// Parses a PEM certificate.
///
/// # Errors
/// Returns error if the input is not a valid PEM certificate.
pub fn parse_cert(pem: &[u8]) -> Result<CertInfo> {
    let (_, parsed) = parse_x509_pem(pem).map_err(|e| anyhow::anyhow!("Bad PEM: {e}"))?;
    let x509 = parsed
        .parse_x509()
        .map_err(|e| anyhow::anyhow!("Bad certificate: {e}"))?;
    Ok(cert_info(&x509, &parsed.contents))
}

/// Parses a DER certificate (as fetched from a TLS probe or the CA).
///
/// # Errors
/// Returns error if the bytes are not a valid certificate.
pub fn parse_cert_der(der: &[u8]) -> Result<CertInfo> {
    let (_, x509) =
        X509Certificate::from_der(der).map_err(|e| anyhow::anyhow!("Bad certificate: {e}"))?;
    Ok(cert_info(&x509, der))
}

/// Reads and parses a PEM certificate file.
///
/// # Errors
/// Returns error if the file cannot be read or parsed.
pub fn parse_cert_file(path: &Path) -> Result<CertInfo> {
    let pem = std::fs::read(path)
        .with_context(|| format!("Failed to read certificate {}", path.display()))?;
    parse_cert(&pem)
}

/// Wraps DER bytes in classic PEM armor with 64-column base64 lines.
#[must_use]
pub fn pem_from_der(label: &str, der: &[u8]) -> String {
    let encoded = base64::engine::general_purpose::STANDARD.encode(der);
    let mut out = format!("-----BEGIN {label}-----\n");
    let mut offset = 0;
    while offset < encoded.len() {
        let end = (offset + PEM_LINE_WIDTH).min(encoded.len());
        out.push_str(&encoded[offset..end]);
        out.push('\n');
        offset = end;
    }
    out.push_str(&format!("-----END {label}-----\n"));
    out
}

/// Extracts the DER payload of the first PEM block in `data`.
///
/// # Errors
/// Returns error if no PEM block is present.
pub fn pem_to_der(data: &[u8]) -> Result<Vec<u8>> {
    let (pem, _) = x509_parser::pem::Pem::read(std::io::Cursor::new(data))
        .map_err(|e| anyhow::anyhow!("Bad PEM: {e}"))?;
    Ok(pem.contents)
}

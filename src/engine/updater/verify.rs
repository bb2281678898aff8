//! Cryptographic Verification
//!
//! Content hashing for assets and code-signing verification for manifests.
//! Manifests are signed with ED25519 over the SHA256 digest of the body.
//! Certificates are JSON documents signed by their issuer; a chain is a JSON
//! array ordered leaf first.

use crate::engine::config::{CodeSigningMetadata, ConfigError, UpdatesConfig};
use base64::engine::general_purpose::{STANDARD, URL_SAFE_NO_PAD};
use base64::Engine;
use chrono::{DateTime, Utc};
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fs;
use std::path::Path;
use thiserror::Error;

/// Key id reserved for the development client trust chain
pub const EXPO_GO_KEY_ID: &str = "expo-go";
pub const ALG_ED25519: &str = "ed25519";
const DEFAULT_KEY_ID: &str = "root";

/// base64url (unpadded) SHA256 of the bytes
pub fn content_hash(bytes: &[u8]) -> String {
    URL_SAFE_NO_PAD.encode(Sha256::digest(bytes))
}

#[derive(Error, Debug, PartialEq)]
pub enum SignatureError {
    #[error("No code signing key matches keyid '{0}'")]
    NoMatchingKey(String),
    #[error("Manifest signature is invalid")]
    InvalidSignature,
    #[error("Certificate '{subject}' is outside its validity window")]
    ChainExpired { subject: String },
    #[error("Manifest is not signed but code signing is required")]
    MissingSignature,
    #[error("Malformed signature header: {0}")]
    MalformedHeader(String),
    #[error("Unsupported signing algorithm '{0}'")]
    UnsupportedAlgorithm(String),
    #[error("Invalid certificate chain: {0}")]
    InvalidChain(String),
}

/// Parsed `expo-signature` structured field
#[derive(Debug, Clone, PartialEq)]
pub struct SignatureHeader {
    pub sig: String,
    pub keyid: String,
    pub alg: String,
}

impl SignatureHeader {
    /// Parse a structured-field dictionary such as
    /// `sig="...", keyid="expo-go", alg="ed25519"`
    pub fn parse(value: &str) -> Result<Self, SignatureError> {
        let mut sig = None;
        let mut keyid = None;
        let mut alg = None;

        for member in split_members(value)? {
            let member = member.trim();
            if member.is_empty() {
                continue;
            }
            // Parameters are not used by the signing protocol
            let member = member.split(';').next().unwrap_or_default();
            let (key, raw) = match member.split_once('=') {
                Some((key, raw)) => (key.trim(), Some(raw.trim())),
                None => (member.trim(), None),
            };
            let value = match raw {
                Some(raw) => Some(parse_item(raw)?),
                None => None,
            };
            match key {
                "sig" => sig = value,
                "keyid" => keyid = value,
                "alg" => alg = value,
                _ => {}
            }
        }

        let sig = sig.ok_or_else(|| {
            SignatureError::MalformedHeader("missing string member 'sig'".to_string())
        })?;
        Ok(Self {
            sig,
            keyid: keyid.unwrap_or_else(|| DEFAULT_KEY_ID.to_string()),
            alg: alg.unwrap_or_else(|| ALG_ED25519.to_string()),
        })
    }

    pub fn to_header_value(&self) -> String {
        format!(
            "sig=\"{}\", keyid=\"{}\", alg=\"{}\"",
            self.sig, self.keyid, self.alg
        )
    }

    /// Sign a manifest body the way the update server does
    pub fn sign(manifest: &[u8], key: &SigningKey, keyid: &str) -> Self {
        let signature = key.sign(&Sha256::digest(manifest));
        Self {
            sig: STANDARD.encode(signature.to_bytes()),
            keyid: keyid.to_string(),
            alg: ALG_ED25519.to_string(),
        }
    }
}

/// Split on commas that are outside quoted strings
fn split_members(value: &str) -> Result<Vec<&str>, SignatureError> {
    let mut members = Vec::new();
    let mut start = 0;
    let mut in_string = false;
    let mut escaped = false;

    for (i, c) in value.char_indices() {
        if in_string {
            match c {
                _ if escaped => escaped = false,
                '\\' => escaped = true,
                '"' => in_string = false,
                _ => {}
            }
        } else if c == '"' {
            in_string = true;
        } else if c == ',' {
            members.push(&value[start..i]);
            start = i + 1;
        }
    }
    if in_string {
        return Err(SignatureError::MalformedHeader(
            "unterminated string".to_string(),
        ));
    }
    members.push(&value[start..]);
    Ok(members)
}

fn parse_item(raw: &str) -> Result<String, SignatureError> {
    let Some(quoted) = raw.strip_prefix('"') else {
        // Bare tokens are accepted for keyid and alg
        return Ok(raw.to_string());
    };
    let inner = quoted
        .strip_suffix('"')
        .ok_or_else(|| SignatureError::MalformedHeader(format!("bad string {}", raw)))?;

    let mut out = String::with_capacity(inner.len());
    let mut chars = inner.chars();
    while let Some(c) = chars.next() {
        if c == '\\' {
            match chars.next() {
                Some(next @ ('"' | '\\')) => out.push(next),
                _ => {
                    return Err(SignatureError::MalformedHeader(format!(
                        "bad escape in {}",
                        raw
                    )))
                }
            }
        } else {
            out.push(c);
        }
    }
    Ok(out)
}

/// Signed portion of a certificate
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CertificateBody {
    pub subject: String,
    pub issuer: String,
    /// base64 ED25519 public key
    pub public_key: String,
    pub not_before: DateTime<Utc>,
    pub not_after: DateTime<Utc>,
    #[serde(default)]
    pub is_ca: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Certificate {
    #[serde(flatten)]
    pub body: CertificateBody,
    /// base64 issuer signature over the JSON encoding of `body`
    pub signature: String,
}

impl Certificate {
    pub fn issue(body: CertificateBody, issuer_key: &SigningKey) -> Result<Self, SignatureError> {
        let message = serde_json::to_vec(&body)
            .map_err(|e| SignatureError::InvalidChain(e.to_string()))?;
        let signature = issuer_key.sign(&message);
        Ok(Self {
            body,
            signature: STANDARD.encode(signature.to_bytes()),
        })
    }

    pub fn parse(text: &str) -> Result<Self, SignatureError> {
        serde_json::from_str(text).map_err(|e| SignatureError::InvalidChain(e.to_string()))
    }

    pub fn parse_chain(text: &str) -> Result<Vec<Self>, SignatureError> {
        serde_json::from_str(text).map_err(|e| SignatureError::InvalidChain(e.to_string()))
    }

    pub fn verifying_key(&self) -> Result<VerifyingKey, SignatureError> {
        let bytes = STANDARD.decode(&self.body.public_key).map_err(|e| {
            SignatureError::InvalidChain(format!("{}: {}", self.body.subject, e))
        })?;
        let bytes: [u8; 32] = bytes.try_into().map_err(|_| {
            SignatureError::InvalidChain(format!("{}: bad key length", self.body.subject))
        })?;
        VerifyingKey::from_bytes(&bytes)
            .map_err(|_| SignatureError::InvalidChain(format!("{}: bad key", self.body.subject)))
    }

    fn check_validity(&self, now: DateTime<Utc>) -> Result<(), SignatureError> {
        if now < self.body.not_before || now > self.body.not_after {
            return Err(SignatureError::ChainExpired {
                subject: self.body.subject.clone(),
            });
        }
        Ok(())
    }

    fn same_identity(&self, other: &Certificate) -> bool {
        self.body.subject == other.body.subject && self.body.public_key == other.body.public_key
    }

    fn verify_issued_by(&self, issuer: &Certificate) -> Result<(), SignatureError> {
        if !issuer.body.is_ca {
            return Err(SignatureError::InvalidChain(format!(
                "{} is not a certificate authority",
                issuer.body.subject
            )));
        }
        if self.body.issuer != issuer.body.subject {
            return Err(SignatureError::InvalidChain(format!(
                "{} was not issued by {}",
                self.body.subject, issuer.body.subject
            )));
        }
        let message = serde_json::to_vec(&self.body)
            .map_err(|e| SignatureError::InvalidChain(e.to_string()))?;
        let signature = decode_signature(&self.signature)
            .map_err(|_| SignatureError::InvalidChain(format!("{}: bad signature", self.body.subject)))?;
        issuer
            .verifying_key()?
            .verify(&message, &signature)
            .map_err(|_| {
                SignatureError::InvalidChain(format!(
                    "{} signature does not verify against {}",
                    self.body.subject, issuer.body.subject
                ))
            })
    }
}

fn decode_signature(encoded: &str) -> Result<Signature, SignatureError> {
    let sig_bytes = STANDARD
        .decode(encoded)
        .map_err(|_| SignatureError::InvalidSignature)?;
    if sig_bytes.len() != 64 {
        return Err(SignatureError::InvalidSignature);
    }
    let mut sig_array = [0u8; 64];
    sig_array.copy_from_slice(&sig_bytes);
    Ok(Signature::from_bytes(&sig_array))
}

/// Walk `chain` (leaf first) up to `anchor`; returns the leaf
fn validate_chain<'a>(
    chain: &'a [Certificate],
    anchor: &Certificate,
    now: DateTime<Utc>,
) -> Result<&'a Certificate, SignatureError> {
    let leaf = chain
        .first()
        .ok_or_else(|| SignatureError::InvalidChain("empty certificate chain".to_string()))?;

    anchor.check_validity(now)?;
    for cert in chain {
        cert.check_validity(now)?;
    }
    for pair in chain.windows(2) {
        pair[0].verify_issued_by(&pair[1])?;
    }

    if let Some(top) = chain.last() {
        if !top.same_identity(anchor) {
            top.verify_issued_by(anchor)?;
        }
    }
    Ok(leaf)
}

/// Outcome of a successful verification
#[derive(Debug, Clone, PartialEq)]
pub struct VerifiedManifest {
    pub is_verified: bool,
    pub keyid: Option<String>,
}

/// Code-signing verifier built from the configuration
pub struct CodeSigningVerifier {
    root: Option<Certificate>,
    developer: Option<(Certificate, CodeSigningMetadata)>,
    include_manifest_response_certificate_chain: bool,
    allow_unsigned: bool,
}

impl CodeSigningVerifier {
    pub fn new(
        root: Option<Certificate>,
        developer: Option<(Certificate, CodeSigningMetadata)>,
        allow_unsigned: bool,
    ) -> Self {
        Self {
            root,
            developer,
            include_manifest_response_certificate_chain: false,
            allow_unsigned,
        }
    }

    pub fn with_response_certificate_chain(mut self, include: bool) -> Self {
        self.include_manifest_response_certificate_chain = include;
        self
    }

    /// `None` when code signing is not configured
    pub fn from_config(config: &UpdatesConfig) -> Result<Option<Self>, ConfigError> {
        let Some(signing) = &config.code_signing else {
            return Ok(None);
        };

        let developer = load_certificate(&signing.certificate_path)?;
        let root = match &signing.root_certificate_path {
            Some(path) => Some(load_certificate(path)?),
            None => None,
        };

        Ok(Some(
            Self::new(
                root,
                Some((developer, signing.metadata.clone())),
                signing.allow_unsigned_manifests,
            )
            .with_response_certificate_chain(signing.include_manifest_response_certificate_chain),
        ))
    }

    pub fn verify(
        &self,
        manifest: &[u8],
        signature_header: Option<&str>,
        certificate_chain: Option<&str>,
    ) -> Result<VerifiedManifest, SignatureError> {
        self.verify_at(manifest, signature_header, certificate_chain, Utc::now())
    }

    pub fn verify_at(
        &self,
        manifest: &[u8],
        signature_header: Option<&str>,
        certificate_chain: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<VerifiedManifest, SignatureError> {
        let Some(header) = signature_header else {
            if self.allow_unsigned {
                tracing::debug!("accepting unsigned manifest");
                return Ok(VerifiedManifest {
                    is_verified: false,
                    keyid: None,
                });
            }
            return Err(SignatureError::MissingSignature);
        };

        let header = SignatureHeader::parse(header)?;
        if header.alg != ALG_ED25519 {
            return Err(SignatureError::UnsupportedAlgorithm(header.alg));
        }

        let chain = match certificate_chain {
            Some(text) => Certificate::parse_chain(text)?,
            None => Vec::new(),
        };

        let leaf = if header.keyid == EXPO_GO_KEY_ID {
            let root = self
                .root
                .as_ref()
                .ok_or_else(|| SignatureError::NoMatchingKey(header.keyid.clone()))?;
            if chain.is_empty() {
                return Err(SignatureError::InvalidChain(
                    "certificate chain required for expo-go key".to_string(),
                ));
            }
            validate_chain(&chain, root, now)?.clone()
        } else {
            let (developer, metadata) = self
                .developer
                .as_ref()
                .filter(|(_, metadata)| metadata.keyid == header.keyid)
                .ok_or_else(|| SignatureError::NoMatchingKey(header.keyid.clone()))?;
            if metadata.alg != header.alg {
                return Err(SignatureError::UnsupportedAlgorithm(header.alg));
            }
            if self.include_manifest_response_certificate_chain && !chain.is_empty() {
                validate_chain(&chain, developer, now)?.clone()
            } else {
                developer.check_validity(now)?;
                developer.clone()
            }
        };

        let signature = decode_signature(&header.sig)?;
        leaf.verifying_key()?
            .verify(&Sha256::digest(manifest), &signature)
            .map_err(|_| SignatureError::InvalidSignature)?;

        tracing::debug!(keyid = %header.keyid, subject = %leaf.body.subject, "manifest signature verified");
        Ok(VerifiedManifest {
            is_verified: true,
            keyid: Some(header.keyid),
        })
    }
}

fn load_certificate(path: &Path) -> Result<Certificate, ConfigError> {
    let text = fs::read_to_string(path).map_err(|e| ConfigError::Certificate {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })?;
    Certificate::parse(&text).map_err(|e| ConfigError::Certificate {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })
}

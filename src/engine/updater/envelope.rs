//! Manifest response envelope
//!
//! Request headers sent to the manifest endpoint, and parsing of its
//! response: either a bare JSON manifest or a `multipart/mixed` body whose
//! parts are named by `content-disposition`.

use crate::engine::catalog::{AssetRecord, UpdateRecord, UpdateStatus};
use crate::engine::config::UpdatesConfig;
use crate::engine::updater::manifest::Manifest;
use crate::engine::updater::verify::{CodeSigningVerifier, SignatureError};
use std::collections::BTreeMap;
use thiserror::Error;

pub const PROTOCOL_VERSION: &str = "0";
pub const SFV_VERSION: &str = "0";

const MANIFEST_PART: &str = "manifest";
const CERTIFICATE_CHAIN_PART: &str = "certificate_chain";
const SIGNATURE_HEADERS: [&str; 2] = ["expo-signature", "expo-manifest-signature"];

#[derive(Error, Debug)]
pub enum EnvelopeError {
    #[error("Unsupported manifest response content type: {0}")]
    UnsupportedContentType(String),
    #[error("Malformed multipart body: {0}")]
    MalformedMultipart(String),
    #[error("Multipart response has no manifest part")]
    MissingManifestPart,
    #[error("Unsupported protocol version: {0}")]
    UnsupportedProtocol(String),
    #[error(transparent)]
    Signature(#[from] SignatureError),
    #[error("Invalid manifest: {0}")]
    Manifest(#[from] serde_json::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Platform {
    Ios,
    Android,
}

impl Platform {
    pub fn as_str(&self) -> &'static str {
        match self {
            Platform::Ios => "ios",
            Platform::Android => "android",
        }
    }
}

/// Headers for a manifest request built from the configuration
pub fn manifest_request_headers(
    config: &UpdatesConfig,
    platform: Platform,
) -> BTreeMap<String, String> {
    let mut headers = BTreeMap::new();
    headers.insert(
        "accept".to_string(),
        "multipart/mixed, application/expo+json, application/json".to_string(),
    );
    headers.insert("expo-platform".to_string(), platform.as_str().to_string());
    headers.insert("expo-protocol-version".to_string(), PROTOCOL_VERSION.to_string());
    headers.insert("expo-sfv-version".to_string(), SFV_VERSION.to_string());
    headers.insert("expo-api-version".to_string(), "1".to_string());
    headers.insert("cache-control".to_string(), "private, max-age=0".to_string());
    headers.insert(
        "expo-release-channel".to_string(),
        config.release_channel.clone(),
    );
    if let Some(runtime_version) = config.effective_runtime_version() {
        headers.insert("expo-runtime-version".to_string(), runtime_version.to_string());
    }
    if let Some(signing) = &config.code_signing {
        headers.insert("expo-accept-signature".to_string(), "true".to_string());
        headers.insert(
            "expo-expect-signature".to_string(),
            format!(
                "sig, keyid=\"{}\", alg=\"{}\"",
                signing.metadata.keyid, signing.metadata.alg
            ),
        );
    }
    for (name, value) in &config.request_headers {
        headers.insert(name.to_ascii_lowercase(), value.clone());
    }
    headers
}

fn header<'a>(headers: &'a BTreeMap<String, String>, name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|(k, _)| k.eq_ignore_ascii_case(name))
        .map(|(_, v)| v.as_str())
}

fn signature_header(headers: &BTreeMap<String, String>) -> Option<String> {
    SIGNATURE_HEADERS
        .iter()
        .find_map(|name| header(headers, name))
        .map(str::to_string)
}

/// Raw pieces of a manifest response, before verification
#[derive(Debug, Clone, Default)]
pub struct ManifestResponse {
    pub manifest: Vec<u8>,
    pub signature: Option<String>,
    pub certificate_chain: Option<String>,
}

impl ManifestResponse {
    pub fn parse(headers: &BTreeMap<String, String>, body: &[u8]) -> Result<Self, EnvelopeError> {
        if let Some(version) = header(headers, "expo-protocol-version") {
            if version.trim() != PROTOCOL_VERSION {
                return Err(EnvelopeError::UnsupportedProtocol(version.to_string()));
            }
        }

        let content_type = header(headers, "content-type").unwrap_or("application/json");
        let mime = content_type
            .split(';')
            .next()
            .unwrap_or_default()
            .trim()
            .to_ascii_lowercase();

        match mime.as_str() {
            "multipart/mixed" => {
                let boundary = content_type_param(content_type, "boundary").ok_or_else(|| {
                    EnvelopeError::MalformedMultipart("missing boundary".to_string())
                })?;
                let parts = parse_multipart(body, &boundary)?;
                Self::from_parts(headers, parts)
            }
            "application/json" | "application/expo+json" | "text/plain" => Ok(Self {
                manifest: body.to_vec(),
                signature: signature_header(headers),
                certificate_chain: None,
            }),
            _ => Err(EnvelopeError::UnsupportedContentType(content_type.to_string())),
        }
    }

    fn from_parts(
        headers: &BTreeMap<String, String>,
        parts: Vec<Part>,
    ) -> Result<Self, EnvelopeError> {
        let mut response = Self::default();
        let mut found_manifest = false;

        for part in parts {
            match part.name().as_deref() {
                Some(MANIFEST_PART) => {
                    response.signature =
                        signature_header(&part.headers).or_else(|| signature_header(headers));
                    response.manifest = part.body;
                    found_manifest = true;
                }
                Some(CERTIFICATE_CHAIN_PART) => {
                    response.certificate_chain =
                        Some(String::from_utf8_lossy(&part.body).into_owned());
                }
                _ => {}
            }
        }

        if !found_manifest {
            return Err(EnvelopeError::MissingManifestPart);
        }
        Ok(response)
    }
}

struct Part {
    headers: BTreeMap<String, String>,
    body: Vec<u8>,
}

impl Part {
    fn parse(raw: &[u8]) -> Result<Self, EnvelopeError> {
        let (head, body) = match find(raw, b"\r\n\r\n", 0) {
            Some(at) => (&raw[..at], &raw[at + 4..]),
            None => match find(raw, b"\n\n", 0) {
                Some(at) => (&raw[..at], &raw[at + 2..]),
                None => {
                    return Err(EnvelopeError::MalformedMultipart(
                        "part without header block".to_string(),
                    ))
                }
            },
        };

        let mut headers = BTreeMap::new();
        for line in String::from_utf8_lossy(head).lines() {
            if let Some((name, value)) = line.split_once(':') {
                headers.insert(name.trim().to_ascii_lowercase(), value.trim().to_string());
            }
        }
        Ok(Self {
            headers,
            body: body.to_vec(),
        })
    }

    fn name(&self) -> Option<String> {
        header(&self.headers, "content-disposition")
            .and_then(|value| content_type_param(value, "name"))
    }
}

/// Parameter value from a `type; key=value` header, unquoted
fn content_type_param(value: &str, param: &str) -> Option<String> {
    value.split(';').skip(1).find_map(|segment| {
        let (key, val) = segment.split_once('=')?;
        if !key.trim().eq_ignore_ascii_case(param) {
            return None;
        }
        let val = val.trim();
        Some(
            val.strip_prefix('"')
                .and_then(|v| v.strip_suffix('"'))
                .unwrap_or(val)
                .to_string(),
        )
    })
}

fn find(haystack: &[u8], needle: &[u8], from: usize) -> Option<usize> {
    if from > haystack.len() || needle.is_empty() {
        return None;
    }
    haystack[from..]
        .windows(needle.len())
        .position(|window| window == needle)
        .map(|pos| pos + from)
}

fn parse_multipart(body: &[u8], boundary: &str) -> Result<Vec<Part>, EnvelopeError> {
    let delimiter = format!("--{}", boundary).into_bytes();
    let mut pos = find(body, &delimiter, 0)
        .ok_or_else(|| EnvelopeError::MalformedMultipart("no opening boundary".to_string()))?;
    let mut parts = Vec::new();

    loop {
        pos += delimiter.len();
        if body[pos..].starts_with(b"--") {
            break;
        }
        if body[pos..].starts_with(b"\r\n") {
            pos += 2;
        } else if body[pos..].starts_with(b"\n") {
            pos += 1;
        }

        let next = find(body, &delimiter, pos)
            .ok_or_else(|| EnvelopeError::MalformedMultipart("unterminated part".to_string()))?;
        let mut content = &body[pos..next];
        if let Some(stripped) = content.strip_suffix(b"\r\n") {
            content = stripped;
        } else if let Some(stripped) = content.strip_suffix(b"\n") {
            content = stripped;
        }
        parts.push(Part::parse(content)?);
        pos = next;
    }
    Ok(parts)
}

/// Verify and decode a manifest response into catalog rows with status `Pending`
pub fn load_verified_manifest(
    response: &ManifestResponse,
    verifier: Option<&CodeSigningVerifier>,
    scope_key: &str,
) -> Result<(UpdateRecord, Vec<AssetRecord>), EnvelopeError> {
    let is_verified = match verifier {
        Some(verifier) => {
            verifier
                .verify(
                    &response.manifest,
                    response.signature.as_deref(),
                    response.certificate_chain.as_deref(),
                )?
                .is_verified
        }
        None => false,
    };

    let manifest = Manifest::parse(&response.manifest)?;
    Ok(manifest.into_records(scope_key, UpdateStatus::Pending, is_verified)?)
}

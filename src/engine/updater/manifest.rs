//! Manifest document model
//!
//! The JSON description of an update as served by the manifest endpoint and
//! as bundled inside the binary.

use crate::engine::catalog::{AssetRecord, UpdateRecord, UpdateStatus};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use uuid::Uuid;

/// Extension used for a launch asset that does not declare one
const LAUNCH_ASSET_EXTENSION: &str = ".bundle";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Manifest {
    pub id: Uuid,
    pub created_at: DateTime<Utc>,
    pub runtime_version: String,
    pub launch_asset: ManifestAsset,
    #[serde(default)]
    pub assets: Vec<ManifestAsset>,
    #[serde(default)]
    pub metadata: Map<String, Value>,
    #[serde(default)]
    pub extra: ManifestExtra,
    /// The document as received, unknown fields included
    #[serde(skip)]
    pub raw: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct ManifestAsset {
    #[serde(default)]
    pub key: Option<String>,
    #[serde(default)]
    pub content_type: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
    /// base64url SHA-256 of the content
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hash: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_extension: Option<String>,
    /// Embedded manifests only: resource name inside the application bundle
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub main_bundle_filename: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct ManifestExtra {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scope_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expo_client: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expo_go: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub eas: Option<Value>,
}

impl Manifest {
    pub fn parse(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        let raw: Value = serde_json::from_slice(bytes)?;
        let mut manifest: Manifest = serde_json::from_value(raw.clone())?;
        manifest.raw = raw;
        Ok(manifest)
    }

    /// Catalog rows for this manifest; the launch asset comes first
    pub fn into_records(
        self,
        scope_key: &str,
        status: UpdateStatus,
        is_verified: bool,
    ) -> Result<(UpdateRecord, Vec<AssetRecord>), serde_json::Error> {
        let mut assets = Vec::with_capacity(self.assets.len() + 1);
        assets.push(asset_record(&self.launch_asset, true));
        assets.extend(self.assets.iter().map(|a| asset_record(a, false)));

        // Manifests built in code rather than parsed have no raw document
        let manifest = match self.raw {
            Value::Null => serde_json::to_value(&self)?,
            ref raw => raw.clone(),
        };
        let update = UpdateRecord {
            id: self.id,
            scope_key: scope_key.to_string(),
            commit_time: self.created_at,
            runtime_version: self.runtime_version.clone(),
            manifest,
            status,
            is_verified,
            last_accessed: None,
        };
        Ok((update, assets))
    }
}

fn asset_record(asset: &ManifestAsset, is_launch_asset: bool) -> AssetRecord {
    let mut record = AssetRecord::new(asset_filename(asset, is_launch_asset));
    record.key = asset.key.clone();
    record.url = asset.url.clone();
    record.content_type = asset.content_type.clone();
    record.expected_hash = asset.hash.clone();
    record.is_launch_asset = is_launch_asset;
    record.main_bundle_filename = asset.main_bundle_filename.clone();
    record
}

/// `<hash><ext>` when the content hash is known, otherwise derived from the key or URL
pub fn asset_filename(asset: &ManifestAsset, is_launch_asset: bool) -> String {
    let extension = match asset.file_extension.as_deref() {
        Some(ext) if !ext.is_empty() && ext.starts_with('.') => ext.to_string(),
        Some(ext) if !ext.is_empty() => format!(".{}", ext),
        _ if is_launch_asset => LAUNCH_ASSET_EXTENSION.to_string(),
        _ => String::new(),
    };
    let stem = match &asset.hash {
        Some(hash) => hash.clone(),
        None => {
            let source = asset
                .key
                .as_deref()
                .or(asset.url.as_deref())
                .unwrap_or_default();
            hex::encode(Sha256::digest(source.as_bytes()))
        }
    };
    format!("{}{}", stem, extension)
}

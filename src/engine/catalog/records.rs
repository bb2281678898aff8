//! Catalog record types

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Lifecycle status of a stored update
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UpdateStatus {
    /// Shipped inside the application binary
    Embedded,
    /// Manifest stored, assets still loading
    Pending,
    Ready,
    Launched,
    Errored,
    /// Served from a local development server
    Development,
}

impl UpdateStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            UpdateStatus::Embedded => "embedded",
            UpdateStatus::Pending => "pending",
            UpdateStatus::Ready => "ready",
            UpdateStatus::Launched => "launched",
            UpdateStatus::Errored => "errored",
            UpdateStatus::Development => "development",
        }
    }

    /// Statuses the catalog hands to selection
    pub fn launchable() -> &'static [UpdateStatus] {
        &[
            UpdateStatus::Embedded,
            UpdateStatus::Ready,
            UpdateStatus::Launched,
            UpdateStatus::Development,
        ]
    }
}

impl fmt::Display for UpdateStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for UpdateStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "embedded" => Ok(UpdateStatus::Embedded),
            "pending" => Ok(UpdateStatus::Pending),
            "ready" => Ok(UpdateStatus::Ready),
            "launched" => Ok(UpdateStatus::Launched),
            "errored" => Ok(UpdateStatus::Errored),
            "development" => Ok(UpdateStatus::Development),
            other => Err(format!("unknown update status: {}", other)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpdateRecord {
    pub id: Uuid,
    pub scope_key: String,
    pub manifest: Value,
    pub commit_time: DateTime<Utc>,
    pub runtime_version: String,
    pub status: UpdateStatus,
    pub is_verified: bool,
    pub last_accessed: Option<DateTime<Utc>>,
}

impl UpdateRecord {
    /// Manifest `metadata` object, if any
    pub fn metadata(&self) -> Option<&serde_json::Map<String, Value>> {
        self.manifest.get("metadata").and_then(Value::as_object)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssetRecord {
    pub key: Option<String>,
    /// Content-derived; shared by every update referencing the same bytes
    pub filename: String,
    pub url: Option<String>,
    pub content_type: Option<String>,
    pub expected_hash: Option<String>,
    pub content_hash: Option<String>,
    pub is_launch_asset: bool,
    #[serde(default)]
    pub extra_headers: BTreeMap<String, String>,
    pub download_time: Option<DateTime<Utc>>,
    pub main_bundle_filename: Option<String>,
}

impl AssetRecord {
    pub fn new(filename: impl Into<String>) -> Self {
        Self {
            key: None,
            filename: filename.into(),
            url: None,
            content_type: None,
            expected_hash: None,
            content_hash: None,
            is_launch_asset: false,
            extra_headers: BTreeMap::new(),
            download_time: None,
            main_bundle_filename: None,
        }
    }

    pub fn display_key(&self) -> &str {
        self.key.as_deref().unwrap_or(&self.filename)
    }
}

/// Per-scope predicate data that excludes non-matching candidates
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ManifestFilters(pub BTreeMap<String, Value>);

impl ManifestFilters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.0.insert(key.into(), value.into());
        self
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// An update passes when every filter key it carries in its metadata agrees
    pub fn matches(&self, update: &UpdateRecord) -> bool {
        let Some(metadata) = update.metadata() else {
            return true;
        };
        self.0.iter().all(|(key, expected)| match metadata.get(key) {
            None => true,
            Some(actual) => actual == expected,
        })
    }
}

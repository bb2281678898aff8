//! Relaunch Configuration Module
//! Handles loading and validating relaunch.config.json

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use thiserror::Error;

pub const CONFIG_FILENAME: &str = "relaunch.config.json";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Config file not found: {0}")]
    NotFound(PathBuf),
    #[error("Failed to read config: {0}")]
    ReadError(#[from] std::io::Error),
    #[error("Invalid config format: {0}")]
    ParseError(#[from] serde_json::Error),
    #[error("Invalid configuration: {0}")]
    Invalid(String),
    #[error("The embedded manifest is invalid or could not be read at {path}: {reason}")]
    EmbeddedManifest { path: PathBuf, reason: String },
    #[error("Invalid code signing certificate {path}: {reason}")]
    Certificate { path: PathBuf, reason: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum CheckOnLaunch {
    #[default]
    Always,
    WifiOnly,
    ErrorRecoveryOnly,
    Never,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdatesConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub scope_key: Option<String>,
    #[serde(default)]
    pub update_url: Option<String>,
    #[serde(default)]
    pub request_headers: BTreeMap<String, String>,
    #[serde(default = "default_release_channel")]
    pub release_channel: String,
    #[serde(default)]
    pub launch_wait_ms: u64,
    #[serde(default)]
    pub check_on_launch: CheckOnLaunch,
    #[serde(default)]
    pub runtime_version: Option<String>,
    #[serde(default)]
    pub sdk_version: Option<String>,
    #[serde(default = "default_true")]
    pub has_embedded_update: bool,
    #[serde(default)]
    pub code_signing: Option<CodeSigningConfig>,
    /// Where the catalog and downloaded assets live
    #[serde(default)]
    pub base_dir: Option<PathBuf>,
    /// Resources shipped inside the application binary
    pub bundle_dir: PathBuf,
    #[serde(default = "default_max_concurrent_asset_loads")]
    pub max_concurrent_asset_loads: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CodeSigningConfig {
    /// Developer-supplied certificate
    pub certificate_path: PathBuf,
    pub metadata: CodeSigningMetadata,
    #[serde(default)]
    pub include_manifest_response_certificate_chain: bool,
    #[serde(default)]
    pub allow_unsigned_manifests: bool,
    /// Root certificate baked into the client, anchors `expo-go` chains
    #[serde(default)]
    pub root_certificate_path: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CodeSigningMetadata {
    pub keyid: String,
    pub alg: String,
}

fn default_true() -> bool {
    true
}

fn default_release_channel() -> String {
    "default".to_string()
}

fn default_max_concurrent_asset_loads() -> usize {
    8
}

impl UpdatesConfig {
    pub fn load(config_dir: &Path) -> Result<Self, ConfigError> {
        let config_path = config_dir.join(CONFIG_FILENAME);
        if !config_path.exists() {
            return Err(ConfigError::NotFound(config_path));
        }
        let content = std::fs::read_to_string(&config_path)?;
        let mut config: UpdatesConfig = serde_json::from_str(&content)?;
        config.resolve_relative_paths(config_dir);
        Ok(config)
    }

    pub fn save(&self, config_dir: &Path) -> Result<(), ConfigError> {
        let config_path = config_dir.join(CONFIG_FILENAME);
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(&config_path, content)?;
        Ok(())
    }

    pub fn for_bundle(bundle_dir: PathBuf, scope_key: &str, runtime_version: &str) -> Self {
        Self {
            enabled: true,
            scope_key: Some(scope_key.to_string()),
            update_url: None,
            request_headers: BTreeMap::new(),
            release_channel: default_release_channel(),
            launch_wait_ms: 0,
            check_on_launch: CheckOnLaunch::default(),
            runtime_version: Some(runtime_version.to_string()),
            sdk_version: None,
            has_embedded_update: true,
            code_signing: None,
            base_dir: None,
            bundle_dir,
            max_concurrent_asset_loads: default_max_concurrent_asset_loads(),
        }
    }

    fn resolve_relative_paths(&mut self, config_dir: &Path) {
        let resolve = |p: &mut PathBuf| {
            if p.is_relative() {
                *p = config_dir.join(&*p);
            }
        };
        resolve(&mut self.bundle_dir);
        if let Some(base_dir) = self.base_dir.as_mut() {
            resolve(base_dir);
        }
        if let Some(code_signing) = self.code_signing.as_mut() {
            resolve(&mut code_signing.certificate_path);
            if let Some(root) = code_signing.root_certificate_path.as_mut() {
                resolve(root);
            }
        }
    }

    /// Explicit scope key, or the normalized origin of the update URL
    pub fn resolved_scope_key(&self) -> Option<String> {
        if let Some(scope_key) = &self.scope_key {
            return Some(scope_key.clone());
        }
        self.update_url
            .as_deref()
            .and_then(|url| normalized_url_origin(url).ok())
    }

    /// Runtime version used for candidate matching, falling back to the SDK version
    pub fn effective_runtime_version(&self) -> Option<&str> {
        self.runtime_version
            .as_deref()
            .filter(|v| !v.is_empty())
            .or_else(|| self.sdk_version.as_deref().filter(|v| !v.is_empty()))
    }

    pub fn is_missing_runtime_version(&self) -> bool {
        self.effective_runtime_version().is_none()
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.resolved_scope_key().is_none() {
            return Err(ConfigError::Invalid(
                "either scope_key or a valid update_url must be set".to_string(),
            ));
        }
        if self.is_missing_runtime_version() {
            return Err(ConfigError::Invalid(
                "either runtime_version or sdk_version must be set".to_string(),
            ));
        }
        if self.max_concurrent_asset_loads == 0 {
            return Err(ConfigError::Invalid(
                "max_concurrent_asset_loads must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    /// Base directory for the catalog and asset cache
    pub fn resolved_base_dir(&self) -> Result<PathBuf, ConfigError> {
        if let Some(base_dir) = &self.base_dir {
            return Ok(base_dir.clone());
        }
        dirs::data_local_dir()
            .map(|dir| dir.join("relaunch"))
            .ok_or_else(|| ConfigError::Invalid("could not determine data directory".to_string()))
    }
}

/// `scheme://host[:port]`, dropping the port when it is the scheme default
pub fn normalized_url_origin(url: &str) -> Result<String, ConfigError> {
    let parsed = reqwest::Url::parse(url)
        .map_err(|e| ConfigError::Invalid(format!("invalid update_url {}: {}", url, e)))?;
    let host = parsed
        .host_str()
        .ok_or_else(|| ConfigError::Invalid(format!("update_url {} has no host", url)))?;
    // `port()` is already None when the URL spells out the scheme's default port
    match parsed.port() {
        Some(port) => Ok(format!("{}://{}:{}", parsed.scheme(), host, port)),
        None => Ok(format!("{}://{}", parsed.scheme(), host)),
    }
}

//! Embedded update
//!
//! The update compiled into the application binary. Its manifest is read
//! from the bundle at most once per process and treated as trusted.

use crate::engine::catalog::{AssetRecord, CatalogWrite, CatalogWriter, UpdateRecord, UpdateStatus};
use crate::engine::config::{ConfigError, UpdatesConfig};
use crate::engine::updater::error::ImportError;
use crate::engine::updater::loader::{AssetLoader, AssetSource};
use crate::engine::updater::manifest::Manifest;
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};
use tokio::sync::OnceCell;
use uuid::Uuid;

pub const EMBEDDED_MANIFEST_FILENAME: &str = "app.manifest";
pub const EMBEDDED_LAUNCH_BUNDLE_FILENAME: &str = "main.jsbundle";

/// Read-only view of the application bundle directory
#[derive(Debug, Clone)]
pub struct EmbeddedBundle {
    dir: PathBuf,
}

impl EmbeddedBundle {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn manifest_path(&self) -> PathBuf {
        self.dir.join(EMBEDDED_MANIFEST_FILENAME)
    }

    pub fn launch_bundle_path(&self) -> PathBuf {
        self.dir.join(EMBEDDED_LAUNCH_BUNDLE_FILENAME)
    }

    pub fn resource_path(&self, name: &str) -> PathBuf {
        self.dir.join(name)
    }
}

#[derive(Debug, Clone)]
pub struct EmbeddedUpdate {
    pub update: UpdateRecord,
    pub assets: Vec<AssetRecord>,
}

impl EmbeddedUpdate {
    pub fn id(&self) -> Uuid {
        self.update.id
    }

    /// Embedded asset with this key that can be copied out of the bundle
    pub fn bundled_asset(&self, key: &str) -> Option<&AssetRecord> {
        self.assets.iter().find(|asset| {
            asset.key.as_deref() == Some(key) && asset.main_bundle_filename.is_some()
        })
    }
}

/// Process-scoped owner of the embedded manifest
pub struct EmbeddedImporter {
    config: Arc<UpdatesConfig>,
    bundle: EmbeddedBundle,
    manifest: OnceLock<Arc<EmbeddedUpdate>>,
    imported: OnceCell<Option<UpdateRecord>>,
}

impl EmbeddedImporter {
    pub fn new(config: Arc<UpdatesConfig>) -> Self {
        let bundle = EmbeddedBundle::new(config.bundle_dir.clone());
        Self {
            config,
            bundle,
            manifest: OnceLock::new(),
            imported: OnceCell::new(),
        }
    }

    pub fn bundle(&self) -> &EmbeddedBundle {
        &self.bundle
    }

    /// The embedded update, or `None` when the build ships without one.
    /// A missing or malformed manifest is fatal.
    pub fn embedded_update(&self) -> Result<Option<Arc<EmbeddedUpdate>>, ConfigError> {
        if !self.config.has_embedded_update {
            return Ok(None);
        }
        if let Some(cached) = self.manifest.get() {
            return Ok(Some(cached.clone()));
        }

        let loaded = Arc::new(self.read_manifest()?);
        // A concurrent reader may have won the race; both parsed the same file
        Ok(Some(self.manifest.get_or_init(|| loaded).clone()))
    }

    fn read_manifest(&self) -> Result<EmbeddedUpdate, ConfigError> {
        let path = self.bundle.manifest_path();
        let invalid = |reason: String| ConfigError::EmbeddedManifest {
            path: path.clone(),
            reason,
        };

        let bytes = std::fs::read(&path).map_err(|e| invalid(e.to_string()))?;
        let mut manifest = Manifest::parse(&bytes).map_err(|e| invalid(e.to_string()))?;
        if manifest.launch_asset.main_bundle_filename.is_none() {
            manifest.launch_asset.main_bundle_filename =
                Some(EMBEDDED_LAUNCH_BUNDLE_FILENAME.to_string());
        }

        let scope_key = self
            .config
            .resolved_scope_key()
            .ok_or_else(|| invalid("no scope key configured".to_string()))?;
        let (update, assets) = manifest
            .into_records(&scope_key, UpdateStatus::Embedded, true)
            .map_err(|e| invalid(e.to_string()))?;

        tracing::debug!(update_id = %update.id, assets = assets.len(), "read embedded manifest");
        Ok(EmbeddedUpdate { update, assets })
    }

    /// Copy bundled assets into the store and record the embedded update.
    /// Runs once per process; later calls return the first outcome.
    pub async fn import_embedded_manifest_once(
        &self,
        loader: &AssetLoader,
        writer: &CatalogWriter,
    ) -> Result<Option<UpdateRecord>, ImportError> {
        self.imported
            .get_or_try_init(|| self.import(loader, writer))
            .await
            .cloned()
    }

    async fn import(
        &self,
        loader: &AssetLoader,
        writer: &CatalogWriter,
    ) -> Result<Option<UpdateRecord>, ImportError> {
        let Some(embedded) = self.embedded_update()? else {
            return Ok(None);
        };

        let mut assets = embedded.assets.clone();
        for asset in assets.iter_mut() {
            let Some(resource) = asset.main_bundle_filename.clone() else {
                continue;
            };
            if loader.store().contains(&asset.filename).await {
                continue;
            }
            let source = AssetSource::Bundle {
                bundle: &self.bundle,
                resource: &resource,
            };
            match loader.load(source, asset).await {
                Ok(loaded) => {
                    asset.content_hash = Some(loaded.content_hash);
                    asset.download_time = Some(loaded.download_time);
                }
                Err(e) => {
                    tracing::warn!(key = asset.display_key(), error = %e, "could not copy embedded asset");
                }
            }
        }

        writer
            .write(CatalogWrite::InsertUpdate {
                update: embedded.update.clone(),
                assets,
            })
            .await?;

        tracing::info!(update_id = %embedded.id(), "embedded update recorded");
        Ok(Some(embedded.update.clone()))
    }
}

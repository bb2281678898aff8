//! Asset Reconciler
//!
//! Makes every asset of the selected update available on disk before launch.
//! Each asset is resolved on its own task: already stored, then copied from
//! the application bundle, then downloaded. Only the launch asset is
//! critical; other failures are logged and the asset is left out of the map.

use crate::engine::catalog::{AssetRecord, CatalogWrite, CatalogWriter, UpdateRecord, UpdateStatus};
use crate::engine::updater::download::AssetFetcher;
use crate::engine::updater::embedded::{EmbeddedBundle, EmbeddedUpdate, EMBEDDED_LAUNCH_BUNDLE_FILENAME};
use crate::engine::updater::error::{AssetError, LaunchError};
use crate::engine::updater::loader::{AssetLoader, AssetSource};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconcileStats {
    pub cached: usize,
    pub copied: usize,
    pub downloaded: usize,
    pub failed: usize,
}

/// Paths the host needs to start the selected update
#[derive(Debug, Clone, Default)]
pub struct LaunchResult {
    pub launch_asset: Option<PathBuf>,
    /// Asset key to local path; failed and keyless assets are absent
    pub asset_map: BTreeMap<String, PathBuf>,
    pub uses_embedded_assets: bool,
    pub stats: ReconcileStats,
}

#[derive(Debug, Clone, Copy)]
enum Resolution {
    Cached,
    Copied,
    Downloaded,
}

#[derive(Clone)]
pub struct AssetReconciler {
    loader: AssetLoader,
    bundle: EmbeddedBundle,
    embedded: Option<Arc<EmbeddedUpdate>>,
    fetcher: Arc<dyn AssetFetcher>,
    request_headers: Arc<BTreeMap<String, String>>,
    writer: CatalogWriter,
    permits: Arc<Semaphore>,
}

impl AssetReconciler {
    pub fn new(
        loader: AssetLoader,
        bundle: EmbeddedBundle,
        fetcher: Arc<dyn AssetFetcher>,
        writer: CatalogWriter,
    ) -> Self {
        Self {
            loader,
            bundle,
            embedded: None,
            fetcher,
            request_headers: Arc::new(BTreeMap::new()),
            writer,
            permits: Arc::new(Semaphore::new(8)),
        }
    }

    pub fn with_embedded_update(mut self, embedded: Option<Arc<EmbeddedUpdate>>) -> Self {
        self.embedded = embedded;
        self
    }

    pub fn with_request_headers(mut self, headers: BTreeMap<String, String>) -> Self {
        self.request_headers = Arc::new(headers);
        self
    }

    /// Upper bound on assets copied or downloaded at the same time
    pub fn with_max_concurrency(mut self, max: usize) -> Self {
        self.permits = Arc::new(Semaphore::new(max.max(1)));
        self
    }

    pub async fn ensure_all_assets_exist(
        &self,
        update: &UpdateRecord,
        assets: Vec<AssetRecord>,
    ) -> Result<LaunchResult, LaunchError> {
        match update.status {
            UpdateStatus::Embedded => return self.embedded_launch().await,
            UpdateStatus::Development => {
                tracing::debug!(update_id = %update.id, "development update, nothing to reconcile");
                return Ok(LaunchResult::default());
            }
            _ => {}
        }

        if !assets.iter().any(|a| a.is_launch_asset) {
            return Err(LaunchError::MissingLaunchAsset(update.id));
        }

        let total = assets.len();
        let mut tasks = JoinSet::new();
        for asset in assets {
            let this = self.clone();
            tasks.spawn(async move {
                let outcome = this.ensure_asset_exists(&asset).await;
                (asset, outcome)
            });
        }

        let mut result = LaunchResult::default();
        let mut launch_failure = None;
        let mut completed = 0;

        while let Some(joined) = tasks.join_next().await {
            completed += 1;
            let (asset, outcome) = match joined {
                Ok(done) => done,
                Err(e) => {
                    // Task identity is lost with the panic; a missing launch asset is caught below
                    tracing::error!(error = %e, "asset task aborted");
                    result.stats.failed += 1;
                    continue;
                }
            };

            match outcome {
                Ok((path, resolution)) => {
                    match resolution {
                        Resolution::Cached => result.stats.cached += 1,
                        Resolution::Copied => result.stats.copied += 1,
                        Resolution::Downloaded => result.stats.downloaded += 1,
                    }
                    if asset.is_launch_asset {
                        result.launch_asset = Some(path);
                    } else if let Some(key) = asset.key {
                        result.asset_map.insert(key, path);
                    }
                }
                Err(e) => {
                    result.stats.failed += 1;
                    if asset.is_launch_asset {
                        tracing::error!(key = asset.display_key(), error = %e, "launch asset unavailable");
                        launch_failure = Some((asset.display_key().to_string(), e));
                    } else {
                        tracing::warn!(key = asset.display_key(), error = %e, "asset unavailable, continuing without it");
                    }
                }
            }
        }

        tracing::info!(
            update_id = %update.id,
            completed,
            total,
            cached = result.stats.cached,
            copied = result.stats.copied,
            downloaded = result.stats.downloaded,
            failed = result.stats.failed,
            "asset reconciliation finished"
        );

        if result.launch_asset.is_none() {
            let (key, source) = launch_failure.unwrap_or_else(|| {
                (
                    "launch asset".to_string(),
                    AssetError::TaskFailed {
                        key: "launch asset".to_string(),
                        reason: "task aborted".to_string(),
                    },
                )
            });
            return Err(LaunchError::LaunchAssetUnavailable { key, source });
        }
        Ok(result)
    }

    async fn embedded_launch(&self) -> Result<LaunchResult, LaunchError> {
        let path = self.bundle.launch_bundle_path();
        if !tokio::fs::try_exists(&path).await.unwrap_or(false) {
            let key = EMBEDDED_LAUNCH_BUNDLE_FILENAME.to_string();
            return Err(LaunchError::LaunchAssetUnavailable {
                key: key.clone(),
                source: AssetError::NotInBundle { key },
            });
        }
        Ok(LaunchResult {
            launch_asset: Some(path),
            uses_embedded_assets: true,
            ..Default::default()
        })
    }

    async fn ensure_asset_exists(&self, asset: &AssetRecord) -> Result<(PathBuf, Resolution), AssetError> {
        let _permit = self
            .permits
            .acquire()
            .await
            .map_err(|e| AssetError::TaskFailed {
                key: asset.display_key().to_string(),
                reason: e.to_string(),
            })?;

        let store = self.loader.store();
        if store.contains(&asset.filename).await {
            return Ok((store.asset_path(&asset.filename), Resolution::Cached));
        }

        match self.copy_from_bundle(asset).await {
            Ok(Some(path)) => return Ok((path, Resolution::Copied)),
            Ok(None) => {}
            Err(e) => {
                tracing::warn!(key = asset.display_key(), error = %e, "bundle copy failed, downloading instead");
            }
        }

        let source = AssetSource::Remote {
            fetcher: self.fetcher.as_ref(),
            request_headers: self.request_headers.as_ref(),
        };
        let loaded = self.loader.load(source, asset).await?;

        let mut record = asset.clone();
        record.content_hash = Some(loaded.content_hash);
        record.download_time = Some(loaded.download_time);
        self.writer.submit(CatalogWrite::UpsertAsset(record));

        Ok((loaded.path, Resolution::Downloaded))
    }

    /// `Ok(None)` when the bundle has no asset with this key
    async fn copy_from_bundle(&self, asset: &AssetRecord) -> Result<Option<PathBuf>, AssetError> {
        let (Some(embedded), Some(key)) = (&self.embedded, asset.key.as_deref()) else {
            return Ok(None);
        };
        let Some(bundled) = embedded.bundled_asset(key) else {
            return Ok(None);
        };

        let Some(resource) = bundled.main_bundle_filename.as_deref() else {
            return Ok(None);
        };

        let source = AssetSource::Bundle {
            bundle: &self.bundle,
            resource,
        };
        let loaded = self.loader.load(source, asset).await?;
        Ok(Some(loaded.path))
    }
}

//! Launcher
//!
//! Picks the update to run and hands back the paths of its assets. Runs at
//! most once per instance.

use crate::engine::catalog::{
    AssetRecord, Catalog, CatalogError, CatalogWrite, CatalogWriter, UpdateRecord, UpdateStatus,
};
use crate::engine::updater::error::LaunchError;
use crate::engine::updater::reconciler::{AssetReconciler, LaunchResult, ReconcileStats};
use crate::engine::updater::selection::SelectionPolicy;
use crate::engine::updater::state::{LaunchState, TransitionError};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::oneshot;
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct LaunchedUpdate {
    pub update: UpdateRecord,
    pub result: LaunchResult,
}

impl LaunchedUpdate {
    pub fn launch_asset(&self) -> Option<&Path> {
        self.result.launch_asset.as_deref()
    }

    pub fn asset_map(&self) -> &BTreeMap<String, PathBuf> {
        &self.result.asset_map
    }

    pub fn is_using_embedded_assets(&self) -> bool {
        self.result.uses_embedded_assets
    }
}

/// Host-visible summary of a launch attempt
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LaunchReport {
    pub success: bool,
    pub update_id: Option<Uuid>,
    pub launch_asset: Option<PathBuf>,
    pub asset_map: BTreeMap<String, PathBuf>,
    pub uses_embedded_assets: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stats: Option<ReconcileStats>,
    pub error: Option<String>,
}

impl LaunchReport {
    pub fn from_outcome(outcome: &Result<LaunchedUpdate, LaunchError>) -> Self {
        match outcome {
            Ok(launched) => Self {
                success: true,
                update_id: Some(launched.update.id),
                launch_asset: launched.result.launch_asset.clone(),
                asset_map: launched.result.asset_map.clone(),
                uses_embedded_assets: launched.result.uses_embedded_assets,
                stats: Some(launched.result.stats.clone()),
                error: None,
            },
            Err(e) => Self {
                success: false,
                update_id: None,
                launch_asset: None,
                asset_map: BTreeMap::new(),
                uses_embedded_assets: false,
                stats: None,
                error: Some(e.to_string()),
            },
        }
    }

    /// Save atomically: temp file first, then rename
    pub fn save(&self, path: &Path) -> io::Result<()> {
        let content = serde_json::to_string_pretty(self)?;
        let temp_path = path.with_extension("tmp");
        fs::write(&temp_path, &content)?;
        fs::rename(&temp_path, path)
    }

    pub fn load(path: &Path) -> io::Result<Self> {
        let content = fs::read_to_string(path)?;
        Ok(serde_json::from_str(&content)?)
    }
}

pub struct Launcher {
    scope_key: String,
    catalog: Catalog,
    writer: CatalogWriter,
    policy: Arc<dyn SelectionPolicy>,
    reconciler: AssetReconciler,
    state: Mutex<LaunchState>,
    started: AtomicBool,
}

impl Launcher {
    pub fn new(
        scope_key: impl Into<String>,
        catalog: Catalog,
        writer: CatalogWriter,
        policy: Arc<dyn SelectionPolicy>,
        reconciler: AssetReconciler,
    ) -> Self {
        Self {
            scope_key: scope_key.into(),
            catalog,
            writer,
            policy,
            reconciler,
            state: Mutex::new(LaunchState::Idle),
            started: AtomicBool::new(false),
        }
    }

    pub fn state(&self) -> LaunchState {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    fn transition<F>(&self, apply: F)
    where
        F: FnOnce(&mut LaunchState) -> Result<(), TransitionError>,
    {
        let mut state = self
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Err(e) = apply(&mut state) {
            // Only reachable through a logic error; `started` guards re-entry
            tracing::error!(error = %e, "launch state not updated");
        }
    }

    /// The update selection would pick right now, without touching its assets
    pub async fn launchable_update(&self) -> Result<Option<UpdateRecord>, CatalogError> {
        let catalog = self.catalog.clone();
        let scope_key = self.scope_key.clone();
        let (candidates, filters) = tokio::task::spawn_blocking(move || {
            let mut candidates = catalog.query_launchable_updates(&scope_key)?;
            let filters = catalog.query_manifest_filters(&scope_key)?;
            // Never go back to an update older than one already launched in this scope
            if let Some(floor) = catalog.launch_floor(&scope_key)? {
                candidates.retain(|u| u.commit_time >= floor);
            }
            Ok::<_, CatalogError>((candidates, filters))
        })
        .await
        .map_err(|e| CatalogError::Task(e.to_string()))??;

        tracing::debug!(scope_key = %self.scope_key, candidates = candidates.len(), "selecting update");
        Ok(self.policy.select_update_to_launch(&candidates, &filters))
    }

    /// Ids of updates that are fully loaded but not yet launched
    pub async fn stored_update_ids(&self) -> Result<Vec<Uuid>, CatalogError> {
        let catalog = self.catalog.clone();
        tokio::task::spawn_blocking(move || catalog.update_ids_with_status(UpdateStatus::Ready))
            .await
            .map_err(|e| CatalogError::Task(e.to_string()))?
    }

    async fn assets_for(&self, update: &UpdateRecord) -> Result<Vec<AssetRecord>, CatalogError> {
        if matches!(update.status, UpdateStatus::Embedded | UpdateStatus::Development) {
            return Ok(Vec::new());
        }
        let catalog = self.catalog.clone();
        let id = update.id;
        tokio::task::spawn_blocking(move || catalog.assets_for_update(id))
            .await
            .map_err(|e| CatalogError::Task(e.to_string()))?
    }

    /// Select, reconcile, and report the update to run
    pub async fn launch(&self) -> Result<LaunchedUpdate, LaunchError> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(LaunchError::AlreadyStarted);
        }
        self.transition(LaunchState::start_selecting);

        let outcome = self.select_and_reconcile().await;
        match &outcome {
            Ok(launched) => {
                self.transition(LaunchState::mark_launched);
                self.writer.submit(CatalogWrite::MarkLaunched(launched.update.id));
                tracing::info!(
                    update_id = %launched.update.id,
                    status = %launched.update.status,
                    embedded_assets = launched.is_using_embedded_assets(),
                    "update launched"
                );
            }
            Err(e) => {
                let reason = e.to_string();
                self.transition(|state| state.mark_failed(reason));
                tracing::error!(error = %e, "launch failed");
            }
        }
        outcome
    }

    async fn select_and_reconcile(&self) -> Result<LaunchedUpdate, LaunchError> {
        let update = match self.launchable_update().await {
            Ok(Some(update)) => update,
            Ok(None) => return Err(LaunchError::NoLaunchableUpdate { cause: None }),
            Err(e) => return Err(LaunchError::NoLaunchableUpdate { cause: Some(e) }),
        };

        tracing::info!(update_id = %update.id, status = %update.status, "selected update");
        self.transition(|state| state.start_reconciling(update.id));

        let assets = self.assets_for(&update).await?;
        let result = self
            .reconciler
            .ensure_all_assets_exist(&update, assets)
            .await?;
        Ok(LaunchedUpdate { update, result })
    }

    /// Run [`Launcher::launch`] on the runtime
    pub fn launch_in_background(self: Arc<Self>) -> LaunchHandle {
        let (tx, rx) = oneshot::channel();
        tokio::spawn(async move {
            let outcome = self.launch().await;
            let _ = tx.send(outcome);
        });
        LaunchHandle { rx }
    }
}

/// Completion of a background launch, consumed exactly once
pub struct LaunchHandle {
    rx: oneshot::Receiver<Result<LaunchedUpdate, LaunchError>>,
}

impl LaunchHandle {
    /// A task that ends without reporting yields [`LaunchError::Abandoned`]
    pub async fn wait(self) -> Result<LaunchedUpdate, LaunchError> {
        self.rx
            .await
            .unwrap_or_else(|_| Err(LaunchError::Abandoned))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_report_for_failure() {
        let outcome: Result<LaunchedUpdate, LaunchError> =
            Err(LaunchError::NoLaunchableUpdate { cause: None });
        let report = LaunchReport::from_outcome(&outcome);
        assert!(!report.success);
        assert_eq!(
            report.error.as_deref(),
            Some("No launchable updates found in database")
        );
        assert!(report.update_id.is_none());
    }

    #[tokio::test]
    async fn test_dropped_launch_task_is_abandoned() {
        let (tx, rx) = oneshot::channel();
        drop(tx);
        let outcome = LaunchHandle { rx }.wait().await;
        assert!(matches!(outcome, Err(LaunchError::Abandoned)));

        let report = LaunchReport::from_outcome(&outcome);
        assert!(!report.success);
        assert_eq!(
            report.error.as_deref(),
            Some("Launch task ended without reporting a result")
        );
    }

    #[test]
    fn test_report_persistence() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("last-launch.json");

        let mut asset_map = BTreeMap::new();
        asset_map.insert("logo".to_string(), PathBuf::from("/a/logo.png"));
        let report = LaunchReport {
            success: true,
            update_id: Some(Uuid::nil()),
            launch_asset: Some(PathBuf::from("/a/bundle.js")),
            asset_map,
            uses_embedded_assets: false,
            stats: Some(ReconcileStats {
                cached: 1,
                copied: 0,
                downloaded: 1,
                failed: 0,
            }),
            error: None,
        };
        report.save(&path).unwrap();
        assert!(!path.with_extension("tmp").exists());
        assert_eq!(LaunchReport::load(&path).unwrap(), report);
    }
}

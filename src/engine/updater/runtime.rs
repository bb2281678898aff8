//! Process wiring
//!
//! Opens the asset store and catalog for a configuration, starts the writer
//! lane, and assembles launchers that share them.

use crate::engine::catalog::{Catalog, CatalogError, CatalogWriter, UpdateRecord};
use crate::engine::config::{ConfigError, UpdatesConfig};
use crate::engine::database::{Database, DatabaseError};
use crate::engine::updater::asset_store::AssetStore;
use crate::engine::updater::download::AssetFetcher;
use crate::engine::updater::embedded::EmbeddedImporter;
use crate::engine::updater::error::ImportError;
use crate::engine::updater::launcher::Launcher;
use crate::engine::updater::loader::AssetLoader;
use crate::engine::updater::reconciler::AssetReconciler;
use crate::engine::updater::selection::{DefaultSelectionPolicy, SelectionPolicy};
use std::sync::Arc;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum StartupError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("Failed to open catalog: {0}")]
    Database(#[from] DatabaseError),
    #[error(transparent)]
    Catalog(#[from] CatalogError),
    #[error("Failed to prepare asset store: {0}")]
    Io(#[from] std::io::Error),
}

pub struct UpdatesRuntime {
    config: Arc<UpdatesConfig>,
    scope_key: String,
    store: AssetStore,
    catalog: Catalog,
    writer: CatalogWriter,
    importer: EmbeddedImporter,
    fetcher: Arc<dyn AssetFetcher>,
}

impl UpdatesRuntime {
    pub fn open(config: UpdatesConfig, fetcher: Arc<dyn AssetFetcher>) -> Result<Self, StartupError> {
        config.validate()?;
        let scope_key = config
            .resolved_scope_key()
            .ok_or_else(|| ConfigError::Invalid("scope key could not be resolved".to_string()))?;

        let store = AssetStore::with_base_dir(config.resolved_base_dir()?);
        store.init()?;
        store.cleanup_partials()?;

        let db = Database::new(&store.database_path())?;
        let catalog = Catalog::new(db);
        let writer = CatalogWriter::spawn(catalog.clone())?;

        let config = Arc::new(config);
        let importer = EmbeddedImporter::new(config.clone());

        tracing::info!(scope_key = %scope_key, base_dir = %store.base_dir().display(), "updates runtime opened");
        Ok(Self {
            config,
            scope_key,
            store,
            catalog,
            writer,
            importer,
            fetcher,
        })
    }

    pub fn config(&self) -> &UpdatesConfig {
        &self.config
    }

    pub fn scope_key(&self) -> &str {
        &self.scope_key
    }

    pub fn store(&self) -> &AssetStore {
        &self.store
    }

    pub fn catalog(&self) -> &Catalog {
        &self.catalog
    }

    pub fn writer(&self) -> &CatalogWriter {
        &self.writer
    }

    pub fn importer(&self) -> &EmbeddedImporter {
        &self.importer
    }

    pub async fn import_embedded_update(&self) -> Result<Option<UpdateRecord>, ImportError> {
        let loader = AssetLoader::new(self.store.clone());
        self.importer
            .import_embedded_manifest_once(&loader, &self.writer)
            .await
    }

    /// Launcher using the default selection policy
    pub fn launcher(&self) -> Result<Launcher, ConfigError> {
        let embedded = self.importer.embedded_update()?;
        let policy = DefaultSelectionPolicy::from_config(&self.config, embedded.as_deref());
        self.launcher_with_policy(Arc::new(policy))
    }

    pub fn launcher_with_policy(
        &self,
        policy: Arc<dyn SelectionPolicy>,
    ) -> Result<Launcher, ConfigError> {
        let embedded = self.importer.embedded_update()?;
        let reconciler = AssetReconciler::new(
            AssetLoader::new(self.store.clone()),
            self.importer.bundle().clone(),
            self.fetcher.clone(),
            self.writer.clone(),
        )
        .with_embedded_update(embedded)
        .with_request_headers(self.config.request_headers.clone())
        .with_max_concurrency(self.config.max_concurrent_asset_loads);

        Ok(Launcher::new(
            self.scope_key.clone(),
            self.catalog.clone(),
            self.writer.clone(),
            policy,
            reconciler,
        ))
    }
}

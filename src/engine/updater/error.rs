//! Launch error taxonomy

use crate::engine::catalog::CatalogError;
use crate::engine::config::ConfigError;
use crate::engine::updater::download::DownloadError;
use std::io;
use thiserror::Error;
use uuid::Uuid;

/// Failure to make a single asset available on disk
#[derive(Error, Debug)]
pub enum AssetError {
    #[error("Failed to download asset {key} with no URL provided")]
    NoUrl { key: String },

    #[error("Download of asset {key} failed: {source}")]
    Download {
        key: String,
        #[source]
        source: DownloadError,
    },

    #[error("Hash mismatch for asset {key}: expected {expected}, got {actual}")]
    HashMismatch {
        key: String,
        expected: String,
        actual: String,
    },

    #[error("Asset {key} is not present in the application bundle")]
    NotInBundle { key: String },

    #[error("Copying asset {key} from the application bundle failed: {source}")]
    BundleCopy {
        key: String,
        #[source]
        source: io::Error,
    },

    #[error("Writing {filename} to the asset store failed: {source}")]
    Store {
        filename: String,
        #[source]
        source: io::Error,
    },

    #[error("Asset task for {key} did not complete: {reason}")]
    TaskFailed { key: String, reason: String },
}

/// Why a launch attempt produced no launchable update
#[derive(Error, Debug)]
pub enum LaunchError {
    #[error("No launchable updates found in database")]
    NoLaunchableUpdate {
        #[source]
        cause: Option<CatalogError>,
    },

    #[error("Launch asset {key} is unavailable: {source}")]
    LaunchAssetUnavailable {
        key: String,
        #[source]
        source: AssetError,
    },

    #[error("Update {0} does not reference a launch asset")]
    MissingLaunchAsset(Uuid),

    #[error("Catalog error during launch: {0}")]
    Catalog(#[from] CatalogError),

    #[error("Launch was already started on this launcher")]
    AlreadyStarted,

    #[error("Launch task ended without reporting a result")]
    Abandoned,
}

/// Failure while ingesting the update embedded in the binary
#[derive(Error, Debug)]
pub enum ImportError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("Failed to record embedded update: {0}")]
    Catalog(#[from] CatalogError),
}

//! Update launch engine
//!
//! Components:
//! - `selection` - Picks the update to launch
//! - `verify` - Content hashes and manifest code signing
//! - `reconciler` - Makes an update's assets available on disk
//! - `embedded` - The update shipped inside the binary
//! - `launcher` - Ties selection and reconciliation together
//! - `envelope` - Manifest request headers and response parsing
//! - `state` - Launch state machine

pub mod asset_store;
pub mod download;
pub mod embedded;
pub mod envelope;
pub mod error;
pub mod launcher;
pub mod loader;
pub mod manifest;
pub mod reconciler;
pub mod runtime;
pub mod selection;
pub mod state;
pub mod verify;

pub use asset_store::AssetStore;
pub use download::{AssetFetcher, DownloadError, Downloader};
pub use embedded::{EmbeddedBundle, EmbeddedImporter, EmbeddedUpdate};
pub use error::{AssetError, ImportError, LaunchError};
pub use launcher::{LaunchHandle, LaunchReport, LaunchedUpdate, Launcher};
pub use manifest::Manifest;
pub use reconciler::{AssetReconciler, LaunchResult, ReconcileStats};
pub use runtime::{StartupError, UpdatesRuntime};
pub use selection::{DefaultSelectionPolicy, SelectionPolicy};
pub use state::LaunchState;
pub use verify::{CodeSigningVerifier, SignatureError};

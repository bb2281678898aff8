//! Relaunch - on-device update launch engine
//!
//! Decides which stored update a host application runs on startup and makes
//! sure its assets are on disk before handing back their paths.

pub mod engine;

pub use engine::catalog::{AssetRecord, ManifestFilters, UpdateRecord, UpdateStatus};
pub use engine::config::UpdatesConfig;
pub use engine::updater::{
    LaunchError, LaunchReport, LaunchState, LaunchedUpdate, Launcher, UpdatesRuntime,
};

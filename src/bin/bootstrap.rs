//! Relaunch Bootstrapper
//!
//! Resolves which stored update the host application should run and prints
//! a JSON launch report with the paths of its assets.
//!
//! ## Responsibilities
//! 1. Load `relaunch.config.json` from the config directory
//! 2. Record the update embedded in the application bundle
//! 3. Select an update and make its assets available
//! 4. Persist the report to `<base_dir>/last-launch.json`
//!
//! The config directory is the first argument, else `RELAUNCH_CONFIG_DIR`,
//! else the working directory.

use anyhow::Context;
use relaunch_lib::engine::updater::embedded::EmbeddedBundle;
use relaunch_lib::engine::updater::{Downloader, LaunchReport, UpdatesRuntime};
use relaunch_lib::UpdatesConfig;
use std::collections::BTreeMap;
use std::env;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

const LAST_LAUNCH_FILENAME: &str = "last-launch.json";

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let config_dir = resolve_config_dir();

    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            eprintln!("Error: Could not start async runtime: {}", e);
            return ExitCode::FAILURE;
        }
    };

    match runtime.block_on(run(&config_dir)) {
        Ok(report) => {
            match serde_json::to_string_pretty(&report) {
                Ok(json) => println!("{}", json),
                Err(e) => eprintln!("Warning: Could not encode launch report: {}", e),
            }
            if report.success {
                ExitCode::SUCCESS
            } else {
                ExitCode::FAILURE
            }
        }
        Err(e) => {
            eprintln!("Error: {:#}", e);
            ExitCode::FAILURE
        }
    }
}

fn resolve_config_dir() -> PathBuf {
    env::args()
        .nth(1)
        .map(PathBuf::from)
        .or_else(|| env::var_os("RELAUNCH_CONFIG_DIR").map(PathBuf::from))
        .unwrap_or_else(|| PathBuf::from("."))
}

/// Configuration and import errors abort before any launch attempt
async fn run(config_dir: &Path) -> anyhow::Result<LaunchReport> {
    let config = UpdatesConfig::load(config_dir)
        .with_context(|| format!("loading configuration from {}", config_dir.display()))?;

    if !config.enabled {
        tracing::info!("updates disabled, launching embedded bundle");
        return Ok(embedded_only_report(&config));
    }

    let updates = UpdatesRuntime::open(config, Arc::new(Downloader::new()))
        .context("opening updates directory")?;
    updates
        .import_embedded_update()
        .await
        .context("importing embedded update")?;

    let launcher = Arc::new(updates.launcher().context("preparing launcher")?);
    let outcome = launcher.launch_in_background().wait().await;
    let report = LaunchReport::from_outcome(&outcome);

    // Let best-effort catalog writes land before the process exits
    if let Err(e) = updates.writer().flush().await {
        tracing::warn!(error = %e, "catalog writes may be incomplete");
    }

    let report_path = updates.store().base_dir().join(LAST_LAUNCH_FILENAME);
    if let Err(e) = report.save(&report_path) {
        tracing::warn!(path = %report_path.display(), error = %e, "could not save launch report");
    }
    Ok(report)
}

fn embedded_only_report(config: &UpdatesConfig) -> LaunchReport {
    let launch_asset = EmbeddedBundle::new(config.bundle_dir.clone()).launch_bundle_path();
    let exists = launch_asset.exists();
    LaunchReport {
        success: exists,
        update_id: None,
        launch_asset: exists.then_some(launch_asset),
        asset_map: BTreeMap::new(),
        uses_embedded_assets: true,
        stats: None,
        error: (!exists).then(|| "embedded launch bundle is missing".to_string()),
    }
}

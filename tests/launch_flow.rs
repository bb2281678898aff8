mod common;

use common::*;
use relaunch_lib::engine::catalog::CatalogWrite;
use relaunch_lib::engine::updater::AssetError;
use relaunch_lib::{LaunchError, LaunchState, ManifestFilters, UpdateStatus};
use std::fs;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

fn embedded_id() -> Uuid {
    Uuid::parse_str(EMBEDDED_ID).unwrap()
}

#[tokio::test]
async fn test_embedded_only_launch() {
    let h = Harness::new();
    let runtime = h.start().await;

    let launcher = runtime.launcher().unwrap();
    let launched = launcher.launch().await.unwrap();

    assert_eq!(launched.update.id, embedded_id());
    assert!(launched.is_using_embedded_assets());
    assert_eq!(
        launched.launch_asset().unwrap(),
        h.bundle_dir().join("main.jsbundle")
    );
    assert_eq!(launcher.state().launched_update_id(), Some(embedded_id()));
    assert_eq!(h.fetcher.total_calls(), 0);
}

#[tokio::test]
async fn test_newer_remote_update_wins() {
    let h = Harness::new();
    let runtime = h.start().await;

    let id = Uuid::new_v4();
    h.fetcher.serve(&cdn_url("bundle"), b"remote js");
    h.fetcher.serve(&cdn_url("icon"), b"icon bytes");
    store_update(
        &runtime,
        remote_update(
            id,
            "2026-02-01T00:00:00Z",
            &[
                RemoteAsset { key: "bundle", body: b"remote js" },
                RemoteAsset { key: "icon", body: b"icon bytes" },
            ],
        ),
    )
    .await;

    let launched = runtime.launcher().unwrap().launch().await.unwrap();
    assert_eq!(launched.update.id, id);
    assert!(!launched.is_using_embedded_assets());
    assert_eq!(fs::read(launched.launch_asset().unwrap()).unwrap(), b"remote js");
    assert_eq!(fs::read(&launched.asset_map()["icon"]).unwrap(), b"icon bytes");
    assert_eq!(launched.result.stats.downloaded, 2);

    runtime.writer().flush().await.unwrap();
    let stored = runtime.catalog().update_by_id(id).unwrap().unwrap();
    assert_eq!(stored.status, UpdateStatus::Launched);
    assert!(stored.last_accessed.is_some());

    // Downloaded hashes are recorded against the asset rows
    let assets = runtime.catalog().assets_for_update(id).unwrap();
    assert!(assets.iter().all(|a| a.content_hash.is_some()));
}

#[tokio::test]
async fn test_asset_with_bundled_key_is_copied_not_fetched() {
    let h = Harness::new();
    let runtime = h.start().await;

    h.fetcher.serve(&cdn_url("bundle"), b"remote js");
    store_update(
        &runtime,
        remote_update(
            Uuid::new_v4(),
            "2026-02-01T00:00:00Z",
            &[
                RemoteAsset { key: "bundle", body: b"remote js" },
                RemoteAsset { key: "logo", body: b"logo-bytes" },
            ],
        ),
    )
    .await;

    let launched = runtime.launcher().unwrap().launch().await.unwrap();
    assert_eq!(launched.result.stats.copied, 1);
    assert_eq!(h.fetcher.calls(&cdn_url("logo")), 0);
    assert_eq!(fs::read(&launched.asset_map()["logo"]).unwrap(), b"logo-bytes");
}

#[tokio::test]
async fn test_bundled_asset_with_different_content_is_downloaded() {
    let h = Harness::new();
    let runtime = h.start().await;

    h.fetcher.serve(&cdn_url("bundle"), b"remote js");
    h.fetcher.serve(&cdn_url("logo"), b"new logo");
    store_update(
        &runtime,
        remote_update(
            Uuid::new_v4(),
            "2026-02-01T00:00:00Z",
            &[
                RemoteAsset { key: "bundle", body: b"remote js" },
                RemoteAsset { key: "logo", body: b"new logo" },
            ],
        ),
    )
    .await;

    let launched = runtime.launcher().unwrap().launch().await.unwrap();
    assert_eq!(h.fetcher.calls(&cdn_url("logo")), 1);
    assert_eq!(fs::read(&launched.asset_map()["logo"]).unwrap(), b"new logo");
}

#[tokio::test]
async fn test_missing_non_launch_asset_is_tolerated() {
    let h = Harness::new();
    let runtime = h.start().await;

    h.fetcher.serve(&cdn_url("bundle"), b"remote js");
    store_update(
        &runtime,
        remote_update(
            Uuid::new_v4(),
            "2026-02-01T00:00:00Z",
            &[
                RemoteAsset { key: "bundle", body: b"remote js" },
                RemoteAsset { key: "font", body: b"never served" },
            ],
        ),
    )
    .await;

    let launched = runtime.launcher().unwrap().launch().await.unwrap();
    assert_eq!(launched.result.stats.failed, 1);
    assert!(!launched.asset_map().contains_key("font"));
    assert!(launched.launch_asset().is_some());
}

#[tokio::test]
async fn test_missing_launch_asset_fails_launch() {
    let h = Harness::new();
    let runtime = h.start().await;

    h.fetcher.serve(&cdn_url("icon"), b"icon bytes");
    store_update(
        &runtime,
        remote_update(
            Uuid::new_v4(),
            "2026-02-01T00:00:00Z",
            &[
                RemoteAsset { key: "bundle", body: b"never served" },
                RemoteAsset { key: "icon", body: b"icon bytes" },
            ],
        ),
    )
    .await;

    let launcher = runtime.launcher().unwrap();
    let err = launcher.launch().await.unwrap_err();
    match err {
        LaunchError::LaunchAssetUnavailable { key, source } => {
            assert_eq!(key, "bundle");
            assert!(matches!(source, AssetError::Download { .. }));
        }
        other => panic!("unexpected error: {other}"),
    }
    assert!(matches!(launcher.state(), LaunchState::Failed { .. }));
}

#[tokio::test]
async fn test_corrupt_download_is_rejected() {
    let h = Harness::new();
    let runtime = h.start().await;

    h.fetcher.serve(&cdn_url("bundle"), b"tampered js");
    store_update(
        &runtime,
        remote_update(
            Uuid::new_v4(),
            "2026-02-01T00:00:00Z",
            &[RemoteAsset { key: "bundle", body: b"remote js" }],
        ),
    )
    .await;

    let err = runtime.launcher().unwrap().launch().await.unwrap_err();
    assert!(matches!(
        err,
        LaunchError::LaunchAssetUnavailable {
            source: AssetError::HashMismatch { .. },
            ..
        }
    ));
}

#[tokio::test]
async fn test_relaunch_uses_cached_assets() {
    let h = Harness::new();
    let runtime = h.start().await;

    let id = Uuid::new_v4();
    h.fetcher.serve(&cdn_url("bundle"), b"remote js");
    store_update(
        &runtime,
        remote_update(
            id,
            "2026-02-01T00:00:00Z",
            &[RemoteAsset { key: "bundle", body: b"remote js" }],
        ),
    )
    .await;

    runtime.launcher().unwrap().launch().await.unwrap();
    runtime.writer().flush().await.unwrap();
    let calls = h.fetcher.total_calls();

    let again = runtime.launcher().unwrap().launch().await.unwrap();
    assert_eq!(again.update.id, id);
    assert_eq!(again.result.stats.cached, 1);
    assert_eq!(h.fetcher.total_calls(), calls);
}

#[tokio::test]
async fn test_launch_survives_restart() {
    let h = Harness::new();
    let id = Uuid::new_v4();
    h.fetcher.serve(&cdn_url("bundle"), b"remote js");

    {
        let runtime = h.start().await;
        store_update(
            &runtime,
            remote_update(
                id,
                "2026-02-01T00:00:00Z",
                &[RemoteAsset { key: "bundle", body: b"remote js" }],
            ),
        )
        .await;
        runtime.launcher().unwrap().launch().await.unwrap();
        runtime.writer().flush().await.unwrap();
    }

    let runtime = h.start().await;
    let launched = runtime.launcher().unwrap().launch().await.unwrap();
    assert_eq!(launched.update.id, id);
    assert_eq!(launched.result.stats.cached, 1);
    assert_eq!(h.fetcher.calls(&cdn_url("bundle")), 1);
}

#[tokio::test]
async fn test_stale_embedded_update_is_skipped() {
    let h = Harness::new();
    let old_build = Uuid::new_v4();

    // A previous build embedded a newer-looking update
    write_embedded_bundle(&h.bundle_dir(), &old_build.to_string(), "2026-03-01T00:00:00Z");
    {
        let runtime = h.start().await;
        runtime.writer().flush().await.unwrap();
    }

    write_embedded_bundle(&h.bundle_dir(), EMBEDDED_ID, "2026-01-01T00:00:00Z");
    let runtime = h.start().await;
    let ids: Vec<_> = runtime
        .catalog()
        .query_launchable_updates(SCOPE)
        .unwrap()
        .into_iter()
        .map(|u| u.id)
        .collect();
    assert!(ids.contains(&old_build));

    let launched = runtime.launcher().unwrap().launch().await.unwrap();
    assert_eq!(launched.update.id, embedded_id());
}

#[tokio::test]
async fn test_never_falls_back_below_launched_update() {
    let h = Harness::new();
    let runtime = h.start().await;

    let older = Uuid::new_v4();
    let newer = Uuid::new_v4();
    h.fetcher.serve(&cdn_url("a"), b"a js");
    h.fetcher.serve(&cdn_url("b"), b"b js");
    store_update(
        &runtime,
        remote_update(older, "2026-02-01T00:00:00Z", &[RemoteAsset { key: "a", body: b"a js" }]),
    )
    .await;
    store_update(
        &runtime,
        remote_update(newer, "2026-03-01T00:00:00Z", &[RemoteAsset { key: "b", body: b"b js" }]),
    )
    .await;

    let launched = runtime.launcher().unwrap().launch().await.unwrap();
    assert_eq!(launched.update.id, newer);
    runtime.writer().flush().await.unwrap();

    runtime
        .writer()
        .write(CatalogWrite::SetStatus {
            id: newer,
            status: UpdateStatus::Errored,
        })
        .await
        .unwrap();

    let launcher = runtime.launcher().unwrap();
    assert!(launcher.launchable_update().await.unwrap().is_none());
    assert!(matches!(
        launcher.launch().await,
        Err(LaunchError::NoLaunchableUpdate { cause: None })
    ));
}

#[tokio::test]
async fn test_manifest_filters_exclude_other_branches() {
    let h = Harness::new();
    let runtime = h.start().await;

    store_update(
        &runtime,
        remote_update(
            Uuid::new_v4(),
            "2026-02-01T00:00:00Z",
            &[RemoteAsset { key: "bundle", body: b"remote js" }],
        ),
    )
    .await;
    runtime
        .writer()
        .write(CatalogWrite::SetManifestFilters {
            scope_key: SCOPE.to_string(),
            filters: ManifestFilters::new().with("branchname", "preview"),
        })
        .await
        .unwrap();

    let launched = runtime.launcher().unwrap().launch().await.unwrap();
    assert_eq!(launched.update.id, embedded_id());
}

#[tokio::test]
async fn test_asset_loads_respect_concurrency_limit() {
    let h = Harness::with_fetcher(CountingFetcher::with_delay(Duration::from_millis(40)));
    let mut config = h.config();
    config.max_concurrent_asset_loads = 2;
    let runtime = h.start_with(config).await;

    let keys = ["bundle", "a", "b", "c", "d", "e"];
    for key in keys {
        h.fetcher.serve(&cdn_url(key), key.as_bytes());
    }
    let assets: Vec<_> = keys
        .iter()
        .map(|key| RemoteAsset {
            key: *key,
            body: key.as_bytes(),
        })
        .collect();
    store_update(
        &runtime,
        remote_update(Uuid::new_v4(), "2026-02-01T00:00:00Z", &assets),
    )
    .await;

    let launched = runtime.launcher().unwrap().launch().await.unwrap();
    assert_eq!(launched.result.stats.downloaded, keys.len());
    assert!(h.fetcher.max_in_flight() <= 2);
    assert!(h.fetcher.max_in_flight() >= 1);
}

#[tokio::test]
async fn test_launcher_runs_once() {
    let h = Harness::new();
    let runtime = h.start().await;

    let launcher = runtime.launcher().unwrap();
    launcher.launch().await.unwrap();
    assert!(matches!(
        launcher.launch().await,
        Err(LaunchError::AlreadyStarted)
    ));
    // The first outcome stands
    assert_eq!(launcher.state().launched_update_id(), Some(embedded_id()));
}

#[tokio::test]
async fn test_launch_in_background() {
    let h = Harness::new();
    let runtime = h.start().await;

    let launcher = Arc::new(runtime.launcher().unwrap());
    let outcome = launcher.clone().launch_in_background().wait().await;
    assert_eq!(outcome.unwrap().update.id, embedded_id());
    assert!(launcher.state().is_terminal());
}

#[tokio::test]
async fn test_stored_update_ids_lists_ready_updates() {
    let h = Harness::new();
    let runtime = h.start().await;

    let id = Uuid::new_v4();
    store_update(
        &runtime,
        remote_update(id, "2025-12-01T00:00:00Z", &[RemoteAsset { key: "bundle", body: b"js" }]),
    )
    .await;

    let launcher = runtime.launcher().unwrap();
    assert_eq!(launcher.stored_update_ids().await.unwrap(), vec![id]);
}

#[tokio::test]
async fn test_shared_content_keeps_each_update_asset_key() {
    let h = Harness::new();
    let runtime = h.start().await;

    let older = Uuid::new_v4();
    let newer = Uuid::new_v4();
    h.fetcher.serve(&cdn_url("bundle"), b"older js");
    h.fetcher.serve(&cdn_url("logo"), b"same image");
    store_update(
        &runtime,
        remote_update(
            older,
            "2026-02-01T00:00:00Z",
            &[
                RemoteAsset { key: "bundle", body: b"older js" },
                RemoteAsset { key: "logo", body: b"same image" },
            ],
        ),
    )
    .await;
    store_update(
        &runtime,
        remote_update(
            newer,
            "2026-03-01T00:00:00Z",
            &[
                RemoteAsset { key: "bundle2", body: b"newer js" },
                RemoteAsset { key: "icon", body: b"same image" },
            ],
        ),
    )
    .await;
    runtime
        .writer()
        .write(CatalogWrite::SetStatus {
            id: newer,
            status: UpdateStatus::Errored,
        })
        .await
        .unwrap();

    let launched = runtime.launcher().unwrap().launch().await.unwrap();
    assert_eq!(launched.update.id, older);
    assert_eq!(
        launched.asset_map().keys().map(String::as_str).collect::<Vec<_>>(),
        vec!["logo"]
    );
    assert_eq!(fs::read(&launched.asset_map()["logo"]).unwrap(), b"same image");
}

#[tokio::test]
async fn test_catalog_failure_during_selection_fails_launch() {
    let h = Harness::new();
    let runtime = h.start().await;
    runtime.writer().flush().await.unwrap();

    {
        let conn = runtime.catalog().database().get_connection().unwrap();
        conn.execute_batch("DROP TABLE updates_assets; DROP TABLE updates;")
            .unwrap();
    }

    let launcher = runtime.launcher().unwrap();
    let err = launcher.launch().await.unwrap_err();
    assert!(matches!(
        err,
        LaunchError::NoLaunchableUpdate { cause: Some(_) }
    ));
    assert!(matches!(launcher.state(), LaunchState::Failed { .. }));
    assert_eq!(h.fetcher.total_calls(), 0);
}

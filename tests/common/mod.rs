#![allow(dead_code)]

use futures_util::future::BoxFuture;
use relaunch_lib::engine::catalog::{AssetRecord, CatalogWrite, UpdateRecord, UpdateStatus};
use relaunch_lib::engine::updater::embedded::{EMBEDDED_LAUNCH_BUNDLE_FILENAME, EMBEDDED_MANIFEST_FILENAME};
use relaunch_lib::engine::updater::verify::content_hash;
use relaunch_lib::engine::updater::{AssetFetcher, DownloadError, Manifest, UpdatesRuntime};
use relaunch_lib::UpdatesConfig;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;
use uuid::Uuid;

pub const SCOPE: &str = "@test/app";
pub const RUNTIME: &str = "1.0.0";
pub const EMBEDDED_ID: &str = "11111111-1111-4111-8111-111111111111";

/// In-memory CDN that counts requests per URL
#[derive(Default)]
pub struct CountingFetcher {
    bodies: Mutex<BTreeMap<String, Vec<u8>>>,
    calls: Mutex<BTreeMap<String, usize>>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    delay: Option<Duration>,
}

impl CountingFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_delay(delay: Duration) -> Self {
        Self {
            delay: Some(delay),
            ..Self::default()
        }
    }

    pub fn serve(&self, url: &str, body: &[u8]) {
        self.bodies.lock().unwrap().insert(url.to_string(), body.to_vec());
    }

    pub fn calls(&self, url: &str) -> usize {
        self.calls.lock().unwrap().get(url).copied().unwrap_or(0)
    }

    pub fn total_calls(&self) -> usize {
        self.calls.lock().unwrap().values().sum()
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }
}

impl AssetFetcher for CountingFetcher {
    fn fetch<'a>(
        &'a self,
        url: &'a str,
        _headers: &'a BTreeMap<String, String>,
    ) -> BoxFuture<'a, Result<Vec<u8>, DownloadError>> {
        Box::pin(async move {
            *self.calls.lock().unwrap().entry(url.to_string()).or_default() += 1;
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(now, Ordering::SeqCst);

            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            let body = self.bodies.lock().unwrap().get(url).cloned();

            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            body.ok_or_else(|| DownloadError::InvalidResponse("HTTP 404 Not Found".to_string()))
        })
    }
}

/// Temporary app bundle + updates directory
pub struct Harness {
    pub temp: TempDir,
    pub fetcher: Arc<CountingFetcher>,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_fetcher(CountingFetcher::new())
    }

    pub fn with_fetcher(fetcher: CountingFetcher) -> Self {
        let harness = Self {
            temp: TempDir::new().unwrap(),
            fetcher: Arc::new(fetcher),
        };
        write_embedded_bundle(&harness.bundle_dir(), EMBEDDED_ID, "2026-01-01T00:00:00Z");
        harness
    }

    pub fn bundle_dir(&self) -> PathBuf {
        self.temp.path().join("bundle")
    }

    pub fn base_dir(&self) -> PathBuf {
        self.temp.path().join("data")
    }

    pub fn config(&self) -> UpdatesConfig {
        let mut config = UpdatesConfig::for_bundle(self.bundle_dir(), SCOPE, RUNTIME);
        config.base_dir = Some(self.base_dir());
        config
    }

    /// Open the runtime and import the embedded update, as a process start would
    pub async fn start(&self) -> UpdatesRuntime {
        self.start_with(self.config()).await
    }

    pub async fn start_with(&self, config: UpdatesConfig) -> UpdatesRuntime {
        let runtime = UpdatesRuntime::open(config, self.fetcher.clone()).unwrap();
        runtime.import_embedded_update().await.unwrap();
        runtime
    }
}

/// Bundle with a launch bundle and one bundled image keyed `logo`
pub fn write_embedded_bundle(dir: &Path, id: &str, created_at: &str) {
    fs::create_dir_all(dir).unwrap();
    let manifest = json!({
        "id": id,
        "createdAt": created_at,
        "runtimeVersion": RUNTIME,
        "launchAsset": { "key": "embedded-bundle", "contentType": "application/javascript" },
        "assets": [{
            "key": "logo",
            "contentType": "image/png",
            "fileExtension": ".png",
            "hash": content_hash(b"logo-bytes"),
            "mainBundleFilename": "logo.png"
        }]
    });
    fs::write(dir.join(EMBEDDED_MANIFEST_FILENAME), manifest.to_string()).unwrap();
    fs::write(dir.join(EMBEDDED_LAUNCH_BUNDLE_FILENAME), b"embedded js").unwrap();
    fs::write(dir.join("logo.png"), b"logo-bytes").unwrap();
}

pub struct RemoteAsset<'a> {
    pub key: &'a str,
    pub body: &'a [u8],
}

pub fn cdn_url(key: &str) -> String {
    format!("https://cdn.test/{}", key)
}

/// A downloaded manifest in `Ready` state; the first asset is the launch asset
pub fn remote_update(id: Uuid, created_at: &str, assets: &[RemoteAsset<'_>]) -> (UpdateRecord, Vec<AssetRecord>) {
    let describe = |asset: &RemoteAsset<'_>| -> Value {
        json!({
            "key": asset.key,
            "contentType": "application/octet-stream",
            "url": cdn_url(asset.key),
            "hash": content_hash(asset.body),
            "fileExtension": ".bin"
        })
    };
    let (launch, rest) = assets.split_first().unwrap();
    let manifest = json!({
        "id": id,
        "createdAt": created_at,
        "runtimeVersion": RUNTIME,
        "launchAsset": describe(launch),
        "assets": rest.iter().map(describe).collect::<Vec<_>>(),
        "metadata": { "branchname": "main" }
    });
    Manifest::parse(manifest.to_string().as_bytes())
        .unwrap()
        .into_records(SCOPE, UpdateStatus::Ready, true)
        .unwrap()
}

pub async fn store_update(runtime: &UpdatesRuntime, (update, assets): (UpdateRecord, Vec<AssetRecord>)) {
    runtime
        .writer()
        .write(CatalogWrite::InsertUpdate { update, assets })
        .await
        .unwrap();
}

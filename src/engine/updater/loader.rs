//! Asset loading from the application bundle or the network

use crate::engine::catalog::AssetRecord;
use crate::engine::updater::asset_store::AssetStore;
use crate::engine::updater::download::AssetFetcher;
use crate::engine::updater::embedded::EmbeddedBundle;
use crate::engine::updater::error::AssetError;
use crate::engine::updater::verify::content_hash;
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::path::PathBuf;

/// Where the bytes of an asset come from
#[derive(Clone, Copy)]
pub enum AssetSource<'a> {
    /// A named resource inside the application bundle
    Bundle {
        bundle: &'a EmbeddedBundle,
        resource: &'a str,
    },
    Remote {
        fetcher: &'a dyn AssetFetcher,
        request_headers: &'a BTreeMap<String, String>,
    },
}

#[derive(Debug, Clone)]
pub struct LoadedAsset {
    pub path: PathBuf,
    pub content_hash: String,
    pub download_time: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct AssetLoader {
    store: AssetStore,
}

impl AssetLoader {
    pub fn new(store: AssetStore) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &AssetStore {
        &self.store
    }

    /// Fetch the bytes for `asset`, check them against its expected hash,
    /// and store them under its filename
    pub async fn load(
        &self,
        source: AssetSource<'_>,
        asset: &AssetRecord,
    ) -> Result<LoadedAsset, AssetError> {
        let key = asset.display_key().to_string();
        let bytes = match source {
            AssetSource::Bundle { bundle, resource } => tokio::fs::read(bundle.resource_path(resource))
                .await
                .map_err(|source| AssetError::BundleCopy {
                    key: key.clone(),
                    source,
                })?,
            AssetSource::Remote {
                fetcher,
                request_headers,
            } => {
                let url = asset
                    .url
                    .as_deref()
                    .ok_or_else(|| AssetError::NoUrl { key: key.clone() })?;
                let mut headers = request_headers.clone();
                headers.extend(
                    asset
                        .extra_headers
                        .iter()
                        .map(|(k, v)| (k.clone(), v.clone())),
                );
                fetcher
                    .fetch(url, &headers)
                    .await
                    .map_err(|source| AssetError::Download {
                        key: key.clone(),
                        source,
                    })?
            }
        };

        let actual = content_hash(&bytes);
        if let Some(expected) = &asset.expected_hash {
            if *expected != actual {
                return Err(AssetError::HashMismatch {
                    key,
                    expected: expected.clone(),
                    actual,
                });
            }
        }

        let path = self
            .store
            .write_atomically(&asset.filename, &bytes)
            .await
            .map_err(|source| AssetError::Store {
                filename: asset.filename.clone(),
                source,
            })?;

        Ok(LoadedAsset {
            path,
            content_hash: actual,
            download_time: Utc::now(),
        })
    }
}

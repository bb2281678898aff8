//! Update Catalog
//!
//! Persisted store of update and asset records. Reads may run from any thread;
//! every mutation goes through the [`CatalogWriter`] lane.

pub mod records;
pub mod writer;

pub use records::{AssetRecord, ManifestFilters, UpdateRecord, UpdateStatus};
pub use writer::{CatalogWrite, CatalogWriter};

use crate::engine::database::{Database, DatabaseError};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::collections::BTreeMap;
use thiserror::Error;
use uuid::Uuid;

#[derive(Error, Debug)]
pub enum CatalogError {
    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Corrupt catalog row: {0}")]
    Corrupt(String),
    #[error("Update not found: {0}")]
    UpdateNotFound(Uuid),
    #[error("Catalog writer is not running")]
    WriterClosed,
    #[error("Catalog task failed: {0}")]
    Task(String),
}

const UPDATE_COLUMNS: &str =
    "id, scope_key, commit_time, runtime_version, manifest, status, is_verified, last_accessed";

/// `key` comes from the join row: the same file may be known by a different key in each update
const ASSET_COLUMNS: &str = "ua.key, a.filename, a.url, a.content_type, a.expected_hash, \
     a.content_hash, ua.is_launch_asset, a.extra_headers, a.download_time, a.main_bundle_filename";

/// Raw update row, converted outside of the rusqlite row callback
struct UpdateRow {
    id: String,
    scope_key: String,
    commit_time: i64,
    runtime_version: String,
    manifest: String,
    status: String,
    is_verified: bool,
    last_accessed: Option<String>,
}

impl UpdateRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            scope_key: row.get(1)?,
            commit_time: row.get(2)?,
            runtime_version: row.get(3)?,
            manifest: row.get(4)?,
            status: row.get(5)?,
            is_verified: row.get(6)?,
            last_accessed: row.get(7)?,
        })
    }

    fn into_record(self) -> Result<UpdateRecord, CatalogError> {
        Ok(UpdateRecord {
            id: Uuid::parse_str(&self.id)
                .map_err(|e| CatalogError::Corrupt(format!("update id {}: {}", self.id, e)))?,
            scope_key: self.scope_key,
            manifest: serde_json::from_str(&self.manifest)?,
            commit_time: from_millis(self.commit_time)?,
            runtime_version: self.runtime_version,
            status: self.status.parse().map_err(CatalogError::Corrupt)?,
            is_verified: self.is_verified,
            last_accessed: self.last_accessed.as_deref().map(parse_time).transpose()?,
        })
    }
}

struct AssetRow {
    key: Option<String>,
    filename: String,
    url: Option<String>,
    content_type: Option<String>,
    expected_hash: Option<String>,
    content_hash: Option<String>,
    is_launch_asset: bool,
    extra_headers: String,
    download_time: Option<String>,
    main_bundle_filename: Option<String>,
}

impl AssetRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            key: row.get(0)?,
            filename: row.get(1)?,
            url: row.get(2)?,
            content_type: row.get(3)?,
            expected_hash: row.get(4)?,
            content_hash: row.get(5)?,
            is_launch_asset: row.get(6)?,
            extra_headers: row.get(7)?,
            download_time: row.get(8)?,
            main_bundle_filename: row.get(9)?,
        })
    }

    fn into_record(self) -> Result<AssetRecord, CatalogError> {
        Ok(AssetRecord {
            key: self.key,
            filename: self.filename,
            url: self.url,
            content_type: self.content_type,
            expected_hash: self.expected_hash,
            content_hash: self.content_hash,
            is_launch_asset: self.is_launch_asset,
            extra_headers: serde_json::from_str::<BTreeMap<String, String>>(&self.extra_headers)?,
            download_time: self.download_time.as_deref().map(parse_time).transpose()?,
            main_bundle_filename: self.main_bundle_filename,
        })
    }
}

fn from_millis(ms: i64) -> Result<DateTime<Utc>, CatalogError> {
    DateTime::<Utc>::from_timestamp_millis(ms)
        .ok_or_else(|| CatalogError::Corrupt(format!("timestamp out of range: {}", ms)))
}

fn parse_time(s: &str) -> Result<DateTime<Utc>, CatalogError> {
    DateTime::parse_from_rfc3339(s)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| CatalogError::Corrupt(format!("timestamp {}: {}", s, e)))
}

#[derive(Clone)]
pub struct Catalog {
    db: Database,
}

impl Catalog {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    pub fn database(&self) -> &Database {
        &self.db
    }

    /// All updates for the scope in a launchable, non-errored state
    pub fn query_launchable_updates(&self, scope_key: &str) -> Result<Vec<UpdateRecord>, CatalogError> {
        let conn = self.db.get_connection()?;
        let statuses = UpdateStatus::launchable()
            .iter()
            .map(|s| format!("'{}'", s.as_str()))
            .collect::<Vec<_>>()
            .join(", ");
        let sql = format!(
            "SELECT {} FROM updates WHERE scope_key = ?1 AND status IN ({}) ORDER BY commit_time DESC, id",
            UPDATE_COLUMNS, statuses
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
            .query_map(params![scope_key], UpdateRow::from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        rows.into_iter().map(UpdateRow::into_record).collect()
    }

    pub fn query_manifest_filters(&self, scope_key: &str) -> Result<ManifestFilters, CatalogError> {
        let conn = self.db.get_connection()?;
        let filters: Option<String> = conn
            .query_row(
                "SELECT filters FROM manifest_filters WHERE scope_key = ?1",
                params![scope_key],
                |row| row.get(0),
            )
            .optional()?;
        match filters {
            Some(json) => Ok(serde_json::from_str(&json)?),
            None => Ok(ManifestFilters::default()),
        }
    }

    pub fn update_by_id(&self, id: Uuid) -> Result<Option<UpdateRecord>, CatalogError> {
        let conn = self.db.get_connection()?;
        let row = conn
            .query_row(
                &format!("SELECT {} FROM updates WHERE id = ?1", UPDATE_COLUMNS),
                params![id.to_string()],
                UpdateRow::from_row,
            )
            .optional()?;
        row.map(UpdateRow::into_record).transpose()
    }

    /// Assets referenced by an update, launch asset first
    pub fn assets_for_update(&self, id: Uuid) -> Result<Vec<AssetRecord>, CatalogError> {
        let conn = self.db.get_connection()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM assets a JOIN updates_assets ua ON ua.asset_id = a.id
             WHERE ua.update_id = ?1 ORDER BY ua.is_launch_asset DESC, a.id",
            ASSET_COLUMNS
        ))?;
        let rows = stmt
            .query_map(params![id.to_string()], AssetRow::from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        rows.into_iter().map(AssetRow::into_record).collect()
    }

    pub fn asset_by_filename(&self, filename: &str) -> Result<Option<AssetRecord>, CatalogError> {
        let conn = self.db.get_connection()?;
        let row = conn
            .query_row(
                "SELECT key, filename, url, content_type, expected_hash, content_hash, 0,
                        extra_headers, download_time, main_bundle_filename
                 FROM assets WHERE filename = ?1",
                params![filename],
                AssetRow::from_row,
            )
            .optional()?;
        row.map(AssetRow::into_record).transpose()
    }

    pub fn update_ids_with_status(&self, status: UpdateStatus) -> Result<Vec<Uuid>, CatalogError> {
        let conn = self.db.get_connection()?;
        let mut stmt = conn.prepare("SELECT id FROM updates WHERE status = ?1 ORDER BY commit_time, id")?;
        let ids = stmt
            .query_map(params![status.as_str()], |row| row.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;
        ids.iter()
            .map(|id| {
                Uuid::parse_str(id).map_err(|e| CatalogError::Corrupt(format!("update id {}: {}", id, e)))
            })
            .collect()
    }

    /// Commit time of the newest update ever launched in this scope
    pub fn launch_floor(&self, scope_key: &str) -> Result<Option<DateTime<Utc>>, CatalogError> {
        let conn = self.db.get_connection()?;
        let millis: Option<i64> = conn
            .query_row(
                "SELECT commit_time FROM launch_floor WHERE scope_key = ?1",
                params![scope_key],
                |row| row.get(0),
            )
            .optional()?;
        millis.map(from_millis).transpose()
    }

    pub(crate) fn apply(&self, write: &CatalogWrite) -> Result<(), CatalogError> {
        match write {
            CatalogWrite::InsertUpdate { update, assets } => self.insert_update(update, assets).map(|_| ()),
            CatalogWrite::MarkLaunched(id) => self.mark_launched(*id),
            CatalogWrite::MarkAccessed(id) => self.mark_update_accessed(*id),
            CatalogWrite::UpsertAsset(asset) => self.upsert_asset(asset).map(|_| ()),
            CatalogWrite::SetStatus { id, status } => self.set_status(*id, *status),
            CatalogWrite::SetManifestFilters { scope_key, filters } => {
                self.set_manifest_filters(scope_key, filters)
            }
        }
    }

    /// Returns false when the update row already existed
    pub(crate) fn insert_update(
        &self,
        update: &UpdateRecord,
        assets: &[AssetRecord],
    ) -> Result<bool, CatalogError> {
        let mut conn = self.db.get_connection()?;
        let tx = conn.transaction()?;

        let inserted = tx.execute(
            "INSERT OR IGNORE INTO updates
                (id, scope_key, commit_time, runtime_version, manifest, status, is_verified, last_accessed)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                update.id.to_string(),
                update.scope_key,
                update.commit_time.timestamp_millis(),
                update.runtime_version,
                serde_json::to_string(&update.manifest)?,
                update.status.as_str(),
                update.is_verified,
                update.last_accessed.map(|t| t.to_rfc3339()),
            ],
        )?;
        if inserted == 0 {
            return Ok(false);
        }

        for asset in assets {
            let asset_id = upsert_asset_row(&tx, asset)?;
            tx.execute(
                "INSERT OR IGNORE INTO updates_assets (update_id, asset_id, is_launch_asset, key)
                 VALUES (?1, ?2, ?3, ?4)",
                params![update.id.to_string(), asset_id, asset.is_launch_asset, asset.key],
            )?;
        }

        tx.commit()?;
        Ok(true)
    }

    /// Make `id` the single launched update and raise its scope's launch floor
    pub(crate) fn mark_launched(&self, id: Uuid) -> Result<(), CatalogError> {
        let mut conn = self.db.get_connection()?;
        let tx = conn.transaction()?;

        let (scope_key, commit_time, status): (String, i64, String) = tx
            .query_row(
                "SELECT scope_key, commit_time, status FROM updates WHERE id = ?1",
                params![id.to_string()],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .optional()?
            .ok_or(CatalogError::UpdateNotFound(id))?;
        let status: UpdateStatus = status.parse().map_err(CatalogError::Corrupt)?;

        tx.execute(
            "UPDATE updates SET status = ?1 WHERE status = ?2 AND id != ?3",
            params![
                UpdateStatus::Ready.as_str(),
                UpdateStatus::Launched.as_str(),
                id.to_string()
            ],
        )?;

        // Embedded and development rows keep their status; stale-embedded filtering depends on it
        let new_status = match status {
            UpdateStatus::Ready | UpdateStatus::Launched => UpdateStatus::Launched,
            other => other,
        };
        tx.execute(
            "UPDATE updates SET status = ?1, last_accessed = ?2 WHERE id = ?3",
            params![new_status.as_str(), Utc::now().to_rfc3339(), id.to_string()],
        )?;

        tx.execute(
            "INSERT INTO launch_floor (scope_key, update_id, commit_time) VALUES (?1, ?2, ?3)
             ON CONFLICT(scope_key) DO UPDATE SET
                update_id = excluded.update_id,
                commit_time = excluded.commit_time
             WHERE excluded.commit_time >= launch_floor.commit_time",
            params![scope_key, id.to_string(), commit_time],
        )?;

        tx.commit()?;
        Ok(())
    }

    pub(crate) fn mark_update_accessed(&self, id: Uuid) -> Result<(), CatalogError> {
        let conn = self.db.get_connection()?;
        let changed = conn.execute(
            "UPDATE updates SET last_accessed = ?1 WHERE id = ?2",
            params![Utc::now().to_rfc3339(), id.to_string()],
        )?;
        if changed == 0 {
            return Err(CatalogError::UpdateNotFound(id));
        }
        Ok(())
    }

    pub(crate) fn upsert_asset(&self, asset: &AssetRecord) -> Result<i64, CatalogError> {
        let conn = self.db.get_connection()?;
        upsert_asset_row(&conn, asset)
    }

    pub(crate) fn set_status(&self, id: Uuid, status: UpdateStatus) -> Result<(), CatalogError> {
        let conn = self.db.get_connection()?;
        let changed = conn.execute(
            "UPDATE updates SET status = ?1 WHERE id = ?2",
            params![status.as_str(), id.to_string()],
        )?;
        if changed == 0 {
            return Err(CatalogError::UpdateNotFound(id));
        }
        Ok(())
    }

    pub(crate) fn set_manifest_filters(
        &self,
        scope_key: &str,
        filters: &ManifestFilters,
    ) -> Result<(), CatalogError> {
        let conn = self.db.get_connection()?;
        conn.execute(
            "INSERT INTO manifest_filters (scope_key, filters) VALUES (?1, ?2)
             ON CONFLICT(scope_key) DO UPDATE SET filters = excluded.filters",
            params![scope_key, serde_json::to_string(filters)?],
        )?;
        Ok(())
    }
}

/// Insert or refresh an asset row keyed by filename; known hashes and times are never cleared.
/// `assets.key` keeps the first key seen for the file; per-update keys live in `updates_assets`.
fn upsert_asset_row(conn: &Connection, asset: &AssetRecord) -> Result<i64, CatalogError> {
    let id = conn.query_row(
        "INSERT INTO assets
            (key, filename, url, content_type, expected_hash, content_hash,
             extra_headers, download_time, main_bundle_filename)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
         ON CONFLICT(filename) DO UPDATE SET
            key = COALESCE(assets.key, excluded.key),
            url = COALESCE(excluded.url, assets.url),
            content_type = COALESCE(excluded.content_type, assets.content_type),
            expected_hash = COALESCE(excluded.expected_hash, assets.expected_hash),
            content_hash = COALESCE(excluded.content_hash, assets.content_hash),
            extra_headers = CASE WHEN excluded.extra_headers = '{}'
                                 THEN assets.extra_headers ELSE excluded.extra_headers END,
            download_time = COALESCE(excluded.download_time, assets.download_time),
            main_bundle_filename = COALESCE(excluded.main_bundle_filename, assets.main_bundle_filename)
         RETURNING id",
        params![
            asset.key,
            asset.filename,
            asset.url,
            asset.content_type,
            asset.expected_hash,
            asset.content_hash,
            serde_json::to_string(&asset.extra_headers)?,
            asset.download_time.map(|t| t.to_rfc3339()),
            asset.main_bundle_filename,
        ],
        |row| row.get(0),
    )?;
    Ok(id)
}

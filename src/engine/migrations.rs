//! Relaunch Migrations Module
//! Ordered catalog schema migrations, each applied exactly once

use crate::engine::database::{record_migration, Database, DatabaseError};
use sha2::{Digest, Sha256};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum MigrationError {
    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),
    #[error("Schema drift detected: {0}")]
    SchemaDrift(String),
    #[error("SQL execution error: {0}")]
    SqlError(#[from] rusqlite::Error),
}

#[derive(Debug, Clone)]
pub struct Migration {
    pub name: &'static str,
    pub sql: &'static str,
}

impl Migration {
    pub fn checksum(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.sql.as_bytes());
        let result = hasher.finalize();
        base64::Engine::encode(&base64::engine::general_purpose::STANDARD, result)
    }
}

const CATALOG_MIGRATIONS: &[Migration] = &[
    Migration {
        name: "0001_updates_and_assets",
        sql: "
            CREATE TABLE updates (
                id TEXT PRIMARY KEY NOT NULL,
                scope_key TEXT NOT NULL,
                commit_time INTEGER NOT NULL,
                runtime_version TEXT NOT NULL,
                manifest TEXT NOT NULL,
                status TEXT NOT NULL,
                is_verified INTEGER NOT NULL DEFAULT 0,
                last_accessed TEXT
            );
            CREATE INDEX updates_scope_key_idx ON updates (scope_key);

            CREATE TABLE assets (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                key TEXT,
                filename TEXT NOT NULL UNIQUE,
                url TEXT,
                content_type TEXT,
                expected_hash TEXT,
                content_hash TEXT,
                extra_headers TEXT NOT NULL DEFAULT '{}',
                download_time TEXT,
                main_bundle_filename TEXT
            );

            CREATE TABLE updates_assets (
                update_id TEXT NOT NULL REFERENCES updates(id) ON DELETE CASCADE,
                asset_id INTEGER NOT NULL REFERENCES assets(id) ON DELETE CASCADE,
                is_launch_asset INTEGER NOT NULL DEFAULT 0,
                PRIMARY KEY (update_id, asset_id)
            );
        ",
    },
    Migration {
        name: "0002_manifest_filters",
        sql: "
            CREATE TABLE manifest_filters (
                scope_key TEXT PRIMARY KEY NOT NULL,
                filters TEXT NOT NULL
            );
        ",
    },
    Migration {
        name: "0003_launch_floor",
        sql: "
            CREATE TABLE launch_floor (
                scope_key TEXT PRIMARY KEY NOT NULL,
                update_id TEXT NOT NULL,
                commit_time INTEGER NOT NULL
            );
        ",
    },
    Migration {
        name: "0004_update_asset_keys",
        sql: "
            ALTER TABLE updates_assets ADD COLUMN key TEXT;
            UPDATE updates_assets
               SET key = (SELECT a.key FROM assets a WHERE a.id = updates_assets.asset_id);
        ",
    },
];

pub struct MigrationRunner {
    migrations: &'static [Migration],
}

impl MigrationRunner {
    pub fn catalog() -> Self {
        Self {
            migrations: CATALOG_MIGRATIONS,
        }
    }

    pub fn list_pending(&self, db: &Database) -> Result<Vec<&'static Migration>, MigrationError> {
        let applied = db.get_applied_migrations()?;
        Ok(self
            .migrations
            .iter()
            .filter(|m| !applied.iter().any(|name| name == m.name))
            .collect())
    }

    pub fn apply(&self, db: &Database, migration: &Migration) -> Result<(), MigrationError> {
        let mut conn = db.get_connection()?;
        let tx = conn.transaction()?;
        tx.execute_batch(migration.sql)?;
        record_migration(&tx, migration.name, &migration.checksum())?;
        tx.commit()?;
        tracing::debug!(migration = migration.name, "applied catalog migration");
        Ok(())
    }

    /// Verify that applied migrations still match the compiled-in SQL
    pub fn check(&self, db: &Database) -> Result<(), MigrationError> {
        let conn = db.get_connection()?;
        let mut stmt = conn.prepare("SELECT name, checksum FROM _relaunch_migrations")?;
        let applied = stmt
            .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)))?
            .collect::<Result<Vec<_>, _>>()?;

        for (name, checksum) in applied {
            let Some(migration) = self.migrations.iter().find(|m| m.name == name) else {
                return Err(MigrationError::SchemaDrift(format!(
                    "unknown migration {} in journal",
                    name
                )));
            };
            if migration.checksum() != checksum {
                return Err(MigrationError::SchemaDrift(format!(
                    "checksum of {} changed since it was applied",
                    name
                )));
            }
        }
        Ok(())
    }

    pub fn push(&self, db: &Database) -> Result<Vec<String>, MigrationError> {
        self.check(db)?;
        let pending = self.list_pending(db)?;
        let mut applied = Vec::new();

        for migration in pending {
            self.apply(db, migration)?;
            applied.push(migration.name.to_string());
        }

        Ok(applied)
    }
}

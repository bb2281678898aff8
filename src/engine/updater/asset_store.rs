//! Asset Store
//!
//! Filesystem layout for the updates directory:
//!
//! ```text
//! <base_dir>/
//!   catalog.db
//!   assets/
//!     <hash><ext>
//! ```
//!
//! Files are written to a unique `.partial` sibling and renamed into place,
//! so a crash never leaves a truncated asset under its final name.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use uuid::Uuid;

const PARTIAL_EXTENSION: &str = "partial";

#[derive(Debug, Clone)]
pub struct AssetStore {
    base_dir: PathBuf,
}

impl AssetStore {
    pub fn with_base_dir(base_dir: PathBuf) -> Self {
        Self { base_dir }
    }

    pub fn init(&self) -> io::Result<()> {
        fs::create_dir_all(self.assets_dir())
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    pub fn assets_dir(&self) -> PathBuf {
        self.base_dir.join("assets")
    }

    pub fn database_path(&self) -> PathBuf {
        self.base_dir.join("catalog.db")
    }

    pub fn asset_path(&self, filename: &str) -> PathBuf {
        self.assets_dir().join(filename)
    }

    fn checked_path(&self, filename: &str) -> io::Result<PathBuf> {
        let plain = !filename.is_empty()
            && filename != "."
            && filename != ".."
            && !filename.contains(['/', '\\']);
        if !plain {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("invalid asset filename: {}", filename),
            ));
        }
        Ok(self.asset_path(filename))
    }

    pub async fn contains(&self, filename: &str) -> bool {
        match self.checked_path(filename) {
            Ok(path) => tokio::fs::try_exists(path).await.unwrap_or(false),
            Err(_) => false,
        }
    }

    pub async fn write_atomically(&self, filename: &str, bytes: &[u8]) -> io::Result<PathBuf> {
        let dest = self.checked_path(filename)?;
        let partial = self.partial_path(filename);
        tokio::fs::create_dir_all(self.assets_dir()).await?;

        if let Err(e) = tokio::fs::write(&partial, bytes).await {
            let _ = tokio::fs::remove_file(&partial).await;
            return Err(e);
        }
        tokio::fs::rename(&partial, &dest).await?;
        Ok(dest)
    }

    /// Concurrent writers of the same filename each get their own partial
    fn partial_path(&self, filename: &str) -> PathBuf {
        self.assets_dir().join(format!(
            ".{}.{}.{}",
            filename,
            Uuid::new_v4().simple(),
            PARTIAL_EXTENSION
        ))
    }

    /// Remove partial files left behind by an interrupted run
    pub fn cleanup_partials(&self) -> io::Result<usize> {
        let dir = self.assets_dir();
        if !dir.exists() {
            return Ok(0);
        }

        let mut removed = 0;
        for entry in fs::read_dir(&dir)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) == Some(PARTIAL_EXTENSION) {
                fs::remove_file(&path)?;
                removed += 1;
            }
        }
        if removed > 0 {
            tracing::info!(removed, "removed interrupted asset writes");
        }
        Ok(removed)
    }
}

//! Single-writer lane for catalog mutations
//!
//! A dedicated `catalog-writer` thread drains a channel of tagged writes and
//! applies them one at a time, so no two mutations ever interleave.

use super::{AssetRecord, Catalog, CatalogError, ManifestFilters, UpdateRecord, UpdateStatus};
use tokio::sync::{mpsc, oneshot};
use uuid::Uuid;

#[derive(Debug, Clone)]
pub enum CatalogWrite {
    InsertUpdate {
        update: UpdateRecord,
        assets: Vec<AssetRecord>,
    },
    MarkLaunched(Uuid),
    MarkAccessed(Uuid),
    UpsertAsset(AssetRecord),
    SetStatus {
        id: Uuid,
        status: UpdateStatus,
    },
    SetManifestFilters {
        scope_key: String,
        filters: ManifestFilters,
    },
}

impl CatalogWrite {
    fn describe(&self) -> &'static str {
        match self {
            CatalogWrite::InsertUpdate { .. } => "insert_update",
            CatalogWrite::MarkLaunched(_) => "mark_launched",
            CatalogWrite::MarkAccessed(_) => "mark_accessed",
            CatalogWrite::UpsertAsset(_) => "upsert_asset",
            CatalogWrite::SetStatus { .. } => "set_status",
            CatalogWrite::SetManifestFilters { .. } => "set_manifest_filters",
        }
    }
}

enum WriteJob {
    Apply {
        write: CatalogWrite,
        reply: Option<oneshot::Sender<Result<(), CatalogError>>>,
    },
    Flush(oneshot::Sender<()>),
}

/// Handle to the writer lane; clones share the same thread
#[derive(Clone)]
pub struct CatalogWriter {
    tx: mpsc::UnboundedSender<WriteJob>,
}

impl CatalogWriter {
    /// Start the writer thread. It exits once every handle is dropped.
    pub fn spawn(catalog: Catalog) -> Result<Self, CatalogError> {
        let (tx, mut rx) = mpsc::unbounded_channel::<WriteJob>();

        std::thread::Builder::new()
            .name("catalog-writer".to_string())
            .spawn(move || {
                while let Some(job) = rx.blocking_recv() {
                    match job {
                        WriteJob::Apply { write, reply } => {
                            let result = catalog.apply(&write);
                            match reply {
                                Some(reply) => {
                                    let _ = reply.send(result);
                                }
                                None => {
                                    if let Err(e) = result {
                                        tracing::warn!(
                                            op = write.describe(),
                                            error = %e,
                                            "best-effort catalog write failed"
                                        );
                                    }
                                }
                            }
                        }
                        WriteJob::Flush(done) => {
                            let _ = done.send(());
                        }
                    }
                }
                tracing::debug!("catalog writer stopped");
            })?;

        Ok(Self { tx })
    }

    /// Apply a write and wait for its outcome
    pub async fn write(&self, write: CatalogWrite) -> Result<(), CatalogError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(WriteJob::Apply {
                write,
                reply: Some(reply),
            })
            .map_err(|_| CatalogError::WriterClosed)?;
        rx.await.map_err(|_| CatalogError::WriterClosed)?
    }

    /// Fire-and-forget; failures are logged by the writer thread
    pub fn submit(&self, write: CatalogWrite) {
        let op = write.describe();
        if self
            .tx
            .send(WriteJob::Apply { write, reply: None })
            .is_err()
        {
            tracing::warn!(op, "catalog writer closed, dropping write");
        }
    }

    /// Resolves once every write submitted before this call has been applied
    pub async fn flush(&self) -> Result<(), CatalogError> {
        let (done, rx) = oneshot::channel();
        self.tx
            .send(WriteJob::Flush(done))
            .map_err(|_| CatalogError::WriterClosed)?;
        rx.await.map_err(|_| CatalogError::WriterClosed)
    }
}

use crate::{
    ArchiveBuilder, ArchiveEntry, ContentRecord, ContentStore, PieceError, PieceSizeTarget,
    RegenerateStatus, Result, commp, resolve_manifest,
};
use std::path::PathBuf;
use std::sync::Arc;

/// Rebuilds an archive from a record's manifest and checks it against the
/// recorded piece CID.
pub struct RegenerateArchiveOperation {
    content_store: Arc<ContentStore>,
}

#[derive(Debug, Clone)]
pub struct RegenerateArchiveOperationRequest {
    pub record: ContentRecord,
    pub parent_root: PathBuf,
    pub scratch_dir: Option<PathBuf>,
    pub out_dir: PathBuf,
}

#[derive(Debug, Clone)]
pub struct RegenerateArchiveOperationResult {
    pub record_id: String,
    pub commp: String,
    pub archive_path: PathBuf,
    pub archive_size: u64,
}

impl RegenerateArchiveOperation {
    pub fn new(content_store: Arc<ContentStore>) -> Self {
        Self { content_store }
    }

    pub async fn run(
        &self,
        request: RegenerateArchiveOperationRequest,
    ) -> Result<RegenerateArchiveOperationResult> {
        let RegenerateArchiveOperationRequest {
            record,
            parent_root,
            scratch_dir,
            out_dir,
        } = request;

        // Nothing is written or persisted unless every source is present.
        let sources = resolve_manifest(&record.manifest, &parent_root)?;
        let entries: Vec<ArchiveEntry> = sources
            .into_iter()
            .zip(&record.manifest)
            .map(|(source, entry)| ArchiveEntry {
                source,
                relative_path: entry.relative_path.clone(),
            })
            .collect();

        self.content_store
            .set_regenerate_status(&record.id, RegenerateStatus::Pending)?;

        match self.rebuild(&record, entries, out_dir, scratch_dir).await {
            Ok(result) => {
                self.content_store
                    .set_regenerate_status(&record.id, RegenerateStatus::Success)?;
                tracing::info!(
                    "Regenerated archive {} at {}",
                    record.commp,
                    result.archive_path.display()
                );
                Ok(result)
            }
            Err(error) => {
                tracing::warn!("Failed to regenerate archive {}: {}", record.commp, error);
                self.content_store
                    .set_regenerate_status(&record.id, RegenerateStatus::Failed)?;
                Err(error)
            }
        }
    }

    async fn rebuild(
        &self,
        record: &ContentRecord,
        entries: Vec<ArchiveEntry>,
        out_dir: PathBuf,
        scratch_dir: Option<PathBuf>,
    ) -> Result<RegenerateArchiveOperationResult> {
        commp::validate_piece_size(record.piece_size)?;
        let builder = ArchiveBuilder::new(out_dir, scratch_dir);
        let target = PieceSizeTarget::Exact(record.piece_size);

        let (builder, built) = tokio::task::spawn_blocking(move || {
            let built = builder.build(&entries, target);
            (builder, built)
        })
        .await
        .map_err(|error| PieceError::Internal(format!("archive task failed: {}", error)))?;
        // The recorded size is valid, so a padding failure means the sources
        // no longer fit in the recorded piece.
        let built = built.map_err(|error| match error {
            PieceError::InvalidPieceSize(reason) => PieceError::CommitmentMismatch {
                expected: record.commp.clone(),
                actual: reason,
            },
            other => other,
        })?;

        if built.piece_cid != record.commp {
            builder.discard(&built);
            return Err(PieceError::CommitmentMismatch {
                expected: record.commp.clone(),
                actual: built.piece_cid,
            });
        }

        let archive_path = builder.publish(&built)?;
        Ok(RegenerateArchiveOperationResult {
            record_id: record.id.clone(),
            commp: record.commp.clone(),
            archive_path,
            archive_size: built.archive_size,
        })
    }
}

/// Which records a batch regeneration covers.
#[derive(Debug, Clone)]
pub enum RegenerateSelection {
    RecordId(String),
    PieceCids(Vec<String>),
}

#[derive(Debug, Clone)]
pub struct RegenerateArchivesOperationRequest {
    pub selection: RegenerateSelection,
    pub parent_root: PathBuf,
    pub scratch_dir: Option<PathBuf>,
    pub out_dir: PathBuf,
}

#[derive(Debug, Clone)]
pub struct RegenerateItem {
    pub commp: String,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct RegenerateArchivesOperationResult {
    pub attempted: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub warnings: Vec<String>,
    pub items: Vec<RegenerateItem>,
}

/// Regenerates several records, one at a time; a failed item never stops
/// the batch.
pub struct RegenerateArchivesOperation {
    content_store: Arc<ContentStore>,
}

impl RegenerateArchivesOperation {
    pub fn new(content_store: Arc<ContentStore>) -> Self {
        Self { content_store }
    }

    pub async fn run(
        &self,
        request: RegenerateArchivesOperationRequest,
    ) -> Result<RegenerateArchivesOperationResult> {
        let mut result = RegenerateArchivesOperationResult::default();

        let records = match &request.selection {
            RegenerateSelection::RecordId(id) => {
                let record = self
                    .content_store
                    .get_record(id)?
                    .ok_or_else(|| PieceError::RecordNotFound(format!("content record {}", id)))?;
                vec![record]
            }
            RegenerateSelection::PieceCids(cids) => {
                let mut records = Vec::with_capacity(cids.len());
                for cid in cids {
                    match self.content_store.get_by_commp(cid)? {
                        Some(record) => records.push(record),
                        None => {
                            tracing::warn!("No content record for piece CID {}", cid);
                            result.warnings.push(format!("unknown piece CID: {}", cid));
                        }
                    }
                }
                records
            }
        };

        let single = RegenerateArchiveOperation::new(self.content_store.clone());
        for record in records {
            result.attempted += 1;
            let commp = record.commp.clone();
            let outcome = single
                .run(RegenerateArchiveOperationRequest {
                    record,
                    parent_root: request.parent_root.clone(),
                    scratch_dir: request.scratch_dir.clone(),
                    out_dir: request.out_dir.clone(),
                })
                .await;

            match outcome {
                Ok(_) => {
                    result.succeeded += 1;
                    result.items.push(RegenerateItem { commp, error: None });
                }
                // storage failures are not per-item
                Err(error @ PieceError::Database(_)) => return Err(error),
                Err(error) => {
                    result.failed += 1;
                    result.items.push(RegenerateItem {
                        commp,
                        error: Some(error.to_string()),
                    });
                }
            }
        }

        tracing::info!(
            "Regeneration finished: {} attempted, {} succeeded, {} failed",
            result.attempted,
            result.succeeded,
            result.failed
        );

        Ok(result)
    }
}

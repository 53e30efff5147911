use crate::{
    ArchiveBuilder, ArchiveEntry, ContentRecord, ContentStore, DealSendStatus, PieceError,
    PieceSizeTarget, RegenerateStatus, Result, SourceFile, build_manifest, commp, select_files,
};
use chrono::Utc;
use rand::Rng;
use std::path::PathBuf;
use std::sync::Arc;
use ulid::Ulid;

pub struct GenerateArchiveOperation {
    content_store: Arc<ContentStore>,
}

#[derive(Debug, Clone)]
pub struct GenerateArchiveOperationRequest {
    pub universe: Vec<SourceFile>,
    pub target_archive_size: u64,
    /// Zero keeps the minimal piece size.
    pub target_piece_size: u64,
    pub parent_root: PathBuf,
    pub scratch_dir: Option<PathBuf>,
    pub out_dir: PathBuf,
}

#[derive(Debug, Clone)]
pub enum GenerateArchiveOperationOutcome {
    Created(ContentRecord),
    /// The archive had the same piece CID as an existing record.
    Duplicate(ContentRecord),
}

impl GenerateArchiveOperation {
    pub fn new(content_store: Arc<ContentStore>) -> Self {
        Self { content_store }
    }

    pub async fn run<R>(
        &self,
        request: GenerateArchiveOperationRequest,
        rng: &mut R,
    ) -> Result<GenerateArchiveOperationOutcome>
    where
        R: Rng + ?Sized,
    {
        let GenerateArchiveOperationRequest {
            universe,
            target_archive_size,
            target_piece_size,
            parent_root,
            scratch_dir,
            out_dir,
        } = request;

        let target = if target_piece_size == 0 {
            PieceSizeTarget::Minimal
        } else {
            commp::validate_piece_size(target_piece_size)?;
            PieceSizeTarget::AtLeast(target_piece_size)
        };

        let selection = select_files(&universe, target_archive_size, rng)?;
        let manifest = build_manifest(&selection, &parent_root)?;
        let entries: Vec<ArchiveEntry> = selection
            .iter()
            .zip(&manifest)
            .map(|(file, entry)| ArchiveEntry {
                source: file.path.clone(),
                relative_path: entry.relative_path.clone(),
            })
            .collect();

        tracing::info!(
            "Generating archive from {} files ({} bytes requested) into {}",
            entries.len(),
            target_archive_size,
            out_dir.display()
        );

        let builder = ArchiveBuilder::new(out_dir, scratch_dir);
        let (builder, built) = tokio::task::spawn_blocking(move || {
            let built = builder.build(&entries, target);
            (builder, built)
        })
        .await
        .map_err(|error| PieceError::Internal(format!("archive task failed: {}", error)))?;
        let built = built?;

        if let Some(existing) = self.content_store.get_by_commp(&built.piece_cid)? {
            tracing::warn!(
                "Archive {} already recorded as {}; discarding the new copy",
                built.piece_cid,
                existing.id
            );
            builder.discard(&built);
            return Ok(GenerateArchiveOperationOutcome::Duplicate(existing));
        }

        let final_path = builder.publish(&built)?;
        let now = Utc::now();
        let record = ContentRecord {
            id: Ulid::new().to_string(),
            commp: built.piece_cid.clone(),
            payload_cid: built.payload_cid.clone(),
            piece_size: built.piece_size,
            archive_size: built.archive_size,
            file_path: final_path.to_string_lossy().into_owned(),
            manifest,
            deal_status: DealSendStatus::Pending,
            deal_time: None,
            deal_error: None,
            deal_id: None,
            regenerate_status: RegenerateStatus::Pending,
            created_at: now,
            updated_at: now,
        };

        if let Err(error) = self.content_store.insert_record(&record) {
            if let Err(remove_error) = std::fs::remove_file(&final_path) {
                tracing::warn!(
                    "Failed to remove unrecorded archive {}: {}",
                    final_path.display(),
                    remove_error
                );
            }
            return Err(error);
        }

        tracing::info!(
            "Generated archive {} (piece size {}, {} bytes)",
            record.commp,
            record.piece_size,
            record.archive_size
        );

        Ok(GenerateArchiveOperationOutcome::Created(record))
    }
}

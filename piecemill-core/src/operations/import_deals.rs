use crate::{
    ContentStore, DealState, DealStore, DealTool, RegenerateStatus, Result, archive_file_name,
};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

pub struct ImportDealsOperation {
    content_store: Arc<ContentStore>,
    deal_store: Arc<DealStore>,
    deal_tool: Arc<dyn DealTool>,
}

#[derive(Debug, Clone)]
pub struct ImportDealsOperationRequest {
    /// Searched in order for `<commp>.tar`.
    pub archive_dirs: Vec<PathBuf>,
    /// Only import archives whose content was verified by regeneration.
    pub require_regenerated: bool,
    pub inter_item_delay: Duration,
}

#[derive(Debug, Clone, Default)]
pub struct ImportDealsOperationResult {
    pub checked: usize,
    pub imported: usize,
    pub skipped: usize,
    pub failed: usize,
}

impl ImportDealsOperation {
    pub fn new(
        content_store: Arc<ContentStore>,
        deal_store: Arc<DealStore>,
        deal_tool: Arc<dyn DealTool>,
    ) -> Self {
        Self {
            content_store,
            deal_store,
            deal_tool,
        }
    }

    pub async fn run(
        &self,
        request: ImportDealsOperationRequest,
    ) -> Result<ImportDealsOperationResult> {
        let mut result = ImportDealsOperationResult::default();
        let deals = self.deal_store.list_by_state(&DealState::Proposed)?;
        let total = deals.len();

        for (index, deal) in deals.into_iter().enumerate() {
            result.checked += 1;

            if request.require_regenerated {
                let regenerated = self
                    .content_store
                    .get_by_commp(&deal.commp)?
                    .is_some_and(|record| record.regenerate_status == RegenerateStatus::Success);
                if !regenerated {
                    tracing::debug!("Deal {} waits for regeneration of {}", deal.uuid, deal.commp);
                    result.skipped += 1;
                    continue;
                }
            }

            let Some(archive_path) = locate_archive(&request.archive_dirs, &deal.commp) else {
                tracing::warn!("No archive found for deal {} ({})", deal.uuid, deal.commp);
                result.skipped += 1;
                continue;
            };

            if let Err(error) = self.deal_tool.import_deal(&deal.uuid, &archive_path).await {
                tracing::warn!("Import of deal {} failed: {}", deal.uuid, error);
                result.failed += 1;
                continue;
            }

            if self
                .deal_store
                .advance_state(&deal.uuid, &DealState::Proposed, &DealState::Imported)?
            {
                result.imported += 1;
                tracing::info!("Imported {} for deal {}", archive_path.display(), deal.uuid);
            } else {
                tracing::warn!("Deal {} changed state during import", deal.uuid);
            }

            if index + 1 < total && !request.inter_item_delay.is_zero() {
                tokio::time::sleep(request.inter_item_delay).await;
            }
        }

        tracing::info!(
            "Import finished: {} checked, {} imported, {} skipped, {} failed",
            result.checked,
            result.imported,
            result.skipped,
            result.failed
        );

        Ok(result)
    }
}

fn locate_archive(dirs: &[PathBuf], commp: &str) -> Option<PathBuf> {
    let file_name = archive_file_name(commp);
    dirs.iter()
        .map(|dir| dir.join(&file_name))
        .find(|path| path.is_file())
}

use crate::{DealState, DealStore, Result, archive_file_name};
use std::path::PathBuf;
use std::sync::Arc;

/// Removes local archives of deals that are already on chain.
pub struct ClearArchivesOperation {
    deal_store: Arc<DealStore>,
}

#[derive(Debug, Clone)]
pub struct ClearArchivesOperationRequest {
    pub archive_dirs: Vec<PathBuf>,
    /// Without this only the would-be deletions are logged.
    pub really_delete: bool,
}

#[derive(Debug, Clone, Default)]
pub struct ClearArchivesOperationResult {
    pub deals: usize,
    pub found: usize,
    pub deleted: usize,
    pub errors: usize,
}

impl ClearArchivesOperation {
    pub fn new(deal_store: Arc<DealStore>) -> Self {
        Self { deal_store }
    }

    pub async fn run(
        &self,
        request: ClearArchivesOperationRequest,
    ) -> Result<ClearArchivesOperationResult> {
        let mut result = ClearArchivesOperationResult::default();
        let deals = self.deal_store.list_by_state(&DealState::Success)?;

        for deal in deals {
            result.deals += 1;
            let file_name = archive_file_name(&deal.commp);

            for dir in &request.archive_dirs {
                let path = dir.join(&file_name);
                match tokio::fs::try_exists(&path).await {
                    Ok(true) => {}
                    Ok(false) => continue,
                    Err(error) => {
                        result.errors += 1;
                        tracing::warn!("Failed to check {}: {}", path.display(), error);
                        continue;
                    }
                }
                result.found += 1;

                if !request.really_delete {
                    tracing::info!("Would delete {}", path.display());
                    continue;
                }

                match tokio::fs::remove_file(&path).await {
                    Ok(()) => {
                        result.deleted += 1;
                        tracing::info!("Deleted {}", path.display());
                    }
                    Err(error) => {
                        result.errors += 1;
                        tracing::warn!("Failed to delete {}: {}", path.display(), error);
                    }
                }
            }
        }

        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::DealRecord;
    use chrono::Utc;

    fn deal(uuid: &str, commp: &str, status: DealState) -> DealRecord {
        let now = Utc::now();
        DealRecord {
            uuid: uuid.to_string(),
            storage_provider: "f01000".to_string(),
            client_wallet: "f1wallet".to_string(),
            payload_cid: "bafkreix".to_string(),
            commp: commp.to_string(),
            start_epoch: 1,
            end_epoch: 2,
            provider_collateral: 0.0,
            status,
            created_at: now,
            updated_at: now,
        }
    }

    #[tokio::test]
    async fn test_clear_only_successful_deals() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(DealStore::open(dir.path().join("piecemill.db")).unwrap());
        let cars = dir.path().join("cars");
        std::fs::create_dir_all(&cars).unwrap();
        std::fs::write(cars.join("baga-done.tar"), b"x").unwrap();
        std::fs::write(cars.join("baga-live.tar"), b"x").unwrap();

        store.insert_deal(&deal("u-1", "baga-done", DealState::Success)).unwrap();
        store.insert_deal(&deal("u-2", "baga-live", DealState::Sealing)).unwrap();
        store.insert_deal(&deal("u-3", "baga-gone", DealState::Success)).unwrap();

        let operation = ClearArchivesOperation::new(store);

        let dry = operation
            .run(ClearArchivesOperationRequest {
                archive_dirs: vec![cars.clone()],
                really_delete: false,
            })
            .await
            .unwrap();
        assert_eq!(dry.deals, 2);
        assert_eq!(dry.found, 1);
        assert_eq!(dry.deleted, 0);
        assert!(cars.join("baga-done.tar").exists());

        let real = operation
            .run(ClearArchivesOperationRequest {
                archive_dirs: vec![cars.clone()],
                really_delete: true,
            })
            .await
            .unwrap();
        assert_eq!(real.deleted, 1);
        assert!(!cars.join("baga-done.tar").exists());
        assert!(cars.join("baga-live.tar").exists());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_unreadable_location_counts_as_error() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(DealStore::open(dir.path().join("piecemill.db")).unwrap());
        store.insert_deal(&deal("u-1", "baga-done", DealState::Success)).unwrap();

        // a regular file where a directory is expected cannot be searched
        let not_a_dir = dir.path().join("cars");
        std::fs::write(&not_a_dir, b"x").unwrap();

        let result = ClearArchivesOperation::new(store)
            .run(ClearArchivesOperationRequest {
                archive_dirs: vec![not_a_dir],
                really_delete: true,
            })
            .await
            .unwrap();
        assert_eq!(result.found, 0);
        assert_eq!(result.errors, 1);
    }
}

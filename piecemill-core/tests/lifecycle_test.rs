use piecemill_core::operations::{
    ClearArchivesOperation, ClearArchivesOperationRequest, DealSelection,
    GenerateArchiveOperation, GenerateArchiveOperationOutcome, GenerateArchiveOperationRequest,
    ImportDealsOperation, ImportDealsOperationRequest, ParseFailurePolicy, PollDealsOperation,
    PollDealsOperationRequest, RegenerateArchivesOperation, RegenerateArchivesOperationRequest,
    RegenerateArchivesOperationResult, RegenerateSelection, SendDealsOperation,
    SendDealsOperationRequest,
};
use piecemill_core::{
    ContentRecord, ContentStore, DealSendStatus, DealState, DealStore, MemoryDealTool,
    RegenerateStatus, SourceFile, StatusSignals, index_directory,
};
use rand::SeedableRng;
use rand::rngs::StdRng;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

struct Harness {
    dir: tempfile::TempDir,
    content_store: Arc<ContentStore>,
    deal_store: Arc<DealStore>,
    tool: MemoryDealTool,
}

impl Harness {
    fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let db = dir.path().join("piecemill.db");
        let content_store = Arc::new(ContentStore::open(&db).unwrap());
        let deal_store = Arc::new(DealStore::open(&db).unwrap());
        Self {
            dir,
            content_store,
            deal_store,
            tool: MemoryDealTool::new(),
        }
    }

    fn data_dir(&self) -> PathBuf {
        self.dir.path().join("data")
    }

    fn out_dir(&self) -> PathBuf {
        self.dir.path().join("out")
    }

    fn write_dataset(&self) -> Vec<SourceFile> {
        let root = self.data_dir();
        for index in 0..6u8 {
            let path = root.join(format!("shard-{}", index % 2)).join(format!("{}.bin", index));
            std::fs::create_dir_all(path.parent().unwrap()).unwrap();
            let bytes: Vec<u8> = (0..(1500 + index as usize * 700))
                .map(|i| (i as u8).wrapping_mul(31).wrapping_add(index))
                .collect();
            std::fs::write(path, bytes).unwrap();
        }
        index_directory(&root).unwrap()
    }

    async fn generate(&self, universe: &[SourceFile], seed: u64) -> ContentRecord {
        let outcome = GenerateArchiveOperation::new(self.content_store.clone())
            .run(
                GenerateArchiveOperationRequest {
                    universe: universe.to_vec(),
                    target_archive_size: 9000,
                    target_piece_size: 0,
                    parent_root: self.data_dir(),
                    scratch_dir: None,
                    out_dir: self.out_dir(),
                },
                &mut StdRng::seed_from_u64(seed),
            )
            .await
            .unwrap();
        match outcome {
            GenerateArchiveOperationOutcome::Created(record) => record,
            GenerateArchiveOperationOutcome::Duplicate(record) => record,
        }
    }

    fn send_request(&self, selection: DealSelection) -> SendDealsOperationRequest {
        SendDealsOperationRequest {
            selection,
            provider: "f01000".to_string(),
            wallet: "f1client".to_string(),
            duration_epochs: 1_468_800,
            start_epoch_offset_days: 3,
            limit: 0,
            dry_run: false,
            inter_item_delay: Duration::ZERO,
            parse_failure_policy: ParseFailurePolicy::LeavePending,
        }
    }

    fn send_operation(&self) -> SendDealsOperation {
        SendDealsOperation::new(
            self.content_store.clone(),
            self.deal_store.clone(),
            Arc::new(self.tool.clone()),
        )
    }
}

async fn regenerate_record(harness: &Harness, record_id: &str) -> RegenerateArchivesOperationResult {
    RegenerateArchivesOperation::new(harness.content_store.clone())
        .run(RegenerateArchivesOperationRequest {
            selection: RegenerateSelection::RecordId(record_id.to_string()),
            parent_root: harness.data_dir(),
            scratch_dir: None,
            out_dir: harness.dir.path().join("regen"),
        })
        .await
        .unwrap()
}

fn corrupt(path: &Path) {
    let mut bytes = std::fs::read(path).unwrap();
    bytes[0] ^= 0x5a;
    std::fs::write(path, bytes).unwrap();
}

#[tokio::test]
async fn test_full_deal_lifecycle() {
    let harness = Harness::new();
    let universe = harness.write_dataset();

    let mut records = Vec::new();
    for seed in 0..5 {
        let record = harness.generate(&universe, 100 + seed).await;
        if !records.iter().any(|r: &ContentRecord| r.id == record.id) {
            records.push(record);
        }
    }
    assert!(records.len() >= 2);

    // Regenerate everything from the manifests into a second directory.
    let regen_dir = harness.dir.path().join("regen");
    let regenerated = RegenerateArchivesOperation::new(harness.content_store.clone())
        .run(RegenerateArchivesOperationRequest {
            selection: RegenerateSelection::PieceCids(
                records.iter().map(|record| record.commp.clone()).collect(),
            ),
            parent_root: harness.data_dir(),
            scratch_dir: Some(harness.dir.path().join("scratch")),
            out_dir: regen_dir.clone(),
        })
        .await
        .unwrap();
    assert_eq!(regenerated.succeeded, records.len());
    for record in &records {
        let original = std::fs::read(&record.file_path).unwrap();
        let rebuilt = std::fs::read(regen_dir.join(format!("{}.tar", record.commp))).unwrap();
        assert_eq!(original, rebuilt);
    }

    let sent = harness
        .send_operation()
        .run(harness.send_request(DealSelection::Pending))
        .await
        .unwrap();
    assert_eq!(sent.succeeded, records.len());

    let imported = ImportDealsOperation::new(
        harness.content_store.clone(),
        harness.deal_store.clone(),
        Arc::new(harness.tool.clone()),
    )
    .run(ImportDealsOperationRequest {
        archive_dirs: vec![regen_dir.clone()],
        require_regenerated: true,
        inter_item_delay: Duration::ZERO,
    })
    .await
    .unwrap();
    assert_eq!(imported.imported, records.len());

    let deals = harness.deal_store.list_deals().unwrap();
    harness.tool.set_status(&deals[0].uuid, "deal status: Proving").await;
    let poll = PollDealsOperation::new(harness.deal_store.clone(), Arc::new(harness.tool.clone()));
    let polled = poll
        .run(PollDealsOperationRequest {
            signals: StatusSignals::default(),
            inter_item_delay: Duration::ZERO,
        })
        .await
        .unwrap();
    assert_eq!(polled.succeeded, 1);
    assert_eq!(polled.unchanged, records.len() - 1);

    let cleared = ClearArchivesOperation::new(harness.deal_store.clone())
        .run(ClearArchivesOperationRequest {
            archive_dirs: vec![regen_dir.clone()],
            really_delete: true,
        })
        .await
        .unwrap();
    assert_eq!(cleared.deleted, 1);
    assert!(!regen_dir.join(format!("{}.tar", deals[0].commp)).exists());
}

#[tokio::test]
async fn test_regeneration_detects_changes_and_missing_files() {
    let harness = Harness::new();
    let universe = harness.write_dataset();
    let record = harness.generate(&universe, 7).await;
    let first_source = harness
        .data_dir()
        .join(&record.manifest[0].relative_path);
    corrupt(&first_source);

    let tampered = regenerate_record(&harness, &record.id).await;
    assert_eq!(tampered.failed, 1);
    assert!(tampered.items[0].error.as_deref().unwrap().contains("mismatch"));
    let stored = harness.content_store.get_record(&record.id).unwrap().unwrap();
    assert_eq!(stored.regenerate_status, RegenerateStatus::Failed);

    corrupt(&first_source);
    let restored = regenerate_record(&harness, &record.id).await;
    assert_eq!(restored.succeeded, 1);

    std::fs::remove_file(&first_source).unwrap();
    let missing = regenerate_record(&harness, &record.id).await;
    assert_eq!(missing.failed, 1);
    assert!(missing.items[0].error.as_deref().unwrap().contains("not found"));
    let stored = harness.content_store.get_record(&record.id).unwrap().unwrap();
    assert_eq!(stored.regenerate_status, RegenerateStatus::Success);
}

#[tokio::test]
async fn test_batch_survives_individual_failures() {
    let harness = Harness::new();
    let universe = harness.write_dataset();

    let mut records = Vec::new();
    let mut seed = 0;
    while records.len() < 5 {
        let record = harness.generate(&universe, 500 + seed).await;
        seed += 1;
        if !records.iter().any(|r: &ContentRecord| r.id == record.id) {
            records.push(record);
        }
    }

    let pending = harness.content_store.list_pending_deals(None).unwrap();
    assert_eq!(pending.len(), 5);
    harness.tool.fail_proposal(&pending[1].commp, "provider offline").await;
    harness.tool.fail_proposal(&pending[4].commp, "provider offline").await;

    let result = harness
        .send_operation()
        .run(harness.send_request(DealSelection::Pending))
        .await
        .unwrap();
    assert_eq!(result.attempted, 5);
    assert_eq!(result.succeeded, 3);
    assert_eq!(result.failed, 2);

    for (index, record) in pending.iter().enumerate() {
        let stored = harness.content_store.get_record(&record.id).unwrap().unwrap();
        if index == 1 || index == 4 {
            assert_eq!(stored.deal_status, DealSendStatus::Failed);
            assert!(stored.deal_id.is_none());
        } else {
            assert_eq!(stored.deal_status, DealSendStatus::Success);
            let deal = harness
                .deal_store
                .get_deal(stored.deal_id.as_deref().unwrap())
                .unwrap()
                .unwrap();
            assert_eq!(deal.status, DealState::Proposed);
            assert_eq!(deal.commp, record.commp);
        }
    }

    // explicit retry of the failed ones
    let retry = harness
        .send_operation()
        .run(harness.send_request(DealSelection::PieceCids(vec![
            pending[1].commp.clone(),
            pending[4].commp.clone(),
        ])))
        .await
        .unwrap();
    assert_eq!(retry.succeeded, 2);
    assert_eq!(harness.deal_store.list_deals().unwrap().len(), 5);
}

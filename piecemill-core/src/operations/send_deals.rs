use crate::{
    ContentRecord, ContentStore, DealRecord, DealSendStatus, DealState, DealStore, DealTool,
    ProposeDealRequest, ProposedDeal, Result, chain, parse_deal_response,
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

/// What happens to a record whose proposal response cannot be used.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParseFailurePolicy {
    /// Keep the record pending so the next run proposes it again.
    #[default]
    LeavePending,
    MarkFailed,
}

#[derive(Debug, Clone)]
pub enum DealSelection {
    /// Every pending record, oldest first.
    Pending,
    PieceCids(Vec<String>),
}

#[derive(Debug, Clone)]
pub struct SendDealsOperationRequest {
    pub selection: DealSelection,
    pub provider: String,
    pub wallet: String,
    pub duration_epochs: i64,
    pub start_epoch_offset_days: i64,
    /// Zero means no limit.
    pub limit: usize,
    pub dry_run: bool,
    pub inter_item_delay: Duration,
    pub parse_failure_policy: ParseFailurePolicy,
}

#[derive(Debug, Clone, Default)]
pub struct SendDealsOperationResult {
    /// Proposals logged but not sent by a dry run.
    pub planned: usize,
    pub attempted: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub warnings: Vec<String>,
}

pub struct SendDealsOperation {
    content_store: Arc<ContentStore>,
    deal_store: Arc<DealStore>,
    deal_tool: Arc<dyn DealTool>,
}

impl SendDealsOperation {
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

    pub async fn run(&self, request: SendDealsOperationRequest) -> Result<SendDealsOperationResult> {
        let mut result = SendDealsOperationResult::default();

        let mut records = match &request.selection {
            DealSelection::Pending => self.content_store.list_pending_deals(None)?,
            DealSelection::PieceCids(cids) => self.lookup_records(cids, &mut result.warnings)?,
        };
        if request.limit > 0 && request.limit < records.len() {
            records.truncate(request.limit);
        }

        let start_epoch =
            chain::start_epoch(chain::current_height(), request.start_epoch_offset_days);
        tracing::info!(
            "Sending {} deals to {} starting at epoch {}",
            records.len(),
            request.provider,
            start_epoch
        );

        let total = records.len();
        for (index, record) in records.into_iter().enumerate() {
            let proposal = ProposeDealRequest {
                provider: request.provider.clone(),
                wallet: request.wallet.clone(),
                commp: record.commp.clone(),
                piece_size: record.piece_size,
                payload_cid: record.payload_cid.clone(),
                verified: true,
                duration_epochs: request.duration_epochs,
                storage_price: 0,
                start_epoch,
            };
            if request.dry_run {
                tracing::info!(?proposal, "Dry run, not proposing deal");
                result.planned += 1;
                continue;
            }
            result.attempted += 1;

            if record.deal_status == DealSendStatus::Failed {
                tracing::info!("Retrying failed record {}", record.commp);
                self.content_store.reset_deal_status(&record.id)?;
            }

            let response = match self.deal_tool.propose_deal(&proposal).await {
                Ok(response) => response,
                Err(error) => {
                    tracing::warn!("Deal proposal for {} failed: {}", record.commp, error);
                    self.content_store
                        .mark_deal_failed(&record.id, &error.to_string())?;
                    result.failed += 1;
                    continue;
                }
            };

            let deal = match accept_response(&record, &response) {
                Ok(deal) => deal,
                Err(reason) => {
                    tracing::warn!("Unusable deal response for {}: {}", record.commp, reason);
                    match request.parse_failure_policy {
                        ParseFailurePolicy::LeavePending => {
                            self.content_store.touch_deal_attempt(&record.id, &reason)?
                        }
                        ParseFailurePolicy::MarkFailed => {
                            self.content_store.mark_deal_failed(&record.id, &reason)?
                        }
                    }
                    result.failed += 1;
                    continue;
                }
            };

            let now = Utc::now();
            let deal_record = DealRecord {
                uuid: deal.deal_uuid.clone(),
                storage_provider: non_empty_or(deal.storage_provider, &request.provider),
                client_wallet: non_empty_or(deal.client_wallet, &request.wallet),
                payload_cid: non_empty_or(deal.payload_cid, &record.payload_cid),
                commp: record.commp.clone(),
                start_epoch: deal.start_epoch,
                end_epoch: deal.end_epoch,
                provider_collateral: deal.provider_collateral,
                status: DealState::Proposed,
                created_at: now,
                updated_at: now,
            };
            if !self.deal_store.insert_deal(&deal_record)? {
                tracing::warn!("Deal {} was already recorded", deal_record.uuid);
            }
            self.content_store
                .mark_deal_sent(&record.id, &deal_record.uuid)?;
            result.succeeded += 1;

            tracing::info!("Proposed deal {} for {}", deal_record.uuid, record.commp);

            if index + 1 < total && !request.inter_item_delay.is_zero() {
                tokio::time::sleep(request.inter_item_delay).await;
            }
        }

        tracing::info!(
            "Deal sending finished: {} planned, {} attempted, {} succeeded, {} failed",
            result.planned,
            result.attempted,
            result.succeeded,
            result.failed
        );

        Ok(result)
    }

    fn lookup_records(
        &self,
        cids: &[String],
        warnings: &mut Vec<String>,
    ) -> Result<Vec<ContentRecord>> {
        let mut records = Vec::with_capacity(cids.len());
        let mut seen = HashSet::with_capacity(cids.len());
        for cid in cids {
            if !seen.insert(cid.as_str()) {
                tracing::warn!("Piece CID {} listed more than once, proposing it once", cid);
                warnings.push(format!("duplicate piece CID: {}", cid));
                continue;
            }
            match self.content_store.get_by_commp(cid)? {
                Some(record) if record.deal_status == DealSendStatus::Success => {
                    let deal_id = record.deal_id.unwrap_or_default();
                    tracing::warn!("{} already has deal {}, skipping", cid, deal_id);
                    warnings.push(format!("{} already has deal {}", cid, deal_id));
                }
                Some(record) => records.push(record),
                None => {
                    tracing::warn!("No content record for piece CID {}", cid);
                    warnings.push(format!("unknown piece CID: {}", cid));
                }
            }
        }
        Ok(records)
    }
}

fn accept_response(
    record: &ContentRecord,
    response: &str,
) -> std::result::Result<ProposedDeal, String> {
    let deal = parse_deal_response(response).map_err(|error| error.to_string())?;
    if !deal.commp.is_empty() && deal.commp != record.commp {
        return Err(format!(
            "response names piece {} but {} was proposed",
            deal.commp, record.commp
        ));
    }
    Ok(deal)
}

fn non_empty_or(value: String, fallback: &str) -> String {
    if value.is_empty() {
        fallback.to_string()
    } else {
        value
    }
}

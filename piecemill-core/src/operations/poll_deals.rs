use crate::{DealState, DealStatusQuery, DealStore, DealTool, Result, StatusSignal, StatusSignals};
use std::sync::Arc;
use std::time::Duration;

pub struct PollDealsOperation {
    deal_store: Arc<DealStore>,
    deal_tool: Arc<dyn DealTool>,
}

#[derive(Debug, Clone, Default)]
pub struct PollDealsOperationRequest {
    pub signals: StatusSignals,
    pub inter_item_delay: Duration,
}

#[derive(Debug, Clone, Default)]
pub struct PollDealsOperationResult {
    pub checked: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub sealing: usize,
    pub unchanged: usize,
    pub errors: usize,
}

impl PollDealsOperation {
    pub fn new(deal_store: Arc<DealStore>, deal_tool: Arc<dyn DealTool>) -> Self {
        Self {
            deal_store,
            deal_tool,
        }
    }

    /// Query every imported or sealing deal once and move it forward when
    /// its status text carries a known signal.
    pub async fn run(&self, request: PollDealsOperationRequest) -> Result<PollDealsOperationResult> {
        let mut result = PollDealsOperationResult::default();
        let deals = self
            .deal_store
            .list_by_states(&[DealState::Imported, DealState::Sealing])?;
        let total = deals.len();

        for (index, deal) in deals.into_iter().enumerate() {
            result.checked += 1;

            let query = DealStatusQuery {
                provider: deal.storage_provider.clone(),
                deal_uuid: deal.uuid.clone(),
                wallet: deal.client_wallet.clone(),
            };

            match self.deal_tool.query_deal_status(&query).await {
                Ok(text) => {
                    let next = match request.signals.classify(&text) {
                        StatusSignal::Success => Some(DealState::Success),
                        StatusSignal::Error => Some(DealState::Failed),
                        StatusSignal::Sealing => Some(DealState::Sealing),
                        StatusSignal::InProgress => None,
                    };

                    let advanced = match &next {
                        Some(next) => {
                            self.deal_store
                                .advance_state(&deal.uuid, &deal.status, next)?
                        }
                        None => false,
                    };

                    match next {
                        Some(DealState::Success) if advanced => result.succeeded += 1,
                        Some(DealState::Failed) if advanced => result.failed += 1,
                        Some(DealState::Sealing) if advanced => result.sealing += 1,
                        _ => result.unchanged += 1,
                    }

                    if advanced {
                        tracing::info!(
                            "Deal {} moved from {} to {}",
                            deal.uuid,
                            deal.status,
                            next.as_ref().map(DealState::as_str).unwrap_or_default()
                        );
                    }
                }
                Err(error) => {
                    tracing::warn!("Status query for deal {} failed: {}", deal.uuid, error);
                    result.errors += 1;
                }
            }

            if index + 1 < total && !request.inter_item_delay.is_zero() {
                tokio::time::sleep(request.inter_item_delay).await;
            }
        }

        tracing::info!(
            "Polled {} deals: {} succeeded, {} failed, {} sealing, {} unchanged, {} errors",
            result.checked,
            result.succeeded,
            result.failed,
            result.sealing,
            result.unchanged,
            result.errors
        );

        Ok(result)
    }
}

use super::{DealStatusQuery, DealTool, ProposeDealRequest};
use crate::error::{PieceError, Result};
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Mutex;

/// A call received by [`MemoryDealTool`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DealToolCall {
    Propose(ProposeDealRequest),
    QueryStatus(DealStatusQuery),
    Import {
        deal_uuid: String,
        archive_path: PathBuf,
    },
}

type Reply = std::result::Result<String, String>;

#[derive(Default)]
struct Script {
    proposals: HashMap<String, VecDeque<Reply>>,
    statuses: HashMap<String, Reply>,
    import_failures: HashMap<String, String>,
    calls: Vec<DealToolCall>,
    issued: u64,
}

/// In-memory deal tool with scripted replies.
///
/// Unscripted proposals succeed with a well-formed response echoing the
/// request, unscripted status queries report a deal still in transfer and
/// unscripted imports succeed.
#[derive(Clone, Default)]
pub struct MemoryDealTool {
    script: Arc<Mutex<Script>>,
}

impl MemoryDealTool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a raw proposal response for `commp`.
    pub async fn respond_to_proposal(&self, commp: &str, text: &str) {
        self.push_proposal(commp, Ok(text.to_string())).await;
    }

    /// Queue an invocation failure for the next proposal of `commp`.
    pub async fn fail_proposal(&self, commp: &str, message: &str) {
        self.push_proposal(commp, Err(message.to_string())).await;
    }

    async fn push_proposal(&self, commp: &str, reply: Reply) {
        let mut script = self.script.lock().await;
        script
            .proposals
            .entry(commp.to_string())
            .or_default()
            .push_back(reply);
    }

    /// Set the status text reported for `deal_uuid` from now on.
    pub async fn set_status(&self, deal_uuid: &str, text: &str) {
        let mut script = self.script.lock().await;
        script
            .statuses
            .insert(deal_uuid.to_string(), Ok(text.to_string()));
    }

    pub async fn fail_status(&self, deal_uuid: &str, message: &str) {
        let mut script = self.script.lock().await;
        script
            .statuses
            .insert(deal_uuid.to_string(), Err(message.to_string()));
    }

    pub async fn fail_import(&self, deal_uuid: &str, message: &str) {
        let mut script = self.script.lock().await;
        script
            .import_failures
            .insert(deal_uuid.to_string(), message.to_string());
    }

    pub async fn calls(&self) -> Vec<DealToolCall> {
        self.script.lock().await.calls.clone()
    }

    pub async fn proposal_count(&self) -> usize {
        self.script
            .lock()
            .await
            .calls
            .iter()
            .filter(|call| matches!(call, DealToolCall::Propose(_)))
            .count()
    }
}

fn echo_proposal(request: &ProposeDealRequest, sequence: u64) -> String {
    format!(
        "sent deal proposal\n\
         deal uuid: memory-deal-{sequence:04}\n\
         storage provider: {provider}\n\
         client wallet: {wallet}\n\
         payload cid: {payload_cid}\n\
         commp: {commp}\n\
         start epoch: {start}\n\
         end epoch: {end}\n\
         provider collateral: 0 FIL\n",
        provider = request.provider,
        wallet = request.wallet,
        payload_cid = request.payload_cid,
        commp = request.commp,
        start = request.start_epoch,
        end = request.start_epoch + request.duration_epochs,
    )
}

#[async_trait]
impl DealTool for MemoryDealTool {
    async fn propose_deal(&self, request: &ProposeDealRequest) -> Result<String> {
        let mut script = self.script.lock().await;
        script.calls.push(DealToolCall::Propose(request.clone()));

        let scripted = script
            .proposals
            .get_mut(&request.commp)
            .and_then(|queue| queue.pop_front());
        match scripted {
            Some(reply) => reply.map_err(PieceError::DealTool),
            None => {
                script.issued += 1;
                Ok(echo_proposal(request, script.issued))
            }
        }
    }

    async fn query_deal_status(&self, query: &DealStatusQuery) -> Result<String> {
        let mut script = self.script.lock().await;
        script.calls.push(DealToolCall::QueryStatus(query.clone()));

        match script.statuses.get(&query.deal_uuid) {
            Some(reply) => reply.clone().map_err(PieceError::DealTool),
            None => Ok(format!(
                "deal uuid: {}\ndeal status: Transferred\n",
                query.deal_uuid
            )),
        }
    }

    async fn import_deal(&self, deal_uuid: &str, archive_path: &Path) -> Result<()> {
        let mut script = self.script.lock().await;
        script.calls.push(DealToolCall::Import {
            deal_uuid: deal_uuid.to_string(),
            archive_path: archive_path.to_path_buf(),
        });

        match script.import_failures.get(deal_uuid) {
            Some(message) => Err(PieceError::DealTool(message.clone())),
            None => Ok(()),
        }
    }
}

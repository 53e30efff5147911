//! Port to the external deal-making tools.
//!
//! Every tool call returns the tool's raw textual output; interpreting it is
//! left to [`response`].

pub mod memory;
pub mod process;
pub mod response;

pub use memory::{DealToolCall, MemoryDealTool};
pub use process::{BoostDealTool, BoostPaths, ProcessRunner};
pub use response::{ProposedDeal, StatusSignal, StatusSignals, parse_deal_response};

use crate::error::Result;
use async_trait::async_trait;
use std::path::Path;

/// Parameters of one offline deal proposal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProposeDealRequest {
    pub provider: String,
    pub wallet: String,
    pub commp: String,
    pub piece_size: u64,
    pub payload_cid: String,
    pub verified: bool,
    pub duration_epochs: i64,
    pub storage_price: u64,
    pub start_epoch: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DealStatusQuery {
    pub provider: String,
    pub deal_uuid: String,
    pub wallet: String,
}

#[async_trait]
pub trait DealTool: Send + Sync {
    /// Propose a deal and return the tool's response text.
    async fn propose_deal(&self, request: &ProposeDealRequest) -> Result<String>;

    /// Query a deal's status and return the tool's response text.
    async fn query_deal_status(&self, query: &DealStatusQuery) -> Result<String>;

    /// Hand the archive for a proposed deal to the provider.
    async fn import_deal(&self, deal_uuid: &str, archive_path: &Path) -> Result<()>;
}

use super::{DealStatusQuery, DealTool, ProposeDealRequest};
use crate::error::{PieceError, Result};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;

/// Runs external programs and captures their output.
#[derive(Debug, Clone, Default)]
pub struct ProcessRunner {
    timeout: Option<Duration>,
}

impl ProcessRunner {
    pub fn new(timeout: Option<Duration>) -> Self {
        Self { timeout }
    }

    /// Run `program` with `args`, returning stdout on a zero exit status.
    ///
    /// A timed-out child is killed.
    pub async fn invoke(
        &self,
        env_overrides: &[(String, String)],
        program: &Path,
        args: &[String],
    ) -> Result<String> {
        let mut command = Command::new(program);
        command
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        for (key, value) in env_overrides {
            command.env(key, value);
        }

        tracing::debug!(program = %program.display(), ?args, "Invoking external tool");

        let pending = command.output();
        let output = match self.timeout {
            Some(limit) => tokio::time::timeout(limit, pending).await.map_err(|_| {
                PieceError::DealTool(format!(
                    "{} timed out after {}s",
                    program.display(),
                    limit.as_secs()
                ))
            })?,
            None => pending.await,
        }
        .map_err(|error| {
            PieceError::DealTool(format!("failed to start {}: {}", program.display(), error))
        })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(PieceError::DealTool(format!(
                "{} exited with {}: {}",
                program.display(),
                output.status,
                stderr.trim()
            )));
        }

        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

#[derive(Debug, Clone)]
pub struct BoostPaths {
    pub boost: PathBuf,
    pub boostd: PathBuf,
    /// Value of `FULLNODE_API_INFO` passed to the client tool.
    pub api_info: Option<String>,
}

/// Deal tool backed by the `boost` client and `boostd` provider binaries.
pub struct BoostDealTool {
    paths: BoostPaths,
    runner: ProcessRunner,
}

impl BoostDealTool {
    pub fn new(paths: BoostPaths, runner: ProcessRunner) -> Self {
        Self { paths, runner }
    }

    fn client_env(&self) -> Vec<(String, String)> {
        self.paths
            .api_info
            .iter()
            .map(|info| ("FULLNODE_API_INFO".to_string(), info.clone()))
            .collect()
    }
}

pub(crate) fn propose_args(request: &ProposeDealRequest) -> Vec<String> {
    vec![
        "offline-deal".to_string(),
        format!("--provider={}", request.provider),
        format!("--commp={}", request.commp),
        format!("--piece-size={}", request.piece_size),
        format!("--wallet={}", request.wallet),
        format!("--payload-cid={}", request.payload_cid),
        format!("--verified={}", request.verified),
        format!("--duration={}", request.duration_epochs),
        format!("--storage-price={}", request.storage_price),
        format!("--start-epoch={}", request.start_epoch),
    ]
}

pub(crate) fn status_args(query: &DealStatusQuery) -> Vec<String> {
    vec![
        "deal-status".to_string(),
        format!("--provider={}", query.provider),
        format!("--deal-uuid={}", query.deal_uuid),
        format!("--wallet={}", query.wallet),
    ]
}

pub(crate) fn import_args(deal_uuid: &str, archive_path: &Path) -> Vec<String> {
    vec![
        "import-data".to_string(),
        deal_uuid.to_string(),
        archive_path.to_string_lossy().into_owned(),
    ]
}

#[async_trait]
impl DealTool for BoostDealTool {
    async fn propose_deal(&self, request: &ProposeDealRequest) -> Result<String> {
        self.runner
            .invoke(&self.client_env(), &self.paths.boost, &propose_args(request))
            .await
    }

    async fn query_deal_status(&self, query: &DealStatusQuery) -> Result<String> {
        self.runner
            .invoke(&self.client_env(), &self.paths.boost, &status_args(query))
            .await
    }

    async fn import_deal(&self, deal_uuid: &str, archive_path: &Path) -> Result<()> {
        self.runner
            .invoke(&[], &self.paths.boostd, &import_args(deal_uuid, archive_path))
            .await?;
        Ok(())
    }
}

mod config;
use clap::{Parser, Subcommand};
use config::Config;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use chrono::{DateTime, NaiveDateTime, Utc};
use piecemill_core::operations::{
    ClearArchivesOperation, ClearArchivesOperationRequest, DealSelection,
    GenerateArchiveOperation, GenerateArchiveOperationOutcome, GenerateArchiveOperationRequest,
    ImportDealsOperation, ImportDealsOperationRequest, PollDealsOperation,
    PollDealsOperationRequest, RegenerateArchivesOperation, RegenerateArchivesOperationRequest,
    RegenerateSelection, SendDealsOperation, SendDealsOperationRequest,
};
use piecemill_core::{
    BoostDealTool, ContentStore, DealSendStatus, DealStore, DealTool, PieceError, Result,
    SourceFile, index_directory, parse_piece_cid,
};
use rand::SeedableRng;
use rand::rngs::StdRng;
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

#[derive(Parser)]
#[command(name = "piecemill")]
#[command(about = "Build content-addressed deal archives and drive their storage deals")]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, global = true, default_value = "piecemill.yaml")]
    config: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Index a directory into a JSON file list
    Index {
        dir: PathBuf,

        /// Write the list here instead of stdout
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Generate archives from random selections of an indexed file list
    Generate {
        /// JSON file list produced by `index`
        #[arg(long)]
        input: PathBuf,

        /// Directory the manifest paths are made relative to
        #[arg(long)]
        parent_root: PathBuf,

        #[arg(long)]
        out_dir: PathBuf,

        #[arg(long)]
        scratch_dir: Option<PathBuf>,

        /// Bytes of source data per archive
        #[arg(long)]
        target_size: u64,

        /// Piece size to pad to; 0 keeps the minimal size
        #[arg(long, default_value_t = 0)]
        piece_size: u64,

        /// Number of archives to generate
        #[arg(long, default_value_t = 1)]
        count: usize,
    },

    /// Rebuild archives from their manifests and verify their piece CIDs
    Regenerate {
        #[arg(long)]
        parent_root: PathBuf,

        #[arg(long)]
        out_dir: PathBuf,

        #[arg(long)]
        scratch_dir: Option<PathBuf>,

        /// Content record id
        #[arg(long, conflicts_with = "piece_cid")]
        id: Option<String>,

        /// Piece CID to regenerate, may be repeated
        #[arg(long)]
        piece_cid: Vec<String>,
    },

    /// Propose deals for pending archives
    SendDeals {
        #[arg(long)]
        provider: String,

        #[arg(long)]
        wallet: String,

        /// Chain node API, overrides the configured one
        #[arg(long)]
        api: Option<String>,

        /// Deal duration in epochs
        #[arg(long)]
        duration: Option<i64>,

        /// Days from now until the deal may start
        #[arg(long)]
        start_epoch_day: Option<i64>,

        /// Number of deals to send; 0 sends every pending archive
        #[arg(long, default_value_t = 1)]
        total: usize,

        /// Propose these piece CIDs instead of the pending queue (retries failed ones)
        #[arg(long)]
        piece_cid: Vec<String>,

        /// Actually send the deals
        #[arg(long)]
        really_do_it: bool,

        /// Loop interval in seconds; 0 runs once
        #[arg(long, default_value_t = 0)]
        interval: u64,
    },

    /// Import archives for proposed deals into the provider
    ImportDeals {
        /// Directories searched for archives, in order
        #[arg(long)]
        archive_dir: Vec<PathBuf>,

        /// Only import archives that were verified by regeneration
        #[arg(long)]
        require_regenerated: bool,

        #[arg(long, default_value_t = 0)]
        interval: u64,
    },

    /// Query the status of imported deals
    PollDeals {
        #[arg(long, default_value_t = 0)]
        interval: u64,
    },

    /// Delete local archives of deals that reached success
    ClearArchives {
        #[arg(long)]
        archive_dir: Vec<PathBuf>,

        #[arg(long)]
        really_do_it: bool,
    },

    /// Print piece CIDs filtered by deal status and deal time
    Export {
        /// pending, success or failed
        #[arg(long)]
        deal_status: Option<String>,

        /// RFC3339 or `YYYY-MM-DD HH:MM:SS` (UTC)
        #[arg(long)]
        since: Option<String>,

        #[arg(long)]
        until: Option<String>,
    },
}

#[tokio::main]
async fn main() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "piecemill=info,piecemill_core=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();

    let cfg = match Config::from_file(&cli.config) {
        Ok(c) => c,
        Err(e) => {
            tracing::error!("Failed to load config: {}", e);
            std::process::exit(1);
        }
    };

    if let Err(e) = run(cli.command, cfg).await {
        tracing::error!("Command failed: {}", e);
        std::process::exit(1);
    }
}

async fn run(command: Commands, cfg: Config) -> Result<()> {
    match command {
        Commands::Index { dir, output } => {
            let files = index_directory(&dir)?;
            let json = serde_json::to_string_pretty(&files)?;
            match output {
                Some(path) => std::fs::write(path, json)?,
                None => println!("{}", json),
            }
            Ok(())
        }

        Commands::Generate {
            input,
            parent_root,
            out_dir,
            scratch_dir,
            target_size,
            piece_size,
            count,
        } => {
            let universe: Vec<SourceFile> = serde_json::from_slice(&std::fs::read(&input)?)?;
            let operation = GenerateArchiveOperation::new(open_content_store(&cfg)?);
            let mut rng = StdRng::from_entropy();

            for index in 0..count {
                let outcome = operation
                    .run(
                        GenerateArchiveOperationRequest {
                            universe: universe.clone(),
                            target_archive_size: target_size,
                            target_piece_size: piece_size,
                            parent_root: parent_root.clone(),
                            scratch_dir: scratch_dir.clone(),
                            out_dir: out_dir.clone(),
                        },
                        &mut rng,
                    )
                    .await?;

                match outcome {
                    GenerateArchiveOperationOutcome::Created(record) => tracing::info!(
                        "[{}/{}] {} piece_size={} payload={} path={}",
                        index + 1,
                        count,
                        record.commp,
                        record.piece_size,
                        record.payload_cid,
                        record.file_path
                    ),
                    GenerateArchiveOperationOutcome::Duplicate(record) => tracing::warn!(
                        "[{}/{}] selection duplicated existing archive {}",
                        index + 1,
                        count,
                        record.commp
                    ),
                }
            }
            Ok(())
        }

        Commands::Regenerate {
            parent_root,
            out_dir,
            scratch_dir,
            id,
            piece_cid,
        } => {
            let selection = match id {
                Some(id) => RegenerateSelection::RecordId(id),
                None if !piece_cid.is_empty() => {
                    RegenerateSelection::PieceCids(checked_piece_cids(piece_cid)?)
                }
                None => {
                    return Err(PieceError::InvalidRequest(
                        "either --id or --piece-cid is required".to_string(),
                    ));
                }
            };

            let result = RegenerateArchivesOperation::new(open_content_store(&cfg)?)
                .run(RegenerateArchivesOperationRequest {
                    selection,
                    parent_root,
                    scratch_dir,
                    out_dir,
                })
                .await?;

            for warning in &result.warnings {
                tracing::warn!("{}", warning);
            }
            for item in &result.items {
                if let Some(error) = &item.error {
                    tracing::error!("{}: {}", item.commp, error);
                }
            }
            if result.failed > 0 {
                return Err(PieceError::Internal(format!(
                    "{} of {} regenerations failed",
                    result.failed, result.attempted
                )));
            }
            Ok(())
        }

        Commands::SendDeals {
            provider,
            wallet,
            api,
            duration,
            start_epoch_day,
            total,
            piece_cid,
            really_do_it,
            interval,
        } => {
            let operation = SendDealsOperation::new(
                open_content_store(&cfg)?,
                open_deal_store(&cfg)?,
                deal_tool(&cfg, api),
            );
            let selection = if piece_cid.is_empty() {
                DealSelection::Pending
            } else {
                DealSelection::PieceCids(checked_piece_cids(piece_cid)?)
            };
            let request = SendDealsOperationRequest {
                selection,
                provider,
                wallet,
                duration_epochs: duration.unwrap_or(cfg.deal.duration_epochs),
                start_epoch_offset_days: start_epoch_day
                    .unwrap_or(cfg.deal.start_epoch_offset_days),
                limit: total,
                dry_run: !really_do_it,
                inter_item_delay: Duration::from_millis(cfg.deal.delay_ms),
                parse_failure_policy: cfg.deal.parse_failure_policy,
            };

            let (operation, request) = (&operation, &request);
            repeat_every(interval, move || async move {
                let result = operation.run(request.clone()).await?;
                for warning in &result.warnings {
                    tracing::warn!("{}", warning);
                }
                Ok::<(), PieceError>(())
            })
            .await
        }

        Commands::ImportDeals {
            archive_dir,
            require_regenerated,
            interval,
        } => {
            let archive_dirs = if archive_dir.is_empty() {
                cfg.import.archive_dirs.clone()
            } else {
                archive_dir
            };
            if archive_dirs.is_empty() {
                return Err(PieceError::InvalidRequest(
                    "no archive directories given".to_string(),
                ));
            }

            let operation = ImportDealsOperation::new(
                open_content_store(&cfg)?,
                open_deal_store(&cfg)?,
                deal_tool(&cfg, None),
            );
            let request = ImportDealsOperationRequest {
                archive_dirs,
                require_regenerated,
                inter_item_delay: Duration::from_millis(cfg.import.delay_ms),
            };

            let (operation, request) = (&operation, &request);
            repeat_every(interval, move || async move {
                operation.run(request.clone()).await.map(|_| ())
            })
            .await
        }

        Commands::PollDeals { interval } => {
            let operation = PollDealsOperation::new(open_deal_store(&cfg)?, deal_tool(&cfg, None));
            let request = PollDealsOperationRequest {
                signals: cfg.poll.signals.clone(),
                inter_item_delay: Duration::from_millis(cfg.poll.delay_ms),
            };

            let (operation, request) = (&operation, &request);
            repeat_every(interval, move || async move {
                operation.run(request.clone()).await.map(|_| ())
            })
            .await
        }

        Commands::ClearArchives {
            archive_dir,
            really_do_it,
        } => {
            let archive_dirs = if archive_dir.is_empty() {
                cfg.import.archive_dirs.clone()
            } else {
                archive_dir
            };

            let result = ClearArchivesOperation::new(open_deal_store(&cfg)?)
                .run(ClearArchivesOperationRequest {
                    archive_dirs,
                    really_delete: really_do_it,
                })
                .await?;

            tracing::info!(
                "{} successful deals, {} archives found, {} deleted, {} errors",
                result.deals,
                result.found,
                result.deleted,
                result.errors
            );
            Ok(())
        }

        Commands::Export {
            deal_status,
            since,
            until,
        } => {
            let status = deal_status
                .as_deref()
                .map(str::parse::<DealSendStatus>)
                .transpose()?;
            let since = since.as_deref().map(parse_time).transpose()?;
            let until = until.as_deref().map(parse_time).transpose()?;

            let records = open_content_store(&cfg)?.list_by_deal_status(status, since, until)?;
            for record in &records {
                println!("{}", record.commp);
            }
            tracing::info!("Exported {} records", records.len());
            Ok(())
        }
    }
}

fn open_content_store(cfg: &Config) -> Result<Arc<ContentStore>> {
    Ok(Arc::new(ContentStore::open(cfg.database_path.clone())?))
}

fn open_deal_store(cfg: &Config) -> Result<Arc<DealStore>> {
    Ok(Arc::new(DealStore::open(cfg.database_path.clone())?))
}

fn deal_tool(cfg: &Config, api_override: Option<String>) -> Arc<dyn DealTool> {
    Arc::new(BoostDealTool::new(
        cfg.boost.paths(api_override),
        cfg.boost.runner(),
    ))
}

/// Run `task` once, or forever every `interval_secs` seconds when non-zero.
/// In loop mode a failed round is logged and the loop continues.
async fn repeat_every<F, Fut>(interval_secs: u64, task: F) -> Result<()>
where
    F: Fn() -> Fut,
    Fut: Future<Output = Result<()>>,
{
    if interval_secs == 0 {
        return task().await;
    }

    loop {
        if let Err(e) = task().await {
            tracing::error!("Round failed: {}", e);
        }
        tokio::time::sleep(Duration::from_secs(interval_secs)).await;
    }
}

fn checked_piece_cids(cids: Vec<String>) -> Result<Vec<String>> {
    for cid in &cids {
        parse_piece_cid(cid)
            .map_err(|e| PieceError::InvalidRequest(format!("bad piece CID '{}': {}", cid, e)))?;
    }
    Ok(cids)
}

fn parse_time(value: &str) -> Result<DateTime<Utc>> {
    if let Ok(time) = DateTime::parse_from_rfc3339(value) {
        return Ok(time.with_timezone(&Utc));
    }

    NaiveDateTime::parse_from_str(value, "%Y-%m-%d %H:%M:%S")
        .map(|naive| naive.and_utc())
        .map_err(|e| PieceError::InvalidRequest(format!("invalid time '{}': {}", value, e)))
}

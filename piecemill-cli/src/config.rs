use piecemill_core::operations::ParseFailurePolicy;
use piecemill_core::{BoostPaths, PieceError, ProcessRunner, Result, StatusSignals};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub database_path: PathBuf,
    pub boost: BoostConfig,
    pub deal: DealConfig,
    pub import: ImportConfig,
    pub poll: PollConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database_path: PathBuf::from("piecemill.db"),
            boost: BoostConfig::default(),
            deal: DealConfig::default(),
            import: ImportConfig::default(),
            poll: PollConfig::default(),
        }
    }
}

/// External deal tool locations
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BoostConfig {
    pub boost_path: PathBuf,
    pub boostd_path: PathBuf,
    /// Chain node API passed to the client as `FULLNODE_API_INFO`.
    pub api_info: Option<String>,
    /// Zero disables the timeout.
    pub timeout_secs: u64,
}

impl Default for BoostConfig {
    fn default() -> Self {
        Self {
            boost_path: PathBuf::from("boost"),
            boostd_path: PathBuf::from("boostd"),
            api_info: None,
            timeout_secs: 600,
        }
    }
}

impl BoostConfig {
    pub fn paths(&self, api_override: Option<String>) -> BoostPaths {
        BoostPaths {
            boost: self.boost_path.clone(),
            boostd: self.boostd_path.clone(),
            api_info: api_override.or_else(|| self.api_info.clone()),
        }
    }

    pub fn runner(&self) -> ProcessRunner {
        let timeout = (self.timeout_secs > 0).then(|| Duration::from_secs(self.timeout_secs));
        ProcessRunner::new(timeout)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DealConfig {
    pub delay_ms: u64,
    pub duration_epochs: i64,
    pub start_epoch_offset_days: i64,
    pub parse_failure_policy: ParseFailurePolicy,
}

impl Default for DealConfig {
    fn default() -> Self {
        Self {
            delay_ms: 1000,
            duration_epochs: 3_513_600,
            start_epoch_offset_days: 10,
            parse_failure_policy: ParseFailurePolicy::LeavePending,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ImportConfig {
    pub delay_ms: u64,
    pub archive_dirs: Vec<PathBuf>,
}

impl Default for ImportConfig {
    fn default() -> Self {
        Self {
            delay_ms: 10_000,
            archive_dirs: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PollConfig {
    pub delay_ms: u64,
    pub signals: StatusSignals,
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            delay_ms: 1000,
            signals: StatusSignals::default(),
        }
    }
}

impl Config {
    /// Load `path` if it exists, then apply `PIECEMILL_*` overrides
    /// (nested keys separated by `__`, e.g. `PIECEMILL_BOOST__API_INFO`).
    pub fn from_file(path: &str) -> Result<Self> {
        let settings = ::config::Config::builder()
            .add_source(::config::File::with_name(path).required(false))
            .add_source(
                ::config::Environment::with_prefix("PIECEMILL")
                    .prefix_separator("_")
                    .separator("__"),
            )
            .build()
            .map_err(|e| PieceError::Config(e.to_string()))?;

        let config: Config = settings
            .try_deserialize()
            .map_err(|e| PieceError::Config(e.to_string()))?;

        Ok(config)
    }
}

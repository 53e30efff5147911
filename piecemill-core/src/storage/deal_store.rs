use super::{format_timestamp, open_connection, parse_timestamp};
use crate::error::Result;
use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, Row, params};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

/// On-chain status of a deal.
///
/// Values outside the known set are kept verbatim as `Unrecognized` and are
/// never advanced.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum DealState {
    Proposed,
    Imported,
    Sealing,
    Success,
    Failed,
    Unrecognized(String),
}

impl DealState {
    pub fn as_str(&self) -> &str {
        match self {
            Self::Proposed => "proposed",
            Self::Imported => "imported",
            Self::Sealing => "sealing",
            Self::Success => "success",
            Self::Failed => "failed",
            Self::Unrecognized(value) => value,
        }
    }

    pub fn parse(value: &str) -> Self {
        match value {
            "proposed" => Self::Proposed,
            "imported" => Self::Imported,
            "sealing" => Self::Sealing,
            "success" => Self::Success,
            "failed" => Self::Failed,
            other => Self::Unrecognized(other.to_string()),
        }
    }

    fn rank(&self) -> Option<u8> {
        match self {
            Self::Proposed => Some(0),
            Self::Imported => Some(1),
            Self::Sealing => Some(2),
            Self::Success | Self::Failed => Some(3),
            Self::Unrecognized(_) => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Success | Self::Failed)
    }

    /// Whether moving from `self` to `next` goes strictly forward.
    pub fn can_advance_to(&self, next: &DealState) -> bool {
        if self.is_terminal() {
            return false;
        }
        match (self.rank(), next.rank()) {
            (Some(current), Some(next)) => next > current,
            _ => false,
        }
    }
}

impl fmt::Display for DealState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DealRecord {
    pub uuid: String,
    pub storage_provider: String,
    pub client_wallet: String,
    pub payload_cid: String,
    pub commp: String,
    pub start_epoch: i64,
    pub end_epoch: i64,
    pub provider_collateral: f64,
    pub status: DealState,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

const DEAL_COLUMNS: &str = "uuid, storage_provider, client_wallet, payload_cid, commp,
     start_epoch, end_epoch, provider_collateral, status, created_at, updated_at";

pub struct DealStore {
    db_path: PathBuf,
}

impl DealStore {
    pub fn open(db_path: impl Into<PathBuf>) -> Result<Self> {
        let store = Self {
            db_path: db_path.into(),
        };
        store.init_schema()?;
        Ok(store)
    }

    fn get_conn(&self) -> Result<Connection> {
        open_connection(&self.db_path)
    }

    fn init_schema(&self) -> Result<()> {
        let conn = self.get_conn()?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS deals (
                uuid TEXT PRIMARY KEY,
                storage_provider TEXT NOT NULL,
                client_wallet TEXT NOT NULL,
                payload_cid TEXT NOT NULL,
                commp TEXT NOT NULL,
                start_epoch INTEGER NOT NULL,
                end_epoch INTEGER NOT NULL,
                provider_collateral REAL NOT NULL,
                status TEXT NOT NULL,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )",
            [],
        )?;

        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_deals_status ON deals(status, created_at)",
            [],
        )?;

        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_deals_commp ON deals(commp)",
            [],
        )?;

        Ok(())
    }

    /// Insert a deal; returns false if a deal with this uuid already exists.
    pub fn insert_deal(&self, deal: &DealRecord) -> Result<bool> {
        let conn = self.get_conn()?;

        let inserted = conn.execute(
            "INSERT INTO deals (
                uuid, storage_provider, client_wallet, payload_cid, commp,
                start_epoch, end_epoch, provider_collateral, status, created_at, updated_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
            ON CONFLICT(uuid) DO NOTHING",
            params![
                deal.uuid,
                deal.storage_provider,
                deal.client_wallet,
                deal.payload_cid,
                deal.commp,
                deal.start_epoch,
                deal.end_epoch,
                deal.provider_collateral,
                deal.status.as_str(),
                format_timestamp(&deal.created_at),
                format_timestamp(&deal.updated_at),
            ],
        )?;

        Ok(inserted > 0)
    }

    pub fn get_deal(&self, uuid: &str) -> Result<Option<DealRecord>> {
        let conn = self.get_conn()?;
        let sql = format!("SELECT {} FROM deals WHERE uuid = ?1", DEAL_COLUMNS);
        let deal = conn.query_row(&sql, [uuid], row_to_deal).optional()?;
        Ok(deal)
    }

    pub fn list_deals(&self) -> Result<Vec<DealRecord>> {
        let conn = self.get_conn()?;
        let sql = format!(
            "SELECT {} FROM deals ORDER BY created_at ASC, uuid ASC",
            DEAL_COLUMNS
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map([], row_to_deal)?;

        let mut deals = Vec::new();
        for row in rows {
            deals.push(row?);
        }
        Ok(deals)
    }

    pub fn list_by_state(&self, state: &DealState) -> Result<Vec<DealRecord>> {
        self.list_by_states(std::slice::from_ref(state))
    }

    /// Deals in any of `states`, oldest first
    pub fn list_by_states(&self, states: &[DealState]) -> Result<Vec<DealRecord>> {
        if states.is_empty() {
            return Ok(Vec::new());
        }

        let conn = self.get_conn()?;
        let placeholders = (1..=states.len())
            .map(|index| format!("?{}", index))
            .collect::<Vec<_>>()
            .join(", ");
        let sql = format!(
            "SELECT {} FROM deals WHERE status IN ({}) ORDER BY created_at ASC, uuid ASC",
            DEAL_COLUMNS, placeholders
        );

        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(
            rusqlite::params_from_iter(states.iter().map(|state| state.as_str())),
            row_to_deal,
        )?;

        let mut deals = Vec::new();
        for row in rows {
            deals.push(row?);
        }
        Ok(deals)
    }

    /// Move a deal forward from `current` to `next`.
    ///
    /// Returns false when the transition would not go forward or the stored
    /// status no longer equals `current`.
    pub fn advance_state(&self, uuid: &str, current: &DealState, next: &DealState) -> Result<bool> {
        if !current.can_advance_to(next) {
            return Ok(false);
        }

        let conn = self.get_conn()?;
        let now = format_timestamp(&Utc::now());

        let affected = conn.execute(
            "UPDATE deals SET status = ?1, updated_at = ?2 WHERE uuid = ?3 AND status = ?4",
            params![next.as_str(), now, uuid, current.as_str()],
        )?;

        Ok(affected > 0)
    }
}

fn row_to_deal(row: &Row<'_>) -> rusqlite::Result<DealRecord> {
    let status: String = row.get(8)?;
    let created_at: String = row.get(9)?;
    let updated_at: String = row.get(10)?;

    Ok(DealRecord {
        uuid: row.get(0)?,
        storage_provider: row.get(1)?,
        client_wallet: row.get(2)?,
        payload_cid: row.get(3)?,
        commp: row.get(4)?,
        start_epoch: row.get(5)?,
        end_epoch: row.get(6)?,
        provider_collateral: row.get(7)?,
        status: DealState::parse(&status),
        created_at: parse_timestamp(9, &created_at)?,
        updated_at: parse_timestamp(10, &updated_at)?,
    })
}

use super::{conversion_error, format_timestamp, open_connection, parse_timestamp};
use crate::archive::ManifestEntry;
use crate::error::{PieceError, Result};
use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, Row, params};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

/// Deal-send status of a content record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DealSendStatus {
    Pending,
    Success,
    Failed,
}

impl DealSendStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Success => "success",
            Self::Failed => "failed",
        }
    }
}

impl FromStr for DealSendStatus {
    type Err = PieceError;

    fn from_str(value: &str) -> Result<Self> {
        match value {
            "pending" => Ok(Self::Pending),
            "success" => Ok(Self::Success),
            "failed" => Ok(Self::Failed),
            other => Err(PieceError::InvalidRequest(format!(
                "unknown deal status: {}",
                other
            ))),
        }
    }
}

impl fmt::Display for DealSendStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Regeneration status of a content record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RegenerateStatus {
    Pending,
    Success,
    Failed,
}

impl RegenerateStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Success => "success",
            Self::Failed => "failed",
        }
    }
}

impl FromStr for RegenerateStatus {
    type Err = PieceError;

    fn from_str(value: &str) -> Result<Self> {
        match value {
            "pending" => Ok(Self::Pending),
            "success" => Ok(Self::Success),
            "failed" => Ok(Self::Failed),
            other => Err(PieceError::InvalidRequest(format!(
                "unknown regenerate status: {}",
                other
            ))),
        }
    }
}

/// Content record as stored in the database
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContentRecord {
    pub id: String,
    pub commp: String,
    pub payload_cid: String,
    pub piece_size: u64,
    pub archive_size: u64,
    pub file_path: String,
    pub manifest: Vec<ManifestEntry>,
    pub deal_status: DealSendStatus,
    pub deal_time: Option<DateTime<Utc>>,
    pub deal_error: Option<String>,
    pub deal_id: Option<String>,
    pub regenerate_status: RegenerateStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

const RECORD_COLUMNS: &str = "id, commp, payload_cid, piece_size, archive_size, file_path, manifest,
     deal_status, deal_time, deal_error, deal_id, regenerate_status, created_at, updated_at";

pub struct ContentStore {
    db_path: PathBuf,
}

impl ContentStore {
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
            "CREATE TABLE IF NOT EXISTS files (
                id TEXT PRIMARY KEY,
                commp TEXT NOT NULL,
                payload_cid TEXT NOT NULL,
                piece_size INTEGER NOT NULL,
                archive_size INTEGER NOT NULL,
                file_path TEXT NOT NULL,
                manifest TEXT NOT NULL,
                deal_status TEXT NOT NULL DEFAULT 'pending',
                deal_time TEXT,
                deal_error TEXT,
                deal_id TEXT,
                regenerate_status TEXT NOT NULL DEFAULT 'pending',
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )",
            [],
        )?;

        // commp is the join key with deals
        conn.execute(
            "CREATE UNIQUE INDEX IF NOT EXISTS idx_files_commp ON files(commp)",
            [],
        )?;

        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_files_deal_status ON files(deal_status, created_at)",
            [],
        )?;

        Ok(())
    }

    /// Store a newly generated content record
    pub fn insert_record(&self, record: &ContentRecord) -> Result<()> {
        let conn = self.get_conn()?;
        let manifest_json = serde_json::to_string(&record.manifest)?;

        conn.execute(
            "INSERT INTO files (
                id, commp, payload_cid, piece_size, archive_size, file_path, manifest,
                deal_status, deal_time, deal_error, deal_id, regenerate_status,
                created_at, updated_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)",
            params![
                record.id,
                record.commp,
                record.payload_cid,
                record.piece_size as i64,
                record.archive_size as i64,
                record.file_path,
                manifest_json,
                record.deal_status.as_str(),
                record.deal_time.as_ref().map(format_timestamp),
                record.deal_error,
                record.deal_id,
                record.regenerate_status.as_str(),
                format_timestamp(&record.created_at),
                format_timestamp(&record.updated_at),
            ],
        )?;

        Ok(())
    }

    pub fn get_record(&self, id: &str) -> Result<Option<ContentRecord>> {
        let conn = self.get_conn()?;
        let sql = format!("SELECT {} FROM files WHERE id = ?1", RECORD_COLUMNS);
        let record = conn.query_row(&sql, [id], row_to_record).optional()?;
        Ok(record)
    }

    /// Look up the record a deal belongs to by its piece commitment
    pub fn get_by_commp(&self, commp: &str) -> Result<Option<ContentRecord>> {
        let conn = self.get_conn()?;
        let sql = format!("SELECT {} FROM files WHERE commp = ?1", RECORD_COLUMNS);
        let record = conn.query_row(&sql, [commp], row_to_record).optional()?;
        Ok(record)
    }

    /// All records, oldest first
    pub fn list_records(&self) -> Result<Vec<ContentRecord>> {
        let conn = self.get_conn()?;
        let sql = format!(
            "SELECT {} FROM files ORDER BY created_at ASC, id ASC",
            RECORD_COLUMNS
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map([], row_to_record)?;
        collect_rows(rows)
    }

    /// Records still waiting for a deal, oldest first
    pub fn list_pending_deals(&self, limit: Option<usize>) -> Result<Vec<ContentRecord>> {
        let conn = self.get_conn()?;
        let sql = format!(
            "SELECT {} FROM files WHERE deal_status = 'pending'
             ORDER BY created_at ASC, id ASC LIMIT ?1",
            RECORD_COLUMNS
        );
        let limit = limit.map(|value| value as i64).unwrap_or(-1);
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map([limit], row_to_record)?;
        collect_rows(rows)
    }

    /// Records filtered by deal status and a deal-time window
    pub fn list_by_deal_status(
        &self,
        status: Option<DealSendStatus>,
        since: Option<DateTime<Utc>>,
        until: Option<DateTime<Utc>>,
    ) -> Result<Vec<ContentRecord>> {
        let conn = self.get_conn()?;
        let sql = format!(
            "SELECT {} FROM files
             WHERE (?1 IS NULL OR deal_status = ?1)
               AND (?2 IS NULL OR deal_time >= ?2)
               AND (?3 IS NULL OR deal_time <= ?3)
             ORDER BY created_at ASC, id ASC",
            RECORD_COLUMNS
        );

        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(
            params![
                status.map(|value| value.as_str()),
                since.as_ref().map(format_timestamp),
                until.as_ref().map(format_timestamp),
            ],
            row_to_record,
        )?;
        collect_rows(rows)
    }

    /// Put a record back to pending before a new attempt, clearing the last failure
    pub fn reset_deal_status(&self, id: &str) -> Result<()> {
        let conn = self.get_conn()?;
        let now = format_timestamp(&Utc::now());

        let affected = conn.execute(
            "UPDATE files SET deal_status = 'pending', deal_error = NULL, updated_at = ?1
             WHERE id = ?2",
            params![now, id],
        )?;

        ensure_updated(affected, id)
    }

    /// Record a successful deal submission and link the resulting deal
    pub fn mark_deal_sent(&self, id: &str, deal_uuid: &str) -> Result<()> {
        let conn = self.get_conn()?;
        let now = format_timestamp(&Utc::now());

        let affected = conn.execute(
            "UPDATE files
             SET deal_status = 'success', deal_time = ?1, deal_error = NULL, deal_id = ?2,
                 updated_at = ?1
             WHERE id = ?3",
            params![now, deal_uuid, id],
        )?;

        ensure_updated(affected, id)
    }

    /// Record a failed deal submission with its reason
    pub fn mark_deal_failed(&self, id: &str, reason: &str) -> Result<()> {
        let conn = self.get_conn()?;
        let now = format_timestamp(&Utc::now());

        let affected = conn.execute(
            "UPDATE files
             SET deal_status = 'failed', deal_time = ?1, deal_error = ?2, updated_at = ?1
             WHERE id = ?3",
            params![now, reason, id],
        )?;

        ensure_updated(affected, id)
    }

    /// Stamp an attempt whose outcome is unknown without changing its status
    pub fn touch_deal_attempt(&self, id: &str, note: &str) -> Result<()> {
        let conn = self.get_conn()?;
        let now = format_timestamp(&Utc::now());

        let affected = conn.execute(
            "UPDATE files SET deal_time = ?1, deal_error = ?2, updated_at = ?1 WHERE id = ?3",
            params![now, note, id],
        )?;

        ensure_updated(affected, id)
    }

    pub fn set_regenerate_status(&self, id: &str, status: RegenerateStatus) -> Result<()> {
        let conn = self.get_conn()?;
        let now = format_timestamp(&Utc::now());

        let affected = conn.execute(
            "UPDATE files SET regenerate_status = ?1, updated_at = ?2 WHERE id = ?3",
            params![status.as_str(), now, id],
        )?;

        ensure_updated(affected, id)
    }
}

fn ensure_updated(affected: usize, id: &str) -> Result<()> {
    if affected == 0 {
        return Err(PieceError::RecordNotFound(format!("content record {}", id)));
    }
    Ok(())
}

fn collect_rows<F>(rows: rusqlite::MappedRows<'_, F>) -> Result<Vec<ContentRecord>>
where
    F: FnMut(&Row<'_>) -> rusqlite::Result<ContentRecord>,
{
    let mut records = Vec::new();
    for row in rows {
        records.push(row?);
    }
    Ok(records)
}

fn row_to_record(row: &Row<'_>) -> rusqlite::Result<ContentRecord> {
    let piece_size: i64 = row.get(3)?;
    let archive_size: i64 = row.get(4)?;
    let manifest_json: String = row.get(6)?;
    let deal_status: String = row.get(7)?;
    let deal_time: Option<String> = row.get(8)?;
    let regenerate_status: String = row.get(11)?;
    let created_at: String = row.get(12)?;
    let updated_at: String = row.get(13)?;

    Ok(ContentRecord {
        id: row.get(0)?,
        commp: row.get(1)?,
        payload_cid: row.get(2)?,
        piece_size: piece_size as u64,
        archive_size: archive_size as u64,
        file_path: row.get(5)?,
        manifest: serde_json::from_str(&manifest_json)
            .map_err(|error| conversion_error(6, error))?,
        deal_status: deal_status
            .parse()
            .map_err(|error: PieceError| conversion_error(7, error))?,
        deal_time: deal_time
            .map(|value| parse_timestamp(8, &value))
            .transpose()?,
        deal_error: row.get(9)?,
        deal_id: row.get(10)?,
        regenerate_status: regenerate_status
            .parse()
            .map_err(|error: PieceError| conversion_error(11, error))?,
        created_at: parse_timestamp(12, &created_at)?,
        updated_at: parse_timestamp(13, &updated_at)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn sample_record(commp: &str, created_at: DateTime<Utc>) -> ContentRecord {
        ContentRecord {
            id: ulid::Ulid::new().to_string(),
            commp: commp.to_string(),
            payload_cid: format!("payload-{}", commp),
            piece_size: 2048,
            archive_size: 1500,
            file_path: format!("/out/{}.tar", commp),
            manifest: vec![ManifestEntry {
                name: "a".to_string(),
                size: 1000,
                relative_path: "dir/a".to_string(),
            }],
            deal_status: DealSendStatus::Pending,
            deal_time: None,
            deal_error: None,
            deal_id: None,
            regenerate_status: RegenerateStatus::Pending,
            created_at,
            updated_at: created_at,
        }
    }

    fn open_store(dir: &tempfile::TempDir) -> ContentStore {
        ContentStore::open(dir.path().join("piecemill.db")).unwrap()
    }

    #[test]
    fn test_insert_and_lookup() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&dir);
        let record = sample_record("baga-one", Utc::now());

        store.insert_record(&record).unwrap();

        let by_id = store.get_record(&record.id).unwrap().unwrap();
        assert_eq!(by_id.commp, "baga-one");
        assert_eq!(by_id.manifest, record.manifest);
        assert_eq!(by_id.deal_status, DealSendStatus::Pending);
        assert_eq!(by_id.regenerate_status, RegenerateStatus::Pending);

        let by_commp = store.get_by_commp("baga-one").unwrap().unwrap();
        assert_eq!(by_commp.id, record.id);
        assert!(store.get_by_commp("baga-unknown").unwrap().is_none());
    }

    #[test]
    fn test_commp_is_unique() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&dir);
        store
            .insert_record(&sample_record("baga-dup", Utc::now()))
            .unwrap();
        assert!(matches!(
            store.insert_record(&sample_record("baga-dup", Utc::now())),
            Err(PieceError::Database(_))
        ));
    }

    #[test]
    fn test_pending_oldest_first() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&dir);
        let base = Utc::now();

        let newer = sample_record("baga-newer", base);
        let older = sample_record("baga-older", base - Duration::minutes(5));
        let done = sample_record("baga-done", base - Duration::minutes(10));
        store.insert_record(&newer).unwrap();
        store.insert_record(&older).unwrap();
        store.insert_record(&done).unwrap();
        store.mark_deal_sent(&done.id, "deal-1").unwrap();

        let pending = store.list_pending_deals(None).unwrap();
        let commps: Vec<&str> = pending.iter().map(|r| r.commp.as_str()).collect();
        assert_eq!(commps, vec!["baga-older", "baga-newer"]);

        let limited = store.list_pending_deals(Some(1)).unwrap();
        assert_eq!(limited.len(), 1);
        assert_eq!(limited[0].commp, "baga-older");
    }

    #[test]
    fn test_deal_status_transitions() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&dir);
        let record = sample_record("baga-status", Utc::now());
        store.insert_record(&record).unwrap();

        store.mark_deal_failed(&record.id, "boom").unwrap();
        let failed = store.get_record(&record.id).unwrap().unwrap();
        assert_eq!(failed.deal_status, DealSendStatus::Failed);
        assert_eq!(failed.deal_error.as_deref(), Some("boom"));
        assert!(failed.deal_time.is_some());

        store.reset_deal_status(&record.id).unwrap();
        let reset = store.get_record(&record.id).unwrap().unwrap();
        assert_eq!(reset.deal_status, DealSendStatus::Pending);
        assert!(reset.deal_error.is_none());

        store.mark_deal_sent(&record.id, "deal-uuid").unwrap();
        let sent = store.get_record(&record.id).unwrap().unwrap();
        assert_eq!(sent.deal_status, DealSendStatus::Success);
        assert_eq!(sent.deal_id.as_deref(), Some("deal-uuid"));

        assert!(matches!(
            store.mark_deal_sent("missing", "x"),
            Err(PieceError::RecordNotFound(_))
        ));
    }

    #[test]
    fn test_list_by_deal_status() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&dir);
        let first = sample_record("baga-a", Utc::now());
        let second = sample_record("baga-b", Utc::now());
        store.insert_record(&first).unwrap();
        store.insert_record(&second).unwrap();
        store.mark_deal_failed(&second.id, "nope").unwrap();

        let failed = store
            .list_by_deal_status(Some(DealSendStatus::Failed), None, None)
            .unwrap();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].commp, "baga-b");

        let all = store.list_by_deal_status(None, None, None).unwrap();
        assert_eq!(all.len(), 2);

        let future = store
            .list_by_deal_status(None, Some(Utc::now() + Duration::hours(1)), None)
            .unwrap();
        assert!(future.is_empty());
    }

    #[test]
    fn test_regenerate_status() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&dir);
        let record = sample_record("baga-regen", Utc::now());
        store.insert_record(&record).unwrap();

        store
            .set_regenerate_status(&record.id, RegenerateStatus::Failed)
            .unwrap();
        let updated = store.get_record(&record.id).unwrap().unwrap();
        assert_eq!(updated.regenerate_status, RegenerateStatus::Failed);
        assert_eq!(updated.commp, record.commp);
    }
}

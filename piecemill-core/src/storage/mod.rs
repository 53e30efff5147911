//! Storage modules for Piecemill
//!
//! Content records and deal records live in two tables of one SQLite file.

pub mod content_store;
pub mod deal_store;

pub use content_store::{ContentRecord, ContentStore, DealSendStatus, RegenerateStatus};
pub use deal_store::{DealRecord, DealState, DealStore};

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::Connection;
use rusqlite::types::Type;
use std::path::Path;
use std::time::Duration;

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

pub(crate) fn open_connection(db_path: &Path) -> crate::Result<Connection> {
    let conn = Connection::open(db_path)?;
    conn.busy_timeout(BUSY_TIMEOUT)?;
    Ok(conn)
}

// Fixed precision keeps the text columns ordered the same way as the instants.
pub(crate) fn format_timestamp(time: &DateTime<Utc>) -> String {
    time.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub(crate) fn parse_timestamp(column: usize, value: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|time| time.with_timezone(&Utc))
        .map_err(|error| conversion_error(column, error))
}

pub(crate) fn conversion_error<E>(column: usize, error: E) -> rusqlite::Error
where
    E: std::error::Error + Send + Sync + 'static,
{
    rusqlite::Error::FromSqlConversionFailure(column, Type::Text, Box::new(error))
}

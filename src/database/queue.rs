use crate::database::models::{ScanRecord, SyncState};
use crate::error::ScanError;
use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};

type Result<T> = std::result::Result<T, ScanError>;

const SELECT_COLUMNS: &str =
    "SELECT local_id, session_id, code, scanned_at, sync_state, server_id, synced_at FROM scan_records";

/// Durable on-device queue of scan records awaiting server acknowledgment.
///
/// The only component allowed to touch the `scan_records` table.
#[derive(Clone)]
pub struct ScanQueue {
    pool: SqlitePool,
}

impl ScanQueue {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Stores a new pending record and returns its local id.
    pub async fn enqueue(
        &self,
        session_id: i64,
        code: &str,
        scanned_at: DateTime<Utc>,
    ) -> Result<i64> {
        let result = sqlx::query(
            "INSERT INTO scan_records (session_id, code, scanned_at, sync_state) VALUES (?, ?, ?, ?)",
        )
        .bind(session_id)
        .bind(code)
        .bind(scanned_at)
        .bind(SyncState::Pending.as_str())
        .execute(&self.pool)
        .await?;

        let local_id = result.last_insert_rowid();
        tracing::debug!("Enqueued scan local_id={}, session_id={}", local_id, session_id);
        Ok(local_id)
    }

    /// All pending records, oldest scan first.
    pub async fn list_pending(&self) -> Result<Vec<ScanRecord>> {
        let rows = sqlx::query(&format!(
            "{} WHERE sync_state = ? ORDER BY scanned_at ASC, local_id ASC",
            SELECT_COLUMNS
        ))
        .bind(SyncState::Pending.as_str())
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(row_to_record).collect()
    }

    pub async fn list_pending_for_session(&self, session_id: i64) -> Result<Vec<ScanRecord>> {
        let rows = sqlx::query(&format!(
            "{} WHERE sync_state = ? AND session_id = ? ORDER BY scanned_at ASC, local_id ASC",
            SELECT_COLUMNS
        ))
        .bind(SyncState::Pending.as_str())
        .bind(session_id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(row_to_record).collect()
    }

    /// Most recent records of a session regardless of sync state, newest first.
    pub async fn list_recent(&self, session_id: i64, limit: i64) -> Result<Vec<ScanRecord>> {
        let rows = sqlx::query(&format!(
            "{} WHERE session_id = ? ORDER BY scanned_at DESC, local_id DESC LIMIT ?",
            SELECT_COLUMNS
        ))
        .bind(session_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(row_to_record).collect()
    }

    pub async fn get(&self, local_id: i64) -> Result<Option<ScanRecord>> {
        let row = sqlx::query(&format!("{} WHERE local_id = ?", SELECT_COLUMNS))
            .bind(local_id)
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref().map(row_to_record).transpose()
    }

    /// Moves a record from pending to synced. Returns false when it was already
    /// synced (or unknown), leaving it untouched.
    pub async fn mark_synced(&self, local_id: i64, server_id: Option<i64>) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE scan_records
             SET sync_state = ?, server_id = ?, synced_at = ?
             WHERE local_id = ? AND sync_state = ?",
        )
        .bind(SyncState::Synced.as_str())
        .bind(server_id)
        .bind(Utc::now())
        .bind(local_id)
        .bind(SyncState::Pending.as_str())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    /// Number of pending records.
    pub async fn count(&self) -> Result<i64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM scan_records WHERE sync_state = ?")
            .bind(SyncState::Pending.as_str())
            .fetch_one(&self.pool)
            .await?;

        Ok(count)
    }

    /// Removes records the server has acknowledged. Pending records are never deleted.
    pub async fn delete_synced(&self) -> Result<u64> {
        let result = sqlx::query("DELETE FROM scan_records WHERE sync_state = ?")
            .bind(SyncState::Synced.as_str())
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected())
    }
}

fn row_to_record(row: &SqliteRow) -> Result<ScanRecord> {
    let sync_state: String = row.try_get("sync_state")?;
    let sync_state = sync_state
        .parse::<SyncState>()
        .map_err(|e| sqlx::Error::Decode(e.into()))?;

    Ok(ScanRecord {
        local_id: row.try_get("local_id")?,
        session_id: row.try_get("session_id")?,
        code: row.try_get("code")?,
        scanned_at: row.try_get("scanned_at")?,
        sync_state,
        server_id: row.try_get("server_id")?,
        synced_at: row.try_get("synced_at")?,
    })
}

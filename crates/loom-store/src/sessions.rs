use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::instrument;

use loom_core::ids::{CheckpointId, ThreadId};

use crate::error::StoreError;
use crate::row_helpers;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Active,
    Disconnected,
    Expired,
}

impl SessionStatus {
    /// Whether a client may pick the session back up.
    pub fn is_resumable(&self) -> bool {
        matches!(self, Self::Active | Self::Disconnected)
    }
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Active => write!(f, "active"),
            Self::Disconnected => write!(f, "disconnected"),
            Self::Expired => write!(f, "expired"),
        }
    }
}

impl std::str::FromStr for SessionStatus {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(Self::Active),
            "disconnected" => Ok(Self::Disconnected),
            "expired" => Ok(Self::Expired),
            other => Err(format!("unknown session status: {other}")),
        }
    }
}

/// A stored session record. The reconnect token itself is never stored,
/// only its digest.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SessionRow {
    pub thread_id: ThreadId,
    pub status: SessionStatus,
    pub current_branch: String,
    pub current_checkpoint_id: CheckpointId,
    #[serde(skip)]
    pub token_digest: String,
    pub token_expires_at: DateTime<Utc>,
    pub last_stream_position: u64,
    pub metadata: Map<String, Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

const SESSION_COLUMNS: &str = "thread_id, status, current_branch, current_checkpoint_id, token_digest,
     token_expires_at, last_stream_position, metadata, created_at, updated_at";

pub struct SessionRepo;

impl SessionRepo {
    #[instrument(skip(conn, row), fields(thread_id = %row.thread_id))]
    pub fn insert(conn: &Connection, row: &SessionRow) -> Result<(), StoreError> {
        conn.execute(
            "INSERT INTO sessions (thread_id, status, current_branch, current_checkpoint_id,
                token_digest, token_expires_at, last_stream_position, metadata, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                row.thread_id.as_str(),
                row.status.to_string(),
                row.current_branch,
                row.current_checkpoint_id.as_str(),
                row.token_digest,
                row_helpers::format_timestamp(&row.token_expires_at),
                row.last_stream_position as i64,
                serde_json::to_string(&row.metadata)?,
                row_helpers::format_timestamp(&row.created_at),
                row_helpers::format_timestamp(&row.updated_at),
            ],
        )?;
        Ok(())
    }

    #[instrument(skip(conn), fields(thread_id = %thread_id))]
    pub fn get(conn: &Connection, thread_id: &ThreadId) -> Result<Option<SessionRow>, StoreError> {
        let sql = format!("SELECT {SESSION_COLUMNS} FROM sessions WHERE thread_id = ?1");
        let mut stmt = conn.prepare(&sql)?;
        let mut rows = stmt.query([thread_id.as_str()])?;
        match rows.next()? {
            Some(row) => Ok(Some(row_to_session(row)?)),
            None => Ok(None),
        }
    }

    pub fn exists(conn: &Connection, thread_id: &ThreadId) -> Result<bool, StoreError> {
        let found: Option<i64> = conn
            .query_row(
                "SELECT 1 FROM sessions WHERE thread_id = ?1",
                [thread_id.as_str()],
                |row| row.get(0),
            )
            .optional()?;
        Ok(found.is_some())
    }

    /// List sessions ordered by creation time (oldest first).
    #[instrument(skip(conn))]
    pub fn list(
        conn: &Connection,
        status: Option<SessionStatus>,
    ) -> Result<Vec<SessionRow>, StoreError> {
        let mut results = Vec::new();
        match status {
            Some(s) => {
                let sql = format!(
                    "SELECT {SESSION_COLUMNS} FROM sessions WHERE status = ?1 ORDER BY created_at ASC, thread_id ASC"
                );
                let mut stmt = conn.prepare(&sql)?;
                let mut rows = stmt.query([s.to_string()])?;
                while let Some(row) = rows.next()? {
                    results.push(row_to_session(row)?);
                }
            }
            None => {
                let sql = format!(
                    "SELECT {SESSION_COLUMNS} FROM sessions ORDER BY created_at ASC, thread_id ASC"
                );
                let mut stmt = conn.prepare(&sql)?;
                let mut rows = stmt.query([])?;
                while let Some(row) = rows.next()? {
                    results.push(row_to_session(row)?);
                }
            }
        }
        Ok(results)
    }

    #[instrument(skip(conn), fields(thread_id = %thread_id, status = %status))]
    pub fn update_status(
        conn: &Connection,
        thread_id: &ThreadId,
        status: SessionStatus,
        now: &DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let changed = conn.execute(
            "UPDATE sessions SET status = ?1, updated_at = ?2 WHERE thread_id = ?3",
            params![status.to_string(), row_helpers::format_timestamp(now), thread_id.as_str()],
        )?;
        Ok(changed > 0)
    }

    /// Move the session's position in its checkpoint tree.
    #[instrument(skip(conn), fields(thread_id = %thread_id, checkpoint_id = %checkpoint_id))]
    pub fn update_pointer(
        conn: &Connection,
        thread_id: &ThreadId,
        branch: &str,
        checkpoint_id: &CheckpointId,
        now: &DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let changed = conn.execute(
            "UPDATE sessions SET current_branch = ?1, current_checkpoint_id = ?2, updated_at = ?3
             WHERE thread_id = ?4",
            params![
                branch,
                checkpoint_id.as_str(),
                row_helpers::format_timestamp(now),
                thread_id.as_str()
            ],
        )?;
        Ok(changed > 0)
    }

    /// Replace the token digest and expiry. Any previously issued token stops
    /// validating the moment this commits.
    #[instrument(skip(conn, token_digest), fields(thread_id = %thread_id))]
    pub fn update_token(
        conn: &Connection,
        thread_id: &ThreadId,
        token_digest: &str,
        expires_at: &DateTime<Utc>,
        now: &DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let changed = conn.execute(
            "UPDATE sessions SET token_digest = ?1, token_expires_at = ?2, updated_at = ?3
             WHERE thread_id = ?4",
            params![
                token_digest,
                row_helpers::format_timestamp(expires_at),
                row_helpers::format_timestamp(now),
                thread_id.as_str()
            ],
        )?;
        Ok(changed > 0)
    }

    #[instrument(skip(conn), fields(thread_id = %thread_id))]
    pub fn update_stream_position(
        conn: &Connection,
        thread_id: &ThreadId,
        position: u64,
        now: &DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let changed = conn.execute(
            "UPDATE sessions SET last_stream_position = ?1, updated_at = ?2 WHERE thread_id = ?3",
            params![position as i64, row_helpers::format_timestamp(now), thread_id.as_str()],
        )?;
        Ok(changed > 0)
    }

    /// Hard delete of the session row. Dependent rows must already be gone.
    #[instrument(skip(conn), fields(thread_id = %thread_id))]
    pub fn delete(conn: &Connection, thread_id: &ThreadId) -> Result<bool, StoreError> {
        let changed = conn.execute("DELETE FROM sessions WHERE thread_id = ?1", [thread_id.as_str()])?;
        Ok(changed > 0)
    }
}

fn row_to_session(row: &rusqlite::Row<'_>) -> Result<SessionRow, StoreError> {
    const T: &str = "sessions";
    let status_str: String = row_helpers::get(row, 1, T, "status")?;
    let expires_str: String = row_helpers::get(row, 5, T, "token_expires_at")?;
    let position: i64 = row_helpers::get(row, 6, T, "last_stream_position")?;
    let metadata_str: String = row_helpers::get(row, 7, T, "metadata")?;
    let created_str: String = row_helpers::get(row, 8, T, "created_at")?;
    let updated_str: String = row_helpers::get(row, 9, T, "updated_at")?;

    Ok(SessionRow {
        thread_id: ThreadId::from_raw(row_helpers::get::<String>(row, 0, T, "thread_id")?),
        status: row_helpers::parse_enum(&status_str, T, "status")?,
        current_branch: row_helpers::get(row, 2, T, "current_branch")?,
        current_checkpoint_id: CheckpointId::from_raw(row_helpers::get::<String>(
            row,
            3,
            T,
            "current_checkpoint_id",
        )?),
        token_digest: row_helpers::get(row, 4, T, "token_digest")?,
        token_expires_at: row_helpers::parse_timestamp(&expires_str, T, "token_expires_at")?,
        last_stream_position: u64::try_from(position).map_err(|_| StoreError::CorruptRow {
            table: T,
            column: "last_stream_position",
            detail: format!("negative position {position}"),
        })?,
        metadata: row_helpers::parse_json(&metadata_str, T, "metadata")?,
        created_at: row_helpers::parse_timestamp(&created_str, T, "created_at")?,
        updated_at: row_helpers::parse_timestamp(&updated_str, T, "updated_at")?,
    })
}

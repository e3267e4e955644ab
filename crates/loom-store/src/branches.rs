use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};
use tracing::instrument;

use loom_core::ids::{CheckpointId, ThreadId};

use crate::error::StoreError;
use crate::row_helpers;

/// A named, movable pointer into a thread's checkpoint tree.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BranchRow {
    pub thread_id: ThreadId,
    pub name: String,
    pub head_checkpoint_id: CheckpointId,
    pub created_at: DateTime<Utc>,
}

pub struct BranchRepo;

impl BranchRepo {
    #[instrument(skip(conn, row), fields(thread_id = %row.thread_id, branch = %row.name))]
    pub fn insert(conn: &Connection, row: &BranchRow) -> Result<(), StoreError> {
        conn.execute(
            "INSERT INTO branches (thread_id, name, head_checkpoint_id, created_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![
                row.thread_id.as_str(),
                row.name,
                row.head_checkpoint_id.as_str(),
                row_helpers::format_timestamp(&row.created_at),
            ],
        )?;
        Ok(())
    }

    #[instrument(skip(conn), fields(thread_id = %thread_id, branch = name))]
    pub fn get(
        conn: &Connection,
        thread_id: &ThreadId,
        name: &str,
    ) -> Result<Option<BranchRow>, StoreError> {
        let mut stmt = conn.prepare(
            "SELECT thread_id, name, head_checkpoint_id, created_at
             FROM branches WHERE thread_id = ?1 AND name = ?2",
        )?;
        let mut rows = stmt.query(params![thread_id.as_str(), name])?;
        match rows.next()? {
            Some(row) => Ok(Some(row_to_branch(row)?)),
            None => Ok(None),
        }
    }

    /// Branches of a thread in creation order.
    #[instrument(skip(conn), fields(thread_id = %thread_id))]
    pub fn list(conn: &Connection, thread_id: &ThreadId) -> Result<Vec<BranchRow>, StoreError> {
        let mut stmt = conn.prepare(
            "SELECT thread_id, name, head_checkpoint_id, created_at
             FROM branches WHERE thread_id = ?1 ORDER BY rowid ASC",
        )?;
        let mut rows = stmt.query([thread_id.as_str()])?;
        let mut results = Vec::new();
        while let Some(row) = rows.next()? {
            results.push(row_to_branch(row)?);
        }
        Ok(results)
    }

    #[instrument(skip(conn), fields(thread_id = %thread_id, branch = name, head = %head))]
    pub fn update_head(
        conn: &Connection,
        thread_id: &ThreadId,
        name: &str,
        head: &CheckpointId,
    ) -> Result<bool, StoreError> {
        let changed = conn.execute(
            "UPDATE branches SET head_checkpoint_id = ?1 WHERE thread_id = ?2 AND name = ?3",
            params![head.as_str(), thread_id.as_str(), name],
        )?;
        Ok(changed > 0)
    }

    pub fn delete_for_thread(conn: &Connection, thread_id: &ThreadId) -> Result<usize, StoreError> {
        Ok(conn.execute("DELETE FROM branches WHERE thread_id = ?1", [thread_id.as_str()])?)
    }
}

fn row_to_branch(row: &rusqlite::Row<'_>) -> Result<BranchRow, StoreError> {
    const T: &str = "branches";
    let created_str: String = row_helpers::get(row, 3, T, "created_at")?;
    Ok(BranchRow {
        thread_id: ThreadId::from_raw(row_helpers::get::<String>(row, 0, T, "thread_id")?),
        name: row_helpers::get(row, 1, T, "name")?,
        head_checkpoint_id: CheckpointId::from_raw(row_helpers::get::<String>(
            row,
            2,
            T,
            "head_checkpoint_id",
        )?),
        created_at: row_helpers::parse_timestamp(&created_str, T, "created_at")?,
    })
}

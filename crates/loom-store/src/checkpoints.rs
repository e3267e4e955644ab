use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::instrument;

use loom_core::ids::{CheckpointId, ThreadId};

use crate::error::StoreError;
use crate::row_helpers;

/// An immutable snapshot in a thread's history tree.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CheckpointRow {
    pub id: CheckpointId,
    pub thread_id: ThreadId,
    pub parent_id: Option<CheckpointId>,
    /// Per-thread creation counter, starting at 0 for the root.
    pub sequence: i64,
    pub state: Value,
    pub description: String,
    /// Branch that was current when the checkpoint was created.
    pub branch: String,
    pub message_count: u32,
    pub created_at: DateTime<Utc>,
}

const CHECKPOINT_COLUMNS: &str =
    "id, thread_id, parent_id, sequence, state, description, branch, message_count, created_at";

pub struct CheckpointRepo;

impl CheckpointRepo {
    #[instrument(skip(conn, row), fields(thread_id = %row.thread_id, checkpoint_id = %row.id))]
    pub fn insert(conn: &Connection, row: &CheckpointRow) -> Result<(), StoreError> {
        conn.execute(
            "INSERT INTO checkpoints (id, thread_id, parent_id, sequence, state, description, branch,
                message_count, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                row.id.as_str(),
                row.thread_id.as_str(),
                row.parent_id.as_ref().map(CheckpointId::as_str),
                row.sequence,
                serde_json::to_string(&row.state)?,
                row.description,
                row.branch,
                row.message_count,
                row_helpers::format_timestamp(&row.created_at),
            ],
        )?;
        Ok(())
    }

    /// Look up a checkpoint by id regardless of thread.
    #[instrument(skip(conn), fields(checkpoint_id = %id))]
    pub fn get(conn: &Connection, id: &CheckpointId) -> Result<Option<CheckpointRow>, StoreError> {
        let sql = format!("SELECT {CHECKPOINT_COLUMNS} FROM checkpoints WHERE id = ?1");
        let mut stmt = conn.prepare(&sql)?;
        let mut rows = stmt.query([id.as_str()])?;
        match rows.next()? {
            Some(row) => Ok(Some(row_to_checkpoint(row)?)),
            None => Ok(None),
        }
    }

    /// Look up a checkpoint only if it belongs to `thread_id`.
    #[instrument(skip(conn), fields(thread_id = %thread_id, checkpoint_id = %id))]
    pub fn get_in_thread(
        conn: &Connection,
        thread_id: &ThreadId,
        id: &CheckpointId,
    ) -> Result<Option<CheckpointRow>, StoreError> {
        let sql =
            format!("SELECT {CHECKPOINT_COLUMNS} FROM checkpoints WHERE id = ?1 AND thread_id = ?2");
        let mut stmt = conn.prepare(&sql)?;
        let mut rows = stmt.query(params![id.as_str(), thread_id.as_str()])?;
        match rows.next()? {
            Some(row) => Ok(Some(row_to_checkpoint(row)?)),
            None => Ok(None),
        }
    }

    /// Every checkpoint of a thread in creation order.
    #[instrument(skip(conn), fields(thread_id = %thread_id))]
    pub fn list(conn: &Connection, thread_id: &ThreadId) -> Result<Vec<CheckpointRow>, StoreError> {
        let sql = format!(
            "SELECT {CHECKPOINT_COLUMNS} FROM checkpoints WHERE thread_id = ?1 ORDER BY sequence ASC"
        );
        let mut stmt = conn.prepare(&sql)?;
        let mut rows = stmt.query([thread_id.as_str()])?;
        let mut results = Vec::new();
        while let Some(row) = rows.next()? {
            results.push(row_to_checkpoint(row)?);
        }
        Ok(results)
    }

    pub fn next_sequence(conn: &Connection, thread_id: &ThreadId) -> Result<i64, StoreError> {
        let max: Option<i64> = conn
            .query_row(
                "SELECT MAX(sequence) FROM checkpoints WHERE thread_id = ?1",
                [thread_id.as_str()],
                |row| row.get(0),
            )
            .optional()?
            .flatten();
        Ok(max.map_or(0, |m| m + 1))
    }

    /// Path from the root to `id` (inclusive), root first.
    #[instrument(skip(conn), fields(checkpoint_id = %id))]
    pub fn ancestors(conn: &Connection, id: &CheckpointId) -> Result<Vec<CheckpointRow>, StoreError> {
        let mut stmt = conn.prepare(
            "WITH RECURSIVE ancestors(id, thread_id, parent_id, sequence, state, description, branch,
                    message_count, created_at, lvl) AS (
               SELECT id, thread_id, parent_id, sequence, state, description, branch,
                      message_count, created_at, 0
               FROM checkpoints WHERE id = ?1
               UNION ALL
               SELECT c.id, c.thread_id, c.parent_id, c.sequence, c.state, c.description, c.branch,
                      c.message_count, c.created_at, a.lvl + 1
               FROM checkpoints c JOIN ancestors a ON c.id = a.parent_id
               WHERE a.lvl < 100000
             )
             SELECT id, thread_id, parent_id, sequence, state, description, branch,
                    message_count, created_at
             FROM ancestors ORDER BY lvl DESC",
        )?;
        let mut rows = stmt.query([id.as_str()])?;
        let mut results = Vec::new();
        while let Some(row) = rows.next()? {
            results.push(row_to_checkpoint(row)?);
        }
        Ok(results)
    }

    pub fn count(conn: &Connection, thread_id: &ThreadId) -> Result<i64, StoreError> {
        Ok(conn.query_row(
            "SELECT COUNT(*) FROM checkpoints WHERE thread_id = ?1",
            [thread_id.as_str()],
            |row| row.get(0),
        )?)
    }

    pub fn delete_for_thread(conn: &Connection, thread_id: &ThreadId) -> Result<usize, StoreError> {
        Ok(conn.execute("DELETE FROM checkpoints WHERE thread_id = ?1", [thread_id.as_str()])?)
    }
}

fn row_to_checkpoint(row: &rusqlite::Row<'_>) -> Result<CheckpointRow, StoreError> {
    const T: &str = "checkpoints";
    let state_str: String = row_helpers::get(row, 4, T, "state")?;
    let created_str: String = row_helpers::get(row, 8, T, "created_at")?;

    Ok(CheckpointRow {
        id: CheckpointId::from_raw(row_helpers::get::<String>(row, 0, T, "id")?),
        thread_id: ThreadId::from_raw(row_helpers::get::<String>(row, 1, T, "thread_id")?),
        parent_id: row_helpers::get_opt::<String>(row, 2, T, "parent_id")?.map(CheckpointId::from_raw),
        sequence: row_helpers::get(row, 3, T, "sequence")?,
        state: row_helpers::parse_json(&state_str, T, "state")?,
        description: row_helpers::get(row, 5, T, "description")?,
        branch: row_helpers::get(row, 6, T, "branch")?,
        message_count: row_helpers::get(row, 7, T, "message_count")?,
        created_at: row_helpers::parse_timestamp(&created_str, T, "created_at")?,
    })
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::database::Database;
    use crate::sessions::tests::sample_session;
    use crate::sessions::SessionRepo;
    use serde_json::json;

    pub(crate) fn make_checkpoint(
        thread_id: &str,
        id: &str,
        parent: Option<&str>,
        sequence: i64,
        state: Value,
    ) -> CheckpointRow {
        CheckpointRow {
            id: CheckpointId::from_raw(id),
            thread_id: ThreadId::from_raw(thread_id),
            parent_id: parent.map(CheckpointId::from_raw),
            sequence,
            message_count: loom_core::state::message_count(&state),
            state,
            description: format!("checkpoint {sequence}"),
            branch: "main".into(),
            created_at: Utc::now(),
        }
    }

    fn setup() -> Database {
        let db = Database::in_memory().unwrap();
        db.with_conn(|conn| {
            SessionRepo::insert(conn, &sample_session("s1", "ckpt_1"))?;
            SessionRepo::insert(conn, &sample_session("s2", "ckpt_x"))?;
            Ok(())
        })
        .unwrap();
        db
    }

    fn insert_chain(db: &Database) {
        db.with_conn(|conn| {
            CheckpointRepo::insert(conn, &make_checkpoint("s1", "ckpt_1", None, 0, json!({})))?;
            CheckpointRepo::insert(
                conn,
                &make_checkpoint("s1", "ckpt_2", Some("ckpt_1"), 1, json!({"msgs": ["m1"]})),
            )?;
            CheckpointRepo::insert(
                conn,
                &make_checkpoint("s1", "ckpt_3", Some("ckpt_2"), 2, json!({"msgs": ["m1", "m2"]})),
            )?;
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn insert_and_get_roundtrip() {
        let db = setup();
        insert_chain(&db);
        let fetched = db
            .with_conn(|conn| CheckpointRepo::get(conn, &CheckpointId::from_raw("ckpt_2")))
            .unwrap()
            .unwrap();
        assert_eq!(fetched.state, json!({"msgs": ["m1"]}));
        assert_eq!(fetched.message_count, 1);
        assert_eq!(fetched.parent_id.as_ref().unwrap().as_str(), "ckpt_1");
    }

    #[test]
    fn get_in_thread_rejects_other_threads() {
        let db = setup();
        insert_chain(&db);
        let id = CheckpointId::from_raw("ckpt_2");
        let wrong = db
            .with_conn(|conn| CheckpointRepo::get_in_thread(conn, &ThreadId::from_raw("s2"), &id))
            .unwrap();
        assert!(wrong.is_none());
        let right = db
            .with_conn(|conn| CheckpointRepo::get_in_thread(conn, &ThreadId::from_raw("s1"), &id))
            .unwrap();
        assert!(right.is_some());
    }

    #[test]
    fn missing_parent_is_rejected() {
        let db = setup();
        let orphan = make_checkpoint("s1", "ckpt_9", Some("ckpt_missing"), 0, json!({}));
        let result = db.with_conn(|conn| CheckpointRepo::insert(conn, &orphan));
        assert!(result.is_err());
    }

    #[test]
    fn list_in_creation_order() {
        let db = setup();
        insert_chain(&db);
        let tid = ThreadId::from_raw("s1");
        let all = db.with_conn(|conn| CheckpointRepo::list(conn, &tid)).unwrap();
        let ids: Vec<&str> = all.iter().map(|c| c.id.as_str()).collect();
        assert_eq!(ids, vec!["ckpt_1", "ckpt_2", "ckpt_3"]);
        assert_eq!(db.with_conn(|conn| CheckpointRepo::count(conn, &tid)).unwrap(), 3);
    }

    #[test]
    fn next_sequence_starts_at_zero() {
        let db = setup();
        let tid = ThreadId::from_raw("s1");
        assert_eq!(db.with_conn(|conn| CheckpointRepo::next_sequence(conn, &tid)).unwrap(), 0);
        insert_chain(&db);
        assert_eq!(db.with_conn(|conn| CheckpointRepo::next_sequence(conn, &tid)).unwrap(), 3);
    }

    #[test]
    fn duplicate_sequence_conflicts() {
        let db = setup();
        insert_chain(&db);
        let dup = make_checkpoint("s1", "ckpt_dup", Some("ckpt_3"), 2, json!({}));
        let result = db.with_conn(|conn| CheckpointRepo::insert(conn, &dup));
        assert!(matches!(result, Err(StoreError::Conflict(_))));
    }

    #[test]
    fn ancestors_root_first() {
        let db = setup();
        insert_chain(&db);
        let chain = db
            .with_conn(|conn| CheckpointRepo::ancestors(conn, &CheckpointId::from_raw("ckpt_3")))
            .unwrap();
        let ids: Vec<&str> = chain.iter().map(|c| c.id.as_str()).collect();
        assert_eq!(ids, vec!["ckpt_1", "ckpt_2", "ckpt_3"]);
    }

    #[test]
    fn ancestors_of_unknown_is_empty() {
        let db = setup();
        let chain = db
            .with_conn(|conn| CheckpointRepo::ancestors(conn, &CheckpointId::from_raw("nope")))
            .unwrap();
        assert!(chain.is_empty());
    }
}

//! Append-only per-thread chunk log.
//!
//! `position` is the authoritative buffer index, assigned densely from 0 at
//! append time. Producer position hints stay inside the chunk metadata.

use rusqlite::{params, Connection};
use tracing::instrument;

use loom_core::chunks::StreamChunk;
use loom_core::ids::ThreadId;

use crate::error::StoreError;
use crate::row_helpers;

pub struct ChunkRepo;

impl ChunkRepo {
    /// Append a chunk and return its buffer index.
    #[instrument(skip(conn, chunk), fields(thread_id = %thread_id, content_type = %chunk.content_type))]
    pub fn append(
        conn: &Connection,
        thread_id: &ThreadId,
        chunk: &StreamChunk,
    ) -> Result<u64, StoreError> {
        let next: i64 = conn.query_row(
            "SELECT COALESCE(MAX(position) + 1, 0) FROM chunks WHERE thread_id = ?1",
            [thread_id.as_str()],
            |row| row.get(0),
        )?;
        let position = next as u64;
        conn.execute(
            "INSERT INTO chunks (thread_id, position, content_type, content, metadata, timestamp)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                thread_id.as_str(),
                position as i64,
                chunk.content_type.as_str(),
                chunk.content,
                serde_json::to_string(&chunk.metadata)?,
                row_helpers::format_timestamp(&chunk.timestamp),
            ],
        )?;
        Ok(position)
    }

    /// Number of chunks in the thread's buffer.
    pub fn count(conn: &Connection, thread_id: &ThreadId) -> Result<u64, StoreError> {
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM chunks WHERE thread_id = ?1",
            [thread_id.as_str()],
            |row| row.get(0),
        )?;
        Ok(count as u64)
    }

    /// Chunks with index >= `position`, in buffer order. Empty when
    /// `position` is at or past the end.
    #[instrument(skip(conn), fields(thread_id = %thread_id))]
    pub fn slice_from(
        conn: &Connection,
        thread_id: &ThreadId,
        position: u64,
    ) -> Result<Vec<StreamChunk>, StoreError> {
        let position = i64::try_from(position).unwrap_or(i64::MAX);
        let mut stmt = conn.prepare(
            "SELECT content_type, content, metadata, timestamp
             FROM chunks WHERE thread_id = ?1 AND position >= ?2
             ORDER BY position ASC",
        )?;
        let mut rows = stmt.query(params![thread_id.as_str(), position])?;
        let mut results = Vec::new();
        while let Some(row) = rows.next()? {
            results.push(row_to_chunk(row)?);
        }
        Ok(results)
    }

    pub fn delete_for_thread(conn: &Connection, thread_id: &ThreadId) -> Result<usize, StoreError> {
        Ok(conn.execute("DELETE FROM chunks WHERE thread_id = ?1", [thread_id.as_str()])?)
    }
}

fn row_to_chunk(row: &rusqlite::Row<'_>) -> Result<StreamChunk, StoreError> {
    const T: &str = "chunks";
    let type_str: String = row_helpers::get(row, 0, T, "content_type")?;
    let metadata_str: String = row_helpers::get(row, 2, T, "metadata")?;
    let ts_str: String = row_helpers::get(row, 3, T, "timestamp")?;

    Ok(StreamChunk {
        content_type: row_helpers::parse_enum(&type_str, T, "content_type")?,
        content: row_helpers::get(row, 1, T, "content")?,
        metadata: row_helpers::parse_json(&metadata_str, T, "metadata")?,
        timestamp: row_helpers::parse_timestamp(&ts_str, T, "timestamp")?,
    })
}

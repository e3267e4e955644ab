//! Result shapes returned by [`crate::SessionRegistry`].

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use secrecy::SecretString;
use serde::{Deserialize, Serialize};

use loom_core::chunks::StreamChunk;
use loom_core::ids::{CheckpointId, ThreadId};
use loom_store::checkpoints::CheckpointRow;
use loom_store::sessions::{SessionRow, SessionStatus};

/// Why a reconnection attempt cannot proceed.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResumeBlocker {
    UnknownSession,
    TokenMismatch,
    TokenExpired,
    SessionExpired,
}

impl std::fmt::Display for ResumeBlocker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::UnknownSession => write!(f, "unknown session"),
            Self::TokenMismatch => write!(f, "token does not match session"),
            Self::TokenExpired => write!(f, "token expired"),
            Self::SessionExpired => write!(f, "session expired"),
        }
    }
}

/// A new session plus its first reconnect token.
#[derive(Debug)]
pub struct CreatedSession {
    pub session: SessionRow,
    pub reconnect_token: SecretString,
}

/// Returned by `mark_reconnectable`. Holds the only copy of the new token.
#[derive(Debug)]
pub struct ReconnectInfo {
    pub reconnect_token: SecretString,
    pub thread_id: ThreadId,
    pub last_position: u64,
    pub expires_at: DateTime<Utc>,
}

/// Outcome of a reconnection lookup.
///
/// Either `pending_chunks` holds every chunk from `last_stream_position`
/// onwards, or `can_resume` is false and `reason` says why. Failed token
/// checks never carry chunks.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ReconnectionState {
    pub success: bool,
    pub can_resume: bool,
    pub pending_chunks: Vec<StreamChunk>,
    pub pending_chunks_count: usize,
    pub last_stream_position: u64,
    pub status: Option<SessionStatus>,
    pub reason: Option<ResumeBlocker>,
}

impl ReconnectionState {
    pub(crate) fn blocked(reason: ResumeBlocker, status: Option<SessionStatus>) -> Self {
        Self {
            success: false,
            can_resume: false,
            pending_chunks: Vec::new(),
            pending_chunks_count: 0,
            last_stream_position: 0,
            status,
            reason: Some(reason),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct TimeTravelResult {
    pub success: bool,
    pub checkpoint_id: CheckpointId,
    pub description: String,
    pub message_count: u32,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct CheckpointComparison {
    pub checkpoint_1: CheckpointRow,
    pub checkpoint_2: CheckpointRow,
    /// `count(checkpoint_2) - count(checkpoint_1)`.
    pub message_count_diff: i64,
}

/// Options for `create_branch`.
#[derive(Clone, Debug, Default)]
pub struct CreateBranchOptions {
    /// Defaults to the session's current checkpoint.
    pub from_checkpoint_id: Option<CheckpointId>,
    /// Make the new branch current in the same critical section.
    pub switch: bool,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct BranchCreated {
    pub success: bool,
    pub branch: String,
    pub branch_checkpoint_id: CheckpointId,
    pub source_checkpoint_id: CheckpointId,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct BranchSwitched {
    pub success: bool,
    pub branch: String,
    pub checkpoint_id: CheckpointId,
    pub message_count: u32,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct BranchSummary {
    pub name: String,
    pub head_checkpoint_id: CheckpointId,
    pub message_count: u32,
    pub is_current: bool,
}

/// One node of the history tree. State blobs are left out; fetch the
/// checkpoint itself when the snapshot is needed.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct CheckpointNode {
    pub checkpoint_id: CheckpointId,
    pub parent_id: Option<CheckpointId>,
    pub sequence: i64,
    pub branch: String,
    pub description: String,
    pub message_count: u32,
    pub created_at: DateTime<Utc>,
}

impl From<&CheckpointRow> for CheckpointNode {
    fn from(row: &CheckpointRow) -> Self {
        Self {
            checkpoint_id: row.id.clone(),
            parent_id: row.parent_id.clone(),
            sequence: row.sequence,
            branch: row.branch.clone(),
            description: row.description.clone(),
            message_count: row.message_count,
            created_at: row.created_at,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct HistoryTree {
    pub thread_id: ThreadId,
    pub current_branch: String,
    pub current_checkpoint_id: CheckpointId,
    /// Creation order.
    pub checkpoints: Vec<CheckpointNode>,
    /// Branch name -> head checkpoint.
    pub branches: BTreeMap<String, CheckpointId>,
}

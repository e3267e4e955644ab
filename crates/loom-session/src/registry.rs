use std::collections::BTreeMap;

use chrono::{DateTime, Duration, Utc};
use rusqlite::Connection;
use secrecy::SecretString;
use serde_json::{Map, Value};
use tracing::{debug, info, instrument, warn};

use loom_core::chunks::StreamChunk;
use loom_core::ids::{CheckpointId, ThreadId};
use loom_core::state::message_count;
use loom_core::thinking::{extract_thinking, ThinkingBlock};
use loom_core::time;
use loom_settings::SessionSettings;
use loom_store::branches::{BranchRepo, BranchRow};
use loom_store::checkpoints::{CheckpointRepo, CheckpointRow};
use loom_store::chunks::ChunkRepo;
use loom_store::sessions::{SessionRepo, SessionRow, SessionStatus};
use loom_store::Database;

use crate::errors::{Result, SessionError};
use crate::locks::SessionLocks;
use crate::tokens::TokenService;
use crate::types::{
    BranchCreated, BranchSummary, BranchSwitched, CheckpointComparison, CheckpointNode,
    CreateBranchOptions, CreatedSession, HistoryTree, ReconnectInfo, ReconnectionState,
    ResumeBlocker, TimeTravelResult,
};

const ROOT_DESCRIPTION: &str = "session start";
const MAX_TOKEN_TTL_SECS: u64 = 7 * 24 * 3600;

#[derive(Clone, Debug)]
pub struct RegistryConfig {
    pub token_ttl: Duration,
    pub token_bytes: usize,
    pub default_branch: String,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self::from_settings(&SessionSettings::default())
    }
}

impl RegistryConfig {
    pub fn from_settings(settings: &SessionSettings) -> Self {
        Self {
            token_ttl: Duration::seconds(settings.token_ttl_secs.min(MAX_TOKEN_TTL_SECS) as i64),
            token_bytes: settings.token_bytes,
            default_branch: settings.default_branch.clone(),
        }
    }
}

/// Owns every session and coordinates the chunk log, checkpoint tree and
/// branch pointers on their behalf.
///
/// Each mutating call takes the session's lock, then does all its reads and
/// writes in one store transaction. Reads that need a consistent view of
/// several rows run in a read transaction without the session lock.
pub struct SessionRegistry {
    db: Database,
    tokens: TokenService,
    locks: SessionLocks,
    config: RegistryConfig,
}

impl SessionRegistry {
    pub fn new(db: Database, config: RegistryConfig) -> Self {
        let tokens = TokenService::new(config.token_ttl, config.token_bytes);
        Self {
            db,
            tokens,
            locks: SessionLocks::default(),
            config,
        }
    }

    pub fn config(&self) -> &RegistryConfig {
        &self.config
    }

    /// Run `f` inside the session's critical section.
    ///
    /// Unknown sessions fail with `NotFound` before any lock entry exists.
    /// An entry whose session disappeared while `f` waited is released again.
    fn with_session_lock<T>(
        &self,
        thread_id: &ThreadId,
        f: impl FnOnce() -> Result<T>,
    ) -> Result<T> {
        if !self.db.with_conn(|conn| SessionRepo::exists(conn, thread_id))? {
            return Err(SessionError::session_not_found(thread_id));
        }
        let lock = self.locks.get(thread_id);
        let out = {
            let _guard = lock.lock();
            f()
        };
        drop(lock);
        if out.as_ref().is_err_and(SessionError::is_session_not_found) {
            self.locks.release_idle(thread_id);
        }
        out
    }

    // ─────────────────────────────────────────────────────────────────────
    // Session lifecycle
    // ─────────────────────────────────────────────────────────────────────

    /// Create a session with a root checkpoint, the default branch pointing
    /// at it, an empty chunk buffer and an initial reconnect token.
    #[instrument(skip(self, metadata, initial_state), fields(thread_id = %thread_id))]
    pub fn create_session(
        &self,
        thread_id: &ThreadId,
        metadata: Map<String, Value>,
        initial_state: Option<Value>,
    ) -> Result<CreatedSession> {
        if thread_id.as_str().is_empty() {
            return Err(SessionError::InvalidArgument("thread_id must not be empty".into()));
        }

        let now = time::now();
        let issued = self.tokens.issue(now);
        let state = initial_state.unwrap_or_else(|| Value::Object(Map::new()));
        let branch = self.config.default_branch.clone();

        let root = CheckpointRow {
            id: CheckpointId::new(),
            thread_id: thread_id.clone(),
            parent_id: None,
            sequence: 0,
            message_count: message_count(&state),
            state,
            description: ROOT_DESCRIPTION.to_string(),
            branch: branch.clone(),
            created_at: now,
        };
        let session = SessionRow {
            thread_id: thread_id.clone(),
            status: SessionStatus::Active,
            current_branch: branch.clone(),
            current_checkpoint_id: root.id.clone(),
            token_digest: issued.digest,
            token_expires_at: issued.expires_at,
            last_stream_position: 0,
            metadata,
            created_at: now,
            updated_at: now,
        };

        let lock = self.locks.get(thread_id);
        let inserted = {
            let _guard = lock.lock();
            self.db.with_tx(|conn| {
                if SessionRepo::exists(conn, thread_id)? {
                    return Err(SessionError::AlreadyExists(format!("session {thread_id}")));
                }
                SessionRepo::insert(conn, &session)?;
                CheckpointRepo::insert(conn, &root)?;
                BranchRepo::insert(
                    conn,
                    &BranchRow {
                        thread_id: thread_id.clone(),
                        name: branch.clone(),
                        head_checkpoint_id: root.id.clone(),
                        created_at: now,
                    },
                )?;
                Ok(())
            })
        };
        drop(lock);
        if inserted.is_err() {
            self.locks.release_idle(thread_id);
        }
        inserted?;

        info!(root_checkpoint = %root.id, "session created");
        Ok(CreatedSession {
            session,
            reconnect_token: issued.token,
        })
    }

    #[instrument(skip(self), fields(thread_id = %thread_id))]
    pub fn get_session(&self, thread_id: &ThreadId) -> Result<SessionRow> {
        self.db.with_tx(|conn| load_session(conn, thread_id))
    }

    pub fn list_sessions(&self, status: Option<SessionStatus>) -> Result<Vec<SessionRow>> {
        self.db
            .with_tx(|conn| SessionRepo::list(conn, status).map_err(SessionError::from))
    }

    /// Write the status field. Idempotent.
    ///
    /// The stream cursor is left alone: chunks buffered while DISCONNECTED
    /// stay pending until they are acknowledged or replayed by `resume`.
    #[instrument(skip(self), fields(thread_id = %thread_id, status = %status))]
    pub fn update_status(&self, thread_id: &ThreadId, status: SessionStatus) -> Result<()> {
        self.with_session_lock(thread_id, || {
            self.db.with_tx(|conn| {
                if !SessionRepo::update_status(conn, thread_id, status, &time::now())? {
                    return Err(SessionError::session_not_found(thread_id));
                }
                Ok(())
            })
        })
    }

    /// Remove a session with its chunks, checkpoints and branches.
    #[instrument(skip(self), fields(thread_id = %thread_id))]
    pub fn delete_session(&self, thread_id: &ThreadId) -> Result<()> {
        self.with_session_lock(thread_id, || {
            self.db.with_tx(|conn| {
                if !SessionRepo::exists(conn, thread_id)? {
                    return Err(SessionError::session_not_found(thread_id));
                }
                let branches = BranchRepo::delete_for_thread(conn, thread_id)?;
                let chunks = ChunkRepo::delete_for_thread(conn, thread_id)?;
                let checkpoints = CheckpointRepo::delete_for_thread(conn, thread_id)?;
                ensure_written(SessionRepo::delete(conn, thread_id)?, thread_id, "session delete")?;
                debug!(branches, chunks, checkpoints, "session rows deleted");
                Ok(())
            })
        })?;
        self.locks.forget(thread_id);
        info!("session deleted");
        Ok(())
    }

    // ─────────────────────────────────────────────────────────────────────
    // Stream buffer
    // ─────────────────────────────────────────────────────────────────────

    /// Append a chunk and return its buffer index.
    ///
    /// The cursor follows the chunk only when the session is ACTIVE and the
    /// client has already received everything before it; the chunk is then
    /// delivered live. Otherwise the cursor stays put and the chunk waits
    /// for `acknowledge` or `resume`.
    #[instrument(skip(self, chunk), fields(thread_id = %thread_id, content_type = %chunk.content_type))]
    pub fn append_chunk(&self, thread_id: &ThreadId, mut chunk: StreamChunk) -> Result<u64> {
        chunk.timestamp = time::truncate_micros(chunk.timestamp);
        self.with_session_lock(thread_id, || {
            self.db.with_tx(|conn| {
                let session = load_session(conn, thread_id)?;
                if session.status == SessionStatus::Expired {
                    return Err(SessionError::Conflict(format!(
                        "session {thread_id} is expired"
                    )));
                }
                let position = ChunkRepo::append(conn, thread_id, &chunk)?;
                let caught_up = session.last_stream_position == position;
                if session.status == SessionStatus::Active && caught_up {
                    let written = SessionRepo::update_stream_position(
                        conn,
                        thread_id,
                        position + 1,
                        &time::now(),
                    )?;
                    ensure_written(written, thread_id, "stream position")?;
                }
                Ok(position)
            })
        })
    }

    /// Chunks with index >= `position`. Empty past the end.
    pub fn get_chunks_from(&self, thread_id: &ThreadId, position: u64) -> Result<Vec<StreamChunk>> {
        self.db.with_tx(|conn| {
            let _ = load_session(conn, thread_id)?;
            Ok(ChunkRepo::slice_from(conn, thread_id, position)?)
        })
    }

    /// Record that the client has received everything before `position`.
    /// The cursor never moves backwards; returns its resulting value.
    #[instrument(skip(self), fields(thread_id = %thread_id))]
    pub fn acknowledge(&self, thread_id: &ThreadId, position: u64) -> Result<u64> {
        self.with_session_lock(thread_id, || {
            self.db.with_tx(|conn| {
                let session = load_session(conn, thread_id)?;
                let len = ChunkRepo::count(conn, thread_id)?;
                if position > len {
                    return Err(SessionError::OutOfRange { position, len });
                }
                let cursor = session.last_stream_position.max(position);
                if cursor != session.last_stream_position {
                    let written =
                        SessionRepo::update_stream_position(conn, thread_id, cursor, &time::now())?;
                    ensure_written(written, thread_id, "stream position")?;
                }
                Ok(cursor)
            })
        })
    }

    // ─────────────────────────────────────────────────────────────────────
    // Reconnection
    // ─────────────────────────────────────────────────────────────────────

    pub fn mark_reconnectable(&self, thread_id: &ThreadId) -> Result<ReconnectInfo> {
        self.mark_reconnectable_at(thread_id, Utc::now())
    }

    /// Rotate the token, mark the session DISCONNECTED and report where the
    /// client left off. The previous token stops validating.
    #[instrument(skip(self), fields(thread_id = %thread_id))]
    pub fn mark_reconnectable_at(
        &self,
        thread_id: &ThreadId,
        now: DateTime<Utc>,
    ) -> Result<ReconnectInfo> {
        let now = time::truncate_micros(now);
        let issued = self.tokens.issue(now);
        let last_position = self.with_session_lock(thread_id, || {
            self.db.with_tx(|conn| {
                let session = load_session(conn, thread_id)?;
                if session.status == SessionStatus::Expired {
                    return Err(SessionError::Conflict(format!(
                        "session {thread_id} is expired"
                    )));
                }
                let written = SessionRepo::update_token(
                    conn,
                    thread_id,
                    &issued.digest,
                    &issued.expires_at,
                    &now,
                )?;
                ensure_written(written, thread_id, "token")?;
                let written =
                    SessionRepo::update_status(conn, thread_id, SessionStatus::Disconnected, &now)?;
                ensure_written(written, thread_id, "status")?;
                Ok(session.last_stream_position)
            })
        })?;

        info!(last_position, expires_at = %issued.expires_at, "session marked reconnectable");
        Ok(ReconnectInfo {
            reconnect_token: issued.token,
            thread_id: thread_id.clone(),
            last_position,
            expires_at: issued.expires_at,
        })
    }

    pub fn get_reconnection_state(
        &self,
        thread_id: &ThreadId,
        token: Option<&SecretString>,
    ) -> Result<ReconnectionState> {
        self.get_reconnection_state_at(thread_id, token, Utc::now())
    }

    /// Report what a reconnecting client would receive. Pure read: the
    /// cursor does not move.
    #[instrument(skip(self, token), fields(thread_id = %thread_id, with_token = token.is_some()))]
    pub fn get_reconnection_state_at(
        &self,
        thread_id: &ThreadId,
        token: Option<&SecretString>,
        now: DateTime<Utc>,
    ) -> Result<ReconnectionState> {
        let state = self.with_session_lock(thread_id, || {
            self.db
                .with_tx(|conn| self.reconnection_state(conn, thread_id, token, now))
        });
        unknown_session_blocks(state)
    }

    /// Validate the token, replay pending chunks and re-attach the client:
    /// status becomes ACTIVE and the cursor moves to the end of the buffer.
    #[instrument(skip(self, token), fields(thread_id = %thread_id))]
    pub fn resume(&self, thread_id: &ThreadId, token: &SecretString) -> Result<ReconnectionState> {
        self.resume_at(thread_id, token, Utc::now())
    }

    pub fn resume_at(
        &self,
        thread_id: &ThreadId,
        token: &SecretString,
        now: DateTime<Utc>,
    ) -> Result<ReconnectionState> {
        let state = unknown_session_blocks(self.with_session_lock(thread_id, || {
            self.db.with_tx(|conn| {
                let state = self.reconnection_state(conn, thread_id, Some(token), now)?;
                if state.can_resume {
                    let stamp = time::truncate_micros(now);
                    let end = state.last_stream_position + state.pending_chunks_count as u64;
                    let written = SessionRepo::update_stream_position(conn, thread_id, end, &stamp)?;
                    ensure_written(written, thread_id, "stream position")?;
                    let written =
                        SessionRepo::update_status(conn, thread_id, SessionStatus::Active, &stamp)?;
                    ensure_written(written, thread_id, "status")?;
                }
                Ok(state)
            })
        }))?;

        if state.can_resume {
            info!(replayed = state.pending_chunks_count, "session resumed");
        } else {
            warn!(reason = ?state.reason, "resume refused");
        }
        Ok(state)
    }

    /// Check a token without reading the stream.
    pub fn validate_token(&self, thread_id: &ThreadId, token: &SecretString) -> Result<()> {
        self.validate_token_at(thread_id, token, Utc::now())
    }

    pub fn validate_token_at(
        &self,
        thread_id: &ThreadId,
        token: &SecretString,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let session = self
            .db
            .with_tx(|conn| SessionRepo::get(conn, thread_id).map_err(SessionError::from))?
            .ok_or(SessionError::InvalidToken(ResumeBlocker::UnknownSession))?;
        self.tokens
            .validate(token, &session.token_digest, session.token_expires_at, now)
            .map_err(SessionError::InvalidToken)
    }

    fn reconnection_state(
        &self,
        conn: &Connection,
        thread_id: &ThreadId,
        token: Option<&SecretString>,
        now: DateTime<Utc>,
    ) -> Result<ReconnectionState> {
        let Some(session) = SessionRepo::get(conn, thread_id)? else {
            return Ok(ReconnectionState::blocked(ResumeBlocker::UnknownSession, None));
        };

        if let Some(token) = token {
            if let Err(reason) =
                self.tokens
                    .validate(token, &session.token_digest, session.token_expires_at, now)
            {
                debug!(%reason, "reconnect token rejected");
                return Ok(ReconnectionState::blocked(reason, Some(session.status)));
            }
        }

        if !session.status.is_resumable() {
            return Ok(ReconnectionState {
                success: true,
                can_resume: false,
                pending_chunks: Vec::new(),
                pending_chunks_count: 0,
                last_stream_position: session.last_stream_position,
                status: Some(session.status),
                reason: Some(ResumeBlocker::SessionExpired),
            });
        }

        let pending = ChunkRepo::slice_from(conn, thread_id, session.last_stream_position)?;
        Ok(ReconnectionState {
            success: true,
            can_resume: true,
            pending_chunks_count: pending.len(),
            pending_chunks: pending,
            last_stream_position: session.last_stream_position,
            status: Some(session.status),
            reason: None,
        })
    }

    /// Move DISCONNECTED sessions whose token expired before `now` to
    /// EXPIRED. Returns the affected thread ids.
    #[instrument(skip(self))]
    pub fn expire_stale_sessions(&self, now: DateTime<Utc>) -> Result<Vec<ThreadId>> {
        let stamp = time::truncate_micros(now);
        let candidates = self.list_sessions(Some(SessionStatus::Disconnected))?;
        let mut expired = Vec::new();
        for candidate in candidates.into_iter().filter(|s| s.token_expires_at < now) {
            let thread_id = candidate.thread_id;
            let changed = self.with_session_lock(&thread_id, || {
                self.db.with_tx(|conn| {
                    // Re-check under the lock; a resume may have raced the scan.
                    match SessionRepo::get(conn, &thread_id)? {
                        Some(s)
                            if s.status == SessionStatus::Disconnected
                                && s.token_expires_at < now =>
                        {
                            SessionRepo::update_status(conn, &thread_id, SessionStatus::Expired, &stamp)
                                .map_err(SessionError::from)
                        }
                        _ => Ok(false),
                    }
                })
            });
            match changed {
                Ok(true) => expired.push(thread_id),
                Ok(false) => {}
                // Deleted since the scan.
                Err(e) if e.is_session_not_found() => {}
                Err(e) => return Err(e),
            }
        }
        if !expired.is_empty() {
            info!(count = expired.len(), "stale sessions expired");
        }
        Ok(expired)
    }

    // ─────────────────────────────────────────────────────────────────────
    // Checkpoints & time travel
    // ─────────────────────────────────────────────────────────────────────

    /// Snapshot `state` as a child of the session's current checkpoint on the
    /// current branch. With `adopt`, the session pointer and the branch head
    /// move to the new checkpoint; without it neither moves.
    #[instrument(skip(self, state), fields(thread_id = %thread_id))]
    pub fn create_checkpoint(
        &self,
        thread_id: &ThreadId,
        state: Value,
        description: &str,
        adopt: bool,
    ) -> Result<CheckpointRow> {
        let checkpoint = self.with_session_lock(thread_id, || {
            self.db.with_tx(|conn| {
                let session = load_session(conn, thread_id)?;
                if CheckpointRepo::get_in_thread(conn, thread_id, &session.current_checkpoint_id)?
                    .is_none()
                {
                    return Err(SessionError::integrity(format!(
                        "session {thread_id} points at missing checkpoint {}",
                        session.current_checkpoint_id
                    )));
                }

                let now = time::now();
                let row = CheckpointRow {
                    id: CheckpointId::new(),
                    thread_id: thread_id.clone(),
                    parent_id: Some(session.current_checkpoint_id.clone()),
                    sequence: CheckpointRepo::next_sequence(conn, thread_id)?,
                    message_count: message_count(&state),
                    state,
                    description: description.to_string(),
                    branch: session.current_branch.clone(),
                    created_at: now,
                };
                CheckpointRepo::insert(conn, &row)?;

                if adopt {
                    let written = SessionRepo::update_pointer(
                        conn,
                        thread_id,
                        &session.current_branch,
                        &row.id,
                        &now,
                    )?;
                    ensure_written(written, thread_id, "checkpoint pointer")?;
                    if !BranchRepo::update_head(conn, thread_id, &session.current_branch, &row.id)? {
                        return Err(SessionError::integrity(format!(
                            "current branch {} of {thread_id} does not exist",
                            session.current_branch
                        )));
                    }
                }
                Ok(row)
            })
        })?;

        info!(checkpoint_id = %checkpoint.id, sequence = checkpoint.sequence, "checkpoint created");
        Ok(checkpoint)
    }

    /// Fetch a checkpoint that belongs to `thread_id`.
    pub fn get_checkpoint(
        &self,
        thread_id: &ThreadId,
        checkpoint_id: &CheckpointId,
    ) -> Result<CheckpointRow> {
        self.db.with_tx(|conn| load_checkpoint(conn, thread_id, checkpoint_id))
    }

    /// Every checkpoint of the session in creation order.
    pub fn list_checkpoints(&self, thread_id: &ThreadId) -> Result<Vec<CheckpointRow>> {
        self.db.with_tx(|conn| {
            let _ = load_session(conn, thread_id)?;
            Ok(CheckpointRepo::list(conn, thread_id)?)
        })
    }

    /// Root-first path ending at `checkpoint_id`.
    pub fn get_ancestors(
        &self,
        thread_id: &ThreadId,
        checkpoint_id: &CheckpointId,
    ) -> Result<Vec<CheckpointRow>> {
        self.db.with_tx(|conn| {
            let _ = load_checkpoint(conn, thread_id, checkpoint_id)?;
            let chain = CheckpointRepo::ancestors(conn, checkpoint_id)?;
            if chain.first().is_some_and(|root| root.parent_id.is_some()) {
                return Err(SessionError::integrity(format!(
                    "ancestor chain of {checkpoint_id} does not reach a root"
                )));
            }
            Ok(chain)
        })
    }

    /// Point the session at an existing checkpoint. Nothing is deleted;
    /// later checkpoints stay in the tree.
    #[instrument(skip(self), fields(thread_id = %thread_id, checkpoint_id = %checkpoint_id))]
    pub fn time_travel(
        &self,
        thread_id: &ThreadId,
        checkpoint_id: &CheckpointId,
    ) -> Result<TimeTravelResult> {
        let result = self.with_session_lock(thread_id, || {
            self.db.with_tx(|conn| {
                let session = load_session(conn, thread_id)?;
                let target = load_checkpoint(conn, thread_id, checkpoint_id)?;
                let written = SessionRepo::update_pointer(
                    conn,
                    thread_id,
                    &session.current_branch,
                    &target.id,
                    &time::now(),
                )?;
                ensure_written(written, thread_id, "checkpoint pointer")?;
                Ok(TimeTravelResult {
                    success: true,
                    checkpoint_id: target.id,
                    description: target.description,
                    message_count: target.message_count,
                })
            })
        })?;
        info!(message_count = result.message_count, "time travel");
        Ok(result)
    }

    /// Compare two immutable checkpoints. Needs no session lock.
    pub fn compare_checkpoints(
        &self,
        id_a: &CheckpointId,
        id_b: &CheckpointId,
    ) -> Result<CheckpointComparison> {
        self.db.with_tx(|conn| {
            let a = CheckpointRepo::get(conn, id_a)?
                .ok_or_else(|| SessionError::checkpoint_not_found(id_a))?;
            let b = CheckpointRepo::get(conn, id_b)?
                .ok_or_else(|| SessionError::checkpoint_not_found(id_b))?;
            let message_count_diff = i64::from(b.message_count) - i64::from(a.message_count);
            Ok(CheckpointComparison {
                checkpoint_1: a,
                checkpoint_2: b,
                message_count_diff,
            })
        })
    }

    // ─────────────────────────────────────────────────────────────────────
    // Branches
    // ─────────────────────────────────────────────────────────────────────

    /// Create a named pointer at an existing checkpoint. No checkpoint is
    /// copied; later checkpoints made on the branch chain from its head.
    #[instrument(skip(self, opts), fields(thread_id = %thread_id, branch = name, switch = opts.switch))]
    pub fn create_branch(
        &self,
        thread_id: &ThreadId,
        name: &str,
        opts: CreateBranchOptions,
    ) -> Result<BranchCreated> {
        if name.trim().is_empty() {
            return Err(SessionError::InvalidArgument("branch name must not be empty".into()));
        }
        let created = self.with_session_lock(thread_id, || {
            self.db.with_tx(|conn| {
                let session = load_session(conn, thread_id)?;
                if BranchRepo::get(conn, thread_id, name)?.is_some() {
                    return Err(SessionError::Conflict(format!(
                        "branch {name} already exists in {thread_id}"
                    )));
                }
                let source = opts
                    .from_checkpoint_id
                    .clone()
                    .unwrap_or_else(|| session.current_checkpoint_id.clone());
                let head = load_checkpoint(conn, thread_id, &source)?;

                let now = time::now();
                BranchRepo::insert(
                    conn,
                    &BranchRow {
                        thread_id: thread_id.clone(),
                        name: name.to_string(),
                        head_checkpoint_id: head.id.clone(),
                        created_at: now,
                    },
                )?;
                if opts.switch {
                    let written = SessionRepo::update_pointer(conn, thread_id, name, &head.id, &now)?;
                    ensure_written(written, thread_id, "checkpoint pointer")?;
                }
                Ok(BranchCreated {
                    success: true,
                    branch: name.to_string(),
                    branch_checkpoint_id: head.id.clone(),
                    source_checkpoint_id: head.id,
                })
            })
        })?;
        info!(head = %created.branch_checkpoint_id, "branch created");
        Ok(created)
    }

    /// Make `name` the current branch and move the session to its head.
    #[instrument(skip(self), fields(thread_id = %thread_id, branch = name))]
    pub fn switch_branch(&self, thread_id: &ThreadId, name: &str) -> Result<BranchSwitched> {
        self.with_session_lock(thread_id, || {
            self.db.with_tx(|conn| {
                let _ = load_session(conn, thread_id)?;
                let branch = BranchRepo::get(conn, thread_id, name)?
                    .ok_or_else(|| SessionError::branch_not_found(name))?;
                let head =
                    CheckpointRepo::get_in_thread(conn, thread_id, &branch.head_checkpoint_id)?
                        .ok_or_else(|| {
                            SessionError::integrity(format!(
                                "branch {name} head {} is missing",
                                branch.head_checkpoint_id
                            ))
                        })?;
                let written =
                    SessionRepo::update_pointer(conn, thread_id, name, &head.id, &time::now())?;
                ensure_written(written, thread_id, "checkpoint pointer")?;
                Ok(BranchSwitched {
                    success: true,
                    branch: name.to_string(),
                    checkpoint_id: head.id,
                    message_count: head.message_count,
                })
            })
        })
    }

    /// Branches in creation order. Exactly one is current.
    pub fn list_branches(&self, thread_id: &ThreadId) -> Result<Vec<BranchSummary>> {
        self.db.with_tx(|conn| {
            let session = load_session(conn, thread_id)?;
            let mut summaries = Vec::new();
            for branch in BranchRepo::list(conn, thread_id)? {
                let head =
                    CheckpointRepo::get_in_thread(conn, thread_id, &branch.head_checkpoint_id)?
                        .ok_or_else(|| {
                            SessionError::integrity(format!(
                                "branch {} head {} is missing",
                                branch.name, branch.head_checkpoint_id
                            ))
                        })?;
                summaries.push(BranchSummary {
                    is_current: branch.name == session.current_branch,
                    name: branch.name,
                    head_checkpoint_id: head.id,
                    message_count: head.message_count,
                });
            }
            Ok(summaries)
        })
    }

    /// The whole tree: every checkpoint in creation order plus branch heads.
    pub fn get_history_tree(&self, thread_id: &ThreadId) -> Result<HistoryTree> {
        self.db.with_tx(|conn| {
            let session = load_session(conn, thread_id)?;
            let checkpoints = CheckpointRepo::list(conn, thread_id)?;
            let branches: BTreeMap<String, CheckpointId> = BranchRepo::list(conn, thread_id)?
                .into_iter()
                .map(|b| (b.name, b.head_checkpoint_id))
                .collect();
            Ok(HistoryTree {
                thread_id: session.thread_id,
                current_branch: session.current_branch,
                current_checkpoint_id: session.current_checkpoint_id,
                checkpoints: checkpoints.iter().map(CheckpointNode::from).collect(),
                branches,
            })
        })
    }

    // ─────────────────────────────────────────────────────────────────────
    // Reasoning
    // ─────────────────────────────────────────────────────────────────────

    /// Reasoning content over the session's whole buffer.
    pub fn get_thinking_summary(&self, thread_id: &ThreadId) -> Result<ThinkingBlock> {
        self.get_thinking_summary_since(thread_id, 0)
    }

    /// Reasoning content over chunks with index >= `position`.
    pub fn get_thinking_summary_since(
        &self,
        thread_id: &ThreadId,
        position: u64,
    ) -> Result<ThinkingBlock> {
        let chunks = self.get_chunks_from(thread_id, position)?;
        Ok(extract_thinking(&chunks))
    }
}

fn load_session(conn: &Connection, thread_id: &ThreadId) -> Result<SessionRow> {
    SessionRepo::get(conn, thread_id)?.ok_or_else(|| SessionError::session_not_found(thread_id))
}

/// Checkpoints from other sessions are reported as not found.
fn load_checkpoint(
    conn: &Connection,
    thread_id: &ThreadId,
    checkpoint_id: &CheckpointId,
) -> Result<CheckpointRow> {
    let _ = load_session(conn, thread_id)?;
    CheckpointRepo::get_in_thread(conn, thread_id, checkpoint_id)?
        .ok_or_else(|| SessionError::checkpoint_not_found(checkpoint_id))
}

/// A write to a session row loaded earlier in the same transaction must
/// touch that row.
fn ensure_written(changed: bool, thread_id: &ThreadId, what: &str) -> Result<()> {
    if changed {
        Ok(())
    } else {
        Err(SessionError::integrity(format!(
            "{what} update on session {thread_id} matched no row"
        )))
    }
}

/// Reconnection lookups report an unknown session as a result, not an error.
fn unknown_session_blocks(state: Result<ReconnectionState>) -> Result<ReconnectionState> {
    match state {
        Err(e) if e.is_session_not_found() => {
            Ok(ReconnectionState::blocked(ResumeBlocker::UnknownSession, None))
        }
        other => other,
    }
}

use loom_store::StoreError;

use crate::types::ResumeBlocker;

/// Errors surfaced by [`crate::SessionRegistry`].
///
/// Bad ids, names and tokens from callers are ordinary runtime conditions
/// and map to the typed variants. `Integrity` means the store no longer
/// satisfies the tree invariants and is a bug in this crate.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },

    #[error("already exists: {0}")]
    AlreadyExists(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("invalid token: {0}")]
    InvalidToken(ResumeBlocker),

    #[error("position {position} out of range (buffer holds {len})")]
    OutOfRange { position: u64, len: u64 },

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("integrity violation: {0}")]
    Integrity(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}

pub type Result<T> = std::result::Result<T, SessionError>;

impl SessionError {
    pub(crate) fn session_not_found(id: impl std::fmt::Display) -> Self {
        Self::NotFound {
            kind: "session",
            id: id.to_string(),
        }
    }

    pub(crate) fn checkpoint_not_found(id: impl std::fmt::Display) -> Self {
        Self::NotFound {
            kind: "checkpoint",
            id: id.to_string(),
        }
    }

    pub(crate) fn branch_not_found(id: impl std::fmt::Display) -> Self {
        Self::NotFound {
            kind: "branch",
            id: id.to_string(),
        }
    }

    /// A broken tree invariant. Panics in debug builds.
    pub(crate) fn integrity(detail: impl Into<String>) -> Self {
        let detail = detail.into();
        tracing::error!(%detail, "session store integrity violation");
        debug_assert!(false, "integrity violation: {detail}");
        Self::Integrity(detail)
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    pub(crate) fn is_session_not_found(&self) -> bool {
        matches!(self, Self::NotFound { kind: "session", .. })
    }
}

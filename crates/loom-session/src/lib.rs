//! Session lifecycle, stream replay, checkpoint time travel and branching
//! for long-running agent conversations.
//!
//! [`SessionRegistry`] is the only entry point. Construct one per process
//! around a [`loom_store::Database`] and share it by reference or `Arc`.

pub mod errors;
mod locks;
pub mod registry;
pub mod tokens;
pub mod types;

pub use errors::{Result, SessionError};
pub use registry::{RegistryConfig, SessionRegistry};
pub use tokens::{IssuedToken, TokenService};
pub use types::*;

pub use loom_core::{ContentType, StreamChunk, ThinkingBlock};
pub use loom_core::ids::{CheckpointId, ThreadId};
pub use loom_store::checkpoints::CheckpointRow as Checkpoint;
pub use loom_store::sessions::{SessionRow as Session, SessionStatus};

use std::path::PathBuf;

use anyhow::{Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use secrecy::{ExposeSecret, SecretString};
use serde_json::{json, Map, Value};

use loom_core::ids::{CheckpointId, ThreadId};
use loom_core::{ContentType, StreamChunk};
use loom_session::{CreateBranchOptions, RegistryConfig, SessionRegistry, SessionStatus};
use loom_settings::load_settings;
use loom_store::Database;
use loom_telemetry::{init_telemetry, TelemetryConfig};

/// Inspect and drive a loom session store.
#[derive(Parser)]
#[command(name = "loom", version)]
struct Cli {
    /// SQLite store file. Defaults to the configured `store.dbPath`.
    #[arg(long, global = true)]
    db: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Open a new session with a root checkpoint and a main branch.
    Create {
        thread: String,
        /// Initial state for the root checkpoint, as JSON.
        #[arg(long)]
        state: Option<String>,
    },
    /// Print a session record.
    Show { thread: String },
    /// List sessions, optionally filtered by status.
    Sessions {
        #[arg(long)]
        status: Option<SessionStatus>,
    },
    /// Append a chunk to the stream buffer.
    Append {
        thread: String,
        /// text, thinking, tool_call or tool_result
        content_type: ContentType,
        content: String,
    },
    /// Acknowledge delivery up to a buffer position.
    Ack { thread: String, position: u64 },
    /// Snapshot state as a child of the current checkpoint.
    Checkpoint {
        thread: String,
        state: String,
        description: String,
        /// Make the new checkpoint current and advance the branch head.
        #[arg(long)]
        adopt: bool,
    },
    /// Move the session to an existing checkpoint.
    Travel { thread: String, checkpoint: String },
    /// Create a branch at a checkpoint.
    Branch {
        thread: String,
        name: String,
        #[arg(long)]
        from: Option<String>,
        #[arg(long)]
        switch: bool,
    },
    /// Make a branch current.
    Switch { thread: String, name: String },
    /// List a session's branches.
    Branches { thread: String },
    /// Print the checkpoint tree.
    Tree { thread: String },
    /// Compare the message counts of two checkpoints.
    Compare { a: String, b: String },
    /// Issue a reconnect token and mark the session disconnected.
    Disconnect { thread: String },
    /// Show what a reconnecting client would receive.
    Reconnect {
        thread: String,
        #[arg(long)]
        token: Option<String>,
        /// Replay and re-attach instead of only inspecting.
        #[arg(long, requires = "token")]
        resume: bool,
    },
    /// Summarise reasoning content in the stream buffer.
    Thinking {
        thread: String,
        #[arg(long, default_value_t = 0)]
        since: u64,
    },
    /// Expire disconnected sessions whose token has lapsed.
    Sweep,
    /// Remove a session and everything it owns.
    Delete { thread: String },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let settings = load_settings().context("failed to load settings")?;
    let _telemetry = init_telemetry(TelemetryConfig::from_settings(&settings.logging));

    let db_path = cli.db.unwrap_or_else(|| settings.store.db_path.clone());
    let db = Database::open(&db_path)
        .with_context(|| format!("failed to open store at {}", db_path.display()))?;
    let registry = SessionRegistry::new(db, RegistryConfig::from_settings(&settings.session));

    let output = run(&registry, cli.command)?;
    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(())
}

fn run(registry: &SessionRegistry, command: Command) -> Result<Value> {
    let out = match command {
        Command::Create { thread, state } => {
            let initial_state = state.as_deref().map(parse_json).transpose()?;
            let created = registry.create_session(&thread_id(&thread), Map::new(), initial_state)?;
            json!({
                "session": created.session,
                "reconnectToken": created.reconnect_token.expose_secret(),
            })
        }
        Command::Show { thread } => serde_json::to_value(registry.get_session(&thread_id(&thread))?)?,
        Command::Sessions { status } => serde_json::to_value(registry.list_sessions(status)?)?,
        Command::Append {
            thread,
            content_type,
            content,
        } => {
            let position =
                registry.append_chunk(&thread_id(&thread), StreamChunk::new(content_type, content))?;
            json!({ "position": position })
        }
        Command::Ack { thread, position } => {
            let cursor = registry.acknowledge(&thread_id(&thread), position)?;
            json!({ "lastStreamPosition": cursor })
        }
        Command::Checkpoint {
            thread,
            state,
            description,
            adopt,
        } => {
            let state = parse_json(&state)?;
            serde_json::to_value(registry.create_checkpoint(&thread_id(&thread), state, &description, adopt)?)?
        }
        Command::Travel { thread, checkpoint } => serde_json::to_value(
            registry.time_travel(&thread_id(&thread), &CheckpointId::from_raw(checkpoint))?,
        )?,
        Command::Branch {
            thread,
            name,
            from,
            switch,
        } => {
            let opts = CreateBranchOptions {
                from_checkpoint_id: from.map(CheckpointId::from_raw),
                switch,
            };
            serde_json::to_value(registry.create_branch(&thread_id(&thread), &name, opts)?)?
        }
        Command::Switch { thread, name } => {
            serde_json::to_value(registry.switch_branch(&thread_id(&thread), &name)?)?
        }
        Command::Branches { thread } => {
            serde_json::to_value(registry.list_branches(&thread_id(&thread))?)?
        }
        Command::Tree { thread } => {
            serde_json::to_value(registry.get_history_tree(&thread_id(&thread))?)?
        }
        Command::Compare { a, b } => serde_json::to_value(
            registry.compare_checkpoints(&CheckpointId::from_raw(a), &CheckpointId::from_raw(b))?,
        )?,
        Command::Disconnect { thread } => {
            let info = registry.mark_reconnectable(&thread_id(&thread))?;
            json!({
                "threadId": info.thread_id,
                "reconnectToken": info.reconnect_token.expose_secret(),
                "lastPosition": info.last_position,
                "expiresAt": info.expires_at,
            })
        }
        Command::Reconnect {
            thread,
            token,
            resume,
        } => {
            let id = thread_id(&thread);
            let token = token.map(SecretString::from);
            let state = match (&token, resume) {
                (Some(token), true) => registry.resume(&id, token)?,
                _ => registry.get_reconnection_state(&id, token.as_ref())?,
            };
            serde_json::to_value(state)?
        }
        Command::Thinking { thread, since } => serde_json::to_value(
            registry.get_thinking_summary_since(&thread_id(&thread), since)?,
        )?,
        Command::Sweep => {
            let expired = registry.expire_stale_sessions(Utc::now())?;
            json!({ "expired": expired })
        }
        Command::Delete { thread } => {
            registry.delete_session(&thread_id(&thread))?;
            tracing::info!(thread_id = %thread, "deleted");
            json!({ "deleted": thread })
        }
    };
    Ok(out)
}

fn thread_id(raw: &str) -> ThreadId {
    ThreadId::from_raw(raw)
}

fn parse_json(raw: &str) -> Result<Value> {
    serde_json::from_str(raw).with_context(|| format!("invalid JSON: {raw}"))
}

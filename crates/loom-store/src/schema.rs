/// SQL DDL for the loom store.
/// WAL mode + foreign keys enabled at connection time.
///
/// `sessions.current_checkpoint_id` carries no foreign key: sessions and
/// checkpoints reference each other, so that pointer is kept valid by the
/// registry inside the same transaction that writes it.
pub const SCHEMA_VERSION: u32 = 1;

pub const CREATE_TABLES: &str = r#"
CREATE TABLE IF NOT EXISTS sessions (
    thread_id TEXT PRIMARY KEY,
    status TEXT NOT NULL DEFAULT 'active',
    current_branch TEXT NOT NULL,
    current_checkpoint_id TEXT NOT NULL,
    token_digest TEXT NOT NULL,
    token_expires_at TEXT NOT NULL,
    last_stream_position INTEGER NOT NULL DEFAULT 0,
    metadata TEXT NOT NULL DEFAULT '{}',
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS chunks (
    thread_id TEXT NOT NULL REFERENCES sessions(thread_id),
    position INTEGER NOT NULL,
    content_type TEXT NOT NULL,
    content TEXT NOT NULL,
    metadata TEXT NOT NULL DEFAULT '{}',
    timestamp TEXT NOT NULL,
    PRIMARY KEY (thread_id, position)
);

CREATE TABLE IF NOT EXISTS checkpoints (
    id TEXT PRIMARY KEY,
    thread_id TEXT NOT NULL REFERENCES sessions(thread_id),
    parent_id TEXT REFERENCES checkpoints(id),
    sequence INTEGER NOT NULL,
    state TEXT NOT NULL,
    description TEXT NOT NULL,
    branch TEXT NOT NULL,
    message_count INTEGER NOT NULL,
    created_at TEXT NOT NULL,
    UNIQUE (thread_id, sequence)
);

CREATE TABLE IF NOT EXISTS branches (
    thread_id TEXT NOT NULL REFERENCES sessions(thread_id),
    name TEXT NOT NULL,
    head_checkpoint_id TEXT NOT NULL REFERENCES checkpoints(id),
    created_at TEXT NOT NULL,
    PRIMARY KEY (thread_id, name)
);

CREATE INDEX IF NOT EXISTS idx_checkpoints_thread_seq ON checkpoints(thread_id, sequence);
CREATE INDEX IF NOT EXISTS idx_checkpoints_parent ON checkpoints(parent_id);
CREATE INDEX IF NOT EXISTS idx_sessions_status ON sessions(status);

CREATE TABLE IF NOT EXISTS schema_version (
    version INTEGER NOT NULL
);
"#;

pub const PRAGMAS: &str = r#"
PRAGMA journal_mode = WAL;
PRAGMA foreign_keys = ON;
PRAGMA busy_timeout = 5000;
PRAGMA synchronous = NORMAL;
"#;

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Root settings type.
///
/// All field names are camelCase in JSON. Missing fields take their default,
/// so a partial file like `{"session": {"tokenTtlSecs": 600}}` is valid.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LoomSettings {
    pub store: StoreSettings,
    pub session: SessionSettings,
    pub logging: LoggingSettings,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct StoreSettings {
    /// SQLite database file.
    pub db_path: PathBuf,
}

impl Default for StoreSettings {
    fn default() -> Self {
        Self {
            db_path: crate::loader::loom_home().join("database").join("loom.db"),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SessionSettings {
    /// Lifetime of a reconnect token from issuance.
    pub token_ttl_secs: u64,
    /// Random bytes per reconnect token before encoding.
    pub token_bytes: usize,
    /// Name of the branch created with every session.
    pub default_branch: String,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            token_ttl_secs: 3600,
            token_bytes: 32,
            default_branch: "main".to_string(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LoggingSettings {
    /// Default level filter. `RUST_LOG` still wins when set.
    pub level: String,
    /// Emit JSON lines instead of human-readable output.
    pub json: bool,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

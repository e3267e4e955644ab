use parking_lot::RwLock;
use tracing::Level;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{reload, EnvFilter, Layer, Registry};

use loom_settings::LoggingSettings;

/// Configuration for the telemetry subsystem.
#[derive(Clone, Debug)]
pub struct TelemetryConfig {
    /// Default log level. Overridden by RUST_LOG env var.
    pub log_level: Level,
    /// Per-module level overrides (e.g. "loom_store" => DEBUG).
    pub module_levels: Vec<(String, Level)>,
    /// JSON lines instead of the human-readable formatter.
    pub json: bool,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            log_level: Level::INFO,
            module_levels: Vec::new(),
            json: false,
        }
    }
}

impl TelemetryConfig {
    /// Build from loaded settings. An unparseable level falls back to INFO.
    pub fn from_settings(settings: &LoggingSettings) -> Self {
        Self {
            log_level: settings.level.parse().unwrap_or(Level::INFO),
            module_levels: Vec::new(),
            json: settings.json,
        }
    }
}

type FilterHandle = reload::Handle<EnvFilter, Registry>;

/// Handle returned by [`init_telemetry`]. Keeps the live filter adjustable.
pub struct TelemetryGuard {
    base_directives: String,
    module_levels: RwLock<Vec<(String, Level)>>,
    filter: FilterHandle,
}

impl TelemetryGuard {
    /// Set a per-module level and swap it into the installed filter.
    pub fn set_module_level(&self, module: &str, level: Level) {
        let directives = {
            let mut levels = self.module_levels.write();
            if let Some(entry) = levels.iter_mut().find(|(m, _)| m == module) {
                entry.1 = level;
            } else {
                levels.push((module.to_string(), level));
            }
            join_directives(&self.base_directives, &levels)
        };

        let filter = match EnvFilter::try_new(&directives) {
            Ok(filter) => filter,
            Err(e) => {
                tracing::warn!(%directives, "invalid log filter: {e}");
                return;
            }
        };
        if let Err(e) = self.filter.reload(filter) {
            tracing::warn!(%directives, "failed to reload log filter: {e}");
        }
    }

    /// Get current per-module log level overrides.
    pub fn module_levels(&self) -> Vec<(String, Level)> {
        self.module_levels.read().clone()
    }

    /// The filter currently in effect, or `None` once the subscriber is gone.
    pub fn current_filter(&self) -> Option<String> {
        self.filter.with_current(|filter| filter.to_string()).ok()
    }
}

fn join_directives(base: &str, modules: &[(String, Level)]) -> String {
    let mut filter_str = base.to_string();
    for (module, level) in modules {
        filter_str.push_str(&format!(",{}={}", module, level.to_string().to_lowercase()));
    }
    filter_str
}

/// Build the reloadable filter layer and the guard that drives it.
fn reloadable_filter(
    base_directives: String,
    module_levels: Vec<(String, Level)>,
) -> (reload::Layer<EnvFilter, Registry>, TelemetryGuard) {
    let directives = join_directives(&base_directives, &module_levels);
    let filter = EnvFilter::try_new(&directives).unwrap_or_else(|_| EnvFilter::new("info"));
    let (layer, filter) = reload::Layer::new(filter);
    let guard = TelemetryGuard {
        base_directives,
        module_levels: RwLock::new(module_levels),
        filter,
    };
    (layer, guard)
}

/// Initialize the telemetry subsystem. Call once at startup; later calls
/// leave the first subscriber in place.
///
/// Logs go to stderr so stdout stays free for command output.
pub fn init_telemetry(config: TelemetryConfig) -> TelemetryGuard {
    // RUST_LOG replaces the configured level; module overrides still apply.
    let base_directives = std::env::var(EnvFilter::DEFAULT_ENV)
        .ok()
        .filter(|v| EnvFilter::try_new(v).is_ok())
        .unwrap_or_else(|| config.log_level.to_string().to_lowercase());
    let (filter_layer, guard) = reloadable_filter(base_directives, config.module_levels.clone());

    let fmt_layer = if config.json {
        tracing_subscriber::fmt::layer()
            .json()
            .with_writer(std::io::stderr)
            .with_target(true)
            .with_span_list(true)
            .boxed()
    } else {
        tracing_subscriber::fmt::layer()
            .compact()
            .with_writer(std::io::stderr)
            .with_target(true)
            .boxed()
    };

    if let Err(e) = tracing_subscriber::registry()
        .with(filter_layer)
        .with(fmt_layer)
        .try_init()
    {
        tracing::debug!("telemetry already initialised: {e}");
    }

    guard
}

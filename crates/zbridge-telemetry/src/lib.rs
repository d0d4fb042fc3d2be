use std::sync::Arc;

use parking_lot::RwLock;
use tracing::Level;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

/// Configuration for the telemetry subsystem.
#[derive(Clone, Debug)]
pub struct TelemetryConfig {
    /// Default log level. Overridden by RUST_LOG env var.
    pub log_level: Level,
    /// Per-module level overrides (e.g. "zbridge_server" => DEBUG).
    pub module_levels: Vec<(String, Level)>,
    /// Emit JSON-formatted log lines instead of human-readable ones.
    pub json_output: bool,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            log_level: Level::INFO,
            module_levels: Vec::new(),
            json_output: true,
        }
    }
}

/// Guard holding runtime-adjustable telemetry state.
pub struct TelemetryGuard {
    level_filter: Arc<RwLock<Vec<(String, Level)>>>,
}

impl TelemetryGuard {
    /// Change the log level for a specific module at runtime.
    pub fn set_module_level(&self, module: &str, level: Level) {
        let mut levels = self.level_filter.write();
        if let Some(entry) = levels.iter_mut().find(|(m, _)| m == module) {
            entry.1 = level;
        } else {
            levels.push((module.to_string(), level));
        }
    }

    /// Get current per-module log level overrides.
    pub fn module_levels(&self) -> Vec<(String, Level)> {
        self.level_filter.read().clone()
    }
}

/// Initialize the telemetry subsystem. Call once at startup.
pub fn init_telemetry(config: TelemetryConfig) -> TelemetryGuard {
    let level_filter = Arc::new(RwLock::new(config.module_levels.clone()));

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(filter_string(&config)));

    if config.json_output {
        let fmt_layer = tracing_subscriber::fmt::layer()
            .json()
            .with_target(true)
            .with_span_list(true)
            .with_filter(env_filter);
        tracing_subscriber::registry().with(fmt_layer).init();
    } else {
        let fmt_layer = tracing_subscriber::fmt::layer()
            .with_target(true)
            .with_filter(env_filter);
        tracing_subscriber::registry().with(fmt_layer).init();
    }

    TelemetryGuard { level_filter }
}

/// Build the env-filter directive string from config.
fn filter_string(config: &TelemetryConfig) -> String {
    let mut filter = config.log_level.to_string().to_lowercase();
    for (module, level) in &config.module_levels {
        filter.push_str(&format!(",{}={}", module, level.to_string().to_lowercase()));
    }
    filter
}

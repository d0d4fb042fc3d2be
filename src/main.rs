use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tracing::Level;
use zbridge_core::BridgeError;
use zbridge_server::{
    AutoApproveForms, Collaborators, FnExecutor, InMemorySchemaStore, OverflowPolicy,
    ServerConfig, StaticWalkerEngine,
};
use zbridge_telemetry::{init_telemetry, TelemetryConfig};

#[derive(Parser)]
#[command(name = "zbridge", about = "WebSocket message bridge runtime", version)]
struct Args {
    /// Port to listen on
    #[arg(long, default_value_t = 9092)]
    port: u16,

    /// Per-connection outbound queue capacity
    #[arg(long, default_value_t = 1000)]
    queue_capacity: usize,

    /// What to do when a connection's queue overflows: drop | disconnect
    #[arg(long, default_value = "disconnect")]
    overflow_policy: String,

    /// Bounded drain timeout on graceful close, in seconds
    #[arg(long, default_value_t = 5)]
    drain_timeout_secs: u64,

    /// Default query-cache TTL in seconds (1..=3600)
    #[arg(long, default_value_t = 60)]
    cache_ttl_secs: u64,

    /// Directory of <model>.json schema files to serve
    #[arg(long)]
    schema_dir: Option<PathBuf>,

    /// Human-readable log lines instead of JSON
    #[arg(long)]
    plain_logs: bool,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    let _telemetry = init_telemetry(TelemetryConfig {
        log_level: Level::INFO,
        module_levels: Vec::new(),
        json_output: !args.plain_logs,
    });

    tracing::info!("Starting bridge server");

    let overflow_policy = match args.overflow_policy.as_str() {
        "drop" => OverflowPolicy::Drop,
        "disconnect" => OverflowPolicy::Disconnect,
        other => {
            eprintln!("Unknown overflow policy: {other} (expected drop | disconnect)");
            std::process::exit(2);
        }
    };

    let schemas = Arc::new(InMemorySchemaStore::new());
    if let Some(dir) = &args.schema_dir {
        match load_schemas(&schemas, dir) {
            Ok(count) => tracing::info!(count = count, dir = %dir.display(), "Schemas loaded"),
            Err(err) => {
                eprintln!("Failed to load schemas from {}: {err}", dir.display());
                std::process::exit(1);
            }
        }
    }

    let collaborators = Collaborators {
        schemas,
        executor: Arc::new(builtin_executor()),
        walkers: Arc::new(StaticWalkerEngine::new()),
        forms: Arc::new(AutoApproveForms),
    };

    let config = ServerConfig {
        port: args.port,
        queue_capacity: args.queue_capacity,
        overflow_policy,
        drain_timeout_secs: args.drain_timeout_secs,
        default_cache_ttl_secs: args.cache_ttl_secs,
    };

    let handle = match zbridge_server::start(config, collaborators).await {
        Ok(handle) => handle,
        Err(err) => {
            eprintln!("Failed to start server: {err}");
            std::process::exit(1);
        }
    };

    tracing::info!(port = handle.port, "Bridge server ready");

    if tokio::signal::ctrl_c().await.is_err() {
        tracing::error!("Failed to listen for ctrl+c");
    }

    tracing::info!("Shutting down");
    handle.shutdown().await;
}

/// Built-in commands served without an external backend. Everything else
/// reports an executor error envelope.
fn builtin_executor() -> FnExecutor {
    FnExecutor::new(|command, _args| match command {
        "GetServerTime" => Ok(serde_json::json!(chrono::Utc::now().to_rfc3339())),
        "GetBridgeVersion" => Ok(serde_json::json!(env!("CARGO_PKG_VERSION"))),
        other => Err(BridgeError::Executor(format!(
            "no backend configured for command: {other}"
        ))),
    })
}

/// Load every `<model>.json` in a directory into the schema store.
fn load_schemas(store: &InMemorySchemaStore, dir: &PathBuf) -> std::io::Result<usize> {
    let mut count = 0usize;
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        if path.extension().and_then(|e| e.to_str()) != Some("json") {
            continue;
        }
        let Some(model) = path.file_stem().and_then(|s| s.to_str()) else {
            continue;
        };
        let raw = std::fs::read_to_string(&path)?;
        match serde_json::from_str(&raw) {
            Ok(schema) => {
                store.insert(model, schema);
                count += 1;
            }
            Err(err) => {
                tracing::warn!(path = %path.display(), error = %err, "Skipping unparseable schema");
            }
        }
    }
    Ok(count)
}

//! Seams to the external collaborators the bridge orchestrates.
//!
//! Credential validation, schema loading, business-logic command execution,
//! form validation, and the rendering engine all live outside this crate.
//! The bridge depends only on these traits; each has an in-memory
//! implementation usable by the binary and by tests.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use serde_json::Value;
use zbridge_core::{BridgeError, Chunk, ScriptedSequence, StepSequence, WalkerSource};

/// Business-logic command execution. Implementations performing CPU-bound or
/// blocking work must off-load internally (e.g. `spawn_blocking`) so a slow
/// command cannot stall message routing for other connections.
#[async_trait]
pub trait CommandExecutor: Send + Sync {
    async fn execute(&self, command: &str, args: &Value) -> Result<Value, BridgeError>;
}

/// Schema loading and discovery metadata.
pub trait SchemaStore: Send + Sync {
    fn load(&self, model: &str) -> Option<Value>;
    fn models(&self) -> Vec<String>;
    /// Operation metadata for the `discover` reply.
    fn operations(&self) -> Value;

    /// Per-model or all-model schema metadata for `introspect`.
    fn introspect(&self, model: Option<&str>) -> Result<Value, BridgeError> {
        match model {
            Some(name) => self
                .load(name)
                .map(|schema| serde_json::json!({ name: schema }))
                .ok_or_else(|| BridgeError::SchemaNotFound(name.to_string())),
            None => {
                let mut all = serde_json::Map::new();
                for name in self.models() {
                    if let Some(schema) = self.load(&name) {
                        all.insert(name, schema);
                    }
                }
                Ok(Value::Object(all))
            }
        }
    }
}

/// The declarative rendering engine: turns a walker source into a
/// restartable step sequence.
pub trait WalkerEngine: Send + Sync {
    fn start(&self, source: &WalkerSource) -> Result<Box<dyn StepSequence>, BridgeError>;
}

/// Outcome of a form submission, reported to the client before any
/// suspended walker is resumed.
#[derive(Clone, Debug)]
pub struct FormOutcome {
    pub success: bool,
    pub message: String,
    pub errors: Vec<Value>,
}

impl FormOutcome {
    pub fn accepted(message: impl Into<String>) -> Self {
        Self {
            success: true,
            message: message.into(),
            errors: Vec::new(),
        }
    }

    pub fn rejected(message: impl Into<String>, errors: Vec<Value>) -> Self {
        Self {
            success: false,
            message: message.into(),
            errors,
        }
    }
}

/// Form validation / persistence collaborator.
#[async_trait]
pub trait FormProcessor: Send + Sync {
    async fn submit(
        &self,
        data: &Value,
        on_submit: Option<&Value>,
        model: Option<&str>,
    ) -> FormOutcome;
}

/// Bundle of collaborator handles handed to the server at startup.
#[derive(Clone)]
pub struct Collaborators {
    pub schemas: Arc<dyn SchemaStore>,
    pub executor: Arc<dyn CommandExecutor>,
    pub walkers: Arc<dyn WalkerEngine>,
    pub forms: Arc<dyn FormProcessor>,
}

// ── In-memory implementations ──

/// Schema store backed by a map, loadable from JSON files at startup.
#[derive(Default)]
pub struct InMemorySchemaStore {
    schemas: RwLock<HashMap<String, Value>>,
}

impl InMemorySchemaStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, model: impl Into<String>, schema: Value) {
        self.schemas.write().insert(model.into(), schema);
    }
}

impl SchemaStore for InMemorySchemaStore {
    fn load(&self, model: &str) -> Option<Value> {
        self.schemas.read().get(model).cloned()
    }

    fn models(&self) -> Vec<String> {
        let mut names: Vec<String> = self.schemas.read().keys().cloned().collect();
        names.sort();
        names
    }

    fn operations(&self) -> Value {
        serde_json::json!({
            "get_schema": { "params": ["model"] },
            "discover": { "params": [] },
            "introspect": { "params": ["model?"] },
            "execute_walker": { "params": ["zVaFile", "zVaFolder", "zBlock"] },
            "form_submit": { "params": ["data", "onSubmit", "model?"] },
        })
    }
}

/// Executor backed by a plain function. The binary wires built-ins through
/// this; tests script replies with it.
pub struct FnExecutor {
    f: Box<dyn Fn(&str, &Value) -> Result<Value, BridgeError> + Send + Sync>,
}

impl FnExecutor {
    pub fn new(
        f: impl Fn(&str, &Value) -> Result<Value, BridgeError> + Send + Sync + 'static,
    ) -> Self {
        Self { f: Box::new(f) }
    }

    /// An executor with no backend: every command fails.
    pub fn unconfigured() -> Self {
        Self::new(|command, _| {
            Err(BridgeError::Executor(format!(
                "no backend configured for command: {command}"
            )))
        })
    }
}

#[async_trait]
impl CommandExecutor for FnExecutor {
    async fn execute(&self, command: &str, args: &Value) -> Result<Value, BridgeError> {
        (self.f)(command, args)
    }
}

/// Walker engine serving pre-registered chunk scripts, keyed by
/// `file:folder:block`.
#[derive(Default)]
pub struct StaticWalkerEngine {
    scripts: RwLock<HashMap<String, Vec<Chunk>>>,
}

impl StaticWalkerEngine {
    pub fn new() -> Self {
        Self::default()
    }

    fn key(source: &WalkerSource) -> String {
        format!("{}:{}:{}", source.file, source.folder, source.block)
    }

    pub fn register(&self, source: &WalkerSource, chunks: Vec<Chunk>) {
        self.scripts.write().insert(Self::key(source), chunks);
    }
}

impl WalkerEngine for StaticWalkerEngine {
    fn start(&self, source: &WalkerSource) -> Result<Box<dyn StepSequence>, BridgeError> {
        let chunks = self
            .scripts
            .read()
            .get(&Self::key(source))
            .cloned()
            .ok_or_else(|| {
                BridgeError::WalkerFailed(format!(
                    "unknown walker source: {} / {} / {}",
                    source.file, source.folder, source.block
                ))
            })?;
        Ok(Box::new(ScriptedSequence::new(chunks)))
    }
}

/// Form processor that accepts every submission. Validation rules live in an
/// external collaborator in production.
pub struct AutoApproveForms;

#[async_trait]
impl FormProcessor for AutoApproveForms {
    async fn submit(&self, _data: &Value, _on_submit: Option<&Value>, _model: Option<&str>) -> FormOutcome {
        FormOutcome::accepted("Submitted")
    }
}

/// Form processor that rejects every submission with a fixed message.
pub struct RejectingForms(pub String);

#[async_trait]
impl FormProcessor for RejectingForms {
    async fn submit(&self, _data: &Value, _on_submit: Option<&Value>, _model: Option<&str>) -> FormOutcome {
        FormOutcome::rejected(self.0.clone(), vec![serde_json::json!({"field": "*", "message": self.0})])
    }
}

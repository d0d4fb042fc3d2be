pub mod bridge;
pub mod collaborators;
pub mod connection;
pub mod pending;
pub mod router;
pub mod server;

pub use bridge::{ExecutionBridge, WalkerOutcome};
pub use collaborators::{
    AutoApproveForms, Collaborators, CommandExecutor, FnExecutor, FormOutcome, FormProcessor,
    InMemorySchemaStore, SchemaStore, StaticWalkerEngine, WalkerEngine,
};
pub use connection::{ConnectionRegistry, OverflowPolicy};
pub use router::RouterState;
pub use server::{start, ServerConfig, ServerHandle};

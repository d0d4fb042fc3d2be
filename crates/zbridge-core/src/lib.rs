pub mod auth;
pub mod envelope;
pub mod errors;
pub mod ids;
pub mod walker;

pub use auth::{AuthBindings, AuthContext, AuthScope, Identity};
pub use envelope::{Correlation, Envelope};
pub use errors::BridgeError;
pub use ids::{ConnectionId, WalkerRunId};
pub use walker::{Chunk, ScriptedSequence, StepSequence, WalkerSource};

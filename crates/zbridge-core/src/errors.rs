/// Typed error hierarchy for bridge operations.
/// Classifies errors as fatal to the connection or reportable in-band.
#[derive(Clone, Debug, thiserror::Error)]
pub enum BridgeError {
    // Fatal — tear the connection down
    #[error("transport error: {0}")]
    Transport(String),

    // Reportable — error envelope, connection stays open
    #[error("{0}")]
    Validation(String),
    #[error("Schema not found: {0}")]
    SchemaNotFound(String),
    #[error("command execution failed: {0}")]
    Executor(String),
    #[error("walker start failed: {0}")]
    WalkerFailed(String),
}

impl BridgeError {
    /// Fatal errors tear the connection down; everything else becomes an
    /// error envelope on the open connection.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Transport(_))
    }

    /// Short classification string for logging.
    pub fn error_kind(&self) -> &'static str {
        match self {
            Self::Transport(_) => "transport",
            Self::Validation(_) => "validation",
            Self::SchemaNotFound(_) => "schema_not_found",
            Self::Executor(_) => "executor",
            Self::WalkerFailed(_) => "walker_failed",
        }
    }
}

use agentdeck_pty::PtyError;
use thiserror::Error;

/// Errors from pool and instance operations.
#[derive(Debug, Error)]
pub enum PoolError {
    #[error("agent type '{0}' not available")]
    Unavailable(String),

    #[error("agent instance '{0}' not found")]
    NotFound(String),

    #[error("failed to start {kind}: {source}")]
    Start { kind: String, source: PtyError },

    /// Non-zero exit of a one-shot agent call; `output` is everything it printed.
    #[error("{kind} command failed ({status})\nOutput: {output}")]
    Command {
        kind: String,
        status: String,
        output: String,
    },

    #[error("failed to spawn {command}: {source}")]
    Spawn {
        command: String,
        source: std::io::Error,
    },

    #[error("operation cancelled")]
    Cancelled,

    #[error("operation timed out")]
    TimedOut,

    #[error(transparent)]
    Pty(#[from] PtyError),

    #[error("agent setup failed: {0}")]
    Setup(String),
}

pub type Result<T> = std::result::Result<T, PoolError>;

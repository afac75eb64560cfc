use thiserror::Error;

/// Errors from PTY operations.
#[derive(Debug, Error)]
pub enum PtyError {
    #[error("PTY spawn failed: {0}")]
    SpawnFailed(String),

    #[error("PTY I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("PTY resize failed: {0}")]
    ResizeFailed(String),

    /// The proxy has no PTY attached (never started, or already stopped).
    #[error("PTY is closed")]
    Closed,
}

pub type Result<T> = std::result::Result<T, PtyError>;

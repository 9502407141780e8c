//! Error types for check execution

use thiserror::Error;

/// Result type alias for execution
pub type Result<T> = std::result::Result<T, ExecError>;

/// Errors raised while executing a check
///
/// Most plugin failures are not errors: they become an answer with an
/// out-of-bounds return code. Only conditions the worker cannot turn into a
/// meaningful result surface here.
#[derive(Debug, Error)]
pub enum ExecError {
    /// The host ran out of processes, descriptors or memory
    #[error("fatal error while starting check: {0}")]
    Fatal(#[source] std::io::Error),

    /// The embedded interpreter daemon could not be started
    #[error("embedded interpreter startup failed: {0}")]
    EpnStartup(String),

    /// A request to the embedded interpreter daemon failed
    #[error("embedded interpreter error: {0}")]
    Epn(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl ExecError {
    pub fn epn(msg: impl Into<String>) -> Self {
        ExecError::Epn(msg.into())
    }

    pub fn epn_startup(msg: impl Into<String>) -> Self {
        ExecError::EpnStartup(msg.into())
    }

    /// Whether the worker process should exit
    pub fn is_fatal(&self) -> bool {
        matches!(self, ExecError::Fatal(_) | ExecError::EpnStartup(_))
    }
}

/// Out of descriptors, processes or memory
pub fn is_resource_exhaustion(err: &std::io::Error) -> bool {
    matches!(
        err.raw_os_error(),
        Some(nix::libc::EMFILE | nix::libc::ENFILE | nix::libc::ENOMEM | nix::libc::EAGAIN)
    )
}

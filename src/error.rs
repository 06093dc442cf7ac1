//! Error types surfaced by the session core.

use thiserror::Error;

/// Errors surfaced by the registry, the protocol, and the attach front-end.
#[derive(Debug, Error)]
pub enum SessionError {
    /// No session with that name exists.
    #[error("no session named '{0}'")]
    NotFound(String),

    /// Session artifacts exist but the daemon is dead or not accepting.
    #[error("session '{0}' is not reachable (daemon dead or not accepting)")]
    Unreachable(String),

    /// Name rejected by the validator.
    #[error("invalid session name '{0}': names must match [A-Za-z0-9_-]+")]
    InvalidName(String),

    /// Attempt to start or attach from inside a running session.
    #[error("already inside a persishtent session ('{0}')")]
    Nested(String),

    /// `start -d` against a session that is already running.
    #[error("session '{0}' already exists")]
    AlreadyExists(String),

    /// Malformed frame, oversize payload, or missing Mode handshake.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Underlying filesystem, socket, or terminal failure.
    #[error("{context}: {source}")]
    Io {
        /// What was being attempted when the error occurred.
        context: String,
        #[source]
        source: std::io::Error,
    },
}

impl SessionError {
    /// Wrap an I/O error with a short description of the failed operation.
    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }
}

/// Result alias for session-core operations.
pub type Result<T> = std::result::Result<T, SessionError>;

/// How an attached front-end session ended.
///
/// These are normal outcomes, not errors: the terminal restoration sequence
/// runs for all of them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitReason {
    /// The user pressed the detach sequence (prefix, then `d`).
    Detached,
    /// Another master connection displaced this one.
    Kicked,
    /// The shell exited and the daemon closed the stream.
    Terminated,
}

use serde::Serialize;
use std::fmt;

/// Discriminant for PTY errors, serialized across the command boundary for
/// programmatic error handling (e.g., distinguishing "terminal gone" from
/// "write failed").
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum PtyErrorCode {
    AlreadyExists,
    SpawnFailed,
    TerminalNotFound,
    WriteFailed,
    ResizeFailed,
    KillFailed,
    ResourceExhausted,
}

/// Structured PTY error with a machine-readable code and human-readable message.
///
/// Serialized as JSON at the command boundary. Implements `std::error::Error`
/// so it can be used with `?` in async operation handlers. Constructors are
/// provided for each error variant to keep call sites concise.
#[derive(Debug, Clone, Serialize)]
pub struct PtyError {
    pub code: PtyErrorCode,
    pub message: String,
}

impl fmt::Display for PtyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}: {}", self.code, self.message)
    }
}

impl std::error::Error for PtyError {}

impl PtyError {
    /// A terminal with this id is already registered.
    pub fn already_exists(id: &str) -> Self {
        Self {
            code: PtyErrorCode::AlreadyExists,
            message: format!("Terminal {} already exists", id),
        }
    }

    /// PTY or shell process could not be created.
    pub fn spawn_failed(msg: impl Into<String>) -> Self {
        Self {
            code: PtyErrorCode::SpawnFailed,
            message: msg.into(),
        }
    }

    /// No terminal exists with the given id (already closed or never created).
    pub fn terminal_not_found(id: &str) -> Self {
        Self {
            code: PtyErrorCode::TerminalNotFound,
            message: format!("Terminal {} not found", id),
        }
    }

    /// Writing to the PTY stdin failed (lock poison or I/O error).
    pub fn write_failed(msg: impl Into<String>) -> Self {
        Self {
            code: PtyErrorCode::WriteFailed,
            message: msg.into(),
        }
    }

    /// PTY resize (SIGWINCH propagation) failed.
    pub fn resize_failed(msg: impl Into<String>) -> Self {
        Self {
            code: PtyErrorCode::ResizeFailed,
            message: msg.into(),
        }
    }

    /// Terminal termination (SIGTERM/SIGKILL) failed.
    pub fn kill_failed(msg: impl Into<String>) -> Self {
        Self {
            code: PtyErrorCode::KillFailed,
            message: msg.into(),
        }
    }

    /// The system refused to allocate another PTY.
    pub fn resource_exhausted(msg: impl Into<String>) -> Self {
        Self {
            code: PtyErrorCode::ResourceExhausted,
            message: msg.into(),
        }
    }

    /// True when the error merely reports an unknown terminal id. Close paths
    /// treat this as success (idempotent close).
    pub fn is_not_found(&self) -> bool {
        self.code == PtyErrorCode::TerminalNotFound
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_not_found_is_detectable() {
        assert!(PtyError::terminal_not_found("t1").is_not_found());
        assert!(!PtyError::spawn_failed("boom").is_not_found());
    }

    #[test]
    fn test_display_includes_code_and_message() {
        let err = PtyError::write_failed("pipe closed");
        let text = err.to_string();
        assert!(text.contains("WriteFailed"));
        assert!(text.contains("pipe closed"));
    }
}

//! Error taxonomy for the sandbox subsystem.
//!
//! Every fallible operation in the executor/bridge/bootstrap/sync layers
//! resolves to one of these variants. The taxonomy is deliberately small:
//! callers dispatch on the variant (retry, fall back, surface) without
//! parsing messages. Raw OS errors never cross a crate boundary — they are
//! wrapped as [`SandboxError::Upstream`] at the point of occurrence.

use std::time::Duration;
use thiserror::Error;

/// Unified error type for sandbox operations.
#[derive(Debug, Error)]
pub enum SandboxError {
    /// Executor not initialized, workspace missing, bad settings.
    /// Never retried.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Out-of-bounds path, traversal, dangerous command, symlink escape.
    /// Never retried, surfaced immediately.
    #[error("security violation: {0}")]
    SecurityViolation(String),

    /// The in-VM agent is unreachable or crashed. Triggers one bounded
    /// restart before the adapter escalates to native fallback.
    #[error("sandbox agent unavailable: {0}")]
    RemoteUnavailable(String),

    /// Process-level or per-RPC budget exceeded. Rejects only the
    /// individual caller; the agent process is left running.
    #[error("operation timed out after {0:?}")]
    Timeout(Duration),

    /// Nonzero exit, missing file, OS error — anything the workload itself
    /// produced rather than the sandbox machinery.
    #[error("{0}")]
    Upstream(String),
}

impl SandboxError {
    /// Stable wire/display tag for this variant.
    ///
    /// Used as the `error_type` field in tool-facing errors and to pick a
    /// JSON-RPC error code, so the host can dispatch without parsing
    /// messages.
    pub const fn tag(&self) -> &'static str {
        match self {
            Self::Configuration(_) => "configuration_error",
            Self::SecurityViolation(_) => "security_violation",
            Self::RemoteUnavailable(_) => "remote_unavailable",
            Self::Timeout(_) => "timeout",
            Self::Upstream(_) => "upstream_failure",
        }
    }

    /// Whether the adapter may transparently retry/fall back after this
    /// error. Security and configuration failures are final.
    pub const fn is_recoverable(&self) -> bool {
        matches!(self, Self::RemoteUnavailable(_) | Self::Timeout(_))
    }
}

impl From<std::io::Error> for SandboxError {
    fn from(e: std::io::Error) -> Self {
        Self::Upstream(e.to_string())
    }
}

impl From<serde_json::Error> for SandboxError {
    fn from(e: serde_json::Error) -> Self {
        Self::Upstream(format!("JSON error: {}", e))
    }
}

pub type SandboxResult<T> = Result<T, SandboxError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tags_are_stable() {
        assert_eq!(SandboxError::Configuration(String::new()).tag(), "configuration_error");
        assert_eq!(SandboxError::SecurityViolation(String::new()).tag(), "security_violation");
        assert_eq!(SandboxError::RemoteUnavailable(String::new()).tag(), "remote_unavailable");
        assert_eq!(SandboxError::Timeout(Duration::from_secs(1)).tag(), "timeout");
        assert_eq!(SandboxError::Upstream(String::new()).tag(), "upstream_failure");
    }

    #[test]
    fn security_violations_are_not_recoverable() {
        assert!(!SandboxError::SecurityViolation("rm -rf /".into()).is_recoverable());
        assert!(!SandboxError::Configuration("no workspace".into()).is_recoverable());
        assert!(SandboxError::RemoteUnavailable("agent exited".into()).is_recoverable());
    }
}

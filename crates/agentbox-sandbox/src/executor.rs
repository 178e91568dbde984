//! SandboxExecutor trait: the contract every backend implements.
//!
//! Three implementations exist: [`crate::native::NativeExecutor`] (direct
//! host execution with guard checks) and the two VM bridges built on
//! [`crate::bridge::VmBridge`] (WSL2, Lima). The adapter holds exactly one
//! active implementation at a time; callers never know which backend is
//! live.
//!
//! Every implementation re-validates path containment even when the caller
//! already validated (defense in depth), and communicates failures as
//! [`SandboxError`] values — raw OS errors never leak outward.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;

use agentbox_core::config::SandboxSettings;
use agentbox_core::error::SandboxResult;

pub use agentbox_core::protocol::{DirectoryEntry, ExecutionResult};

/// Per-backend initialization parameters.
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    /// Real workspace root all validated paths must remain under.
    pub workspace_root: PathBuf,
    /// Process-level command timeout (default 60s).
    pub command_timeout: Duration,
    /// Per-RPC-request timeout for bridge backends, typically shorter.
    pub rpc_timeout: Duration,
    /// Extra environment injected into every executed command.
    pub env: HashMap<String, String>,
}

impl ExecutorConfig {
    pub fn new(workspace_root: impl Into<PathBuf>) -> Self {
        Self {
            workspace_root: workspace_root.into(),
            command_timeout: Duration::from_secs(60),
            rpc_timeout: Duration::from_secs(30),
            env: HashMap::new(),
        }
    }

    pub fn from_settings(workspace_root: impl Into<PathBuf>, settings: &SandboxSettings) -> Self {
        Self {
            workspace_root: workspace_root.into(),
            command_timeout: settings.command_timeout,
            rpc_timeout: settings.rpc_timeout,
            env: HashMap::new(),
        }
    }
}

/// Unified executor surface exposed to the tool layer.
#[async_trait]
pub trait SandboxExecutor: Send + Sync {
    /// Backend name for logging and diagnostics.
    fn name(&self) -> &str;

    /// Prepare the backend. Idempotent: a second call with the same config
    /// is a no-op.
    async fn initialize(&self, config: &ExecutorConfig) -> SandboxResult<()>;

    /// Execute a shell command under the workspace root.
    ///
    /// Spawn failure maps to `{success: false, exit_code: 1}` with the
    /// error message in `stderr`; a nonzero exit is not an `Err`.
    async fn execute_command(
        &self,
        command: &str,
        cwd: Option<&Path>,
        env: &HashMap<String, String>,
    ) -> SandboxResult<ExecutionResult>;

    async fn read_file(&self, path: &Path) -> SandboxResult<String>;

    async fn write_file(&self, path: &Path, content: &str) -> SandboxResult<()>;

    async fn list_directory(&self, path: &Path) -> SandboxResult<Vec<DirectoryEntry>>;

    async fn file_exists(&self, path: &Path) -> SandboxResult<bool>;

    async fn delete_file(&self, path: &Path) -> SandboxResult<()>;

    async fn create_directory(&self, path: &Path) -> SandboxResult<()>;

    async fn copy_file(&self, source: &Path, destination: &Path) -> SandboxResult<()>;

    /// Tear the backend down. Safe to call more than once.
    async fn shutdown(&self) -> SandboxResult<()>;
}

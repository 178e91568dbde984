//! SandboxAdapter: backend selection, fallback cascade, unified surface.
//!
//! The tool layer talks to the adapter only; which backend is live is an
//! implementation detail. `initialize()` picks a mode from platform and
//! settings, attempts that backend, and on failure cascades toward
//! `native` (unless fallback is disabled), recording the finally-resolved
//! mode. The cascade also applies mid-session: when a bridge reports
//! `RemoteUnavailable` after its own bounded restart, the adapter swaps to
//! the native executor and retries the call once. Read-only probes
//! (`status`) never mutate the active backend.
//!
//! The adapter is constructed once at startup and passed by reference
//! into the session/tool layers. Multiple sessions may share one backend
//! connection concurrently; correctness of interleaved calls relies on
//! per-request id correlation in the RPC layer, not on any lock. File
//! level races between sessions are accepted and out of scope — callers
//! needing read-modify-write atomicity serialize themselves.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::Serialize;
use tracing::{info, warn};

use agentbox_core::config::{BackendPreference, SandboxSettings};
use agentbox_core::error::{SandboxError, SandboxResult};

use crate::bridge::VmBridge;
use crate::executor::{DirectoryEntry, ExecutionResult, ExecutorConfig, SandboxExecutor};
use crate::native::NativeExecutor;
use crate::rpc::AgentState;
use crate::{lima, wsl};

/// Resolved execution mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SandboxMode {
    Wsl,
    Lima,
    Native,
    None,
}

impl SandboxMode {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Wsl => "wsl",
            Self::Lima => "lima",
            Self::Native => "native",
            Self::None => "none",
        }
    }
}

/// Exactly one active backend at a time (tagged ownership).
enum Backend {
    Bridge(VmBridge),
    Native(NativeExecutor),
    Disabled,
    Uninitialized,
}

impl Backend {
    fn executor(&self) -> Option<&dyn SandboxExecutor> {
        match self {
            Self::Bridge(b) => Some(b),
            Self::Native(n) => Some(n),
            Self::Disabled | Self::Uninitialized => None,
        }
    }

    fn require(&self) -> SandboxResult<&dyn SandboxExecutor> {
        self.executor().ok_or_else(|| {
            SandboxError::Configuration(
                "sandbox not initialized (or disabled by configuration)".to_string(),
            )
        })
    }
}

/// Read-only snapshot for status displays.
#[derive(Debug, Clone, Serialize)]
pub struct AdapterStatus {
    pub mode: SandboxMode,
    pub backend: Option<String>,
    pub agent_state: Option<String>,
    pub workspace_root: PathBuf,
}

/// Delegate one call to the live backend; on `RemoteUnavailable` (the
/// bridge's own bounded restart already failed) escalate to native and
/// retry the call once.
macro_rules! with_fallback {
    ($self:ident, $method:ident ( $($arg:expr),* )) => {{
        let first = {
            let guard = $self.backend.read().await;
            guard.require()?.$method($($arg),*).await
        };
        match first {
            Err(SandboxError::RemoteUnavailable(reason)) => {
                $self.fall_back(&reason).await?;
                let guard = $self.backend.read().await;
                guard.require()?.$method($($arg),*).await
            }
            other => other,
        }
    }};
}

pub struct SandboxAdapter {
    settings: SandboxSettings,
    workspace_root: PathBuf,
    backend: tokio::sync::RwLock<Backend>,
    mode: std::sync::Mutex<SandboxMode>,
}

impl SandboxAdapter {
    pub fn new(workspace_root: impl Into<PathBuf>, settings: SandboxSettings) -> Self {
        Self {
            settings,
            workspace_root: workspace_root.into(),
            backend: tokio::sync::RwLock::new(Backend::Uninitialized),
            mode: std::sync::Mutex::new(SandboxMode::None),
        }
    }

    /// Candidate modes in cascade order for the configured preference.
    fn candidate_order(&self) -> Vec<SandboxMode> {
        let mut order = match self.settings.backend {
            BackendPreference::Wsl => vec![SandboxMode::Wsl, SandboxMode::Native],
            BackendPreference::Lima => vec![SandboxMode::Lima, SandboxMode::Native],
            BackendPreference::Native => vec![SandboxMode::Native],
            BackendPreference::None => vec![SandboxMode::None],
            BackendPreference::Auto => {
                if cfg!(target_os = "windows") {
                    vec![SandboxMode::Wsl, SandboxMode::Native]
                } else if cfg!(target_os = "macos") {
                    vec![SandboxMode::Lima, SandboxMode::Native]
                } else {
                    vec![SandboxMode::Native]
                }
            }
        };
        if self.settings.no_fallback {
            order.truncate(1);
        }
        order
    }

    /// Pick and bring up a backend, cascading toward native on failure.
    pub async fn initialize(&self) -> SandboxResult<SandboxMode> {
        let mut last_error: Option<SandboxError> = None;
        for mode in self.candidate_order() {
            match self.try_mode(mode).await {
                Ok(backend) => {
                    *self.backend.write().await = backend;
                    *self.mode.lock().expect("mode lock") = mode;
                    info!(mode = mode.as_str(), "sandbox backend initialized");
                    return Ok(mode);
                }
                Err(e) => {
                    // Non-fatal: surface a warning and keep cascading.
                    warn!(mode = mode.as_str(), error = %e, "backend unavailable, cascading");
                    last_error = Some(e);
                }
            }
        }
        Err(last_error.unwrap_or_else(|| {
            SandboxError::Configuration("no sandbox backend available".to_string())
        }))
    }

    async fn try_mode(&self, mode: SandboxMode) -> SandboxResult<Backend> {
        match mode {
            SandboxMode::Wsl => {
                let bridge = wsl::connect(&self.workspace_root, &self.settings).await?;
                Ok(Backend::Bridge(bridge))
            }
            SandboxMode::Lima => {
                let bridge = lima::connect(&self.workspace_root, &self.settings).await?;
                Ok(Backend::Bridge(bridge))
            }
            SandboxMode::Native => {
                let native = NativeExecutor::new();
                let config =
                    ExecutorConfig::from_settings(&self.workspace_root, &self.settings);
                native.initialize(&config).await?;
                Ok(Backend::Native(native))
            }
            SandboxMode::None => Ok(Backend::Disabled),
        }
    }

    /// The mode `initialize()` finally resolved to.
    pub fn mode(&self) -> SandboxMode {
        *self.mode.lock().expect("mode lock")
    }

    /// Read-only probe; never mutates the active backend.
    pub async fn status(&self) -> AdapterStatus {
        let guard = self.backend.read().await;
        let (backend, agent_state) = match &*guard {
            Backend::Bridge(bridge) => (
                Some(bridge.name().to_string()),
                Some(format!("{:?}", bridge.agent_state().await)),
            ),
            Backend::Native(native) => (Some(native.name().to_string()), None),
            Backend::Disabled | Backend::Uninitialized => (None, None),
        };
        AdapterStatus {
            mode: self.mode(),
            backend,
            agent_state,
            workspace_root: self.workspace_root.clone(),
        }
    }

    /// Whether the live backend's agent answers. `Ready`/`None` for native.
    pub async fn check_agent(&self) -> Option<AgentState> {
        let guard = self.backend.read().await;
        match &*guard {
            Backend::Bridge(bridge) => Some(bridge.agent_state().await),
            _ => None,
        }
    }

    /// Mid-session escalation: the bridge already spent its one bounded
    /// restart, so swap to the native executor when the cascade permits.
    async fn fall_back(&self, reason: &str) -> SandboxResult<()> {
        let mut guard = self.backend.write().await;
        match &*guard {
            Backend::Bridge(bridge) => {
                if self.settings.no_fallback {
                    return Err(SandboxError::RemoteUnavailable(reason.to_string()));
                }
                let _ = bridge.shutdown().await;
            }
            // Native and disabled backends have nowhere further to fall.
            _ => return Err(SandboxError::RemoteUnavailable(reason.to_string())),
        }
        warn!(error = %reason, "VM backend lost mid-session, falling back to native");
        let native = NativeExecutor::new();
        let config = ExecutorConfig::from_settings(&self.workspace_root, &self.settings);
        native.initialize(&config).await?;
        *guard = Backend::Native(native);
        *self.mode.lock().expect("mode lock") = SandboxMode::Native;
        Ok(())
    }

    pub async fn execute_command(
        &self,
        command: &str,
        cwd: Option<&Path>,
        env: &HashMap<String, String>,
    ) -> SandboxResult<ExecutionResult> {
        with_fallback!(self, execute_command(command, cwd, env))
    }

    pub async fn read_file(&self, path: &Path) -> SandboxResult<String> {
        with_fallback!(self, read_file(path))
    }

    pub async fn write_file(&self, path: &Path, content: &str) -> SandboxResult<()> {
        with_fallback!(self, write_file(path, content))
    }

    pub async fn list_directory(&self, path: &Path) -> SandboxResult<Vec<DirectoryEntry>> {
        with_fallback!(self, list_directory(path))
    }

    pub async fn file_exists(&self, path: &Path) -> SandboxResult<bool> {
        with_fallback!(self, file_exists(path))
    }

    pub async fn delete_file(&self, path: &Path) -> SandboxResult<()> {
        with_fallback!(self, delete_file(path))
    }

    pub async fn create_directory(&self, path: &Path) -> SandboxResult<()> {
        with_fallback!(self, create_directory(path))
    }

    pub async fn copy_file(&self, source: &Path, destination: &Path) -> SandboxResult<()> {
        with_fallback!(self, copy_file(source, destination))
    }

    pub async fn shutdown(&self) -> SandboxResult<()> {
        let mut guard = self.backend.write().await;
        if let Some(executor) = guard.executor() {
            executor.shutdown().await?;
        }
        *guard = Backend::Uninitialized;
        *self.mode.lock().expect("mode lock") = SandboxMode::None;
        Ok(())
    }
}

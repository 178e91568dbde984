//! VmBridge: SandboxExecutor over an AgentClient plus a PathConverter.
//!
//! The bridge is the host side of a VM backend: it launches the agent
//! process inside the isolated environment (via `wsl.exe` or `limactl`),
//! converts every path crossing the wire, and maps wire errors back onto
//! the sandbox taxonomy.
//!
//! Failure semantics: if a connected agent crashes mid-call, the pending
//! request rejects with `RemoteUnavailable` and the bridge attempts
//! exactly one restart before the error escalates to the adapter (which
//! falls back to native or reports a fatal setup error).

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::{info, warn};

use agentbox_core::error::{SandboxError, SandboxResult};
use agentbox_core::protocol::{methods, ExecuteCommandParams, ExecutionResult, SetWorkspaceParams};

use crate::convert::PathConverter;
use crate::executor::{DirectoryEntry, ExecutorConfig, SandboxExecutor};
use crate::rpc::{AgentClient, AgentState};

/// How to (re)launch the agent process for one backend.
#[derive(Debug, Clone)]
pub struct AgentLauncher {
    pub program: String,
    pub args: Vec<String>,
}

impl AgentLauncher {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }
}

pub struct VmBridge {
    name: String,
    launcher: AgentLauncher,
    converter: PathConverter,
    rpc_timeout: Duration,
    command_timeout: Duration,
    client: tokio::sync::RwLock<Option<AgentClient>>,
    /// Serializes restart attempts so one crash triggers one respawn.
    restart_lock: tokio::sync::Mutex<()>,
}

impl VmBridge {
    pub fn new(
        name: impl Into<String>,
        launcher: AgentLauncher,
        converter: PathConverter,
        command_timeout: Duration,
        rpc_timeout: Duration,
    ) -> Self {
        Self {
            name: name.into(),
            launcher,
            converter,
            rpc_timeout,
            command_timeout,
            client: tokio::sync::RwLock::new(None),
            restart_lock: tokio::sync::Mutex::new(()),
        }
    }

    pub fn converter(&self) -> &PathConverter {
        &self.converter
    }

    /// Current agent lifecycle state, for diagnostics.
    pub async fn agent_state(&self) -> AgentState {
        match self.client.read().await.as_ref() {
            Some(client) => client.state(),
            None => AgentState::NotStarted,
        }
    }

    async fn spawn_client(&self) -> SandboxResult<AgentClient> {
        let client =
            AgentClient::spawn(&self.launcher.program, &self.launcher.args, self.rpc_timeout)
                .await?;
        let params = SetWorkspaceParams {
            path: self.converter.vm_root().to_string(),
            host_path: Some(self.converter.host_root().to_string_lossy().into_owned()),
        };
        client
            .call(methods::SET_WORKSPACE, serde_json::to_value(&params)?)
            .await?;
        Ok(client)
    }

    /// Per-call deadline. Command-carrying calls run under the process
    /// budget (plus the RPC deadline as grace for the response to travel);
    /// the flat RPC deadline only guards a hung agent.
    fn deadline_for(&self, method: &str) -> Duration {
        match method {
            methods::EXECUTE_COMMAND | methods::RUN_CLAUDE_CODE => {
                self.command_timeout + self.rpc_timeout
            }
            _ => self.rpc_timeout,
        }
    }

    async fn call_once(&self, method: &str, params: Value, deadline: Duration) -> SandboxResult<Value> {
        let guard = self.client.read().await;
        let client = guard.as_ref().ok_or_else(|| {
            SandboxError::Configuration("bridge not initialized".to_string())
        })?;
        client.call_with_timeout(method, params, deadline).await
    }

    /// One bounded restart on agent loss, then the error escalates.
    async fn restart(&self) -> SandboxResult<()> {
        let _serialized = self.restart_lock.lock().await;
        // Another caller may have already restarted while we waited.
        if let Some(client) = self.client.read().await.as_ref() {
            if client.state() == AgentState::Ready {
                return Ok(());
            }
        }
        warn!(backend = %self.name, "agent lost, attempting one restart");
        let fresh = self.spawn_client().await?;
        *self.client.write().await = Some(fresh);
        info!(backend = %self.name, "agent restarted");
        Ok(())
    }

    async fn call(&self, method: &str, params: Value) -> SandboxResult<Value> {
        let deadline = self.deadline_for(method);
        match self.call_once(method, params.clone(), deadline).await {
            Err(SandboxError::RemoteUnavailable(first)) => {
                self.restart().await.map_err(|e| {
                    SandboxError::RemoteUnavailable(format!(
                        "{}; restart failed: {}",
                        first, e
                    ))
                })?;
                self.call_once(method, params, deadline).await
            }
            other => other,
        }
    }

    #[cfg(test)]
    pub(crate) async fn install_client(&self, client: AgentClient) {
        *self.client.write().await = Some(client);
    }

    fn vm_path(&self, path: &Path) -> SandboxResult<String> {
        // A path outside the mapped root can never be legal on the far
        // side; refuse before it crosses the wire.
        self.converter
            .to_vm(path)
            .map_err(|e| SandboxError::SecurityViolation(e.to_string()))
    }
}

#[async_trait]
impl SandboxExecutor for VmBridge {
    fn name(&self) -> &str {
        &self.name
    }

    // Budgets and the path mapping are fixed at construction (the wsl/lima
    // connectors build them from the same settings); initialize only has to
    // bring the agent up, and is a no-op when it already is.
    async fn initialize(&self, _config: &ExecutorConfig) -> SandboxResult<()> {
        let mut guard = self.client.write().await;
        if let Some(client) = guard.as_ref() {
            if client.state() == AgentState::Ready {
                return Ok(());
            }
        }
        let client = self.spawn_client().await?;
        *guard = Some(client);
        Ok(())
    }

    async fn execute_command(
        &self,
        command: &str,
        cwd: Option<&Path>,
        env: &HashMap<String, String>,
    ) -> SandboxResult<ExecutionResult> {
        let params = ExecuteCommandParams {
            command: command.to_string(),
            cwd: cwd.map(|p| self.vm_path(p)).transpose()?,
            env: env.clone(),
            timeout_secs: Some(self.command_timeout.as_secs()),
        };
        let result = self
            .call(methods::EXECUTE_COMMAND, serde_json::to_value(&params)?)
            .await?;
        Ok(serde_json::from_value(result)?)
    }

    async fn read_file(&self, path: &Path) -> SandboxResult<String> {
        let result = self
            .call(methods::READ_FILE, json!({ "path": self.vm_path(path)? }))
            .await?;
        result["content"]
            .as_str()
            .map(str::to_owned)
            .ok_or_else(|| SandboxError::Upstream("malformed readFile result".to_string()))
    }

    async fn write_file(&self, path: &Path, content: &str) -> SandboxResult<()> {
        self.call(
            methods::WRITE_FILE,
            json!({ "path": self.vm_path(path)?, "content": content }),
        )
        .await
        .map(|_| ())
    }

    async fn list_directory(&self, path: &Path) -> SandboxResult<Vec<DirectoryEntry>> {
        let result = self
            .call(methods::LIST_DIRECTORY, json!({ "path": self.vm_path(path)? }))
            .await?;
        Ok(serde_json::from_value(result["entries"].clone())?)
    }

    async fn file_exists(&self, path: &Path) -> SandboxResult<bool> {
        let result = self
            .call(methods::FILE_EXISTS, json!({ "path": self.vm_path(path)? }))
            .await?;
        result["exists"]
            .as_bool()
            .ok_or_else(|| SandboxError::Upstream("malformed fileExists result".to_string()))
    }

    async fn delete_file(&self, path: &Path) -> SandboxResult<()> {
        self.call(methods::DELETE_FILE, json!({ "path": self.vm_path(path)? }))
            .await
            .map(|_| ())
    }

    async fn create_directory(&self, path: &Path) -> SandboxResult<()> {
        self.call(
            methods::CREATE_DIRECTORY,
            json!({ "path": self.vm_path(path)? }),
        )
        .await
        .map(|_| ())
    }

    async fn copy_file(&self, source: &Path, destination: &Path) -> SandboxResult<()> {
        self.call(
            methods::COPY_FILE,
            json!({
                "source": self.vm_path(source)?,
                "destination": self.vm_path(destination)?,
            }),
        )
        .await
        .map(|_| ())
    }

    async fn shutdown(&self) -> SandboxResult<()> {
        let mut guard = self.client.write().await;
        if let Some(client) = guard.take() {
            client.shutdown().await;
        }
        Ok(())
    }
}

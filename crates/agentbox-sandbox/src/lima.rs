//! Lima backend (macOS): instance control and agent launcher.
//!
//! The agent runs inside a Lima VM reached through `limactl shell`. Lima
//! mounts the user's home directory at the same POSIX path inside the
//! guest, so the path mapping is the identity for workspaces under home;
//! the sync layer (`LimaSync`) is used when a workspace must be mirrored
//! into guest-local storage instead.

use std::path::Path;
use std::time::Duration;

use serde_json::Value;
use tokio::process::Command;
use tracing::debug;

use agentbox_core::config::SandboxSettings;
use agentbox_core::error::{SandboxError, SandboxResult};

use crate::bridge::{AgentLauncher, VmBridge};
use crate::convert::PathConverter;

pub const BACKEND_ID: &str = "lima";

const PROBE_TIMEOUT: Duration = Duration::from_secs(10);

pub fn is_available() -> bool {
    which::which("limactl").is_ok()
}

/// Status of a named instance: `Some("Running")`, `Some("Stopped")`, or
/// `None` when the instance does not exist.
pub async fn instance_status(instance: &str) -> SandboxResult<Option<String>> {
    let output = tokio::time::timeout(
        PROBE_TIMEOUT,
        Command::new("limactl").args(["list", "--json"]).output(),
    )
    .await
    .map_err(|_| SandboxError::Timeout(PROBE_TIMEOUT))?
    .map_err(|e| SandboxError::RemoteUnavailable(format!("limactl list failed: {}", e)))?;

    // One JSON object per line.
    for line in String::from_utf8_lossy(&output.stdout).lines() {
        let Ok(entry) = serde_json::from_str::<Value>(line) else {
            continue;
        };
        if entry["name"].as_str() == Some(instance) {
            return Ok(entry["status"].as_str().map(str::to_owned));
        }
    }
    Ok(None)
}

/// `limactl start` an existing instance. Creation belongs to bootstrap.
pub async fn start_instance(instance: &str) -> SandboxResult<()> {
    let status = Command::new("limactl")
        .args(["start", instance])
        .status()
        .await
        .map_err(|e| SandboxError::RemoteUnavailable(format!("limactl start failed: {}", e)))?;
    if !status.success() {
        return Err(SandboxError::RemoteUnavailable(format!(
            "limactl start {} exited with {}",
            instance, status
        )));
    }
    Ok(())
}

pub fn launcher(settings: &SandboxSettings) -> AgentLauncher {
    AgentLauncher::new(
        "limactl",
        vec![
            "shell".to_string(),
            settings.lima_instance.clone(),
            "--".to_string(),
            settings.agent_bin.clone(),
        ],
    )
}

/// Verify the instance is running, then bring up a bridge.
pub async fn connect(
    workspace_root: &Path,
    settings: &SandboxSettings,
) -> SandboxResult<VmBridge> {
    if !is_available() {
        return Err(SandboxError::RemoteUnavailable(
            "limactl is not installed".to_string(),
        ));
    }
    match instance_status(&settings.lima_instance).await? {
        Some(status) if status == "Running" => {}
        Some(status) => {
            return Err(SandboxError::RemoteUnavailable(format!(
                "lima instance {} is {} (run setup to start it)",
                settings.lima_instance, status
            )))
        }
        None => {
            return Err(SandboxError::RemoteUnavailable(format!(
                "lima instance {} does not exist (run setup to create it)",
                settings.lima_instance
            )))
        }
    }
    debug!("connecting Lima bridge for {}", workspace_root.display());
    // Home mounts are shared at identical paths; the mapping is identity.
    let vm_root = workspace_root.to_string_lossy().replace('\\', "/");
    let converter = PathConverter::new(workspace_root, vm_root);
    let bridge = VmBridge::new(
        BACKEND_ID,
        launcher(settings),
        converter,
        settings.command_timeout,
        settings.rpc_timeout,
    );
    let config = crate::executor::ExecutorConfig::from_settings(workspace_root, settings);
    crate::executor::SandboxExecutor::initialize(&bridge, &config).await?;
    Ok(bridge)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn launcher_shells_into_the_configured_instance() {
        let mut settings = SandboxSettings::from_env();
        settings.lima_instance = "agentbox".to_string();
        settings.agent_bin = "agentbox-agent".to_string();
        let launcher = launcher(&settings);
        assert_eq!(launcher.program, "limactl");
        assert_eq!(launcher.args, vec!["shell", "agentbox", "--", "agentbox-agent"]);
    }
}

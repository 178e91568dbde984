//! WSL2 backend: availability probe, distro enumeration, agent launcher.
//!
//! The agent binary runs inside the default (or configured) WSL
//! distribution; the bridge reaches it through `wsl.exe -e`. Windows
//! workspace paths are addressed inside the VM through their `/mnt/<drive>`
//! mounts, so no file mirroring is needed on this backend.

use std::path::Path;
use std::time::Duration;

use tokio::process::Command;
use tracing::debug;

use agentbox_core::config::SandboxSettings;
use agentbox_core::error::{SandboxError, SandboxResult};

use crate::bridge::{AgentLauncher, VmBridge};
use crate::convert::PathConverter;

pub const BACKEND_ID: &str = "wsl";

const PROBE_TIMEOUT: Duration = Duration::from_secs(10);

/// Fast static check: is a `wsl` binary on PATH at all?
pub fn is_available() -> bool {
    which::which("wsl").is_ok() || which::which("wsl.exe").is_ok()
}

/// Live probe: does `wsl.exe --status` answer? Distinguishes "installed
/// but no distro / VM platform disabled" from a working setup.
pub async fn probe() -> bool {
    let status = tokio::time::timeout(
        PROBE_TIMEOUT,
        Command::new("wsl.exe")
            .arg("--status")
            .stdin(std::process::Stdio::null())
            .stdout(std::process::Stdio::null())
            .stderr(std::process::Stdio::null())
            .status(),
    )
    .await;
    matches!(status, Ok(Ok(s)) if s.success())
}

/// Enumerate installed distributions (`wsl -l -q`).
pub async fn list_distros() -> SandboxResult<Vec<String>> {
    let output = tokio::time::timeout(
        PROBE_TIMEOUT,
        Command::new("wsl.exe").args(["-l", "-q"]).output(),
    )
    .await
    .map_err(|_| SandboxError::Timeout(PROBE_TIMEOUT))?
    .map_err(|e| SandboxError::RemoteUnavailable(format!("wsl -l failed: {}", e)))?;

    let text = decode_wsl_output(&output.stdout);
    Ok(text
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .map(str::to_owned)
        .collect())
}

/// `wsl.exe` emits UTF-16LE; everything else here is UTF-8.
fn decode_wsl_output(bytes: &[u8]) -> String {
    if bytes.iter().take(64).any(|b| *b == 0) {
        let units: Vec<u16> = bytes
            .chunks_exact(2)
            .map(|c| u16::from_le_bytes([c[0], c[1]]))
            .collect();
        String::from_utf16_lossy(&units)
    } else {
        String::from_utf8_lossy(bytes).into_owned()
    }
}

/// Launcher for the in-distro agent process.
pub fn launcher(settings: &SandboxSettings) -> AgentLauncher {
    let mut args = Vec::new();
    if let Some(distro) = &settings.wsl_distro {
        args.push("-d".to_string());
        args.push(distro.clone());
    }
    args.push("-e".to_string());
    args.push(settings.agent_bin.clone());
    AgentLauncher::new("wsl.exe", args)
}

/// `wsl.exe` argv for a shell snippet, run in the same distro the agent
/// launcher targets.
pub fn shell_args(settings: &SandboxSettings, script: &str) -> Vec<String> {
    let mut args = Vec::new();
    if let Some(distro) = &settings.wsl_distro {
        args.push("-d".to_string());
        args.push(distro.clone());
    }
    args.push("-e".to_string());
    args.push("sh".to_string());
    args.push("-c".to_string());
    args.push(script.to_string());
    args
}

/// Probe WSL, then bring up a bridge for the given workspace.
pub async fn connect(
    workspace_root: &Path,
    settings: &SandboxSettings,
) -> SandboxResult<VmBridge> {
    if !is_available() || !probe().await {
        return Err(SandboxError::RemoteUnavailable(
            "WSL2 is not available on this system".to_string(),
        ));
    }
    debug!("connecting WSL bridge for {}", workspace_root.display());
    let converter = PathConverter::wsl(workspace_root)?;
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
    fn decodes_utf16le_distro_listings() {
        let text = "Ubuntu\r\nDebian\r\n";
        let bytes: Vec<u8> = text
            .encode_utf16()
            .flat_map(|u| u.to_le_bytes())
            .collect();
        assert_eq!(decode_wsl_output(&bytes), text);
        assert_eq!(decode_wsl_output(b"Ubuntu\n"), "Ubuntu\n");
    }

    #[test]
    fn launcher_includes_the_configured_distro() {
        let mut settings = SandboxSettings::from_env();
        settings.wsl_distro = Some("Ubuntu-24.04".to_string());
        settings.agent_bin = "agentbox-agent".to_string();
        let launcher = launcher(&settings);
        assert_eq!(launcher.program, "wsl.exe");
        assert_eq!(
            launcher.args,
            vec!["-d", "Ubuntu-24.04", "-e", "agentbox-agent"]
        );
    }

    #[test]
    fn shell_args_target_the_same_distro_as_the_launcher() {
        let mut settings = SandboxSettings::from_env();
        settings.wsl_distro = Some("Ubuntu-24.04".to_string());
        assert_eq!(
            shell_args(&settings, "command -v agentbox-agent"),
            vec!["-d", "Ubuntu-24.04", "-e", "sh", "-c", "command -v agentbox-agent"]
        );
        settings.wsl_distro = None;
        assert_eq!(
            shell_args(&settings, "true"),
            vec!["-e", "sh", "-c", "true"]
        );
    }
}

//! Configuration structs grouped by domain, loaded from the environment.

use std::path::PathBuf;
use std::time::Duration;

use super::env_keys::{observability as obv_keys, sandbox as sbx_keys};
use super::loader::{env_bool, env_optional, env_or, env_u64};

/// Which sandbox backend the user asked for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendPreference {
    /// Pick by platform: WSL on Windows, Lima on macOS, native elsewhere.
    Auto,
    Wsl,
    Lima,
    Native,
    /// Refuse to execute anything.
    None,
}

impl BackendPreference {
    pub fn parse(s: &str) -> Self {
        match s.trim().to_lowercase().as_str() {
            "wsl" => Self::Wsl,
            "lima" => Self::Lima,
            "native" => Self::Native,
            "none" => Self::None,
            _ => Self::Auto,
        }
    }
}

/// Sandbox subsystem settings.
#[derive(Debug, Clone)]
pub struct SandboxSettings {
    pub backend: BackendPreference,
    /// Process-level command timeout (default 60s).
    pub command_timeout: Duration,
    /// Per-RPC-request timeout, typically shorter (default 30s).
    pub rpc_timeout: Duration,
    pub lima_instance: String,
    /// WSL distribution; `None` means the WSL default.
    pub wsl_distro: Option<String>,
    /// Root for per-session sync mirrors inside the sandbox.
    pub sync_root: String,
    /// Local state directory (bootstrap caches).
    pub state_dir: PathBuf,
    /// Agent binary name/path to launch inside the VM.
    pub agent_bin: String,
    /// When true, a VM backend failure is fatal instead of cascading to
    /// the native executor.
    pub no_fallback: bool,
}

impl SandboxSettings {
    pub fn from_env() -> Self {
        Self {
            backend: BackendPreference::parse(&env_or(sbx_keys::BACKEND, &[], || {
                "auto".to_string()
            })),
            command_timeout: Duration::from_secs(env_u64(sbx_keys::COMMAND_TIMEOUT_SECS, 60)),
            rpc_timeout: Duration::from_secs(env_u64(sbx_keys::RPC_TIMEOUT_SECS, 30)),
            lima_instance: env_or(sbx_keys::LIMA_INSTANCE, &[], || "agentbox".to_string()),
            wsl_distro: env_optional(sbx_keys::WSL_DISTRO, &[]),
            sync_root: env_or(sbx_keys::SYNC_ROOT, &[], || "/tmp/agentbox-sync".to_string()),
            state_dir: env_optional(sbx_keys::STATE_DIR, &[])
                .map(PathBuf::from)
                .unwrap_or_else(default_state_dir),
            agent_bin: env_or(sbx_keys::AGENT_BIN, &[], || "agentbox-agent".to_string()),
            no_fallback: env_bool(sbx_keys::NO_FALLBACK, &[], false),
        }
    }
}

impl Default for SandboxSettings {
    fn default() -> Self {
        Self::from_env()
    }
}

fn default_state_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".agentbox")
}

/// Logging / diagnostics configuration.
#[derive(Debug, Clone)]
pub struct ObservabilityConfig {
    pub log_level: String,
    pub quiet: bool,
    pub log_json: bool,
}

impl ObservabilityConfig {
    pub fn from_env() -> Self {
        Self {
            log_level: env_or(obv_keys::LOG_LEVEL, &[], || "agentbox=info".to_string()),
            quiet: env_bool(obv_keys::QUIET, &[], false),
            log_json: env_bool(obv_keys::LOG_JSON, &[], false),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::loader::ScopedEnvGuard;

    #[test]
    fn backend_preference_parses_known_values() {
        assert_eq!(BackendPreference::parse("WSL"), BackendPreference::Wsl);
        assert_eq!(BackendPreference::parse("lima"), BackendPreference::Lima);
        assert_eq!(BackendPreference::parse("native"), BackendPreference::Native);
        assert_eq!(BackendPreference::parse("none"), BackendPreference::None);
        assert_eq!(BackendPreference::parse("banana"), BackendPreference::Auto);
    }

    #[test]
    fn settings_pick_up_timeout_overrides() {
        let _a = ScopedEnvGuard::set("AGENTBOX_COMMAND_TIMEOUT_SECS", "5");
        let _b = ScopedEnvGuard::set("AGENTBOX_RPC_TIMEOUT_SECS", "2");
        let settings = SandboxSettings::from_env();
        assert_eq!(settings.command_timeout, Duration::from_secs(5));
        assert_eq!(settings.rpc_timeout, Duration::from_secs(2));
    }
}

//! Environment variable key constants.
//!
//! Grouped by domain. Aliases exist for keys that were renamed; the loader
//! checks the primary first, then the alias chain.

pub mod sandbox {
    /// Backend preference: "auto" | "wsl" | "lima" | "native" | "none".
    pub const BACKEND: &str = "AGENTBOX_BACKEND";
    /// Process-level command timeout in seconds (default 60).
    pub const COMMAND_TIMEOUT_SECS: &str = "AGENTBOX_COMMAND_TIMEOUT_SECS";
    /// Per-RPC-request timeout in seconds (default 30).
    pub const RPC_TIMEOUT_SECS: &str = "AGENTBOX_RPC_TIMEOUT_SECS";
    /// Lima instance name (default "agentbox").
    pub const LIMA_INSTANCE: &str = "AGENTBOX_LIMA_INSTANCE";
    /// WSL distribution name (default: the WSL default distro).
    pub const WSL_DISTRO: &str = "AGENTBOX_WSL_DISTRO";
    /// Root directory for per-session sync mirrors inside the sandbox.
    pub const SYNC_ROOT: &str = "AGENTBOX_SYNC_ROOT";
    /// State directory for bootstrap caches (default ~/.agentbox).
    pub const STATE_DIR: &str = "AGENTBOX_STATE_DIR";
    /// Agent binary to launch inside the VM (default "agentbox-agent").
    pub const AGENT_BIN: &str = "AGENTBOX_AGENT_BIN";
    /// Disable cascading to the native executor when a VM backend fails.
    pub const NO_FALLBACK: &str = "AGENTBOX_NO_FALLBACK";
    /// Workspace path injected into child process environments.
    pub const WORKSPACE: &str = "AGENTBOX_WORKSPACE";
}

pub mod observability {
    pub const LOG_LEVEL: &str = "AGENTBOX_LOG_LEVEL";
    pub const QUIET: &str = "AGENTBOX_QUIET";
    pub const LOG_JSON: &str = "AGENTBOX_LOG_JSON";
}

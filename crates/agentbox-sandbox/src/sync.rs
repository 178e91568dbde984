//! Workspace mirroring into and out of a sandbox directory.
//!
//! One `SyncSession` per agent session: `init_sync` mirrors the host
//! workspace into an isolated per-session directory with `rsync -a
//! --delete` (dependency, build and VCS directories excluded), work
//! happens against the mirror, and `final_sync` mirrors changes back.
//! The registry is in-memory only; a process restart orphans any
//! un-cleaned sandbox directories, which `cleanup` on the next session
//! id reuse will reconcile via `--delete`.
//!
//! `SandboxSync` runs rsync on the host (native and WSL backends, where
//! both sides of the transfer are host-visible paths). `LimaSync` runs
//! the identical pipeline through `limactl shell`, with the mirror
//! living in guest-local storage.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::Serialize;
use tokio::process::Command;
use tracing::{debug, info, warn};

use agentbox_core::error::{SandboxError, SandboxResult};

/// Directories never mirrored in either direction.
pub const SYNC_EXCLUDES: &[&str] = &[
    "node_modules",
    "target",
    ".git",
    "dist",
    "build",
    ".venv",
    "__pycache__",
    ".next",
];

#[derive(Debug, Clone, Serialize)]
pub struct SyncSession {
    pub session_id: String,
    pub host_path: PathBuf,
    pub sandbox_path: PathBuf,
    pub backend_id: String,
    pub initialized: bool,
    pub file_count: u64,
    pub total_size: u64,
}

/// Outcome of an `init_sync` or `final_sync` pass.
#[derive(Debug, Clone, Serialize)]
pub struct SyncResult {
    pub success: bool,
    pub sandbox_path: PathBuf,
    pub file_count: u64,
    pub total_size: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl SyncResult {
    fn failure(sandbox_path: PathBuf, error: impl Into<String>) -> Self {
        Self {
            success: false,
            sandbox_path,
            file_count: 0,
            total_size: 0,
            error: Some(error.into()),
        }
    }
}

/// Where sync commands run: directly on the host, or inside a Lima guest.
enum Target {
    Host,
    Lima { instance: String },
}

impl Target {
    fn command(&self, program: &str, args: &[String]) -> Command {
        match self {
            Self::Host => {
                let mut cmd = Command::new(program);
                cmd.args(args);
                cmd
            }
            Self::Lima { instance } => {
                let mut cmd = Command::new("limactl");
                cmd.args(["shell", instance, "--", program]);
                cmd.args(args);
                cmd
            }
        }
    }
}

pub struct SandboxSync {
    sync_root: PathBuf,
    target: Target,
    sessions: tokio::sync::Mutex<HashMap<String, SyncSession>>,
}

impl SandboxSync {
    pub fn new(sync_root: impl Into<PathBuf>) -> Self {
        Self {
            sync_root: sync_root.into(),
            target: Target::Host,
            sessions: tokio::sync::Mutex::new(HashMap::new()),
        }
    }

    fn with_target(sync_root: impl Into<PathBuf>, target: Target) -> Self {
        Self {
            sync_root: sync_root.into(),
            target,
            sessions: tokio::sync::Mutex::new(HashMap::new()),
        }
    }

    fn sandbox_dir(&self, session_id: &str) -> PathBuf {
        self.sync_root.join(session_id)
    }

    /// Mirror `host_path` into a fresh per-session directory and record
    /// the session. Errors are folded into the result rather than raised
    /// so the caller always gets a reportable outcome.
    pub async fn init_sync(
        &self,
        host_path: &Path,
        session_id: &str,
        backend_id: &str,
    ) -> SyncResult {
        let sandbox_path = self.sandbox_dir(session_id);
        if which::which("rsync").is_err() {
            return SyncResult::failure(sandbox_path, "rsync is not installed");
        }
        if let Err(e) = self.ensure_dir(&sandbox_path).await {
            return SyncResult::failure(sandbox_path, e.to_string());
        }
        if let Err(e) = self.mirror(host_path, &sandbox_path).await {
            return SyncResult::failure(sandbox_path, e.to_string());
        }
        let (file_count, total_size) = match self.measure(&sandbox_path).await {
            Ok(m) => m,
            Err(e) => return SyncResult::failure(sandbox_path, e.to_string()),
        };

        let session = SyncSession {
            session_id: session_id.to_string(),
            host_path: host_path.to_path_buf(),
            sandbox_path: sandbox_path.clone(),
            backend_id: backend_id.to_string(),
            initialized: true,
            file_count,
            total_size,
        };
        info!(
            session = session_id,
            files = file_count,
            bytes = total_size,
            "workspace mirrored into sandbox"
        );
        self.sessions
            .lock()
            .await
            .insert(session_id.to_string(), session);
        SyncResult {
            success: true,
            sandbox_path,
            file_count,
            total_size,
            error: None,
        }
    }

    /// Re-attach a session created by an earlier process without
    /// mirroring anything. The registry itself is not durable, so a
    /// caller that outlives the process re-registers before `final_sync`.
    pub async fn register(&self, host_path: &Path, session_id: &str, backend_id: &str) {
        let sandbox_path = self.sandbox_dir(session_id);
        self.sessions.lock().await.insert(
            session_id.to_string(),
            SyncSession {
                session_id: session_id.to_string(),
                host_path: host_path.to_path_buf(),
                sandbox_path,
                backend_id: backend_id.to_string(),
                initialized: true,
                file_count: 0,
                total_size: 0,
            },
        );
    }

    /// Mirror changes back from the sandbox directory to the host path.
    pub async fn final_sync(&self, session_id: &str) -> SyncResult {
        let session = match self.session(session_id).await {
            Some(s) => s,
            None => {
                return SyncResult::failure(
                    self.sandbox_dir(session_id),
                    format!("no sync session {}", session_id),
                )
            }
        };
        if let Err(e) = self.mirror(&session.sandbox_path, &session.host_path).await {
            return SyncResult::failure(session.sandbox_path, e.to_string());
        }
        let (file_count, total_size) = match self.measure(&session.sandbox_path).await {
            Ok(m) => m,
            Err(e) => return SyncResult::failure(session.sandbox_path, e.to_string()),
        };
        debug!(session = session_id, "sandbox changes mirrored back to host");
        SyncResult {
            success: true,
            sandbox_path: session.sandbox_path,
            file_count,
            total_size,
            error: None,
        }
    }

    /// Delete the sandbox directory and drop the registry entry.
    pub async fn cleanup(&self, session_id: &str) -> SandboxResult<()> {
        let removed = self.sessions.lock().await.remove(session_id);
        let dir = removed
            .map(|s| s.sandbox_path)
            .unwrap_or_else(|| self.sandbox_dir(session_id));
        self.remove_dir(&dir).await?;
        debug!(session = session_id, "sync session cleaned up");
        Ok(())
    }

    pub async fn session(&self, session_id: &str) -> Option<SyncSession> {
        self.sessions.lock().await.get(session_id).cloned()
    }

    /// Remap a host path under the session's workspace to its mirror,
    /// for user-facing display of tool output.
    pub async fn host_to_sandbox_path(
        &self,
        session_id: &str,
        path: &Path,
    ) -> SandboxResult<PathBuf> {
        let session = self.require(session_id).await?;
        let relative = path.strip_prefix(&session.host_path).map_err(|_| {
            SandboxError::SecurityViolation(format!(
                "{} is outside the synced workspace",
                path.display()
            ))
        })?;
        Ok(session.sandbox_path.join(relative))
    }

    pub async fn sandbox_to_host_path(
        &self,
        session_id: &str,
        path: &Path,
    ) -> SandboxResult<PathBuf> {
        let session = self.require(session_id).await?;
        let relative = path.strip_prefix(&session.sandbox_path).map_err(|_| {
            SandboxError::SecurityViolation(format!(
                "{} is outside the sandbox mirror",
                path.display()
            ))
        })?;
        Ok(session.host_path.join(relative))
    }

    async fn require(&self, session_id: &str) -> SandboxResult<SyncSession> {
        self.session(session_id).await.ok_or_else(|| {
            SandboxError::Configuration(format!("no sync session {}", session_id))
        })
    }

    /// `rsync -a --delete` with the exclude list; trailing slashes make
    /// rsync transfer directory contents rather than the directory itself.
    async fn mirror(&self, source: &Path, destination: &Path) -> SandboxResult<()> {
        let mut args = vec!["-a".to_string(), "--delete".to_string()];
        for exclude in SYNC_EXCLUDES {
            args.push(format!("--exclude={}", exclude));
        }
        args.push(format!("{}/", source.display()));
        args.push(format!("{}/", destination.display()));

        let output = self
            .target
            .command("rsync", &args)
            .output()
            .await
            .map_err(|e| SandboxError::Upstream(format!("failed to run rsync: {}", e)))?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            warn!(status = %output.status, "rsync failed: {}", stderr.trim());
            return Err(SandboxError::Upstream(format!(
                "rsync exited with {}: {}",
                output.status,
                stderr.trim()
            )));
        }
        Ok(())
    }

    async fn ensure_dir(&self, dir: &Path) -> SandboxResult<()> {
        match &self.target {
            Target::Host => {
                tokio::fs::create_dir_all(dir).await?;
                Ok(())
            }
            Target::Lima { .. } => {
                self.run_shell("mkdir", &["-p".to_string(), dir.display().to_string()])
                    .await
            }
        }
    }

    async fn remove_dir(&self, dir: &Path) -> SandboxResult<()> {
        match &self.target {
            Target::Host => {
                if dir.exists() {
                    tokio::fs::remove_dir_all(dir).await?;
                }
                Ok(())
            }
            Target::Lima { .. } => {
                self.run_shell("rm", &["-rf".to_string(), dir.display().to_string()])
                    .await
            }
        }
    }

    async fn measure(&self, dir: &Path) -> SandboxResult<(u64, u64)> {
        match &self.target {
            Target::Host => measure_tree(dir),
            Target::Lima { .. } => {
                // find + du inside the guest; the mirror is guest-local.
                let output = self
                    .target
                    .command("sh", &measure_args(dir))
                    .output()
                    .await
                    .map_err(|e| SandboxError::Upstream(format!("measure failed: {}", e)))?;
                let text = String::from_utf8_lossy(&output.stdout);
                let mut lines = text.lines();
                let files = lines
                    .next()
                    .and_then(|l| l.trim().parse().ok())
                    .unwrap_or(0);
                let bytes = lines
                    .next()
                    .and_then(|l| l.trim().parse().ok())
                    .unwrap_or(0);
                Ok((files, bytes))
            }
        }
    }

    async fn run_shell(&self, program: &str, args: &[String]) -> SandboxResult<()> {
        let status = self
            .target
            .command(program, args)
            .status()
            .await
            .map_err(|e| SandboxError::Upstream(format!("{} failed: {}", program, e)))?;
        if !status.success() {
            return Err(SandboxError::Upstream(format!(
                "{} exited with {}",
                program, status
            )));
        }
        Ok(())
    }
}

/// `sh` argv that counts files and bytes under a directory. The path is
/// passed as a positional argument so shell metacharacters in it are
/// inert.
fn measure_args(dir: &Path) -> Vec<String> {
    vec![
        "-c".to_string(),
        r#"find "$1" -type f | wc -l; du -sb "$1" | cut -f1"#.to_string(),
        "sh".to_string(),
        dir.display().to_string(),
    ]
}

/// File count and byte size of a directory tree (host side).
fn measure_tree(root: &Path) -> SandboxResult<(u64, u64)> {
    let mut files = 0u64;
    let mut bytes = 0u64;
    let mut stack = vec![root.to_path_buf()];
    while let Some(dir) = stack.pop() {
        for entry in std::fs::read_dir(&dir)? {
            let entry = entry?;
            let metadata = entry.metadata()?;
            if metadata.is_dir() {
                stack.push(entry.path());
            } else if metadata.is_file() {
                files += 1;
                bytes += metadata.len();
            }
        }
    }
    Ok((files, bytes))
}

/// The same sync pipeline executed inside a Lima guest.
pub struct LimaSync {
    inner: SandboxSync,
}

impl LimaSync {
    pub fn new(sync_root: impl Into<PathBuf>, instance: impl Into<String>) -> Self {
        Self {
            inner: SandboxSync::with_target(
                sync_root,
                Target::Lima {
                    instance: instance.into(),
                },
            ),
        }
    }

    pub async fn init_sync(
        &self,
        host_path: &Path,
        session_id: &str,
    ) -> SyncResult {
        self.inner
            .init_sync(host_path, session_id, crate::lima::BACKEND_ID)
            .await
    }

    pub async fn final_sync(&self, session_id: &str) -> SyncResult {
        self.inner.final_sync(session_id).await
    }

    pub async fn cleanup(&self, session_id: &str) -> SandboxResult<()> {
        self.inner.cleanup(session_id).await
    }

    pub async fn session(&self, session_id: &str) -> Option<SyncSession> {
        self.inner.session(session_id).await
    }

    pub async fn host_to_sandbox_path(
        &self,
        session_id: &str,
        path: &Path,
    ) -> SandboxResult<PathBuf> {
        self.inner.host_to_sandbox_path(session_id, path).await
    }

    pub async fn sandbox_to_host_path(
        &self,
        session_id: &str,
        path: &Path,
    ) -> SandboxResult<PathBuf> {
        self.inner.sandbox_to_host_path(session_id, path).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn rsync_installed() -> bool {
        which::which("rsync").is_ok()
    }

    fn seed_workspace(dir: &Path) {
        std::fs::write(dir.join("a.txt"), "0123456789").unwrap();
        std::fs::create_dir_all(dir.join("node_modules/pkg")).unwrap();
        std::fs::write(dir.join("node_modules/pkg/index.js"), "module.exports = 1;").unwrap();
    }

    #[tokio::test]
    async fn init_sync_excludes_dependency_directories() {
        if !rsync_installed() {
            return;
        }
        let host = TempDir::new().unwrap();
        let root = TempDir::new().unwrap();
        seed_workspace(host.path());

        let sync = SandboxSync::new(root.path());
        let result = sync.init_sync(host.path(), "s1", "native").await;
        assert!(result.success, "{:?}", result.error);
        assert_eq!(result.file_count, 1);
        assert_eq!(result.total_size, 10);
        assert!(result.sandbox_path.join("a.txt").exists());
        assert!(!result.sandbox_path.join("node_modules").exists());
    }

    #[tokio::test]
    async fn final_sync_mirrors_changes_back_to_the_host() {
        if !rsync_installed() {
            return;
        }
        let host = TempDir::new().unwrap();
        let root = TempDir::new().unwrap();
        std::fs::write(host.path().join("a.txt"), "before").unwrap();

        let sync = SandboxSync::new(root.path());
        let result = sync.init_sync(host.path(), "s1", "native").await;
        assert!(result.success);

        std::fs::write(result.sandbox_path.join("a.txt"), "after").unwrap();
        std::fs::write(result.sandbox_path.join("new.txt"), "created").unwrap();
        let back = sync.final_sync("s1").await;
        assert!(back.success, "{:?}", back.error);
        assert_eq!(
            std::fs::read_to_string(host.path().join("a.txt")).unwrap(),
            "after"
        );
        assert!(host.path().join("new.txt").exists());
    }

    #[tokio::test]
    async fn cleanup_deletes_the_mirror_and_forgets_the_session() {
        if !rsync_installed() {
            return;
        }
        let host = TempDir::new().unwrap();
        let root = TempDir::new().unwrap();
        std::fs::write(host.path().join("a.txt"), "x").unwrap();

        let sync = SandboxSync::new(root.path());
        let result = sync.init_sync(host.path(), "s1", "native").await;
        assert!(result.success);
        assert!(sync.session("s1").await.is_some());

        sync.cleanup("s1").await.unwrap();
        assert!(!result.sandbox_path.exists());
        assert!(sync.session("s1").await.is_none());
    }

    #[tokio::test]
    async fn remaps_paths_between_host_and_mirror() {
        if !rsync_installed() {
            return;
        }
        let host = TempDir::new().unwrap();
        let root = TempDir::new().unwrap();
        std::fs::write(host.path().join("a.txt"), "x").unwrap();

        let sync = SandboxSync::new(root.path());
        let result = sync.init_sync(host.path(), "s1", "native").await;
        assert!(result.success);

        let mirrored = sync
            .host_to_sandbox_path("s1", &host.path().join("src/main.rs"))
            .await
            .unwrap();
        assert_eq!(mirrored, result.sandbox_path.join("src/main.rs"));
        let back = sync
            .sandbox_to_host_path("s1", &mirrored)
            .await
            .unwrap();
        assert_eq!(back, host.path().join("src/main.rs"));

        let err = sync
            .host_to_sandbox_path("s1", Path::new("/etc/passwd"))
            .await
            .unwrap_err();
        assert_eq!(err.tag(), "security_violation");
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn guest_measure_script_survives_quotes_in_the_path() {
        let root = TempDir::new().unwrap();
        let spiky = root.path().join("it's here");
        std::fs::create_dir(&spiky).unwrap();
        std::fs::write(spiky.join("a.txt"), "12345").unwrap();

        // Same argv the Lima target sends through `limactl shell`.
        let output = tokio::process::Command::new("sh")
            .args(measure_args(&spiky))
            .output()
            .await
            .unwrap();
        assert!(output.status.success());
        let text = String::from_utf8_lossy(&output.stdout);
        let mut lines = text.lines();
        assert_eq!(lines.next().unwrap().trim(), "1");
        let bytes: u64 = lines.next().unwrap().trim().parse().unwrap();
        assert!(bytes >= 5);
    }

    #[tokio::test]
    async fn unknown_session_is_a_configuration_error() {
        let root = TempDir::new().unwrap();
        let sync = SandboxSync::new(root.path());
        let result = sync.final_sync("missing").await;
        assert!(!result.success);
        let err = sync
            .host_to_sandbox_path("missing", Path::new("/x"))
            .await
            .unwrap_err();
        assert_eq!(err.tag(), "configuration_error");
    }
}

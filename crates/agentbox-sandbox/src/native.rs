//! NativeExecutor: direct host execution with guard checks.
//!
//! The fallback backend when no isolated environment is available, and the
//! execution engine the in-VM agent itself runs on (the agent constructs
//! one against its own workspace root). All isolation here is guard-based:
//! path containment and dangerous-command rejection, no VM boundary.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::AsyncReadExt;
use tokio::process::Command;

use agentbox_core::config::env_keys::sandbox as sbx_keys;
use agentbox_core::error::{SandboxError, SandboxResult};
use agentbox_core::path_guard;

use crate::executor::{DirectoryEntry, ExecutionResult, ExecutorConfig, SandboxExecutor};

#[derive(Debug, Clone)]
struct NativeState {
    root: PathBuf,
    command_timeout: Duration,
    base_env: HashMap<String, String>,
}

/// Direct host execution with guard checks.
#[derive(Debug, Default)]
pub struct NativeExecutor {
    state: Mutex<Option<NativeState>>,
}

impl NativeExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> SandboxResult<NativeState> {
        self.state
            .lock()
            .expect("native state lock")
            .clone()
            .ok_or_else(|| {
                SandboxError::Configuration("executor not initialized".to_string())
            })
    }

    /// Validate a path against the workspace root before any filesystem
    /// syscall happens.
    fn checked(&self, path: &Path) -> SandboxResult<PathBuf> {
        let state = self.state()?;
        path_guard::validate_path(path, &state.root)
    }
}

/// Platform shell for a one-shot command: `bash -c` on POSIX, a locked
/// down non-interactive PowerShell invocation on Windows.
fn shell_command(command: &str) -> Command {
    #[cfg(windows)]
    {
        let mut cmd = Command::new("powershell");
        cmd.args(["-NoProfile", "-NonInteractive", "-Command", command]);
        cmd
    }
    #[cfg(not(windows))]
    {
        let mut cmd = Command::new("bash");
        cmd.args(["-c", command]);
        cmd
    }
}

#[async_trait]
impl SandboxExecutor for NativeExecutor {
    fn name(&self) -> &str {
        "native"
    }

    async fn initialize(&self, config: &ExecutorConfig) -> SandboxResult<()> {
        let root = config.workspace_root.canonicalize().map_err(|e| {
            SandboxError::Configuration(format!(
                "workspace root {} is not usable: {}",
                config.workspace_root.display(),
                e
            ))
        })?;
        let mut state = self.state.lock().expect("native state lock");
        if let Some(existing) = state.as_ref() {
            if existing.root == root {
                return Ok(());
            }
        }
        *state = Some(NativeState {
            root,
            command_timeout: config.command_timeout,
            base_env: config.env.clone(),
        });
        Ok(())
    }

    async fn execute_command(
        &self,
        command: &str,
        cwd: Option<&Path>,
        env: &HashMap<String, String>,
    ) -> SandboxResult<ExecutionResult> {
        let state = self.state()?;
        let cwd = match cwd {
            Some(p) => path_guard::validate_path(p, &state.root)?,
            None => state.root.clone(),
        };
        path_guard::validate_command(command, &cwd, &state.root, &[]).into_result()?;

        let mut cmd = shell_command(command);
        cmd.current_dir(&cwd)
            .env(sbx_keys::WORKSPACE, &state.root)
            .envs(&state.base_env)
            .envs(env)
            .stdin(std::process::Stdio::null())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .kill_on_drop(true);

        let mut child = match cmd.spawn() {
            Ok(child) => child,
            // Spawn failure is an execution result, not an Err: the tool
            // layer shows it like any other failed command.
            Err(e) => {
                return Ok(ExecutionResult {
                    success: false,
                    stdout: String::new(),
                    stderr: format!("failed to spawn command: {}", e),
                    exit_code: 1,
                })
            }
        };

        let mut stdout_pipe = child.stdout.take();
        let mut stderr_pipe = child.stderr.take();
        let stdout_task = tokio::spawn(async move {
            let mut buf = Vec::new();
            if let Some(pipe) = stdout_pipe.as_mut() {
                let _ = pipe.read_to_end(&mut buf).await;
            }
            buf
        });
        let stderr_task = tokio::spawn(async move {
            let mut buf = Vec::new();
            if let Some(pipe) = stderr_pipe.as_mut() {
                let _ = pipe.read_to_end(&mut buf).await;
            }
            buf
        });

        let status = match tokio::time::timeout(state.command_timeout, child.wait()).await {
            Ok(status) => status?,
            Err(_) => {
                let _ = child.start_kill();
                return Err(SandboxError::Timeout(state.command_timeout));
            }
        };

        let stdout = stdout_task.await.unwrap_or_default();
        let stderr = stderr_task.await.unwrap_or_default();
        let exit_code = status.code().unwrap_or(-1);
        Ok(ExecutionResult {
            success: status.success(),
            stdout: String::from_utf8_lossy(&stdout).into_owned(),
            stderr: String::from_utf8_lossy(&stderr).into_owned(),
            exit_code,
        })
    }

    async fn read_file(&self, path: &Path) -> SandboxResult<String> {
        let path = self.checked(path)?;
        tokio::fs::read_to_string(&path)
            .await
            .map_err(|e| SandboxError::Upstream(format!("read {}: {}", path.display(), e)))
    }

    async fn write_file(&self, path: &Path, content: &str) -> SandboxResult<()> {
        let path = self.checked(path)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&path, content)
            .await
            .map_err(|e| SandboxError::Upstream(format!("write {}: {}", path.display(), e)))
    }

    async fn list_directory(&self, path: &Path) -> SandboxResult<Vec<DirectoryEntry>> {
        let path = self.checked(path)?;
        let mut entries = Vec::new();
        let mut dir = tokio::fs::read_dir(&path)
            .await
            .map_err(|e| SandboxError::Upstream(format!("list {}: {}", path.display(), e)))?;
        while let Some(entry) = dir.next_entry().await? {
            let metadata = entry.metadata().await?;
            entries.push(DirectoryEntry {
                name: entry.file_name().to_string_lossy().into_owned(),
                is_directory: metadata.is_dir(),
                size: if metadata.is_file() {
                    Some(metadata.len())
                } else {
                    None
                },
            });
        }
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(entries)
    }

    async fn file_exists(&self, path: &Path) -> SandboxResult<bool> {
        // An escaping path is a violation, not "false".
        let path = self.checked(path)?;
        Ok(tokio::fs::try_exists(&path).await.unwrap_or(false))
    }

    async fn delete_file(&self, path: &Path) -> SandboxResult<()> {
        let path = self.checked(path)?;
        let metadata = tokio::fs::metadata(&path)
            .await
            .map_err(|e| SandboxError::Upstream(format!("delete {}: {}", path.display(), e)))?;
        if metadata.is_dir() {
            tokio::fs::remove_dir_all(&path).await?;
        } else {
            tokio::fs::remove_file(&path).await?;
        }
        Ok(())
    }

    async fn create_directory(&self, path: &Path) -> SandboxResult<()> {
        let path = self.checked(path)?;
        tokio::fs::create_dir_all(&path).await?;
        Ok(())
    }

    async fn copy_file(&self, source: &Path, destination: &Path) -> SandboxResult<()> {
        let source = self.checked(source)?;
        let destination = self.checked(destination)?;
        if let Some(parent) = destination.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::copy(&source, &destination)
            .await
            .map_err(|e| SandboxError::Upstream(format!("copy {}: {}", source.display(), e)))?;
        Ok(())
    }

    async fn shutdown(&self) -> SandboxResult<()> {
        let mut state = self.state.lock().expect("native state lock");
        *state = None;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    async fn executor(dir: &TempDir) -> NativeExecutor {
        let exec = NativeExecutor::new();
        exec.initialize(&ExecutorConfig::new(dir.path())).await.unwrap();
        exec
    }

    #[tokio::test]
    async fn uninitialized_executor_is_a_configuration_error() {
        let exec = NativeExecutor::new();
        let err = exec.read_file(Path::new("a.txt")).await.unwrap_err();
        assert_eq!(err.tag(), "configuration_error");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn echo_returns_stdout_and_zero_exit() {
        let dir = TempDir::new().unwrap();
        let exec = executor(&dir).await;
        let result = exec
            .execute_command("echo hi", None, &HashMap::new())
            .await
            .unwrap();
        assert!(result.success);
        assert_eq!(result.stdout, "hi\n");
        assert_eq!(result.exit_code, 0);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn nonzero_exit_is_a_result_not_an_error() {
        let dir = TempDir::new().unwrap();
        let exec = executor(&dir).await;
        let result = exec
            .execute_command("exit 3", None, &HashMap::new())
            .await
            .unwrap();
        assert!(!result.success);
        assert_eq!(result.exit_code, 3);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn workspace_path_is_injected_into_child_env() {
        let dir = TempDir::new().unwrap();
        let exec = executor(&dir).await;
        let result = exec
            .execute_command("echo $AGENTBOX_WORKSPACE", None, &HashMap::new())
            .await
            .unwrap();
        assert_eq!(
            result.stdout.trim(),
            dir.path().canonicalize().unwrap().to_string_lossy()
        );
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn command_timeout_kills_the_process() {
        let dir = TempDir::new().unwrap();
        let exec = NativeExecutor::new();
        let mut config = ExecutorConfig::new(dir.path());
        config.command_timeout = Duration::from_millis(200);
        exec.initialize(&config).await.unwrap();
        let err = exec
            .execute_command("sleep 5", None, &HashMap::new())
            .await
            .unwrap_err();
        assert_eq!(err.tag(), "timeout");
    }

    #[tokio::test]
    async fn dangerous_commands_are_rejected_before_spawn() {
        let dir = TempDir::new().unwrap();
        let exec = executor(&dir).await;
        let err = exec
            .execute_command("rm -rf /", None, &HashMap::new())
            .await
            .unwrap_err();
        assert_eq!(err.tag(), "security_violation");
    }

    #[tokio::test]
    async fn file_ops_round_trip_inside_the_workspace() {
        let dir = TempDir::new().unwrap();
        let exec = executor(&dir).await;
        exec.write_file(Path::new("sub/a.txt"), "hello").await.unwrap();
        assert_eq!(exec.read_file(Path::new("sub/a.txt")).await.unwrap(), "hello");
        assert!(exec.file_exists(Path::new("sub/a.txt")).await.unwrap());

        exec.copy_file(Path::new("sub/a.txt"), Path::new("sub/b.txt"))
            .await
            .unwrap();
        let entries = exec.list_directory(Path::new("sub")).await.unwrap();
        let names: Vec<_> = entries.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, vec!["a.txt", "b.txt"]);
        assert_eq!(entries[0].size, Some(5));

        exec.delete_file(Path::new("sub/a.txt")).await.unwrap();
        assert!(!exec.file_exists(Path::new("sub/a.txt")).await.unwrap());
    }

    #[tokio::test]
    async fn reads_outside_the_workspace_are_violations() {
        let dir = TempDir::new().unwrap();
        let outside = TempDir::new().unwrap();
        let secret = outside.path().join("secret.txt");
        std::fs::write(&secret, "s").unwrap();

        let exec = executor(&dir).await;
        let err = exec.read_file(&secret).await.unwrap_err();
        assert_eq!(err.tag(), "security_violation");
        // Existence probes outside the root are violations too, not false.
        let err = exec.file_exists(&secret).await.unwrap_err();
        assert_eq!(err.tag(), "security_violation");
    }

    #[tokio::test]
    async fn initialize_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let exec = executor(&dir).await;
        exec.initialize(&ExecutorConfig::new(dir.path())).await.unwrap();
        exec.write_file(Path::new("x"), "1").await.unwrap();
    }
}

//! In-VM sandbox agent: JSON-RPC 2.0 over stdio.
//!
//! **Entry**: the `agentbox-agent` binary, launched by a host-side bridge
//! through `wsl.exe -e` or `limactl shell`.
//!
//! **Scope**: one JSON object per line on stdin/stdout. Every request is
//! dispatched onto its own task, so responses may complete out of order;
//! the host correlates by id. stderr carries tracing output only.
//!
//! The agent trusts nothing from the host side: every path and command is
//! re-validated against its own workspace root before touching the
//! filesystem. Until `setWorkspace` arrives, only `ping` and `shutdown`
//! are accepted.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use serde_json::{json, Value};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info};

use agentbox_core::error::{SandboxError, SandboxResult};
use agentbox_core::path_guard;
use agentbox_core::protocol::{
    codes, methods, validate_envelope, ClaudeMessage, ExecuteCommandParams, PathParams,
    RpcError, RpcRequest, RpcResponse, RunClaudeCodeParams, RunClaudeCodeResult,
    SetWorkspaceParams, WriteFileParams,
};
use agentbox_sandbox::executor::{ExecutorConfig, SandboxExecutor};
use agentbox_sandbox::native::NativeExecutor;

/// Maximum request line size (10 MB) to prevent OOM from a hostile peer.
const MAX_REQUEST_SIZE: usize = 10 * 1024 * 1024;

/// External CLI spawned by `runClaudeCode`.
const CLAUDE_CLI: &str = "claude";

struct Workspace {
    root: PathBuf,
    executor: Arc<NativeExecutor>,
}

pub struct SandboxAgent {
    workspace: tokio::sync::RwLock<Option<Workspace>>,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
}

impl SandboxAgent {
    pub fn new() -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        Self {
            workspace: tokio::sync::RwLock::new(None),
            shutdown_tx,
            shutdown_rx,
        }
    }

    async fn require(&self) -> SandboxResult<(PathBuf, Arc<NativeExecutor>)> {
        match self.workspace.read().await.as_ref() {
            Some(ws) => Ok((ws.root.clone(), ws.executor.clone())),
            None => Err(SandboxError::Configuration(
                "workspace not set; call setWorkspace first".to_string(),
            )),
        }
    }

    async fn set_workspace(&self, params: SetWorkspaceParams) -> SandboxResult<Value> {
        let root = PathBuf::from(&params.path);
        if !root.is_dir() {
            return Err(SandboxError::Configuration(format!(
                "workspace {} does not exist or is not a directory",
                root.display()
            )));
        }
        let root = tokio::fs::canonicalize(&root).await?;

        let executor = Arc::new(NativeExecutor::new());
        executor.initialize(&ExecutorConfig::new(&root)).await?;
        info!(workspace = %root.display(), "workspace set");
        *self.workspace.write().await = Some(Workspace {
            root: root.clone(),
            executor,
        });
        Ok(json!({
            "ok": true,
            "path": root.to_string_lossy(),
            "hostPath": params.host_path,
        }))
    }

    fn request_shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    async fn wait_shutdown(&self) {
        let mut rx = self.shutdown_rx.clone();
        // Already requested, or wait for the flag to flip.
        while !*rx.borrow() {
            if rx.changed().await.is_err() {
                return;
            }
        }
    }
}

impl Default for SandboxAgent {
    fn default() -> Self {
        Self::new()
    }
}

/// Dispatch one request to its handler. Errors become wire errors; a
/// method outside the protocol is `-32601`.
pub async fn dispatch(agent: &SandboxAgent, method: &str, params: Value) -> Result<Value, RpcError> {
    let result = match method {
        methods::PING => Ok(json!({ "pong": true, "version": env!("CARGO_PKG_VERSION") })),
        methods::SET_WORKSPACE => match serde_json::from_value::<SetWorkspaceParams>(params) {
            Ok(p) => agent.set_workspace(p).await,
            Err(e) => return Err(invalid_params(e)),
        },
        methods::SHUTDOWN => {
            agent.request_shutdown();
            Ok(json!({ "ok": true }))
        }
        methods::EXECUTE_COMMAND => match serde_json::from_value::<ExecuteCommandParams>(params) {
            Ok(p) => execute_command(agent, p).await,
            Err(e) => return Err(invalid_params(e)),
        },
        methods::READ_FILE => with_path(agent, params, |exec, path| async move {
            Ok(json!({ "content": exec.read_file(&path).await? }))
        })
        .await,
        methods::WRITE_FILE => match serde_json::from_value::<WriteFileParams>(params) {
            Ok(p) => {
                let (_, exec) = agent.require().await.map_err(wire)?;
                exec.write_file(Path::new(&p.path), &p.content)
                    .await
                    .map(|_| json!({ "ok": true }))
            }
            Err(e) => return Err(invalid_params(e)),
        },
        methods::LIST_DIRECTORY => with_path(agent, params, |exec, path| async move {
            Ok(json!({ "entries": exec.list_directory(&path).await? }))
        })
        .await,
        methods::FILE_EXISTS => with_path(agent, params, |exec, path| async move {
            Ok(json!({ "exists": exec.file_exists(&path).await? }))
        })
        .await,
        methods::DELETE_FILE => with_path(agent, params, |exec, path| async move {
            exec.delete_file(&path).await?;
            Ok(json!({ "ok": true }))
        })
        .await,
        methods::CREATE_DIRECTORY => with_path(agent, params, |exec, path| async move {
            exec.create_directory(&path).await?;
            Ok(json!({ "ok": true }))
        })
        .await,
        methods::COPY_FILE => {
            match serde_json::from_value::<agentbox_core::protocol::CopyFileParams>(params) {
                Ok(p) => {
                    let (_, exec) = agent.require().await.map_err(wire)?;
                    exec.copy_file(Path::new(&p.source), Path::new(&p.destination))
                        .await
                        .map(|_| json!({ "ok": true }))
                }
                Err(e) => return Err(invalid_params(e)),
            }
        }
        methods::RUN_CLAUDE_CODE => match serde_json::from_value::<RunClaudeCodeParams>(params) {
            Ok(p) => run_claude_code(agent, p).await,
            Err(e) => return Err(invalid_params(e)),
        },
        other => {
            return Err(RpcError {
                code: codes::METHOD_NOT_FOUND,
                message: format!("method not found: {}", other),
            })
        }
    };
    result.map_err(|e| RpcError::from_sandbox_error(&e))
}

fn wire(e: SandboxError) -> RpcError {
    RpcError::from_sandbox_error(&e)
}

fn invalid_params(e: serde_json::Error) -> RpcError {
    RpcError {
        code: codes::INVALID_PARAMS,
        message: format!("invalid params: {}", e),
    }
}

async fn with_path<F, Fut>(agent: &SandboxAgent, params: Value, f: F) -> SandboxResult<Value>
where
    F: FnOnce(Arc<NativeExecutor>, PathBuf) -> Fut,
    Fut: std::future::Future<Output = SandboxResult<Value>>,
{
    let p: PathParams = serde_json::from_value(params)
        .map_err(|e| SandboxError::Configuration(format!("invalid params: {}", e)))?;
    let (_, exec) = agent.require().await?;
    f(exec, PathBuf::from(p.path)).await
}

async fn execute_command(agent: &SandboxAgent, p: ExecuteCommandParams) -> SandboxResult<Value> {
    let (_, exec) = agent.require().await?;
    let cwd = p.cwd.as_ref().map(PathBuf::from);
    let fut = exec.execute_command(&p.command, cwd.as_deref(), &p.env);
    // The executor enforces its own default budget; an explicit per-call
    // budget from the host tightens it.
    let result = match p.timeout_secs {
        Some(secs) => {
            let budget = Duration::from_secs(secs);
            tokio::time::timeout(budget, fut)
                .await
                .map_err(|_| SandboxError::Timeout(budget))??
        }
        None => fut.await?,
    };
    Ok(serde_json::to_value(result)?)
}

/// Spawn the external CLI and parse its newline-delimited JSON output.
/// Non-JSON lines are preserved verbatim so diagnostics survive.
async fn run_claude_code(agent: &SandboxAgent, p: RunClaudeCodeParams) -> SandboxResult<Value> {
    let (root, _) = agent.require().await?;
    let cwd = match &p.cwd {
        Some(dir) => path_guard::validate_path(Path::new(dir), &root)?,
        None => root.clone(),
    };

    let mut cmd = tokio::process::Command::new(CLAUDE_CLI);
    cmd.args(&p.args)
        .arg("-p")
        .arg(&p.prompt)
        .current_dir(&cwd)
        .stdin(std::process::Stdio::null());
    let output = cmd
        .output()
        .await
        .map_err(|e| SandboxError::Upstream(format!("failed to spawn {}: {}", CLAUDE_CLI, e)))?;

    let messages: Vec<ClaudeMessage> = String::from_utf8_lossy(&output.stdout)
        .lines()
        .filter(|l| !l.trim().is_empty())
        .map(|line| match serde_json::from_str::<Value>(line) {
            Ok(v) => ClaudeMessage {
                json: Some(v),
                raw: None,
            },
            Err(_) => ClaudeMessage {
                json: None,
                raw: Some(line.to_string()),
            },
        })
        .collect();

    let result = RunClaudeCodeResult {
        messages,
        exit_code: output.status.code().unwrap_or(-1),
    };
    Ok(serde_json::to_value(result)?)
}

// ─── Serve loop ─────────────────────────────────────────────────────────────

/// Run the agent until EOF, `shutdown`, SIGTERM or SIGINT.
pub async fn serve() -> Result<()> {
    let agent = Arc::new(SandboxAgent::new());
    let (tx, mut rx) = mpsc::channel::<RpcResponse>(64);

    // Writer task: single owner of stdout, one response per line.
    let writer = tokio::spawn(async move {
        let mut stdout = tokio::io::stdout();
        while let Some(response) = rx.recv().await {
            match serde_json::to_string(&response) {
                Ok(mut line) => {
                    line.push('\n');
                    stdout.write_all(line.as_bytes()).await?;
                    stdout.flush().await?;
                }
                Err(e) => error!("failed to serialize response: {}", e),
            }
        }
        anyhow::Ok(())
    });

    let mut reader = BufReader::new(tokio::io::stdin());
    serve_loop(&agent, &mut reader, &tx).await?;

    // In-flight handler tasks hold tx clones; the writer drains them all
    // before exiting.
    drop(tx);
    writer.await??;
    info!("agent exiting");
    Ok(())
}

async fn serve_loop<R: AsyncBufRead + Unpin>(
    agent: &Arc<SandboxAgent>,
    reader: &mut R,
    tx: &mpsc::Sender<RpcResponse>,
) -> Result<()> {
    #[cfg(unix)]
    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;

    loop {
        #[cfg(unix)]
        let term = sigterm.recv();
        #[cfg(not(unix))]
        let term = std::future::pending::<Option<()>>();

        tokio::select! {
            _ = agent.wait_shutdown() => {
                debug!("shutdown requested");
                break;
            }
            _ = tokio::signal::ctrl_c() => {
                debug!("SIGINT received");
                break;
            }
            _ = term => {
                debug!("SIGTERM received");
                break;
            }
            line = read_line_limited(reader) => {
                match line {
                    Ok(None) => break, // EOF
                    Ok(Some(l)) => handle_line(agent, l, tx).await,
                    Err(e) => {
                        let _ = tx
                            .send(RpcResponse::error("", codes::PARSE_ERROR, e.to_string()))
                            .await;
                    }
                }
            }
        }
    }
    Ok(())
}

async fn handle_line(agent: &Arc<SandboxAgent>, line: String, tx: &mpsc::Sender<RpcResponse>) {
    let line = line.trim();
    if line.is_empty() {
        return;
    }

    let value: Value = match serde_json::from_str(line) {
        Ok(v) => v,
        Err(e) => {
            let _ = tx
                .send(RpcResponse::error(
                    "",
                    codes::PARSE_ERROR,
                    format!("parse error: {}", e),
                ))
                .await;
            return;
        }
    };

    if let Err(reason) = validate_envelope(&value) {
        let id = value
            .get("id")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let _ = tx
            .send(RpcResponse::error(id, codes::INVALID_ENVELOPE, reason))
            .await;
        return;
    }

    let request: RpcRequest = match serde_json::from_value(value) {
        Ok(r) => r,
        Err(e) => {
            let _ = tx
                .send(RpcResponse::error("", codes::PARSE_ERROR, e.to_string()))
                .await;
            return;
        }
    };

    // One task per request; responses interleave freely on stdout.
    let agent = agent.clone();
    let tx = tx.clone();
    tokio::spawn(async move {
        let response = match dispatch(&agent, &request.method, request.params).await {
            Ok(result) => RpcResponse::result(&request.id, result),
            Err(e) => RpcResponse::error(&request.id, e.code, e.message),
        };
        let _ = tx.send(response).await;
    });
}

/// Read one line, enforcing [`MAX_REQUEST_SIZE`]. `Ok(None)` on EOF. An
/// oversized line is consumed to its newline so the stream stays usable.
async fn read_line_limited<R: AsyncBufRead + Unpin>(
    reader: &mut R,
) -> std::io::Result<Option<String>> {
    use std::io::{Error, ErrorKind};

    let mut buf = Vec::new();
    loop {
        let available = reader.fill_buf().await?;
        if available.is_empty() {
            if buf.is_empty() {
                return Ok(None);
            }
            if buf.last() == Some(&b'\r') {
                buf.pop();
            }
            return String::from_utf8(buf)
                .map(Some)
                .map_err(|_| Error::new(ErrorKind::InvalidData, "invalid UTF-8"));
        }
        match available.iter().position(|&b| b == b'\n') {
            Some(pos) => {
                if buf.len() + pos > MAX_REQUEST_SIZE {
                    reader.consume(pos + 1);
                    return Err(Error::new(
                        ErrorKind::InvalidData,
                        "request exceeds 10MB size limit",
                    ));
                }
                buf.extend_from_slice(&available[..pos]);
                reader.consume(pos + 1);
                if buf.last() == Some(&b'\r') {
                    buf.pop();
                }
                return String::from_utf8(buf)
                    .map(Some)
                    .map_err(|_| Error::new(ErrorKind::InvalidData, "invalid UTF-8"));
            }
            None => {
                let len = available.len();
                if buf.len() + len > MAX_REQUEST_SIZE {
                    reader.consume(len);
                    skip_until_newline(reader).await;
                    return Err(Error::new(
                        ErrorKind::InvalidData,
                        "request exceeds 10MB size limit",
                    ));
                }
                buf.extend_from_slice(available);
                reader.consume(len);
            }
        }
    }
}

async fn skip_until_newline<R: AsyncBufRead + Unpin>(reader: &mut R) {
    loop {
        match reader.fill_buf().await {
            Ok(b) if b.is_empty() => break,
            Ok(b) => {
                if let Some(pos) = b.iter().position(|&c| c == b'\n') {
                    reader.consume(pos + 1);
                    break;
                }
                let len = b.len();
                reader.consume(len);
            }
            Err(_) => break,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    async fn ready_agent(dir: &TempDir) -> SandboxAgent {
        let agent = SandboxAgent::new();
        let params = json!({ "path": dir.path().to_string_lossy() });
        dispatch(&agent, methods::SET_WORKSPACE, params)
            .await
            .unwrap();
        agent
    }

    #[tokio::test]
    async fn ping_answers_before_workspace_is_set() {
        let agent = SandboxAgent::new();
        let result = dispatch(&agent, methods::PING, Value::Null).await.unwrap();
        assert_eq!(result["pong"], true);
    }

    #[tokio::test]
    async fn file_operations_require_a_workspace() {
        let agent = SandboxAgent::new();
        let err = dispatch(&agent, methods::READ_FILE, json!({ "path": "a.txt" }))
            .await
            .unwrap_err();
        assert_eq!(err.code, codes::CONFIGURATION);
    }

    #[tokio::test]
    async fn unknown_method_maps_to_method_not_found() {
        let agent = SandboxAgent::new();
        let err = dispatch(&agent, "frobnicate", Value::Null).await.unwrap_err();
        assert_eq!(err.code, codes::METHOD_NOT_FOUND);
    }

    #[tokio::test]
    async fn set_workspace_rejects_a_missing_directory() {
        let agent = SandboxAgent::new();
        let err = dispatch(
            &agent,
            methods::SET_WORKSPACE,
            json!({ "path": "/definitely/not/here" }),
        )
        .await
        .unwrap_err();
        assert_eq!(err.code, codes::CONFIGURATION);
    }

    #[tokio::test]
    async fn file_round_trip_inside_the_workspace() {
        let dir = TempDir::new().unwrap();
        let agent = ready_agent(&dir).await;
        let file = dir.path().join("notes.txt");

        dispatch(
            &agent,
            methods::WRITE_FILE,
            json!({ "path": file.to_string_lossy(), "content": "hello" }),
        )
        .await
        .unwrap();
        let read = dispatch(
            &agent,
            methods::READ_FILE,
            json!({ "path": file.to_string_lossy() }),
        )
        .await
        .unwrap();
        assert_eq!(read["content"], "hello");

        let listed = dispatch(
            &agent,
            methods::LIST_DIRECTORY,
            json!({ "path": dir.path().to_string_lossy() }),
        )
        .await
        .unwrap();
        let names: Vec<&str> = listed["entries"]
            .as_array()
            .unwrap()
            .iter()
            .map(|e| e["name"].as_str().unwrap())
            .collect();
        assert!(names.contains(&"notes.txt"));
    }

    #[tokio::test]
    async fn escaping_paths_are_rejected_as_security_violations() {
        let dir = TempDir::new().unwrap();
        let agent = ready_agent(&dir).await;
        let outside = dir.path().join("../outside.txt");
        let err = dispatch(
            &agent,
            methods::READ_FILE,
            json!({ "path": outside.to_string_lossy() }),
        )
        .await
        .unwrap_err();
        assert_eq!(err.code, codes::SECURITY_VIOLATION);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn execute_command_runs_inside_the_workspace() {
        let dir = TempDir::new().unwrap();
        let agent = ready_agent(&dir).await;
        let result = dispatch(
            &agent,
            methods::EXECUTE_COMMAND,
            json!({ "command": "echo hi" }),
        )
        .await
        .unwrap();
        assert_eq!(result["success"], true);
        assert_eq!(result["stdout"], "hi\n");
    }

    #[tokio::test]
    async fn shutdown_flips_the_agent_flag() {
        let agent = SandboxAgent::new();
        dispatch(&agent, methods::SHUTDOWN, Value::Null)
            .await
            .unwrap();
        // Resolves immediately once requested.
        agent.wait_shutdown().await;
    }

    #[tokio::test]
    async fn limited_reader_accepts_normal_lines_and_rejects_oversized_ones() {
        let data = b"{\"jsonrpc\":\"2.0\"}\n".to_vec();
        let mut reader = BufReader::new(&data[..]);
        let line = read_line_limited(&mut reader).await.unwrap();
        assert_eq!(line.as_deref(), Some("{\"jsonrpc\":\"2.0\"}"));
        assert!(read_line_limited(&mut reader).await.unwrap().is_none());

        let mut huge = vec![b'x'; MAX_REQUEST_SIZE + 16];
        huge.push(b'\n');
        huge.extend_from_slice(b"after\n");
        let mut reader = BufReader::new(&huge[..]);
        assert!(read_line_limited(&mut reader).await.is_err());
        // The stream recovers at the next line.
        assert_eq!(
            read_line_limited(&mut reader).await.unwrap().as_deref(),
            Some("after")
        );
    }

    #[tokio::test]
    async fn serve_loop_rejects_bad_envelopes_with_the_envelope_code() {
        let agent = Arc::new(SandboxAgent::new());
        let (tx, mut rx) = mpsc::channel(8);
        handle_line(
            &agent,
            "{\"jsonrpc\":\"1.0\",\"id\":\"7\",\"method\":\"ping\"}".to_string(),
            &tx,
        )
        .await;
        let response = rx.recv().await.unwrap();
        assert_eq!(response.error.unwrap().code, codes::INVALID_ENVELOPE);
        assert_eq!(response.id, "7");

        handle_line(&agent, "not json at all".to_string(), &tx).await;
        let response = rx.recv().await.unwrap();
        assert_eq!(response.error.unwrap().code, codes::PARSE_ERROR);
    }

    #[tokio::test]
    async fn dispatched_requests_answer_out_of_band() {
        let dir = TempDir::new().unwrap();
        let agent = Arc::new(SandboxAgent::new());
        let (tx, mut rx) = mpsc::channel(8);

        let set = json!({
            "jsonrpc": "2.0", "id": "1", "method": "setWorkspace",
            "params": { "path": dir.path().to_string_lossy() }
        });
        handle_line(&agent, set.to_string(), &tx).await;
        let response = rx.recv().await.unwrap();
        assert_eq!(response.id, "1");
        assert!(response.error.is_none());
    }
}

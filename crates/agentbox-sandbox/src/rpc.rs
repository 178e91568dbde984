//! AgentClient: newline-delimited JSON-RPC 2.0 over a child process's stdio.
//!
//! One long-lived agent process per VM backend; many logical operations
//! multiplexed onto its single stdio channel via id correlation. Every
//! outgoing call generates a fresh id, stores a single-resolution handle
//! in the pending map, writes one line, and awaits the correlated
//! response line — so concurrent requests complete in any order without
//! cross-talk.
//!
//! If the agent process exits or the stream errors, every still-pending
//! handle is rejected with `RemoteUnavailable` and the map is cleared.
//! Each request additionally carries its own timeout (distinct from the
//! process-level command timeout) that rejects and evicts the stale entry
//! if no response line ever arrives; it does not kill the agent.

use std::collections::HashMap;
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use agentbox_core::error::{SandboxError, SandboxResult};
use agentbox_core::protocol::{methods, RpcRequest, RpcResponse};

/// Agent process lifecycle, driven by spawn success, ping, shutdown
/// requests, and process-exit events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AgentState {
    #[default]
    NotStarted,
    Starting,
    Ready,
    Unhealthy,
    ShuttingDown,
    Stopped,
}

/// How long a graceful shutdown waits for the agent to exit on its own.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

type PendingMap = Arc<Mutex<HashMap<String, oneshot::Sender<SandboxResult<Value>>>>>;

/// Host-side JSON-RPC client for one agent process.
pub struct AgentClient {
    pending: PendingMap,
    tx: mpsc::Sender<String>,
    state: Arc<Mutex<AgentState>>,
    rpc_timeout: Duration,
    monitor: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl std::fmt::Debug for AgentClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentClient")
            .field("state", &self.state())
            .field("pending", &self.pending_len())
            .finish()
    }
}

impl AgentClient {
    /// Spawn the agent process and establish the stdio channel.
    ///
    /// The returned client is `Ready` — a ping has round-tripped — or an
    /// error is returned and the process is torn down.
    pub async fn spawn(program: &str, args: &[String], rpc_timeout: Duration) -> SandboxResult<Self> {
        let mut child = Command::new(program)
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                SandboxError::RemoteUnavailable(format!("failed to spawn {}: {}", program, e))
            })?;

        let stdin = child.stdin.take().ok_or_else(|| {
            SandboxError::RemoteUnavailable("agent stdin not captured".to_string())
        })?;
        let stdout = child.stdout.take().ok_or_else(|| {
            SandboxError::RemoteUnavailable("agent stdout not captured".to_string())
        })?;
        let stderr = child.stderr.take();

        // Agent stderr carries its tracing output; relay at debug level.
        if let Some(stderr) = stderr {
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    debug!(target: "agentbox::agent_stderr", "{}", line);
                }
            });
        }

        let client = Self::from_streams(stdout, stdin, rpc_timeout);
        client.set_state(AgentState::Starting);

        // Exit monitor: owns the child. Rejecting pending requests on EOF
        // is handled by the reader task; this records the exit status and
        // keeps kill_on_drop armed for forced shutdown.
        let pending = Arc::clone(&client.pending);
        let state = Arc::clone(&client.state);
        let monitor = tokio::spawn(async move {
            match child.wait().await {
                Ok(status) => debug!("agent process exited: {}", status),
                Err(e) => warn!("agent process wait failed: {}", e),
            }
            fail_all(&pending, "agent process exited");
            *state.lock().expect("agent state lock") = AgentState::Stopped;
        });
        *client.monitor.lock().expect("monitor lock") = Some(monitor);

        match client.call(methods::PING, Value::Null).await {
            Ok(_) => {
                client.set_state(AgentState::Ready);
                Ok(client)
            }
            Err(e) => {
                client.set_state(AgentState::Unhealthy);
                client.force_stop();
                Err(SandboxError::RemoteUnavailable(format!(
                    "agent did not answer ping: {}",
                    e
                )))
            }
        }
    }

    /// Build a client over raw streams. Used by [`spawn`](Self::spawn) and
    /// by tests driving the wire through an in-memory duplex.
    pub fn from_streams<R, W>(reader: R, writer: W, rpc_timeout: Duration) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let pending: PendingMap = Arc::new(Mutex::new(HashMap::new()));
        let state = Arc::new(Mutex::new(AgentState::Starting));
        let (tx, mut rx) = mpsc::channel::<String>(64);

        // Writer task: serialized line writes; stdin is not shareable.
        let mut writer = writer;
        tokio::spawn(async move {
            while let Some(line) = rx.recv().await {
                if writer.write_all(line.as_bytes()).await.is_err() {
                    break;
                }
                if writer.write_all(b"\n").await.is_err() {
                    break;
                }
                if writer.flush().await.is_err() {
                    break;
                }
            }
        });

        // Reader task: parse one response per line, resolve the matching
        // handle, remove it from the map. On EOF every pending handle is
        // rejected so no caller hangs.
        let pending_reader = Arc::clone(&pending);
        let state_reader = Arc::clone(&state);
        tokio::spawn(async move {
            let mut lines = BufReader::new(reader).lines();
            loop {
                match lines.next_line().await {
                    Ok(Some(line)) => {
                        let line = line.trim();
                        if line.is_empty() {
                            continue;
                        }
                        let response: RpcResponse = match serde_json::from_str(line) {
                            Ok(r) => r,
                            Err(e) => {
                                warn!("unparseable agent response line: {}", e);
                                continue;
                            }
                        };
                        let sender = pending_reader
                            .lock()
                            .expect("pending map lock")
                            .remove(&response.id);
                        match sender {
                            Some(sender) => {
                                let outcome = match (response.result, response.error) {
                                    (_, Some(error)) => Err(error.into_sandbox_error()),
                                    (Some(result), None) => Ok(result),
                                    (None, None) => Ok(Value::Null),
                                };
                                let _ = sender.send(outcome);
                            }
                            // Late response after a per-request timeout
                            // already evicted the entry.
                            None => debug!("uncorrelated response id {}", response.id),
                        }
                    }
                    Ok(None) | Err(_) => break,
                }
            }
            fail_all(&pending_reader, "agent closed the connection");
            *state_reader.lock().expect("agent state lock") = AgentState::Stopped;
        });

        Self {
            pending,
            tx,
            state,
            rpc_timeout,
            monitor: Mutex::new(None),
        }
    }

    /// Issue one JSON-RPC call and await its correlated response, bounded
    /// by the flat RPC timeout.
    pub async fn call(&self, method: &str, params: Value) -> SandboxResult<Value> {
        self.call_with_timeout(method, params, self.rpc_timeout).await
    }

    /// Like [`call`](Self::call) with an explicit deadline, for requests
    /// whose legitimate duration exceeds the flat RPC timeout (remote
    /// command execution runs under the process-level budget instead).
    pub async fn call_with_timeout(
        &self,
        method: &str,
        params: Value,
        deadline: Duration,
    ) -> SandboxResult<Value> {
        match self.state() {
            AgentState::ShuttingDown | AgentState::Stopped => {
                return Err(SandboxError::RemoteUnavailable(format!(
                    "agent is not running (state: {:?})",
                    self.state()
                )))
            }
            _ => {}
        }

        let id = uuid::Uuid::new_v4().to_string();
        let request = RpcRequest::new(id.clone(), method, params);
        let line = serde_json::to_string(&request)?;

        let (resp_tx, resp_rx) = oneshot::channel();
        self.pending
            .lock()
            .expect("pending map lock")
            .insert(id.clone(), resp_tx);

        if self.tx.send(line).await.is_err() {
            self.pending.lock().expect("pending map lock").remove(&id);
            return Err(SandboxError::RemoteUnavailable(
                "agent stdin is closed".to_string(),
            ));
        }

        match tokio::time::timeout(deadline, resp_rx).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => Err(SandboxError::RemoteUnavailable(
                "agent exited before responding".to_string(),
            )),
            Err(_) => {
                // Evict the stale entry; a late response line becomes an
                // uncorrelated no-op in the reader.
                self.pending.lock().expect("pending map lock").remove(&id);
                Err(SandboxError::Timeout(deadline))
            }
        }
    }

    /// Liveness probe.
    pub async fn ping(&self) -> SandboxResult<()> {
        self.call(methods::PING, Value::Null).await.map(|_| ())
    }

    /// Graceful shutdown: ask the agent to exit, wait for the exit to be
    /// observed, force-stop if it lingers. Safe to call more than once.
    pub async fn shutdown(&self) {
        if self.state() == AgentState::Stopped {
            return;
        }
        self.set_state(AgentState::ShuttingDown);
        let id = uuid::Uuid::new_v4().to_string();
        let request = RpcRequest::new(id, methods::SHUTDOWN, Value::Null);
        if let Ok(line) = serde_json::to_string(&request) {
            // Fire and forget: the agent replies by exiting.
            let _ = self.tx.send(line).await;
        }
        // The monitor (or the reader, on EOF) flips the state to Stopped
        // as soon as the process is gone; only a lingering agent burns the
        // full grace period before being killed.
        let observed = tokio::time::timeout(SHUTDOWN_GRACE, async {
            while self.state() != AgentState::Stopped {
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await;
        if observed.is_err() {
            warn!("agent did not exit within {:?}, killing it", SHUTDOWN_GRACE);
        }
        self.force_stop();
    }

    pub fn state(&self) -> AgentState {
        *self.state.lock().expect("agent state lock")
    }

    /// Number of in-flight requests. Diagnostic only.
    pub fn pending_len(&self) -> usize {
        self.pending.lock().expect("pending map lock").len()
    }

    fn set_state(&self, state: AgentState) {
        *self.state.lock().expect("agent state lock") = state;
    }

    /// Abort the exit monitor; dropping the child there kills the process
    /// (kill_on_drop).
    fn force_stop(&self) {
        if let Some(handle) = self.monitor.lock().expect("monitor lock").take() {
            handle.abort();
        }
        fail_all(&self.pending, "agent shut down");
        self.set_state(AgentState::Stopped);
    }
}

/// Reject every outstanding request and clear the map in one pass.
fn fail_all(pending: &PendingMap, reason: &str) {
    let drained: Vec<_> = {
        let mut map = pending.lock().expect("pending map lock");
        map.drain().collect()
    };
    for (_, sender) in drained {
        let _ = sender.send(Err(SandboxError::RemoteUnavailable(reason.to_string())));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use agentbox_core::protocol::codes;
    use serde_json::json;
    use tokio::io::{split, DuplexStream, ReadHalf, WriteHalf};

    struct FakeWire {
        reader: tokio::io::Lines<BufReader<ReadHalf<DuplexStream>>>,
        writer: WriteHalf<DuplexStream>,
    }

    impl FakeWire {
        async fn next_request(&mut self) -> RpcRequest {
            loop {
                let line = self.reader.next_line().await.unwrap().unwrap();
                if !line.trim().is_empty() {
                    return serde_json::from_str(&line).unwrap();
                }
            }
        }

        async fn respond(&mut self, id: &str, result: Value) {
            let line = serde_json::to_string(&RpcResponse::result(id, result)).unwrap();
            self.writer.write_all(line.as_bytes()).await.unwrap();
            self.writer.write_all(b"\n").await.unwrap();
        }

        async fn respond_error(&mut self, id: &str, code: i64, message: &str) {
            let line = serde_json::to_string(&RpcResponse::error(id, code, message)).unwrap();
            self.writer.write_all(line.as_bytes()).await.unwrap();
            self.writer.write_all(b"\n").await.unwrap();
        }
    }

    fn wired(rpc_timeout: Duration) -> (AgentClient, FakeWire) {
        let (host_side, agent_side) = tokio::io::duplex(64 * 1024);
        let (host_read, host_write) = split(host_side);
        let (agent_read, agent_write) = split(agent_side);
        let client = AgentClient::from_streams(host_read, host_write, rpc_timeout);
        let wire = FakeWire {
            reader: BufReader::new(agent_read).lines(),
            writer: agent_write,
        };
        (client, wire)
    }

    #[tokio::test]
    async fn concurrent_requests_correlate_independent_of_completion_order() {
        let (client, mut wire) = wired(Duration::from_secs(5));
        let client = Arc::new(client);

        let mut callers = Vec::new();
        for i in 0..4 {
            let client = Arc::clone(&client);
            callers.push(tokio::spawn(async move {
                client.call("ping", json!({"seq": i})).await.unwrap()
            }));
        }

        // Collect all four requests, then answer them in reverse order,
        // echoing each request's seq back under its own id.
        let mut requests = Vec::new();
        for _ in 0..4 {
            requests.push(wire.next_request().await);
        }
        for request in requests.iter().rev() {
            let seq = request.params["seq"].clone();
            wire.respond(&request.id, json!({"echo": seq})).await;
        }

        for (i, caller) in callers.into_iter().enumerate() {
            let result = caller.await.unwrap();
            assert_eq!(result["echo"], i as u64);
        }
        assert_eq!(client.pending_len(), 0);
    }

    #[tokio::test]
    async fn agent_exit_rejects_every_pending_request() {
        let (client, mut wire) = wired(Duration::from_secs(5));
        let client = Arc::new(client);

        let mut callers = Vec::new();
        for _ in 0..3 {
            let client = Arc::clone(&client);
            callers.push(tokio::spawn(async move { client.call("ping", Value::Null).await }));
        }
        for _ in 0..3 {
            wire.next_request().await;
        }
        assert_eq!(client.pending_len(), 3);

        drop(wire); // agent "crashes": both halves close

        for caller in callers {
            let err = caller.await.unwrap().unwrap_err();
            assert_eq!(err.tag(), "remote_unavailable");
        }
        assert_eq!(client.pending_len(), 0);
        assert_eq!(client.state(), AgentState::Stopped);
    }

    #[tokio::test]
    async fn per_request_timeout_evicts_only_the_stale_entry() {
        let (client, mut wire) = wired(Duration::from_millis(100));
        let err = client.call("ping", Value::Null).await.unwrap_err();
        assert_eq!(err.tag(), "timeout");
        assert_eq!(client.pending_len(), 0);

        // A late response for the evicted id is ignored, not a crash.
        let request = wire.next_request().await;
        wire.respond(&request.id, json!({"late": true})).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(client.pending_len(), 0);
    }

    #[tokio::test]
    async fn explicit_deadlines_outlive_the_flat_rpc_timeout() {
        let (client, mut wire) = wired(Duration::from_millis(100));
        let client = Arc::new(client);
        let c = Arc::clone(&client);
        let call = tokio::spawn(async move {
            c.call_with_timeout(
                "executeCommand",
                json!({"command": "sleep 1"}),
                Duration::from_secs(5),
            )
            .await
        });
        let request = wire.next_request().await;
        // The remote command legitimately runs past the flat RPC deadline.
        tokio::time::sleep(Duration::from_millis(300)).await;
        wire.respond(&request.id, json!({"success": true})).await;
        let result = call.await.unwrap().unwrap();
        assert_eq!(result["success"], true);
        assert_eq!(client.pending_len(), 0);
    }

    #[tokio::test]
    async fn shutdown_returns_as_soon_as_the_agent_exits() {
        let (client, mut wire) = wired(Duration::from_secs(5));
        let client = Arc::new(client);
        let started = std::time::Instant::now();
        let c = Arc::clone(&client);
        let task = tokio::spawn(async move { c.shutdown().await });
        let request = wire.next_request().await;
        assert_eq!(request.method, methods::SHUTDOWN);
        drop(wire); // the agent exits instead of replying
        task.await.unwrap();
        assert_eq!(client.state(), AgentState::Stopped);
        assert!(started.elapsed() < SHUTDOWN_GRACE);
    }

    #[tokio::test]
    async fn error_responses_map_back_to_the_taxonomy() {
        let (client, mut wire) = wired(Duration::from_secs(5));
        let call = tokio::spawn({
            let client = Arc::new(client);
            let c = Arc::clone(&client);
            async move { c.call("readFile", json!({"path": "/etc/passwd"})).await }
        });
        let request = wire.next_request().await;
        wire.respond_error(&request.id, codes::SECURITY_VIOLATION, "path escapes workspace")
            .await;
        let err = call.await.unwrap().unwrap_err();
        assert_eq!(err.tag(), "security_violation");
    }

    #[tokio::test]
    async fn calls_after_stop_are_rejected_immediately() {
        let (client, wire) = wired(Duration::from_secs(5));
        drop(wire);
        // Give the reader task a tick to observe EOF.
        tokio::time::sleep(Duration::from_millis(50)).await;
        let err = client.call("ping", Value::Null).await.unwrap_err();
        assert_eq!(err.tag(), "remote_unavailable");
    }
}

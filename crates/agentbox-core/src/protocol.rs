//! Agent wire protocol: newline-delimited JSON-RPC 2.0 over stdio.
//!
//! One complete JSON object per line in each direction. These types are
//! the shared "currency" between the host-side bridges and the in-VM
//! agent; both ends serialize through this module so the wire format has
//! exactly one definition.
//!
//! Request:  `{"jsonrpc":"2.0","id":"<id>","method":"<name>","params":{...}}`
//! Result:   `{"jsonrpc":"2.0","id":"<id>","result":{...}}`
//! Error:    `{"jsonrpc":"2.0","id":"<id>","error":{"code":<int>,"message":"<text>"}}`

use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::SandboxError;

pub const JSONRPC_VERSION: &str = "2.0";

/// JSON-RPC error codes. The -32000..-32099 range is implementation
/// defined; we use it for the sandbox taxonomy so the host can map an
/// error back to a [`SandboxError`] variant without parsing messages.
pub mod codes {
    pub const PARSE_ERROR: i64 = -32700;
    pub const METHOD_NOT_FOUND: i64 = -32601;
    pub const INVALID_PARAMS: i64 = -32602;
    pub const INTERNAL_ERROR: i64 = -32603;
    /// Malformed envelope: wrong `jsonrpc`, empty `id`, missing `method`.
    pub const INVALID_ENVELOPE: i64 = -32000;
    pub const SECURITY_VIOLATION: i64 = -32001;
    pub const CONFIGURATION: i64 = -32002;
    pub const TIMEOUT: i64 = -32003;
    pub const UPSTREAM: i64 = -32004;
}

/// Agent method names as they appear on the wire.
pub mod methods {
    pub const PING: &str = "ping";
    pub const SET_WORKSPACE: &str = "setWorkspace";
    pub const EXECUTE_COMMAND: &str = "executeCommand";
    pub const READ_FILE: &str = "readFile";
    pub const WRITE_FILE: &str = "writeFile";
    pub const LIST_DIRECTORY: &str = "listDirectory";
    pub const FILE_EXISTS: &str = "fileExists";
    pub const DELETE_FILE: &str = "deleteFile";
    pub const CREATE_DIRECTORY: &str = "createDirectory";
    pub const COPY_FILE: &str = "copyFile";
    pub const RUN_CLAUDE_CODE: &str = "runClaudeCode";
    pub const SHUTDOWN: &str = "shutdown";
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcRequest {
    pub jsonrpc: String,
    pub id: String,
    pub method: String,
    #[serde(default)]
    pub params: Value,
}

impl RpcRequest {
    pub fn new(id: impl Into<String>, method: impl Into<String>, params: Value) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id: id.into(),
            method: method.into(),
            params,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcError {
    pub code: i64,
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcResponse {
    pub jsonrpc: String,
    pub id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<RpcError>,
}

impl RpcResponse {
    pub fn result(id: impl Into<String>, result: Value) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id: id.into(),
            result: Some(result),
            error: None,
        }
    }

    pub fn error(id: impl Into<String>, code: i64, message: impl Into<String>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id: id.into(),
            result: None,
            error: Some(RpcError {
                code,
                message: message.into(),
            }),
        }
    }
}

/// Validate a parsed request envelope.
///
/// A request missing `jsonrpc == "2.0"`, a non-empty string `id`, or a
/// `method` is rejected with [`codes::INVALID_ENVELOPE`].
pub fn validate_envelope(value: &Value) -> Result<(), String> {
    if value.get("jsonrpc").and_then(Value::as_str) != Some(JSONRPC_VERSION) {
        return Err("missing or invalid jsonrpc version".to_string());
    }
    match value.get("id").and_then(Value::as_str) {
        Some(id) if !id.is_empty() => {}
        _ => return Err("missing or empty id".to_string()),
    }
    match value.get("method").and_then(Value::as_str) {
        Some(m) if !m.is_empty() => {}
        _ => return Err("missing method".to_string()),
    }
    Ok(())
}

impl RpcError {
    /// Map a sandbox error onto its wire code.
    pub fn from_sandbox_error(e: &SandboxError) -> Self {
        let code = match e {
            SandboxError::Configuration(_) => codes::CONFIGURATION,
            SandboxError::SecurityViolation(_) => codes::SECURITY_VIOLATION,
            SandboxError::RemoteUnavailable(_) => codes::INTERNAL_ERROR,
            SandboxError::Timeout(_) => codes::TIMEOUT,
            SandboxError::Upstream(_) => codes::UPSTREAM,
        };
        Self {
            code,
            message: e.to_string(),
        }
    }

    /// Map a wire error back onto the sandbox taxonomy.
    pub fn into_sandbox_error(self) -> SandboxError {
        match self.code {
            codes::SECURITY_VIOLATION => SandboxError::SecurityViolation(self.message),
            codes::CONFIGURATION | codes::INVALID_ENVELOPE | codes::INVALID_PARAMS
            | codes::METHOD_NOT_FOUND => SandboxError::Configuration(self.message),
            codes::TIMEOUT => SandboxError::Timeout(Duration::ZERO),
            _ => SandboxError::Upstream(self.message),
        }
    }
}

// ─── Method payloads ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SetWorkspaceParams {
    /// Workspace root as seen by the agent (VM namespace).
    pub path: String,
    /// The same workspace as addressed on the host, for display remapping.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host_path: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecuteCommandParams {
    pub command: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cwd: Option<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
    /// Process-level timeout override, seconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
}

/// Result of executing a command, identical on the wire and in-process.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionResult {
    pub success: bool,
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PathParams {
    pub path: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WriteFileParams {
    pub path: String,
    pub content: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CopyFileParams {
    pub source: String,
    pub destination: String,
}

/// One entry of a directory listing. `size` is present for files only.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DirectoryEntry {
    pub name: String,
    pub is_directory: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunClaudeCodeParams {
    pub prompt: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cwd: Option<String>,
}

/// One parsed line of the external CLI's newline-delimited output.
///
/// Lines that parse as JSON arrive in `json`; anything else is preserved
/// verbatim in `raw` so CLI diagnostics survive.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClaudeMessage {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub json: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub raw: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunClaudeCodeResult {
    pub messages: Vec<ClaudeMessage>,
    pub exit_code: i32,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn envelope_validation_requires_version_id_and_method() {
        let ok = json!({"jsonrpc":"2.0","id":"1","method":"ping","params":{}});
        assert!(validate_envelope(&ok).is_ok());

        let bad_version = json!({"jsonrpc":"1.0","id":"1","method":"ping"});
        assert!(validate_envelope(&bad_version).is_err());

        let empty_id = json!({"jsonrpc":"2.0","id":"","method":"ping"});
        assert!(validate_envelope(&empty_id).is_err());

        let numeric_id = json!({"jsonrpc":"2.0","id":7,"method":"ping"});
        assert!(validate_envelope(&numeric_id).is_err());

        let no_method = json!({"jsonrpc":"2.0","id":"1"});
        assert!(validate_envelope(&no_method).is_err());
    }

    #[test]
    fn response_serializes_one_of_result_or_error() {
        let ok = serde_json::to_value(RpcResponse::result("1", json!({"pong":true}))).unwrap();
        assert!(ok.get("error").is_none());

        let err = serde_json::to_value(RpcResponse::error("1", codes::INVALID_ENVELOPE, "bad"))
            .unwrap();
        assert!(err.get("result").is_none());
        assert_eq!(err["error"]["code"], codes::INVALID_ENVELOPE);
    }

    #[test]
    fn error_codes_round_trip_the_taxonomy() {
        let e = SandboxError::SecurityViolation("rm -rf /".into());
        let wire = RpcError::from_sandbox_error(&e);
        assert_eq!(wire.code, codes::SECURITY_VIOLATION);
        assert_eq!(wire.into_sandbox_error().tag(), "security_violation");
    }

    #[test]
    fn execute_params_use_camel_case_on_the_wire() {
        let params = ExecuteCommandParams {
            command: "echo hi".into(),
            cwd: None,
            env: HashMap::new(),
            timeout_secs: Some(5),
        };
        let v = serde_json::to_value(&params).unwrap();
        assert_eq!(v["timeoutSecs"], 5);
        assert!(v.get("cwd").is_none());
    }
}

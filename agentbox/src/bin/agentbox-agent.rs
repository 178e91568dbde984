//! `agentbox-agent`: the in-VM side of the bridge protocol.
//!
//! Launched by the host through `wsl.exe -e agentbox-agent` or
//! `limactl shell <instance> -- agentbox-agent`. Speaks newline-delimited
//! JSON-RPC 2.0 on stdin/stdout; tracing goes to stderr.

use anyhow::Result;

#[tokio::main]
async fn main() -> Result<()> {
    agentbox_core::observability::init_tracing();
    agentbox::agent::serve().await
}

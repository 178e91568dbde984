//! AgentBox: sandboxed execution for AI agents.
//!
//! The `agentbox` binary is the host-side CLI; `agentbox-agent` is the
//! in-VM stdio server the bridges talk to. Backend selection, path
//! guarding and the wire protocol live in `agentbox-sandbox` and
//! `agentbox-core`.

pub mod agent;
pub mod cli;

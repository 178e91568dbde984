use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// AgentBox - sandboxed command and file execution for AI agents
#[derive(Parser, Debug)]
#[command(name = "agentbox")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Workspace root (defaults to the current directory)
    #[arg(long, global = true, env = "AGENTBOX_WORKSPACE", value_name = "DIR")]
    pub workspace: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Execute a shell command through the sandbox adapter
    Exec {
        /// The command line to run
        #[arg(value_name = "COMMAND")]
        command: String,

        /// Working directory for the command (must be inside the workspace)
        #[arg(long, value_name = "DIR")]
        cwd: Option<PathBuf>,
    },

    /// Show the resolved backend mode and agent health
    Status,

    /// Prepare a VM backend (runs the bootstrap phases with progress)
    Setup {
        /// Re-run a single failed phase instead of the whole sequence
        #[arg(long, value_name = "PHASE")]
        retry: Option<String>,

        /// Drop the cached result and run every phase again
        #[arg(long, default_value = "false")]
        fresh: bool,
    },

    /// Mirror a workspace into or out of a per-session sandbox directory
    Sync {
        #[command(subcommand)]
        action: SyncAction,
    },
}

#[derive(Subcommand, Debug)]
pub enum SyncAction {
    /// Mirror the workspace into a fresh session mirror
    Init {
        #[arg(value_name = "SESSION")]
        session: String,
    },
    /// Mirror sandbox changes back to the workspace
    Final {
        #[arg(value_name = "SESSION")]
        session: String,
    },
    /// Delete the mirror and forget the session
    Cleanup {
        #[arg(value_name = "SESSION")]
        session: String,
    },
}

use std::collections::HashMap;
use std::path::PathBuf;

use anyhow::{bail, Result};
use clap::Parser;

use agentbox::cli::{Cli, Commands, SyncAction};
use agentbox_core::config::{BackendPreference, SandboxSettings};
use agentbox_core::error::SandboxError;
use agentbox_core::observability;
use agentbox_sandbox::adapter::SandboxAdapter;
use agentbox_sandbox::bootstrap::{BootstrapPhase, BootstrapProgress, SandboxBootstrap};
use agentbox_sandbox::sync::SandboxSync;

#[tokio::main]
async fn main() {
    observability::init_tracing();
    let cli = Cli::parse();

    if let Err(e) = run(cli).await {
        // Tagged errors keep scripted callers able to branch on the kind.
        match e.downcast_ref::<SandboxError>() {
            Some(se) => eprintln!("error [{}]: {}", se.tag(), se),
            None => eprintln!("error: {}", e),
        }
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<()> {
    let settings = SandboxSettings::from_env();
    let workspace = match cli.workspace {
        Some(w) => w,
        None => std::env::current_dir()?,
    };

    match cli.command {
        Commands::Exec { command, cwd } => cmd_exec(&workspace, settings, &command, cwd).await,
        Commands::Status => cmd_status(&workspace, settings).await,
        Commands::Setup { retry, fresh } => cmd_setup(settings, retry, fresh).await,
        Commands::Sync { action } => cmd_sync(&workspace, settings, action).await,
    }
}

async fn cmd_exec(
    workspace: &PathBuf,
    settings: SandboxSettings,
    command: &str,
    cwd: Option<PathBuf>,
) -> Result<()> {
    let adapter = SandboxAdapter::new(workspace, settings);
    adapter.initialize().await?;
    let result = adapter
        .execute_command(command, cwd.as_deref(), &HashMap::new())
        .await?;
    adapter.shutdown().await?;

    print!("{}", result.stdout);
    eprint!("{}", result.stderr);
    if !result.success {
        std::process::exit(result.exit_code.max(1));
    }
    Ok(())
}

async fn cmd_status(workspace: &PathBuf, settings: SandboxSettings) -> Result<()> {
    let adapter = SandboxAdapter::new(workspace, settings);
    if let Err(e) = adapter.initialize().await {
        eprintln!("backend initialization failed: {}", e);
    }
    let status = adapter.status().await;
    println!("{}", serde_json::to_string_pretty(&status)?);
    adapter.shutdown().await?;
    Ok(())
}

async fn cmd_setup(
    settings: SandboxSettings,
    retry: Option<String>,
    fresh: bool,
) -> Result<()> {
    let bootstrap = match settings.backend {
        BackendPreference::Wsl => SandboxBootstrap::for_wsl(&settings),
        BackendPreference::Lima => SandboxBootstrap::for_lima(&settings),
        BackendPreference::Auto => {
            if cfg!(target_os = "windows") {
                SandboxBootstrap::for_wsl(&settings)
            } else if cfg!(target_os = "macos") {
                SandboxBootstrap::for_lima(&settings)
            } else {
                bail!("the native backend needs no setup on this platform");
            }
        }
        BackendPreference::Native | BackendPreference::None => {
            bail!("the configured backend needs no setup");
        }
    };

    if fresh {
        bootstrap.invalidate();
    }

    let mut sink = |p: BootstrapProgress| match p.percent {
        Some(pct) => eprintln!("[{:>3}%] {}", pct, p.message),
        None => eprintln!("       {}", p.message),
    };
    let report = match retry {
        Some(name) => {
            let phase = BootstrapPhase::parse(&name)
                .ok_or_else(|| anyhow::anyhow!("unknown bootstrap phase: {}", name))?;
            bootstrap.retry_phase(phase, &mut sink).await?
        }
        None => bootstrap.run(&mut sink).await?,
    };

    println!("{}", serde_json::to_string_pretty(&report)?);
    if !report.ready {
        std::process::exit(1);
    }
    Ok(())
}

async fn cmd_sync(
    workspace: &PathBuf,
    settings: SandboxSettings,
    action: SyncAction,
) -> Result<()> {
    let sync = SandboxSync::new(&settings.sync_root);
    match action {
        SyncAction::Init { session } => {
            let result = sync.init_sync(workspace, &session, "native").await;
            println!("{}", serde_json::to_string_pretty(&result)?);
            if !result.success {
                std::process::exit(1);
            }
        }
        SyncAction::Final { session } => {
            // The registry is per-process; re-attach before mirroring back.
            sync.register(workspace, &session, "native").await;
            let result = sync.final_sync(&session).await;
            println!("{}", serde_json::to_string_pretty(&result)?);
            if !result.success {
                std::process::exit(1);
            }
        }
        SyncAction::Cleanup { session } => {
            sync.cleanup(&session).await?;
            eprintln!("session {} cleaned up", session);
        }
    }
    Ok(())
}

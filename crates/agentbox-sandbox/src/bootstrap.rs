//! SandboxBootstrap: multi-phase preflight/install orchestrator.
//!
//! Run once per backend before first use: detect the runtime, install
//! what is missing, declare the backend ready. Progress is emitted as
//! discrete `{phase, message}` events for the UI. Outcomes are recorded
//! per phase and cached as a last-known-good JSON file, so subsequent
//! session starts skip the full sequence, and a caller can offer a
//! scoped retry of a single failed phase without repeating succeeded
//! ones.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use agentbox_core::config::SandboxSettings;
use agentbox_core::error::{SandboxError, SandboxResult};

use crate::{lima, wsl};

/// One discrete, independently retryable step of preparing a backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BootstrapPhase {
    DetectRuntime,
    ListDistros,
    CreateInstance,
    StartInstance,
    InstallDependencies,
}

impl BootstrapPhase {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::DetectRuntime => "detect_runtime",
            Self::ListDistros => "list_distros",
            Self::CreateInstance => "create_instance",
            Self::StartInstance => "start_instance",
            Self::InstallDependencies => "install_dependencies",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "detect_runtime" => Some(Self::DetectRuntime),
            "list_distros" => Some(Self::ListDistros),
            "create_instance" => Some(Self::CreateInstance),
            "start_instance" => Some(Self::StartInstance),
            "install_dependencies" => Some(Self::InstallDependencies),
            _ => None,
        }
    }
}

/// Terminal state of one phase.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum PhaseOutcome {
    Success,
    Failed { error: String },
    Cancelled,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PhaseRecord {
    pub phase: BootstrapPhase,
    pub outcome: PhaseOutcome,
    pub message: String,
}

/// Progress event pushed to the caller's sink while phases run.
#[derive(Debug, Clone)]
pub struct BootstrapProgress {
    pub phase: BootstrapPhase,
    pub message: String,
    pub percent: Option<u8>,
}

/// Per-backend bootstrap result; `ready` means every phase succeeded.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BootstrapReport {
    pub backend: String,
    pub phases: Vec<PhaseRecord>,
    pub ready: bool,
    pub completed_at: DateTime<Utc>,
}

impl BootstrapReport {
    fn outcome_of(&self, phase: BootstrapPhase) -> Option<&PhaseOutcome> {
        self.phases
            .iter()
            .find(|r| r.phase == phase)
            .map(|r| &r.outcome)
    }
}

/// Executes the concrete work of each phase. Injected so tests substitute
/// fakes and so WSL/Lima provide their own sequences.
#[async_trait]
pub trait PhaseRunner: Send + Sync {
    fn backend_id(&self) -> &str;

    /// Phases in execution order.
    fn phases(&self) -> Vec<BootstrapPhase>;

    /// Run one phase; `Ok` carries a human-readable completion message.
    async fn run_phase(&self, phase: BootstrapPhase) -> Result<String, String>;
}

pub struct SandboxBootstrap {
    runner: Box<dyn PhaseRunner>,
    cache_path: PathBuf,
}

impl SandboxBootstrap {
    pub fn new(runner: Box<dyn PhaseRunner>, state_dir: &Path) -> Self {
        let cache_path = state_dir.join(format!("bootstrap-{}.json", runner.backend_id()));
        Self { runner, cache_path }
    }

    pub fn for_wsl(settings: &SandboxSettings) -> Self {
        Self::new(Box::new(WslPhases::new(settings)), &settings.state_dir)
    }

    pub fn for_lima(settings: &SandboxSettings) -> Self {
        Self::new(Box::new(LimaPhases::new(settings)), &settings.state_dir)
    }

    /// Cached last-known-good report, if any.
    pub fn cached(&self) -> Option<BootstrapReport> {
        let text = std::fs::read_to_string(&self.cache_path).ok()?;
        serde_json::from_str(&text).ok()
    }

    /// Drop the cache; the next `run` executes the full sequence.
    pub fn invalidate(&self) {
        let _ = std::fs::remove_file(&self.cache_path);
    }

    /// Run the sequence, skipping phases the cache already records as
    /// succeeded. A phase failure is recorded and the remaining phases
    /// still run — each phase fails or succeeds on its own, so the caller
    /// can offer a scoped retry.
    pub async fn run(
        &self,
        progress: &mut dyn FnMut(BootstrapProgress),
    ) -> SandboxResult<BootstrapReport> {
        let cached = self.cached();
        if let Some(report) = cached.as_ref() {
            if report.ready {
                progress(BootstrapProgress {
                    phase: BootstrapPhase::DetectRuntime,
                    message: format!("{} backend ready (cached)", report.backend),
                    percent: Some(100),
                });
                return Ok(report.clone());
            }
        }

        let phases = self.runner.phases();
        let total = phases.len().max(1);
        let mut records = Vec::with_capacity(phases.len());

        for (index, phase) in phases.iter().copied().enumerate() {
            let percent = Some((((index + 1) * 100) / total) as u8);

            if let Some(PhaseOutcome::Success) =
                cached.as_ref().and_then(|c| c.outcome_of(phase))
            {
                debug!(phase = phase.as_str(), "phase cached as succeeded, skipping");
                progress(BootstrapProgress {
                    phase,
                    message: format!("{}: already done", phase.as_str()),
                    percent,
                });
                records.push(PhaseRecord {
                    phase,
                    outcome: PhaseOutcome::Success,
                    message: "cached".to_string(),
                });
                continue;
            }

            progress(BootstrapProgress {
                phase,
                message: format!("{}: running", phase.as_str()),
                percent: None,
            });
            match self.runner.run_phase(phase).await {
                Ok(message) => {
                    progress(BootstrapProgress {
                        phase,
                        message: message.clone(),
                        percent,
                    });
                    records.push(PhaseRecord {
                        phase,
                        outcome: PhaseOutcome::Success,
                        message,
                    });
                }
                Err(error) => {
                    progress(BootstrapProgress {
                        phase,
                        message: format!("{}: {}", phase.as_str(), error),
                        percent,
                    });
                    records.push(PhaseRecord {
                        phase,
                        outcome: PhaseOutcome::Failed {
                            error: error.clone(),
                        },
                        message: error,
                    });
                }
            }
        }

        let report = BootstrapReport {
            backend: self.runner.backend_id().to_string(),
            ready: records
                .iter()
                .all(|r| r.outcome == PhaseOutcome::Success),
            phases: records,
            completed_at: Utc::now(),
        };
        self.save(&report)?;
        info!(backend = %report.backend, ready = report.ready, "bootstrap finished");
        Ok(report)
    }

    /// Re-run exactly one phase and merge the outcome into the cached
    /// report. Phases that already succeeded are not re-executed.
    pub async fn retry_phase(
        &self,
        phase: BootstrapPhase,
        progress: &mut dyn FnMut(BootstrapProgress),
    ) -> SandboxResult<BootstrapReport> {
        let mut report = self.cached().ok_or_else(|| {
            SandboxError::Configuration(
                "no bootstrap result to retry; run the full sequence first".to_string(),
            )
        })?;

        progress(BootstrapProgress {
            phase,
            message: format!("{}: retrying", phase.as_str()),
            percent: None,
        });
        let record = match self.runner.run_phase(phase).await {
            Ok(message) => PhaseRecord {
                phase,
                outcome: PhaseOutcome::Success,
                message,
            },
            Err(error) => PhaseRecord {
                phase,
                outcome: PhaseOutcome::Failed {
                    error: error.clone(),
                },
                message: error,
            },
        };
        progress(BootstrapProgress {
            phase,
            message: record.message.clone(),
            percent: Some(100),
        });

        match report.phases.iter_mut().find(|r| r.phase == phase) {
            Some(existing) => *existing = record,
            None => report.phases.push(record),
        }
        report.ready = report
            .phases
            .iter()
            .all(|r| r.outcome == PhaseOutcome::Success);
        report.completed_at = Utc::now();
        self.save(&report)?;
        Ok(report)
    }

    fn save(&self, report: &BootstrapReport) -> SandboxResult<()> {
        if let Some(parent) = self.cache_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&self.cache_path, serde_json::to_string_pretty(report)?)?;
        Ok(())
    }
}

// ─── WSL phases ─────────────────────────────────────────────────────────────

pub struct WslPhases {
    settings: SandboxSettings,
}

impl WslPhases {
    pub fn new(settings: &SandboxSettings) -> Self {
        Self {
            settings: settings.clone(),
        }
    }
}

#[async_trait]
impl PhaseRunner for WslPhases {
    fn backend_id(&self) -> &str {
        wsl::BACKEND_ID
    }

    fn phases(&self) -> Vec<BootstrapPhase> {
        vec![
            BootstrapPhase::DetectRuntime,
            BootstrapPhase::ListDistros,
            BootstrapPhase::InstallDependencies,
        ]
    }

    async fn run_phase(&self, phase: BootstrapPhase) -> Result<String, String> {
        match phase {
            BootstrapPhase::DetectRuntime => {
                if wsl::probe().await {
                    Ok("WSL2 is available".to_string())
                } else {
                    Err("WSL2 is not available; install it with: wsl --install".to_string())
                }
            }
            BootstrapPhase::ListDistros => {
                let distros = wsl::list_distros().await.map_err(|e| e.to_string())?;
                if distros.is_empty() {
                    return Err("no WSL distributions installed".to_string());
                }
                Ok(format!("found distributions: {}", distros.join(", ")))
            }
            BootstrapPhase::InstallDependencies => {
                let check = format!("command -v {}", self.settings.agent_bin);
                let status = tokio::process::Command::new("wsl.exe")
                    .args(wsl::shell_args(&self.settings, &check))
                    .status()
                    .await
                    .map_err(|e| format!("failed to run wsl: {}", e))?;
                if status.success() {
                    Ok(format!("{} present in distro", self.settings.agent_bin))
                } else {
                    Err(format!(
                        "{} not found inside WSL; install it in the distro",
                        self.settings.agent_bin
                    ))
                }
            }
            other => Err(format!("phase {} not part of the WSL sequence", other.as_str())),
        }
    }
}

// ─── Lima phases ────────────────────────────────────────────────────────────

pub struct LimaPhases {
    settings: SandboxSettings,
}

impl LimaPhases {
    pub fn new(settings: &SandboxSettings) -> Self {
        Self {
            settings: settings.clone(),
        }
    }
}

#[async_trait]
impl PhaseRunner for LimaPhases {
    fn backend_id(&self) -> &str {
        lima::BACKEND_ID
    }

    fn phases(&self) -> Vec<BootstrapPhase> {
        vec![
            BootstrapPhase::DetectRuntime,
            BootstrapPhase::CreateInstance,
            BootstrapPhase::StartInstance,
            BootstrapPhase::InstallDependencies,
        ]
    }

    async fn run_phase(&self, phase: BootstrapPhase) -> Result<String, String> {
        let instance = &self.settings.lima_instance;
        match phase {
            BootstrapPhase::DetectRuntime => {
                if lima::is_available() {
                    Ok("limactl is installed".to_string())
                } else {
                    Err("limactl not found; install it with: brew install lima".to_string())
                }
            }
            BootstrapPhase::CreateInstance => {
                if lima::instance_status(instance)
                    .await
                    .map_err(|e| e.to_string())?
                    .is_some()
                {
                    return Ok(format!("instance {} exists", instance));
                }
                let status = tokio::process::Command::new("limactl")
                    .args(["create", "--tty=false", &format!("--name={}", instance), "template://default"])
                    .status()
                    .await
                    .map_err(|e| format!("failed to run limactl: {}", e))?;
                if status.success() {
                    Ok(format!("instance {} created", instance))
                } else {
                    Err(format!("limactl create exited with {}", status))
                }
            }
            BootstrapPhase::StartInstance => {
                match lima::instance_status(instance)
                    .await
                    .map_err(|e| e.to_string())?
                {
                    Some(status) if status == "Running" => {
                        Ok(format!("instance {} already running", instance))
                    }
                    Some(_) => {
                        lima::start_instance(instance)
                            .await
                            .map_err(|e| e.to_string())?;
                        Ok(format!("instance {} started", instance))
                    }
                    None => Err(format!("instance {} does not exist", instance)),
                }
            }
            BootstrapPhase::InstallDependencies => {
                let check = format!("command -v {} && command -v rsync", self.settings.agent_bin);
                let status = tokio::process::Command::new("limactl")
                    .args(["shell", instance, "--", "sh", "-c", &check])
                    .status()
                    .await
                    .map_err(|e| format!("failed to run limactl: {}", e))?;
                if status.success() {
                    Ok("agent and rsync present in guest".to_string())
                } else {
                    Err(format!(
                        "{} or rsync missing inside the guest",
                        self.settings.agent_bin
                    ))
                }
            }
            other => Err(format!("phase {} not part of the Lima sequence", other.as_str())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Mutex;
    use tempfile::TempDir;

    /// Fake runner: scripted outcomes plus an execution counter per phase.
    struct FakePhases {
        outcomes: Mutex<HashMap<BootstrapPhase, Result<String, String>>>,
        executions: Mutex<HashMap<BootstrapPhase, usize>>,
    }

    impl FakePhases {
        fn new(outcomes: &[(BootstrapPhase, Result<&str, &str>)]) -> Self {
            Self {
                outcomes: Mutex::new(
                    outcomes
                        .iter()
                        .map(|(p, o)| {
                            (*p, o.map(str::to_owned).map_err(str::to_owned))
                        })
                        .collect(),
                ),
                executions: Mutex::new(HashMap::new()),
            }
        }

        fn executions(&self, phase: BootstrapPhase) -> usize {
            *self.executions.lock().unwrap().get(&phase).unwrap_or(&0)
        }

        fn set_outcome(&self, phase: BootstrapPhase, outcome: Result<&str, &str>) {
            self.outcomes
                .lock()
                .unwrap()
                .insert(phase, outcome.map(str::to_owned).map_err(str::to_owned));
        }
    }

    #[async_trait]
    impl PhaseRunner for &'static FakePhases {
        fn backend_id(&self) -> &str {
            "fake"
        }

        fn phases(&self) -> Vec<BootstrapPhase> {
            vec![
                BootstrapPhase::DetectRuntime,
                BootstrapPhase::StartInstance,
                BootstrapPhase::InstallDependencies,
            ]
        }

        async fn run_phase(&self, phase: BootstrapPhase) -> Result<String, String> {
            *self.executions.lock().unwrap().entry(phase).or_insert(0) += 1;
            self.outcomes
                .lock()
                .unwrap()
                .get(&phase)
                .cloned()
                .unwrap_or(Ok("ok".to_string()))
        }
    }

    fn leak(fake: FakePhases) -> &'static FakePhases {
        Box::leak(Box::new(fake))
    }

    #[tokio::test]
    async fn records_per_phase_outcomes_and_keeps_going_after_a_failure() {
        let dir = TempDir::new().unwrap();
        let fake = leak(FakePhases::new(&[(
            BootstrapPhase::StartInstance,
            Err("vm refused to start"),
        )]));
        let bootstrap = SandboxBootstrap::new(Box::new(fake), dir.path());

        let mut events = Vec::new();
        let report = bootstrap
            .run(&mut |p| events.push(p.message.clone()))
            .await
            .unwrap();

        assert!(!report.ready);
        assert_eq!(report.phases.len(), 3);
        assert_eq!(report.phases[0].outcome, PhaseOutcome::Success);
        assert!(matches!(report.phases[1].outcome, PhaseOutcome::Failed { .. }));
        // The failure did not abort the remaining phase.
        assert_eq!(report.phases[2].outcome, PhaseOutcome::Success);
        assert_eq!(fake.executions(BootstrapPhase::InstallDependencies), 1);
        assert!(!events.is_empty());
    }

    #[tokio::test]
    async fn cached_ready_result_skips_the_whole_sequence() {
        let dir = TempDir::new().unwrap();
        let fake = leak(FakePhases::new(&[]));
        let bootstrap = SandboxBootstrap::new(Box::new(fake), dir.path());

        let report = bootstrap.run(&mut |_| {}).await.unwrap();
        assert!(report.ready);
        assert_eq!(fake.executions(BootstrapPhase::DetectRuntime), 1);

        let again = bootstrap.run(&mut |_| {}).await.unwrap();
        assert!(again.ready);
        assert_eq!(fake.executions(BootstrapPhase::DetectRuntime), 1);
    }

    #[tokio::test]
    async fn rerun_after_partial_failure_skips_cached_successes() {
        let dir = TempDir::new().unwrap();
        let fake = leak(FakePhases::new(&[(
            BootstrapPhase::StartInstance,
            Err("boom"),
        )]));
        let bootstrap = SandboxBootstrap::new(Box::new(fake), dir.path());
        bootstrap.run(&mut |_| {}).await.unwrap();

        fake.set_outcome(BootstrapPhase::StartInstance, Ok("started"));
        let report = bootstrap.run(&mut |_| {}).await.unwrap();
        assert!(report.ready);
        // Succeeded phases ran once in total; only the failed one re-ran.
        assert_eq!(fake.executions(BootstrapPhase::DetectRuntime), 1);
        assert_eq!(fake.executions(BootstrapPhase::InstallDependencies), 1);
        assert_eq!(fake.executions(BootstrapPhase::StartInstance), 2);
    }

    #[tokio::test]
    async fn retry_phase_touches_only_that_phase() {
        let dir = TempDir::new().unwrap();
        let fake = leak(FakePhases::new(&[(
            BootstrapPhase::StartInstance,
            Err("boom"),
        )]));
        let bootstrap = SandboxBootstrap::new(Box::new(fake), dir.path());
        bootstrap.run(&mut |_| {}).await.unwrap();

        fake.set_outcome(BootstrapPhase::StartInstance, Ok("started"));
        let report = bootstrap
            .retry_phase(BootstrapPhase::StartInstance, &mut |_| {})
            .await
            .unwrap();
        assert!(report.ready);
        assert_eq!(fake.executions(BootstrapPhase::DetectRuntime), 1);
        assert_eq!(fake.executions(BootstrapPhase::StartInstance), 2);
    }

    #[tokio::test]
    async fn invalidate_forces_a_full_rerun() {
        let dir = TempDir::new().unwrap();
        let fake = leak(FakePhases::new(&[]));
        let bootstrap = SandboxBootstrap::new(Box::new(fake), dir.path());
        bootstrap.run(&mut |_| {}).await.unwrap();
        bootstrap.invalidate();
        assert!(bootstrap.cached().is_none());
        bootstrap.run(&mut |_| {}).await.unwrap();
        assert_eq!(fake.executions(BootstrapPhase::DetectRuntime), 2);
    }
}

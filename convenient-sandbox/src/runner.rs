//! Sandbox runners
//!
//! A runner executes one [`SpawnRequest`] inside a fresh scratch directory
//! and always answers with a [`SpawnResult`]. Setup, startup and teardown
//! failures become outcomes rather than errors.

use crate::confine;
use crate::options::{InputMode, IsolationMode, SandboxOptions};
use crate::process::{self, Termination};
use crate::scratch::ScratchDir;
use crate::types::{SandboxError, SpawnOutcome, SpawnRequest, SpawnResult};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Runs spawns in isolation
#[async_trait]
pub trait SandboxRunner: Send + Sync {
    /// Short name for logs
    fn name(&self) -> &str;

    /// Run `request` to completion, timeout or cancellation.
    async fn run(&self, request: &SpawnRequest, cancel: &CancellationToken) -> SpawnResult;
}

/// Runs the command in a per-spawn scratch directory with a cleared
/// environment, supervised in its own process group.
///
/// With [`IsolationMode::Namespace`] the command cannot see other scratch
/// directories and cannot write its inputs.
#[derive(Debug, Clone)]
pub struct ProcessWrapperSandboxRunner {
    sandbox_root: PathBuf,
    timeout_grace: Duration,
    input_mode: InputMode,
    isolation: IsolationMode,
}

impl ProcessWrapperSandboxRunner {
    /// Runner configured from `options`
    pub fn new(options: &SandboxOptions) -> Self {
        Self {
            sandbox_root: options.sandbox_root(),
            timeout_grace: options.timeout_grace(),
            input_mode: options.input_mode,
            isolation: options.isolation,
        }
    }

    /// Directory holding this runner's scratch directories
    pub fn sandbox_root(&self) -> &Path {
        &self.sandbox_root
    }

    async fn run_in(&self, scratch: &ScratchDir, request: &SpawnRequest, cancel: &CancellationToken) -> SpawnResult {
        let failed = |err: SandboxError| SpawnResult::not_started(err.outcome(), err.to_string());

        if let Err(err) = scratch
            .stage_inputs(&request.inputs, self.input_mode)
            .and_then(|()| scratch.prepare_outputs(&request.outputs))
        {
            warn!("Sandbox setup failed for {}: {}", request.mnemonic, err);
            return failed(err);
        }

        let confinement = match confine::prepare(
            self.isolation,
            self.input_mode,
            &self.sandbox_root,
            scratch,
            &request.inputs,
        ) {
            Ok(confinement) => confinement,
            Err(err) => {
                warn!("Cannot confine {}: {}", request.mnemonic, err);
                return failed(err);
            }
        };

        let Some(program) = request.program() else {
            return failed(SandboxError::EmptyCommand);
        };
        let mut command = Command::new(program);
        let _ = command
            .args(&request.command[1..])
            .current_dir(scratch.exec_root())
            .env_clear()
            .envs(&request.env);
        if let Some(confinement) = confinement {
            confinement.apply(&mut command);
        }

        // Staging takes time; the spawn may have been cancelled meanwhile
        if cancel.is_cancelled() {
            debug!("{} cancelled before start", request.mnemonic);
            return SpawnResult::cancelled();
        }

        let report = match process::supervise(command, program, request.timeout, self.timeout_grace, cancel).await {
            Ok(report) => report,
            Err(SandboxError::Startup { source, .. }) if confine::setup_error(&source).is_some() => {
                let cause = confine::setup_error(&source).unwrap_or(source);
                let err = SandboxError::Confinement(format!("mount namespace setup failed: {cause}"));
                warn!("Cannot confine {}: {}", request.mnemonic, err);
                return failed(err);
            }
            Err(err) => {
                warn!("{} could not be started: {}", request.mnemonic, err);
                return failed(err);
            }
        };

        let mut result = SpawnResult {
            outcome: SpawnOutcome::Completed,
            exit_code: process::exit_code(report.status),
            stdout: report.stdout,
            stderr: report.stderr,
            outputs: Vec::new(),
            forced_kill: report.forced_kill,
            duration: Duration::ZERO,
            scratch_dir: None,
            detail: None,
            diagnostic: String::new(),
        };

        match report.termination {
            Termination::Exited => match scratch.deliver_outputs(&request.outputs, &request.exec_root) {
                Ok(outputs) => result.outputs = outputs,
                Err(err) => {
                    warn!("Output delivery failed for {}: {}", request.mnemonic, err);
                    result.outcome = err.outcome();
                    result.detail = Some(err.to_string());
                }
            },
            Termination::TimedOut => {
                result.outcome = SpawnOutcome::TimedOut;
                result.detail = request
                    .timeout
                    .map(|limit| format!("timed out after {} seconds", limit.as_secs_f64()));
            }
            Termination::Cancelled => {
                result.outcome = SpawnOutcome::Cancelled;
            }
        }
        result
    }
}

#[async_trait]
impl SandboxRunner for ProcessWrapperSandboxRunner {
    fn name(&self) -> &str {
        "processwrapper-sandbox"
    }

    async fn run(&self, request: &SpawnRequest, cancel: &CancellationToken) -> SpawnResult {
        let start = Instant::now();
        let spawn_id = uuid::Uuid::new_v4().simple().to_string();
        info!("Running {} in sandbox {}", request.mnemonic, spawn_id);

        if let Err(err) = request.validate() {
            warn!("Rejected {} request: {}", request.mnemonic, err);
            return SpawnResult::not_started(err.outcome(), err.to_string());
        }
        if cancel.is_cancelled() {
            debug!("{} cancelled before start", request.mnemonic);
            return SpawnResult::cancelled();
        }

        let mut result = match ScratchDir::create(&self.sandbox_root, &spawn_id) {
            Ok(scratch) => {
                let mut result = self.run_in(&scratch, request, cancel).await;
                result.scratch_dir = Some(scratch.path().to_path_buf());
                // Dropping the guard removes the scratch directory
                drop(scratch);
                result
            }
            Err(err) => {
                warn!("Failed to create sandbox for {}: {}", request.mnemonic, err);
                SpawnResult::not_started(err.outcome(), err.to_string())
            }
        };

        result.duration = start.elapsed();
        debug!(
            "{} finished: {} (exit {:?}) in {:?}",
            request.mnemonic, result.outcome, result.exit_code, result.duration
        );
        result
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn runner(tmp: &TempDir) -> ProcessWrapperSandboxRunner {
        let mut options = SandboxOptions::with_base(tmp.path().join("base"));
        options.timeout_grace_seconds = 1;
        options.isolation = IsolationMode::Directory;
        ProcessWrapperSandboxRunner::new(&options)
    }

    fn leftover_scratch_dirs(runner: &ProcessWrapperSandboxRunner) -> usize {
        fs::read_dir(runner.sandbox_root()).map(Iterator::count).unwrap_or(0)
    }

    #[tokio::test]
    async fn test_environment_is_cleared() {
        let tmp = TempDir::new().unwrap();
        let runner = runner(&tmp);
        let request = SpawnRequest::new(["/bin/sh", "-c", "echo \"[$HOME][$GREETING]\""], tmp.path())
            .with_env("GREETING", "hi");

        let result = runner.run(&request, &CancellationToken::new()).await;
        assert!(result.success(), "{result:?}");
        assert_eq!(String::from_utf8_lossy(&result.stdout), "[][hi]\n");
        assert_eq!(leftover_scratch_dirs(&runner), 0);
    }

    #[tokio::test]
    async fn test_invalid_request_is_rejected_before_setup() {
        let tmp = TempDir::new().unwrap();
        let runner = runner(&tmp);
        let request = SpawnRequest::new(["/bin/true"], tmp.path()).with_output("../escape");

        let result = runner.run(&request, &CancellationToken::new()).await;
        assert_eq!(result.outcome, SpawnOutcome::IsolationViolation);
        assert_eq!(result.exit_code, None);
        assert!(result.scratch_dir.is_none());
        assert_eq!(leftover_scratch_dirs(&runner), 0);

        let empty = SpawnRequest::new(Vec::<String>::new(), tmp.path());
        let result = runner.run(&empty, &CancellationToken::new()).await;
        assert_eq!(result.outcome, SpawnOutcome::StartupFailed);
    }

    #[tokio::test]
    async fn test_unusable_sandbox_base() {
        let tmp = TempDir::new().unwrap();
        let file = tmp.path().join("not-a-dir");
        fs::write(&file, "").unwrap();
        let mut options = SandboxOptions::with_base(&file);
        options.isolation = IsolationMode::Directory;
        let runner = ProcessWrapperSandboxRunner::new(&options);

        let result = runner.run(&SpawnRequest::new(["/bin/true"], tmp.path()), &CancellationToken::new()).await;
        assert_eq!(result.outcome, SpawnOutcome::IsolationViolation);
        assert!(result.scratch_dir.is_none());
    }

    #[tokio::test]
    async fn test_linked_inputs_need_namespace() {
        let tmp = TempDir::new().unwrap();
        let src = tmp.path().join("main.c");
        fs::write(&src, "int main() {}").unwrap();
        let marker = tmp.path().join("ran");

        let mut options = SandboxOptions::with_base(tmp.path().join("base"));
        options.isolation = IsolationMode::Directory;
        options.input_mode = InputMode::Symlink;
        let runner = ProcessWrapperSandboxRunner::new(&options);
        let script = format!("touch {}", marker.display());
        let request = SpawnRequest::new(["/bin/sh", "-c", script.as_str()], tmp.path())
            .with_input("main.c", &src);

        let result = runner.run(&request, &CancellationToken::new()).await;
        assert_eq!(result.outcome, SpawnOutcome::IsolationViolation);
        assert!(!marker.exists());
        assert_eq!(leftover_scratch_dirs(&runner), 0);
    }

    #[tokio::test]
    async fn test_cancelled_spawn_never_starts() {
        let tmp = TempDir::new().unwrap();
        let runner = runner(&tmp);
        let marker = tmp.path().join("ran");
        let script = format!("touch {}", marker.display());
        let request = SpawnRequest::new(["/bin/sh", "-c", script.as_str()], tmp.path());

        let cancel = CancellationToken::new();
        cancel.cancel();
        let result = runner.run(&request, &cancel).await;
        assert_eq!(result.outcome, SpawnOutcome::Cancelled);
        assert_eq!(result.exit_code, None);
        assert!(result.detail.is_none());
        assert!(!marker.exists());
        assert_eq!(leftover_scratch_dirs(&runner), 0);
    }
}

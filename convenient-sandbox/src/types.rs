//! Core types for spawn execution

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::io;
use std::path::{Component, Path, PathBuf};
use std::time::Duration;

/// A single command to run in isolation.
///
/// Input and output paths are relative to the execution root. Inputs map the
/// path visible to the command onto the host file that backs it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpawnRequest {
    /// Short action kind used in messages (e.g. "Genrule", "CppCompile")
    pub mnemonic: String,

    /// Program followed by its arguments
    pub command: Vec<String>,

    /// Complete environment of the child; nothing is inherited
    pub env: BTreeMap<String, String>,

    /// Execution-root-relative path → host source
    pub inputs: BTreeMap<PathBuf, PathBuf>,

    /// Execution-root-relative paths the command is expected to produce
    pub outputs: Vec<PathBuf>,

    /// Host directory that receives the produced outputs
    pub exec_root: PathBuf,

    /// Wall-clock limit; `None` runs without one
    pub timeout: Option<Duration>,
}

impl SpawnRequest {
    /// Request for `command`, delivering outputs into `exec_root`.
    pub fn new<I, S>(command: I, exec_root: impl Into<PathBuf>) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            mnemonic: "Action".to_string(),
            command: command.into_iter().map(Into::into).collect(),
            env: BTreeMap::new(),
            inputs: BTreeMap::new(),
            outputs: Vec::new(),
            exec_root: exec_root.into(),
            timeout: None,
        }
    }

    /// Set the action kind shown in messages.
    pub fn with_mnemonic(mut self, mnemonic: impl Into<String>) -> Self {
        self.mnemonic = mnemonic.into();
        self
    }

    /// Add an environment variable.
    pub fn with_env(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        let _ = self.env.insert(name.into(), value.into());
        self
    }

    /// Declare an input visible at `path`, backed by host file `source`.
    pub fn with_input(mut self, path: impl Into<PathBuf>, source: impl Into<PathBuf>) -> Self {
        let _ = self.inputs.insert(path.into(), source.into());
        self
    }

    /// Declare an output.
    pub fn with_output(mut self, path: impl Into<PathBuf>) -> Self {
        self.outputs.push(path.into());
        self
    }

    /// Limit the wall-clock time of the command.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Program to execute, if the command is not empty
    pub fn program(&self) -> Option<&str> {
        self.command.first().map(String::as_str)
    }

    /// Check the request before any sandbox is created.
    pub fn validate(&self) -> SandboxResult<()> {
        if self.command.first().is_none_or(String::is_empty) {
            return Err(SandboxError::EmptyCommand);
        }
        for path in self.inputs.keys().chain(&self.outputs) {
            let _ = confined(Path::new("."), path)?;
        }
        Ok(())
    }
}

/// Join `relative` onto `root`, refusing anything that would leave `root`.
pub(crate) fn confined(root: &Path, relative: &Path) -> SandboxResult<PathBuf> {
    let mut joined = root.to_path_buf();
    let mut depth = 0usize;
    for component in relative.components() {
        match component {
            Component::Normal(part) => {
                joined.push(part);
                depth += 1;
            }
            Component::CurDir => {}
            _ => return Err(SandboxError::PathEscape(relative.to_path_buf())),
        }
    }
    if depth == 0 {
        return Err(SandboxError::PathEscape(relative.to_path_buf()));
    }
    Ok(joined)
}

/// How a spawn ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SpawnOutcome {
    /// The command ran to completion; see the exit code
    Completed,
    /// The timeout elapsed and the command was terminated
    TimedOut,
    /// The sandbox could not be set up, or the command could not be
    /// confined to it
    IsolationViolation,
    /// The command could not be started at all
    StartupFailed,
    /// The spawn was cancelled before it finished
    Cancelled,
}

impl fmt::Display for SpawnOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Completed => "completed",
            Self::TimedOut => "timed out",
            Self::IsolationViolation => "isolation violation",
            Self::StartupFailed => "startup failed",
            Self::Cancelled => "cancelled",
        };
        f.write_str(name)
    }
}

/// Result of one spawn
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpawnResult {
    /// How the spawn ended
    pub outcome: SpawnOutcome,

    /// Exit code; `None` if the process never started.
    /// A process ended by a signal reports `128 + signal`.
    pub exit_code: Option<i32>,

    /// Captured standard output
    pub stdout: Vec<u8>,
    /// Captured standard error
    pub stderr: Vec<u8>,

    /// Outputs delivered into the execution root (relative paths)
    pub outputs: Vec<PathBuf>,

    /// Whether the process had to be killed after the grace period
    pub forced_kill: bool,

    /// Wall time from request to cleanup
    pub duration: Duration,

    /// Scratch directory the spawn ran in (removed by the time this is seen)
    pub scratch_dir: Option<PathBuf>,

    /// Runner-level explanation for non-completed outcomes
    pub detail: Option<String>,

    /// Human readable summary, formatted by the executing strategy
    pub diagnostic: String,
}

impl SpawnResult {
    /// Result for a spawn that never got to run its command.
    pub fn not_started(outcome: SpawnOutcome, detail: impl Into<String>) -> Self {
        Self {
            outcome,
            exit_code: None,
            stdout: Vec::new(),
            stderr: Vec::new(),
            outputs: Vec::new(),
            forced_kill: false,
            duration: Duration::ZERO,
            scratch_dir: None,
            detail: Some(detail.into()),
            diagnostic: String::new(),
        }
    }

    /// Cancelled before the command started
    pub fn cancelled() -> Self {
        Self {
            detail: None,
            ..Self::not_started(SpawnOutcome::Cancelled, String::new())
        }
    }

    /// Completed with exit code zero
    pub fn success(&self) -> bool {
        self.outcome == SpawnOutcome::Completed && self.exit_code == Some(0)
    }
}

/// Errors raised while preparing, running or tearing down a sandbox.
///
/// These never leave the runner as errors: each maps onto a [`SpawnOutcome`].
#[derive(Debug, thiserror::Error)]
pub enum SandboxError {
    /// The request has no program
    #[error("Empty command")]
    EmptyCommand,

    /// A declared path leaves the execution root
    #[error("Path {0} escapes the execution root")]
    PathEscape(PathBuf),

    /// The scratch directory could not be claimed
    #[error("Failed to create sandbox directory {path}: {source}")]
    Scratch {
        /// Directory being created
        path: PathBuf,
        /// Underlying I/O error
        source: io::Error,
    },

    /// A declared input could not be staged
    #[error("Failed to stage input {path}: {source}")]
    StageInput {
        /// Execution-root-relative input path
        path: PathBuf,
        /// Underlying I/O error
        source: io::Error,
    },

    /// A produced output could not be moved out of the sandbox
    #[error("Failed to deliver output {path}: {source}")]
    DeliverOutput {
        /// Execution-root-relative output path
        path: PathBuf,
        /// Underlying I/O error
        source: io::Error,
    },

    /// The program could not be executed
    #[error("Failed to start {program}: {source}")]
    Startup {
        /// Program being started
        program: String,
        /// Error reported by the spawn
        source: io::Error,
    },

    /// The command could not be confined to its scratch directory
    #[error("Failed to confine command: {0}")]
    Confinement(String),

    /// Other filesystem error
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

impl SandboxError {
    /// Outcome a spawn reports when it fails with this error
    pub fn outcome(&self) -> SpawnOutcome {
        match self {
            Self::EmptyCommand | Self::Startup { .. } => SpawnOutcome::StartupFailed,
            _ => SpawnOutcome::IsolationViolation,
        }
    }
}

/// Result type for sandbox setup and teardown
pub type SandboxResult<T> = Result<T, SandboxError>;

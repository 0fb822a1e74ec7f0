//! Run one command through a sandboxed strategy

use super::ArgError;
use convenient_sandbox::{
    SandboxOptions, SpawnExecutorPool, SpawnOutcome, SpawnRequest, SpawnResult, StrategyRegistry,
};
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// Everything `bitzel run` was asked to do
pub struct RunArgs {
    pub sandbox: SandboxOptions,
    pub strategy: String,
    pub inputs: Vec<(PathBuf, PathBuf)>,
    pub outputs: Vec<PathBuf>,
    pub env: Vec<(String, String)>,
    pub timeout: Option<f64>,
    pub exec_root: PathBuf,
    pub mnemonic: String,
    pub json: bool,
    pub command: Vec<String>,
}

impl RunArgs {
    /// Turn the arguments into a spawn request with absolute host paths.
    pub fn to_request(&self) -> Result<SpawnRequest, Box<dyn std::error::Error>> {
        let cwd = std::env::current_dir()?;
        let mut request = SpawnRequest::new(self.command.iter().cloned(), cwd.join(&self.exec_root))
            .with_mnemonic(&self.mnemonic);

        for (src, dest) in &self.inputs {
            request = request.with_input(dest, cwd.join(src));
        }
        for output in &self.outputs {
            request = request.with_output(output);
        }
        for (name, value) in &self.env {
            request = request.with_env(name, value);
        }
        if let Some(secs) = self.timeout {
            if !secs.is_finite() || secs <= 0.0 {
                return Err(ArgError::Timeout(secs).into());
            }
            request = request.with_timeout(Duration::from_secs_f64(secs));
        }
        Ok(request)
    }
}

/// Execute the spawn and report it. Returns the process exit code.
pub async fn execute(args: RunArgs) -> Result<i32, Box<dyn std::error::Error>> {
    let request = args.to_request()?;
    let registry = Arc::new(StrategyRegistry::with_builtin()?);
    let pool = Arc::new(SpawnExecutorPool::new(registry, args.sandbox.clone()));

    // Ctrl-C cancels the spawn; the sandbox is still cleaned up
    let interrupt = Arc::clone(&pool);
    let _ = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, cancelling");
            interrupt.cancel_all();
        }
    });

    info!("Running {:?} with strategy {}", request.command, args.strategy);
    let result = pool.execute(&request, &args.strategy).await?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&result)?);
    } else {
        report(&result)?;
    }
    Ok(exit_code(&result))
}

fn report(result: &SpawnResult) -> std::io::Result<()> {
    std::io::stdout().write_all(&result.stdout)?;
    std::io::stderr().write_all(&result.stderr)?;

    let mark = if result.success() { "✓" } else { "✗" };
    eprintln!("{} {}", mark, result.diagnostic);
    for output in &result.outputs {
        eprintln!("  → {}", output.display());
    }
    eprintln!("  {} in {:.2}s", result.outcome, result.duration.as_secs_f64());
    Ok(())
}

/// Exit code of `bitzel run` for a spawn result.
///
/// Completed spawns mirror the command's exit code. The other outcomes use
/// the conventions of `timeout(1)` and shells.
pub fn exit_code(result: &SpawnResult) -> i32 {
    match result.outcome {
        SpawnOutcome::Completed => result.exit_code.unwrap_or(1),
        SpawnOutcome::TimedOut => 124,
        SpawnOutcome::IsolationViolation => 125,
        SpawnOutcome::StartupFailed => 127,
        SpawnOutcome::Cancelled => 130,
    }
}

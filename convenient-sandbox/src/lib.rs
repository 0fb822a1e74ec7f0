//! Sandboxed, time-bounded execution of build spawns.
//!
//! A [`SpawnRequest`] describes one command with its declared inputs,
//! outputs, environment and timeout. A named [`ExecutionStrategy`] from the
//! [`StrategyRegistry`] runs it through a [`SandboxRunner`]:
//!
//! 1. a private scratch directory is claimed under
//!    `<sandbox_base>/<product>-sandbox/`
//! 2. declared inputs are staged into its `execroot/`
//! 3. the command runs there in its own process group with exactly the
//!    requested environment, inside a mount namespace that hides every
//!    other scratch directory and keeps inputs read-only
//! 4. on timeout or cancellation the group is asked to terminate and killed
//!    after the grace period
//! 5. produced outputs are moved to the request's execution root
//! 6. the scratch directory is removed, whatever happened before
//!
//! Every outcome, including failures to set up the sandbox or to start the
//! command, is reported as a [`SpawnResult`].
//!
//! # Example
//!
//! ```no_run
//! use convenient_sandbox::{SandboxOptions, SpawnExecutorPool, SpawnRequest, StrategyRegistry};
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let registry = Arc::new(StrategyRegistry::with_builtin()?);
//! let pool = SpawnExecutorPool::new(registry, SandboxOptions::default());
//!
//! let request = SpawnRequest::new(["/bin/sh", "-c", "echo hi > out.txt"], "/tmp/out")
//!     .with_output("out.txt")
//!     .with_timeout(Duration::from_secs(10));
//! let result = pool.execute(&request, "sandboxed").await?;
//! println!("{}", result.diagnostic);
//! # Ok(())
//! # }
//! ```

mod confine;
pub mod diagnostics;
pub mod options;
pub mod pool;
mod process;
pub mod runner;
pub mod scratch;
pub mod strategy;
pub mod types;

pub use options::{InputMode, IsolationMode, SandboxOptions};
pub use pool::SpawnExecutorPool;
pub use runner::{ProcessWrapperSandboxRunner, SandboxRunner};
pub use scratch::ScratchDir;
pub use strategy::{
    ActionContext, ExecutionStrategy, SandboxStrategy, StrategyError, StrategyFactory,
    StrategyRegistration, StrategyRegistry, StrategyRegistryBuilder, PROCESSWRAPPER_SANDBOX,
    SANDBOXED,
};
pub use types::{SandboxError, SandboxResult, SpawnOutcome, SpawnRequest, SpawnResult};

// Token type taken by runners, strategies and the pool
pub use tokio_util::sync::CancellationToken;

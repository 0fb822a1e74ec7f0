//! Bounded concurrent spawn execution
//!
//! The pool selects a strategy by name, constructs it on first use and
//! limits how many spawns run at once. A pool-wide cancellation token lets
//! the build abort every running spawn.

use crate::diagnostics;
use crate::options::SandboxOptions;
use crate::strategy::{ActionContext, ExecutionStrategy, StrategyError, StrategyRegistry};
use crate::types::{SpawnRequest, SpawnResult};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Pool of sandboxed spawn executions
pub struct SpawnExecutorPool {
    registry: Arc<StrategyRegistry>,

    options: SandboxOptions,

    /// Constructed strategies by selected name
    strategies: Mutex<HashMap<String, Arc<dyn ExecutionStrategy>>>,

    /// Limits concurrent spawns to `options.max_parallel`
    semaphore: Arc<Semaphore>,

    cancel: CancellationToken,
}

impl SpawnExecutorPool {
    /// Pool running at most `options.max_parallel` spawns at once
    pub fn new(registry: Arc<StrategyRegistry>, options: SandboxOptions) -> Self {
        let max_parallel = options.max_parallel.max(1);
        info!("Creating spawn executor pool with {} workers", max_parallel);

        Self {
            registry,
            options,
            strategies: Mutex::new(HashMap::new()),
            semaphore: Arc::new(Semaphore::new(max_parallel)),
            cancel: CancellationToken::new(),
        }
    }

    /// Options handed to every strategy this pool constructs
    pub fn options(&self) -> &SandboxOptions {
        &self.options
    }

    /// Number of spawns that could start right now
    pub fn available_permits(&self) -> usize {
        self.semaphore.available_permits()
    }

    /// Token cancelled by [`cancel_all`](Self::cancel_all)
    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Cancel every running and queued spawn. Later spawns end cancelled too.
    pub fn cancel_all(&self) {
        info!("Cancelling all spawns");
        self.cancel.cancel();
    }

    /// Strategy for a name or comma-separated preference list, built once.
    pub async fn strategy(&self, preferences: &str) -> Result<Arc<dyn ExecutionStrategy>, StrategyError> {
        let (name, registration) = self.registry.select(preferences, ActionContext::Spawn)?;

        let mut strategies = self.strategies.lock().await;
        if let Some(strategy) = strategies.get(name) {
            return Ok(Arc::clone(strategy));
        }

        debug!("Constructing strategy {}", name);
        let strategy = registration.create(name, &self.options);
        let _ = strategies.insert(name.to_string(), Arc::clone(&strategy));
        Ok(strategy)
    }

    /// Run `request` with the named strategy.
    ///
    /// Only strategy selection can fail; how the spawn went is reported in
    /// the returned [`SpawnResult`].
    pub async fn execute(&self, request: &SpawnRequest, strategy_name: &str) -> Result<SpawnResult, StrategyError> {
        self.run(request, strategy_name, None).await
    }

    /// Like [`execute`](Self::execute), additionally ending the spawn as
    /// cancelled when `token` fires.
    pub async fn execute_with_cancel(
        &self,
        request: &SpawnRequest,
        strategy_name: &str,
        token: &CancellationToken,
    ) -> Result<SpawnResult, StrategyError> {
        self.run(request, strategy_name, Some(token)).await
    }

    async fn run(
        &self,
        request: &SpawnRequest,
        strategy_name: &str,
        token: Option<&CancellationToken>,
    ) -> Result<SpawnResult, StrategyError> {
        let strategy = self.strategy(strategy_name).await?;

        // A spawn cancelled while queued never starts
        let external = async {
            match token {
                Some(token) => token.cancelled().await,
                None => std::future::pending().await,
            }
        };
        let _permit = tokio::select! {
            biased;
            () = self.cancel.cancelled() => return Ok(self.cancelled(request)),
            () = external => return Ok(self.cancelled(request)),
            permit = self.semaphore.acquire() => permit.map_err(|_| StrategyError::PoolClosed)?,
        };

        let cancel = self.cancel.child_token();
        let execution = strategy.execute(request, &cancel);
        let Some(token) = token else {
            return Ok(execution.await);
        };

        tokio::pin!(execution);
        tokio::select! {
            result = &mut execution => return Ok(result),
            () = token.cancelled() => cancel.cancel(),
        }
        // The strategy sees the cancellation and winds the spawn down
        Ok(execution.await)
    }

    fn cancelled(&self, request: &SpawnRequest) -> SpawnResult {
        debug!("{} cancelled while queued", request.mnemonic);
        let mut result = SpawnResult::cancelled();
        result.diagnostic = diagnostics::describe(request, &result, self.options.verbose_failures);
        result
    }
}

impl std::fmt::Debug for SpawnExecutorPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SpawnExecutorPool")
            .field("registry", &self.registry.names())
            .field("options", &self.options)
            .field("available_permits", &self.semaphore.available_permits())
            .finish_non_exhaustive()
    }
}

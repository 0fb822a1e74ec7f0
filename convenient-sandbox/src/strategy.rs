//! Execution strategies and their registry
//!
//! A strategy is a named policy that runs spawns through a [`SandboxRunner`]
//! and formats the result for humans. Strategies are registered under one or
//! more names when the process starts; the registry is then frozen and
//! shared read-only.
//!
//! Registrations hold factories, not strategies: a strategy is built from
//! [`SandboxOptions`] only when a name is first selected.

use crate::diagnostics;
use crate::options::SandboxOptions;
use crate::runner::{ProcessWrapperSandboxRunner, SandboxRunner};
use crate::types::{SpawnRequest, SpawnResult};
use async_trait::async_trait;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, OnceLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Name of the default sandboxed strategy
pub const SANDBOXED: &str = "sandboxed";

/// Name of the process-wrapper sandboxed strategy
pub const PROCESSWRAPPER_SANDBOX: &str = "processwrapper-sandbox";

/// Class of requests a strategy handles
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ActionContext {
    /// Command-line spawns
    Spawn,
}

/// A named policy executing spawns
#[async_trait]
pub trait ExecutionStrategy: Send + Sync {
    /// Name the strategy was constructed under
    fn name(&self) -> &str;

    /// Execute `request`. Never fails: every outcome is a [`SpawnResult`].
    async fn execute(&self, request: &SpawnRequest, cancel: &CancellationToken) -> SpawnResult;
}

/// Strategy delegating to a sandbox runner
pub struct SandboxStrategy {
    name: String,
    verbose_failures: bool,
    runner: Arc<dyn SandboxRunner>,
}

impl SandboxStrategy {
    /// Strategy named `name` running spawns through `runner`.
    pub fn new(name: impl Into<String>, verbose_failures: bool, runner: Arc<dyn SandboxRunner>) -> Self {
        Self {
            name: name.into(),
            verbose_failures,
            runner,
        }
    }

    /// Strategy backed by [`ProcessWrapperSandboxRunner`].
    pub fn process_wrapper(name: impl Into<String>, options: &SandboxOptions) -> Self {
        Self::new(
            name,
            options.verbose_failures,
            Arc::new(ProcessWrapperSandboxRunner::new(options)),
        )
    }
}

impl fmt::Debug for SandboxStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SandboxStrategy")
            .field("name", &self.name)
            .field("verbose_failures", &self.verbose_failures)
            .field("runner", &self.runner.name())
            .finish()
    }
}

#[async_trait]
impl ExecutionStrategy for SandboxStrategy {
    fn name(&self) -> &str {
        &self.name
    }

    async fn execute(&self, request: &SpawnRequest, cancel: &CancellationToken) -> SpawnResult {
        let mut result = self.runner.run(request, cancel).await;
        result.diagnostic = diagnostics::describe(request, &result, self.verbose_failures);
        if !result.success() {
            warn!(strategy = %self.name, "{}", result.diagnostic);
        }
        result
    }
}

/// Errors from registering or selecting strategies
#[derive(Debug, thiserror::Error)]
pub enum StrategyError {
    /// A name was registered twice
    #[error("Strategy name '{0}' is already registered")]
    DuplicateName(String),

    /// A registration without names
    #[error("A strategy registration needs at least one name")]
    NoNames,

    /// None of the requested names is registered
    #[error("No strategy registered under '{0}'")]
    UnknownStrategy(String),

    /// The named strategy handles another class of requests
    #[error("Strategy '{name}' does not handle {context:?} requests")]
    WrongContext {
        /// Registered name
        name: String,
        /// Requested context
        context: ActionContext,
    },

    /// [`StrategyRegistry::install`] was already called
    #[error("A strategy registry is already installed")]
    AlreadyInstalled,

    /// The pool was cancelled while the request waited for a slot
    #[error("Executor pool is shut down")]
    PoolClosed,
}

/// Builds a strategy from options
pub type StrategyFactory = Arc<dyn Fn(&str, &SandboxOptions) -> Arc<dyn ExecutionStrategy> + Send + Sync>;

/// One registration: aliases, request class and factory
pub struct StrategyRegistration {
    names: Vec<String>,
    context: ActionContext,
    factory: StrategyFactory,
}

impl StrategyRegistration {
    /// Aliases in registration order
    pub fn names(&self) -> &[String] {
        &self.names
    }

    /// Requests this registration handles
    pub fn context(&self) -> ActionContext {
        self.context
    }

    /// Construct the strategy, naming it `name`.
    pub fn create(&self, name: &str, options: &SandboxOptions) -> Arc<dyn ExecutionStrategy> {
        (self.factory)(name, options)
    }
}

impl fmt::Debug for StrategyRegistration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StrategyRegistration")
            .field("names", &self.names)
            .field("context", &self.context)
            .finish_non_exhaustive()
    }
}

/// Collects registrations during startup
#[derive(Default)]
pub struct StrategyRegistryBuilder {
    registrations: Vec<Arc<StrategyRegistration>>,
    by_name: HashMap<String, usize>,
}

impl fmt::Debug for StrategyRegistryBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StrategyRegistryBuilder")
            .field("registrations", &self.registrations)
            .finish_non_exhaustive()
    }
}

impl StrategyRegistryBuilder {
    /// Empty builder
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `factory` under every name in `names`.
    ///
    /// Nothing is registered if any name is already taken.
    pub fn register<F>(&mut self, names: &[&str], context: ActionContext, factory: F) -> Result<&mut Self, StrategyError>
    where
        F: Fn(&str, &SandboxOptions) -> Arc<dyn ExecutionStrategy> + Send + Sync + 'static,
    {
        if names.is_empty() {
            return Err(StrategyError::NoNames);
        }
        for (i, name) in names.iter().enumerate() {
            if self.by_name.contains_key(*name) || names[..i].contains(name) {
                return Err(StrategyError::DuplicateName((*name).to_string()));
            }
        }

        let index = self.registrations.len();
        for name in names {
            self.by_name.insert((*name).to_string(), index);
        }
        self.registrations.push(Arc::new(StrategyRegistration {
            names: names.iter().map(|name| (*name).to_string()).collect(),
            context,
            factory: Arc::new(factory),
        }));
        debug!("Registered strategy {:?}", names);
        Ok(self)
    }

    /// Freeze the registrations
    pub fn build(self) -> StrategyRegistry {
        StrategyRegistry {
            registrations: self.registrations,
            by_name: self.by_name,
        }
    }
}

/// Immutable name → strategy-factory mapping
#[derive(Debug)]
pub struct StrategyRegistry {
    registrations: Vec<Arc<StrategyRegistration>>,
    by_name: HashMap<String, usize>,
}

static GLOBAL: OnceLock<StrategyRegistry> = OnceLock::new();

impl StrategyRegistry {
    /// Start collecting registrations
    pub fn builder() -> StrategyRegistryBuilder {
        StrategyRegistryBuilder::new()
    }

    /// Registry with the built-in sandboxed strategies.
    pub fn with_builtin() -> Result<Self, StrategyError> {
        let mut builder = Self::builder();
        let _ = builder.register(
            &[SANDBOXED, PROCESSWRAPPER_SANDBOX],
            ActionContext::Spawn,
            |name: &str, options: &SandboxOptions| -> Arc<dyn ExecutionStrategy> {
                Arc::new(SandboxStrategy::process_wrapper(name, options))
            },
        )?;
        Ok(builder.build())
    }

    /// Make this registry the process-wide one. Only the first call succeeds.
    pub fn install(self) -> Result<&'static Self, StrategyError> {
        let mut installed = false;
        let registry = GLOBAL.get_or_init(|| {
            installed = true;
            self
        });
        if installed {
            info!("Installed strategy registry: {}", registry.names().join(", "));
            Ok(registry)
        } else {
            Err(StrategyError::AlreadyInstalled)
        }
    }

    /// The process-wide registry, once installed
    pub fn global() -> Option<&'static Self> {
        GLOBAL.get()
    }

    /// All registered names, sorted
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.by_name.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    /// Registrations in registration order
    pub fn registrations(&self) -> &[Arc<StrategyRegistration>] {
        &self.registrations
    }

    /// Registration owning `name`
    pub fn lookup(&self, name: &str) -> Option<&Arc<StrategyRegistration>> {
        self.by_name.get(name).map(|&index| &self.registrations[index])
    }

    /// Resolve a comma-separated preference list (`"a,b"`): the first
    /// registered name that handles `context` wins.
    pub fn select<'a>(
        &'a self,
        preferences: &'a str,
        context: ActionContext,
    ) -> Result<(&'a str, &'a Arc<StrategyRegistration>), StrategyError> {
        let mut wrong_context = None;
        for name in preferences.split(',').map(str::trim).filter(|name| !name.is_empty()) {
            match self.lookup(name) {
                Some(registration) if registration.context == context => return Ok((name, registration)),
                Some(_) => wrong_context = Some(name),
                None => {}
            }
        }
        Err(match wrong_context {
            Some(name) => StrategyError::WrongContext {
                name: name.to_string(),
                context,
            },
            None => StrategyError::UnknownStrategy(preferences.to_string()),
        })
    }
}

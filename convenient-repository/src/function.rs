//! Keyed production of [`RepositoryState`] values.
//!
//! [`RepositoryDirectoryFunction::repository_state`] is what the incremental
//! evaluator calls for a repository name. It looks up the rule describing the
//! repository, reuses the on-disk directory when its marker is still valid,
//! and otherwise hands the directory to a [`RepositoryFetcher`]. The evaluator
//! serializes calls for the same name; nothing here locks.

use crate::digest::{DigestBuilder, FetchDigest};
use crate::error::{io_at, RepositoryError, RepositoryResult};
use crate::listing::DirectoryListing;
use crate::marker::RepositoryMarker;
use crate::name::RepositoryName;
use crate::state::{RepositoryState, NO_SUCH_REPOSITORY};
use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};

/// Definition of an external repository as declared in the workspace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepositoryRule {
    /// Repository name
    pub name: RepositoryName,
    /// Rule kind, e.g. `local_repository`, `http_archive`
    pub kind: String,
    /// Rule attributes
    pub attributes: BTreeMap<String, String>,
    /// Environment variables the fetch depends on
    pub environ: Vec<String>,
}

impl RepositoryRule {
    /// Rule without attributes.
    pub fn new(name: RepositoryName, kind: impl Into<String>) -> Self {
        Self {
            name,
            kind: kind.into(),
            attributes: BTreeMap::new(),
            environ: Vec::new(),
        }
    }

    /// Add an attribute.
    #[must_use]
    pub fn with_attribute(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        let _ = self.attributes.insert(key.into(), value.into());
        self
    }

    /// Declare an environment variable dependency.
    #[must_use]
    pub fn with_environ(mut self, name: impl Into<String>) -> Self {
        self.environ.push(name.into());
        self
    }

    /// Digest of the rule definition and its declared environment.
    ///
    /// This is the key a marker is checked against; it does not cover the
    /// contents of files the fetch recorded.
    #[must_use]
    pub fn digest(&self, env: &BTreeMap<String, String>) -> FetchDigest {
        self.digest_builder(env).finish()
    }

    /// Digest of a fetched repository: the rule key plus the hashes of every
    /// recorded file.
    #[must_use]
    pub fn state_digest(
        &self,
        env: &BTreeMap<String, String>,
        recorded_files: &BTreeMap<PathBuf, String>,
    ) -> FetchDigest {
        recorded_files
            .iter()
            .fold(self.digest_builder(env), |builder, (path, hash)| {
                builder.record_file(path.clone(), hash.clone())
            })
            .finish()
    }

    fn digest_builder(&self, env: &BTreeMap<String, String>) -> DigestBuilder {
        let mut builder = DigestBuilder::new(self.name.as_str(), &self.kind);
        for (key, value) in &self.attributes {
            builder = builder.attribute(key, value);
        }
        for name in &self.environ {
            builder = builder.record_env(name, env.get(name).cloned());
        }
        builder
    }
}

/// Source of repository definitions (the parsed workspace descriptor).
pub trait RepositoryRuleLookup: Send + Sync {
    /// Rule for `name`, or `None` if no such repository is declared.
    ///
    /// # Errors
    ///
    /// Implementation specific, e.g. the descriptor could not be read.
    fn rule(&self, name: &RepositoryName) -> RepositoryResult<Option<RepositoryRule>>;
}

impl RepositoryRuleLookup for HashMap<RepositoryName, RepositoryRule> {
    fn rule(&self, name: &RepositoryName) -> RepositoryResult<Option<RepositoryRule>> {
        Ok(self.get(name).cloned())
    }
}

/// Result of a successful fetch.
#[derive(Debug, Clone, Default)]
pub struct FetchOutcome {
    /// Contents are not materialized yet; no marker is written.
    pub delayed: bool,
    /// Files read during the fetch (path -> sha256 hex), re-checked on reuse.
    pub recorded_files: BTreeMap<PathBuf, String>,
}

/// Populates a repository directory for the rule kinds it supports.
pub trait RepositoryFetcher: Send + Sync {
    /// Whether this fetcher handles `rule`.
    fn supports(&self, rule: &RepositoryRule) -> bool;

    /// Populate `output_dir`, which does not exist when this is called.
    ///
    /// # Errors
    ///
    /// [`RepositoryError::FetchFailed`] or I/O errors.
    fn fetch(&self, rule: &RepositoryRule, output_dir: &Path) -> RepositoryResult<FetchOutcome>;
}

/// Fetcher for `local_repository` rules: links the directory named by the
/// `path` attribute into place.
#[derive(Debug, Clone, Copy, Default)]
pub struct LocalRepositoryFetcher;

impl LocalRepositoryFetcher {
    /// Rule kind handled by this fetcher.
    pub const KIND: &'static str = "local_repository";
}

impl RepositoryFetcher for LocalRepositoryFetcher {
    fn supports(&self, rule: &RepositoryRule) -> bool {
        rule.kind == Self::KIND
    }

    fn fetch(&self, rule: &RepositoryRule, output_dir: &Path) -> RepositoryResult<FetchOutcome> {
        let failed = |message: String| RepositoryError::FetchFailed {
            name: rule.name.to_string(),
            message,
        };

        let source = rule
            .attributes
            .get("path")
            .map(PathBuf::from)
            .ok_or_else(|| failed("missing 'path' attribute".to_string()))?;

        if !source.is_absolute() {
            return Err(failed(format!("path {} is not absolute", source.display())));
        }
        if !source.is_dir() {
            return Err(failed(format!("{} is not a directory", source.display())));
        }

        link_dir(&source, output_dir)?;
        debug!("Linked {} -> {}", output_dir.display(), source.display());

        Ok(FetchOutcome::default())
    }
}

#[cfg(unix)]
fn link_dir(source: &Path, dest: &Path) -> RepositoryResult<()> {
    std::os::unix::fs::symlink(source, dest).map_err(io_at(dest))
}

#[cfg(windows)]
fn link_dir(source: &Path, dest: &Path) -> RepositoryResult<()> {
    std::os::windows::fs::symlink_dir(source, dest).map_err(io_at(dest))
}

/// Produces [`RepositoryState`] values for repository names.
pub struct RepositoryDirectoryFunction {
    external_root: PathBuf,
    lookup: Arc<dyn RepositoryRuleLookup>,
    fetchers: Vec<Arc<dyn RepositoryFetcher>>,
    client_env: BTreeMap<String, String>,
}

impl RepositoryDirectoryFunction {
    /// Repositories are materialized as `<external_root>/<name>`, markers as
    /// `<external_root>/@<name>.marker`. A relative root is resolved against
    /// the current directory.
    pub fn new(external_root: impl Into<PathBuf>, lookup: Arc<dyn RepositoryRuleLookup>) -> Self {
        let external_root = external_root.into();
        Self {
            external_root: std::path::absolute(&external_root).unwrap_or(external_root),
            lookup,
            fetchers: vec![Arc::new(LocalRepositoryFetcher)],
            client_env: BTreeMap::new(),
        }
    }

    /// Register a fetcher. Later registrations take precedence.
    #[must_use]
    pub fn with_fetcher(mut self, fetcher: Arc<dyn RepositoryFetcher>) -> Self {
        self.fetchers.insert(0, fetcher);
        self
    }

    /// Environment visible to rules that declare `environ` dependencies.
    #[must_use]
    pub fn with_client_env(mut self, env: BTreeMap<String, String>) -> Self {
        self.client_env = env;
        self
    }

    /// Directory a repository is materialized in.
    #[must_use]
    pub fn repository_dir(&self, name: &RepositoryName) -> PathBuf {
        self.external_root.join(name.as_str())
    }

    fn marker_path(&self, name: &RepositoryName) -> PathBuf {
        self.external_root.join(name.marker_file_name())
    }

    /// Current state of repository `name`.
    ///
    /// # Errors
    ///
    /// Lookup, fetch, listing and I/O failures.
    pub fn repository_state(&self, name: &RepositoryName) -> RepositoryResult<RepositoryState> {
        let Some(rule) = self.lookup.rule(name)? else {
            debug!("No rule for repository {name}");
            return Ok(NO_SUCH_REPOSITORY.clone());
        };

        let fetcher = self
            .fetchers
            .iter()
            .find(|f| f.supports(&rule))
            .ok_or_else(|| RepositoryError::NoFetcher(rule.kind.clone()))?;

        if !self.external_root.is_absolute() {
            return Err(RepositoryError::RelativeRoot(self.external_root.clone()));
        }

        let key = rule.digest(&self.client_env);
        let repo_dir = self.repository_dir(name);
        let marker_path = self.marker_path(name);

        if repo_dir.exists() {
            if let Some(marker) = RepositoryMarker::read(&marker_path)? {
                if marker.is_up_to_date(&key, &self.client_env) {
                    info!("Repository {name} is up to date");
                    let digest = rule.state_digest(&self.client_env, marker.files());
                    return self.resolved(&repo_dir, digest);
                }
            }
        }

        info!("Fetching repository {name} ({})", rule.kind);
        remove_if_present(&marker_path)?;
        remove_if_present(&repo_dir)?;
        fs::create_dir_all(&self.external_root).map_err(io_at(&self.external_root))?;

        let outcome = fetcher.fetch(&rule, &repo_dir)?;

        if outcome.delayed {
            debug!("Fetching of {name} is delayed");
            return Ok(RepositoryState::builder()
                .set_path(repo_dir)
                .set_fetching_delayed()
                .build());
        }

        let digest = rule.state_digest(&self.client_env, &outcome.recorded_files);
        let mut marker = RepositoryMarker::new(key);
        for (path, hash) in outcome.recorded_files {
            marker = marker.with_file(path, hash);
        }
        for env_name in &rule.environ {
            marker = marker.with_env(env_name, self.client_env.get(env_name).cloned());
        }
        marker.write(&marker_path)?;

        self.resolved(&repo_dir, digest)
    }

    fn resolved(&self, repo_dir: &Path, digest: FetchDigest) -> RepositoryResult<RepositoryState> {
        let listing = DirectoryListing::read(repo_dir)?;
        Ok(RepositoryState::builder()
            .set_path(repo_dir)
            .set_digest(digest)
            .set_source_dir(listing)
            .build())
    }

    /// Produce the state of `name` and record it in `table`.
    ///
    /// # Errors
    ///
    /// Same as [`Self::repository_state`].
    pub fn evaluate(
        &self,
        table: &mut RepositoryStateTable,
        name: &RepositoryName,
    ) -> RepositoryResult<(RepositoryState, Invalidation)> {
        let state = self.repository_state(name)?;
        let invalidation = table.record(name.clone(), state.clone());
        Ok((state, invalidation))
    }
}

fn remove_if_present(path: &Path) -> RepositoryResult<()> {
    let Ok(meta) = fs::symlink_metadata(path) else {
        return Ok(());
    };
    if meta.is_dir() {
        fs::remove_dir_all(path).map_err(io_at(path))
    } else {
        fs::remove_file(path).map_err(io_at(path))
    }
}

/// Whether a newly produced state invalidates its dependents.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Invalidation {
    /// Equal to the previous value; dependents can be skipped.
    Unchanged,
    /// New or different value; dependents must be re-evaluated.
    Changed,
}

/// Last produced state per repository name.
#[derive(Debug, Default)]
pub struct RepositoryStateTable {
    states: HashMap<RepositoryName, RepositoryState>,
}

impl RepositoryStateTable {
    /// Empty table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Store `state`, comparing it with the previous value by equality.
    pub fn record(&mut self, name: RepositoryName, state: RepositoryState) -> Invalidation {
        match self.states.insert(name, state.clone()) {
            Some(previous) if previous == state => Invalidation::Unchanged,
            _ => Invalidation::Changed,
        }
    }

    /// Last recorded state.
    #[must_use]
    pub fn get(&self, name: &RepositoryName) -> Option<&RepositoryState> {
        self.states.get(name)
    }

    /// Whether `name` must be produced again rather than trusted: nothing is
    /// recorded yet, or the recorded state is still fetching-delayed.
    #[must_use]
    pub fn needs_recheck(&self, name: &RepositoryName) -> bool {
        match self.states.get(name) {
            None => true,
            Some(state) => state.as_resolved().is_some_and(|r| r.is_fetching_delayed()),
        }
    }

    /// Forget a recorded state.
    pub fn invalidate(&mut self, name: &RepositoryName) -> Option<RepositoryState> {
        self.states.remove(name)
    }

    /// Number of recorded repositories.
    #[must_use]
    pub fn len(&self) -> usize {
        self.states.len()
    }

    /// Whether nothing is recorded.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }
}

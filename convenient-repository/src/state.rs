//! Repository directory state stored in the incremental build graph.

use crate::digest::FetchDigest;
use crate::listing::DirectoryListing;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// The shared value for "no such repository", whatever name was requested.
pub static NO_SUCH_REPOSITORY: RepositoryState = RepositoryState::Unresolved;

/// A local view of an external repository.
///
/// Values are immutable once built. The evaluator supersedes a state by
/// producing a new one and compares the two with `==`: only the path, the
/// source listing and the digest take part, so a repository that goes from
/// fetching-delayed to fetched with the same digest does not invalidate
/// anything downstream.
#[derive(Debug, Clone)]
pub enum RepositoryState {
    /// The repository exists on disk.
    Resolved(Arc<ResolvedRepository>),
    /// The repository does not exist. Every accessor except
    /// [`RepositoryState::exists`] panics on this variant.
    Unresolved,
}

impl RepositoryState {
    /// Start building a resolved state.
    pub fn builder() -> RepositoryStateBuilder {
        RepositoryStateBuilder::default()
    }

    /// The process-wide "no such repository" value.
    #[must_use]
    pub fn no_such_repository() -> &'static Self {
        &NO_SUCH_REPOSITORY
    }

    /// Whether the repository exists. Never panics.
    #[must_use]
    pub fn exists(&self) -> bool {
        match self {
            Self::Resolved(_) => true,
            Self::Unresolved => false,
        }
    }

    /// The resolved payload, if any.
    #[must_use]
    pub fn as_resolved(&self) -> Option<&ResolvedRepository> {
        match self {
            Self::Resolved(resolved) => Some(resolved),
            Self::Unresolved => None,
        }
    }

    /// Directory containing the repository's contents.
    ///
    /// # Panics
    ///
    /// If the repository does not exist; check [`RepositoryState::exists`] first.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.resolved("path").path
    }

    /// Whether the final contents have not been materialized yet.
    ///
    /// # Panics
    ///
    /// If the repository does not exist.
    #[must_use]
    pub fn is_fetching_delayed(&self) -> bool {
        self.resolved("is_fetching_delayed").fetching_delayed
    }

    /// Fetch fingerprint; absent only while fetching is delayed.
    ///
    /// # Panics
    ///
    /// If the repository does not exist.
    #[must_use]
    pub fn digest(&self) -> Option<&FetchDigest> {
        self.resolved("digest").digest.as_ref()
    }

    /// Snapshot of the directory's immediate entries, when one was taken.
    ///
    /// # Panics
    ///
    /// If the repository does not exist.
    #[must_use]
    pub fn source_dir(&self) -> Option<&DirectoryListing> {
        self.resolved("source_dir").source_dir.as_ref()
    }

    #[allow(clippy::panic)]
    fn resolved(&self, accessor: &str) -> &ResolvedRepository {
        match self {
            Self::Resolved(resolved) => resolved,
            Self::Unresolved => panic!(
                "{accessor}() called on a repository that does not exist; check exists() first"
            ),
        }
    }
}

impl PartialEq for RepositoryState {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Resolved(a), Self::Resolved(b)) => Arc::ptr_eq(a, b) || a == b,
            (Self::Unresolved, Self::Unresolved) => true,
            _ => false,
        }
    }
}

impl Eq for RepositoryState {}

impl Hash for RepositoryState {
    fn hash<H: Hasher>(&self, state: &mut H) {
        std::mem::discriminant(self).hash(state);
        if let Self::Resolved(resolved) = self {
            resolved.hash(state);
        }
    }
}

impl fmt::Display for RepositoryState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Resolved(resolved) => write!(f, "{}", resolved.path.display()),
            Self::Unresolved => write!(f, "<no such repository>"),
        }
    }
}

/// Payload of [`RepositoryState::Resolved`].
#[derive(Debug)]
pub struct ResolvedRepository {
    path: PathBuf,
    fetching_delayed: bool,
    digest: Option<FetchDigest>,
    source_dir: Option<DirectoryListing>,
}

impl ResolvedRepository {
    /// Directory containing the repository's contents.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Whether the final contents have not been materialized yet.
    #[must_use]
    pub fn is_fetching_delayed(&self) -> bool {
        self.fetching_delayed
    }

    /// Fetch fingerprint.
    #[must_use]
    pub fn digest(&self) -> Option<&FetchDigest> {
        self.digest.as_ref()
    }

    /// Source listing snapshot.
    #[must_use]
    pub fn source_dir(&self) -> Option<&DirectoryListing> {
        self.source_dir.as_ref()
    }
}

// fetching_delayed is left out on purpose: see RepositoryState.
impl PartialEq for ResolvedRepository {
    fn eq(&self, other: &Self) -> bool {
        self.path == other.path && self.source_dir == other.source_dir && self.digest == other.digest
    }
}

impl Eq for ResolvedRepository {}

impl Hash for ResolvedRepository {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.path.hash(state);
        self.source_dir.hash(state);
        self.digest.hash(state);
    }
}

/// Staged construction of a [`RepositoryState::Resolved`].
///
/// Fetchers always call [`set_path`](Self::set_path) and then either
/// [`set_digest`](Self::set_digest) or
/// [`set_fetching_delayed`](Self::set_fetching_delayed).
#[derive(Debug, Clone, Default)]
#[must_use]
pub struct RepositoryStateBuilder {
    path: Option<PathBuf>,
    fetching_delayed: bool,
    digest: Option<FetchDigest>,
    source_dir: Option<DirectoryListing>,
}

impl RepositoryStateBuilder {
    /// Absolute path of the repository directory.
    pub fn set_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.path = Some(path.into());
        self
    }

    /// Mark the contents as not yet materialized. A digest becomes optional.
    pub fn set_fetching_delayed(mut self) -> Self {
        self.fetching_delayed = true;
        self
    }

    /// Fetch fingerprint.
    pub fn set_digest(mut self, digest: impl Into<FetchDigest>) -> Self {
        self.digest = Some(digest.into());
        self
    }

    /// Snapshot of the directory's immediate contents.
    pub fn set_source_dir(mut self, listing: DirectoryListing) -> Self {
        self.source_dir = Some(listing);
        self
    }

    /// Validate and produce the immutable state.
    ///
    /// # Panics
    ///
    /// If no path was set, the path is relative, or no digest was set while
    /// fetching is not delayed. These are bugs in the calling fetcher.
    #[allow(clippy::panic)]
    #[must_use]
    pub fn build(self) -> RepositoryState {
        let Some(path) = self.path else {
            panic!("Repository path must be specified!");
        };
        assert!(
            path.is_absolute(),
            "Repository path must be absolute, got {}",
            path.display()
        );
        // A digest may only be missing while fetching is delayed.
        if !self.fetching_delayed {
            assert!(
                self.digest.is_some(),
                "Repository marker digest must be specified for {}!",
                path.display()
            );
        }

        RepositoryState::Resolved(Arc::new(ResolvedRepository {
            path,
            fetching_delayed: self.fetching_delayed,
            digest: self.digest,
            source_dir: self.source_dir,
        }))
    }
}

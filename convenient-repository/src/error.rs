//! Error types for repository resolution.

use std::io;
use std::path::PathBuf;

/// Recoverable errors raised while resolving a repository.
///
/// Misuse of [`crate::RepositoryState`] (reading the path of a repository
/// that does not exist, building a state without a path) is not reported
/// here: those are caller bugs and panic.
#[derive(Debug, thiserror::Error)]
pub enum RepositoryError {
    /// Repository name failed validation
    #[error("Invalid repository name '{name}': {reason}")]
    InvalidName {
        /// The rejected name
        name: String,
        /// Why it was rejected
        reason: &'static str,
    },

    /// No registered fetcher handles the rule kind
    #[error("No fetcher registered for rule kind '{0}'")]
    NoFetcher(String),

    /// A fetcher could not populate the repository directory
    #[error("Fetching {name} failed: {message}")]
    FetchFailed {
        /// Repository being fetched
        name: String,
        /// Fetcher supplied detail
        message: String,
    },

    /// The external root could not be made absolute
    #[error("External repository root {0} is not absolute")]
    RelativeRoot(PathBuf),

    /// Directory listing failed
    #[error("Failed to list {path}: {source}")]
    Listing {
        /// Directory being listed
        path: PathBuf,
        /// Underlying walk error
        #[source]
        source: walkdir::Error,
    },

    /// Filesystem error
    #[error("IO error at {path}: {source}")]
    Io {
        /// Path involved in the failed operation
        path: PathBuf,
        /// Underlying I/O error
        #[source]
        source: io::Error,
    },
}

/// Result type for repository operations.
pub type RepositoryResult<T> = Result<T, RepositoryError>;

/// Attach a path to an [`io::Error`].
pub(crate) fn io_at(path: impl Into<PathBuf>) -> impl FnOnce(io::Error) -> RepositoryError {
    let path = path.into();
    move |source| RepositoryError::Io { path, source }
}

//! On-disk state of external repositories for an incremental build graph.
//!
//! An external repository is a directory populated by a fetcher (a local
//! path, an archive download, a VCS checkout). The build graph stores one
//! [`RepositoryState`] per repository name and compares old and new values by
//! equality to decide whether anything downstream has to be re-evaluated.
//!
//! # Features
//!
//! - [`RepositoryState`] with exactly two variants: resolved and unresolved
//! - Validating [`RepositoryStateBuilder`], the only construction surface for fetchers
//! - [`FetchDigest`] fingerprints computed by [`DigestBuilder`]
//! - Marker files recording what produced a fetched directory
//! - [`RepositoryDirectoryFunction`] for keyed `repository_state(name)` lookups
//!
//! # Example
//!
//! ```
//! use convenient_repository::{FetchDigest, RepositoryState};
//!
//! let state = RepositoryState::builder()
//!     .set_path("/output/external/zlib")
//!     .set_digest(FetchDigest::from_bytes(b"zlib-1.3"))
//!     .build();
//!
//! assert!(state.exists());
//! assert!(!state.is_fetching_delayed());
//! assert!(!RepositoryState::no_such_repository().exists());
//! ```

#![warn(missing_docs)]
#![deny(unsafe_code)]
#![warn(unused_results)]

pub mod digest;
pub mod error;
pub mod function;
pub mod listing;
pub mod marker;
pub mod name;
pub mod state;

pub use digest::{hash_file, DigestBuilder, FetchDigest};
pub use error::{RepositoryError, RepositoryResult};
pub use function::{
    FetchOutcome, Invalidation, LocalRepositoryFetcher, RepositoryDirectoryFunction,
    RepositoryFetcher, RepositoryRule, RepositoryRuleLookup, RepositoryStateTable,
};
pub use listing::{DirectoryListing, EntryKind, ListingEntry};
pub use marker::RepositoryMarker;
pub use name::RepositoryName;
pub use state::{RepositoryState, RepositoryStateBuilder, ResolvedRepository, NO_SUCH_REPOSITORY};

//! Repository state construction, equality and keyed lookup
//!
//! Covers:
//! 1. Builder invariants (path required, digest required unless delayed)
//! 2. Equality over (path, source listing, digest) only
//! 3. The unresolved singleton and its faulting accessors
//! 4. Reuse of fetched directories through marker files

use convenient_repository::{
    DirectoryListing, EntryKind, FetchDigest, FetchOutcome, Invalidation, ListingEntry,
    RepositoryDirectoryFunction, RepositoryError, RepositoryFetcher, RepositoryName,
    RepositoryResult, RepositoryRule, RepositoryState, RepositoryStateTable, NO_SUCH_REPOSITORY,
};
use std::collections::hash_map::DefaultHasher;
use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::hash::{Hash, Hasher};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tempfile::TempDir;

fn hash_of(state: &RepositoryState) -> u64 {
    let mut hasher = DefaultHasher::new();
    state.hash(&mut hasher);
    hasher.finish()
}

fn listing() -> DirectoryListing {
    DirectoryListing::from_entries([
        ListingEntry::new("BUILD", EntryKind::File),
        ListingEntry::new("src", EntryKind::Directory),
    ])
}

#[test]
fn build_with_path_and_digest() {
    for (path, digest) in [
        ("/out/external/zlib", &b"zlib"[..]),
        ("/out/external/rules_cc", &[0u8, 1, 2][..]),
        ("/", &[][..]),
    ] {
        let state = RepositoryState::builder()
            .set_path(path)
            .set_digest(digest)
            .build();

        assert!(state.exists());
        assert_eq!(state.path(), Path::new(path));
        assert!(!state.is_fetching_delayed());
        assert_eq!(state.digest().map(FetchDigest::as_bytes), Some(digest));
    }
}

#[test]
fn build_delayed_without_digest() {
    let state = RepositoryState::builder()
        .set_path("/out/external/lazy")
        .set_fetching_delayed()
        .build();

    assert!(state.is_fetching_delayed());
    assert_eq!(state.digest(), None);
}

#[test]
#[should_panic(expected = "Repository path must be specified")]
fn build_without_path_faults() {
    let _ = RepositoryState::builder()
        .set_digest(FetchDigest::from_bytes(b"d"))
        .set_fetching_delayed()
        .set_source_dir(listing())
        .build();
}

#[test]
#[should_panic(expected = "Repository path must be specified")]
fn build_empty_builder_faults() {
    let _ = RepositoryState::builder().build();
}

#[test]
#[should_panic(expected = "digest must be specified")]
fn build_without_digest_or_delay_faults() {
    let _ = RepositoryState::builder().set_path("/out/external/zlib").build();
}

#[test]
fn independent_equal_values_hash_identically() {
    let make = |digest: &[u8]| {
        RepositoryState::builder()
            .set_path("/out/external/zlib")
            .set_source_dir(listing())
            .set_digest(digest)
            .build()
    };

    let a = make(b"same");
    let b = make(b"same");
    assert_eq!(a, b);
    assert_eq!(hash_of(&a), hash_of(&b));

    let c = make(b"different");
    assert_ne!(a, c);
}

#[test]
fn path_participates_in_equality() {
    let a = RepositoryState::builder().set_path("/a").set_digest(&b"d"[..]).build();
    let b = RepositoryState::builder().set_path("/b").set_digest(&b"d"[..]).build();
    assert_ne!(a, b);
    assert_ne!(a, NO_SUCH_REPOSITORY);
}

#[test]
fn unresolved_exists_never_faults() {
    assert!(!NO_SUCH_REPOSITORY.exists());
    assert!(!RepositoryState::no_such_repository().exists());
    assert_eq!(NO_SUCH_REPOSITORY.clone(), RepositoryState::Unresolved);
}

#[test]
#[should_panic(expected = "path() called on a repository that does not exist")]
fn unresolved_path_faults() {
    let _ = NO_SUCH_REPOSITORY.path();
}

#[test]
#[should_panic(expected = "is_fetching_delayed() called on a repository that does not exist")]
fn unresolved_delayed_flag_faults() {
    let _ = RepositoryState::no_such_repository().is_fetching_delayed();
}

/// Counts fetches and copies a fixed file set into the repository directory
struct CountingFetcher {
    fetches: AtomicUsize,
    patch: PathBuf,
}

impl RepositoryFetcher for CountingFetcher {
    fn supports(&self, rule: &RepositoryRule) -> bool {
        rule.kind == "test_archive"
    }

    fn fetch(&self, rule: &RepositoryRule, output_dir: &Path) -> RepositoryResult<FetchOutcome> {
        let _ = self.fetches.fetch_add(1, Ordering::SeqCst);
        fs::create_dir_all(output_dir).unwrap();
        fs::write(output_dir.join("BUILD"), rule.attributes["content"].as_bytes()).unwrap();

        let mut outcome = FetchOutcome::default();
        let _ = outcome.recorded_files.insert(
            self.patch.clone(),
            convenient_repository::hash_file(&self.patch).unwrap(),
        );
        if rule.attributes.get("delayed").is_some_and(|v| v == "true") {
            outcome.delayed = true;
        }
        Ok(outcome)
    }
}

struct Fixture {
    _tmp: TempDir,
    external: PathBuf,
    patch: PathBuf,
    rules: HashMap<RepositoryName, RepositoryRule>,
}

fn fixture() -> Fixture {
    let tmp = TempDir::new().unwrap();
    let external = tmp.path().join("external");
    let patch = tmp.path().join("fix.patch");
    fs::write(&patch, "--- a\n+++ b\n").unwrap();

    let archive = RepositoryName::new("archive").unwrap();
    let mut rules = HashMap::new();
    let _ = rules.insert(
        archive.clone(),
        RepositoryRule::new(archive, "test_archive")
            .with_attribute("content", "cc_library(name = 'z')")
            .with_environ("CC"),
    );

    Fixture {
        _tmp: tmp,
        external,
        patch,
        rules,
    }
}

fn function(fx: &Fixture, fetcher: Arc<CountingFetcher>, cc: &str) -> RepositoryDirectoryFunction {
    let mut env = BTreeMap::new();
    let _ = env.insert("CC".to_string(), cc.to_string());
    RepositoryDirectoryFunction::new(&fx.external, Arc::new(fx.rules.clone()))
        .with_fetcher(fetcher)
        .with_client_env(env)
}

#[test]
fn unknown_repository_is_unresolved() {
    let fx = fixture();
    let fetcher = Arc::new(CountingFetcher { fetches: AtomicUsize::new(0), patch: fx.patch.clone() });
    let func = function(&fx, fetcher, "gcc");

    let state = func.repository_state(&RepositoryName::new("nope").unwrap()).unwrap();
    assert!(!state.exists());
}

#[test]
fn marker_allows_reuse_until_inputs_change() {
    let fx = fixture();
    let fetcher = Arc::new(CountingFetcher { fetches: AtomicUsize::new(0), patch: fx.patch.clone() });
    let name = RepositoryName::new("archive").unwrap();
    let mut table = RepositoryStateTable::new();

    let func = function(&fx, fetcher.clone(), "gcc");
    let (first, inv) = func.evaluate(&mut table, &name).unwrap();
    assert_eq!(inv, Invalidation::Changed);
    assert_eq!(first.path(), fx.external.join("archive"));
    assert!(first.source_dir().unwrap().contains("BUILD"));
    assert!(fx.external.join("@archive.marker").is_file());
    assert_eq!(fetcher.fetches.load(Ordering::SeqCst), 1);

    // Same inputs: directory reused, equal state, dependents untouched
    let (second, inv) = func.evaluate(&mut table, &name).unwrap();
    assert_eq!(inv, Invalidation::Unchanged);
    assert_eq!(first, second);
    assert_eq!(fetcher.fetches.load(Ordering::SeqCst), 1);

    // Declared environment changed: refetch with a new digest
    let func = function(&fx, fetcher.clone(), "clang");
    let (third, inv) = func.evaluate(&mut table, &name).unwrap();
    assert_eq!(inv, Invalidation::Changed);
    assert_ne!(third.digest(), first.digest());
    assert_eq!(fetcher.fetches.load(Ordering::SeqCst), 2);

    // Recorded file changed: refetch, and dependents see a new digest
    fs::write(&fx.patch, "--- a\n+++ c\n").unwrap();
    let (fourth, inv) = func.evaluate(&mut table, &name).unwrap();
    assert_eq!(inv, Invalidation::Changed);
    assert_ne!(fourth.digest(), third.digest());
    assert_eq!(fetcher.fetches.load(Ordering::SeqCst), 3);

    // Reuse after that refetch reproduces the same digest
    let (fifth, inv) = func.evaluate(&mut table, &name).unwrap();
    assert_eq!(inv, Invalidation::Unchanged);
    assert_eq!(fifth, fourth);
    assert_eq!(fetcher.fetches.load(Ordering::SeqCst), 3);

    // Marker removed: refetch
    fs::remove_file(fx.external.join("@archive.marker")).unwrap();
    let _ = func.repository_state(&name).unwrap();
    assert_eq!(fetcher.fetches.load(Ordering::SeqCst), 4);
}

/// Copies an upstream file into the repository and records it
struct MirrorFetcher {
    upstream: PathBuf,
}

impl RepositoryFetcher for MirrorFetcher {
    fn supports(&self, rule: &RepositoryRule) -> bool {
        rule.kind == "mirror"
    }

    fn fetch(&self, _rule: &RepositoryRule, output_dir: &Path) -> RepositoryResult<FetchOutcome> {
        fs::create_dir_all(output_dir).unwrap();
        let _ = fs::copy(&self.upstream, output_dir.join("upstream.txt")).unwrap();

        let mut outcome = FetchOutcome::default();
        let _ = outcome.recorded_files.insert(
            self.upstream.clone(),
            convenient_repository::hash_file(&self.upstream).unwrap(),
        );
        Ok(outcome)
    }
}

#[test]
fn changed_upstream_contents_invalidate_dependents() {
    let tmp = TempDir::new().unwrap();
    let upstream = tmp.path().join("upstream.txt");
    fs::write(&upstream, "v1").unwrap();

    let name = RepositoryName::new("mirror").unwrap();
    let mut rules = HashMap::new();
    let _ = rules.insert(name.clone(), RepositoryRule::new(name.clone(), "mirror"));
    let func = RepositoryDirectoryFunction::new(tmp.path().join("external"), Arc::new(rules))
        .with_fetcher(Arc::new(MirrorFetcher { upstream: upstream.clone() }));
    let mut table = RepositoryStateTable::new();

    let (first, inv) = func.evaluate(&mut table, &name).unwrap();
    assert_eq!(inv, Invalidation::Changed);

    fs::write(&upstream, "v2").unwrap();
    let (second, inv) = func.evaluate(&mut table, &name).unwrap();
    assert_eq!(inv, Invalidation::Changed);
    assert_ne!(first.digest(), second.digest());
    assert_eq!(
        fs::read_to_string(second.path().join("upstream.txt")).unwrap(),
        "v2"
    );
}

#[test]
fn delayed_fetch_writes_no_marker() {
    let mut fx = fixture();
    let name = RepositoryName::new("archive").unwrap();
    let rule = fx.rules[&name].clone().with_attribute("delayed", "true");
    let _ = fx.rules.insert(name.clone(), rule);

    let fetcher = Arc::new(CountingFetcher { fetches: AtomicUsize::new(0), patch: fx.patch.clone() });
    let func = function(&fx, fetcher.clone(), "gcc");

    let state = func.repository_state(&name).unwrap();
    assert!(state.is_fetching_delayed());
    assert!(state.digest().is_none());
    assert!(!fx.external.join("@archive.marker").exists());

    // Delayed repositories are fetched again on every evaluation
    let _ = func.repository_state(&name).unwrap();
    assert_eq!(fetcher.fetches.load(Ordering::SeqCst), 2);
}

#[test]
fn unsupported_rule_kind_is_an_error() {
    let tmp = TempDir::new().unwrap();
    let name = RepositoryName::new("remote").unwrap();
    let mut rules = HashMap::new();
    let _ = rules.insert(name.clone(), RepositoryRule::new(name.clone(), "http_archive"));

    let func = RepositoryDirectoryFunction::new(tmp.path(), Arc::new(rules));
    let err = func.repository_state(&name).unwrap_err();
    assert!(matches!(err, RepositoryError::NoFetcher(kind) if kind == "http_archive"));
}

#[cfg(unix)]
#[test]
fn local_repository_links_source_directory() {
    let tmp = TempDir::new().unwrap();
    let source = tmp.path().join("src/mylib");
    fs::create_dir_all(&source).unwrap();
    fs::write(source.join("BUILD"), "").unwrap();

    let name = RepositoryName::new("mylib").unwrap();
    let mut rules = HashMap::new();
    let _ = rules.insert(
        name.clone(),
        RepositoryRule::new(name.clone(), "local_repository")
            .with_attribute("path", source.to_string_lossy()),
    );

    let func = RepositoryDirectoryFunction::new(tmp.path().join("external"), Arc::new(rules));
    let first = func.repository_state(&name).unwrap();
    assert!(first.source_dir().unwrap().contains("BUILD"));

    // A new top-level entry in the source changes the listing and thus equality
    fs::write(source.join("WORKSPACE"), "").unwrap();
    let second = func.repository_state(&name).unwrap();
    assert_eq!(first.digest(), second.digest());
    assert_ne!(first, second);
}

#[test]
fn local_repository_requires_existing_directory() {
    let tmp = TempDir::new().unwrap();
    let name = RepositoryName::new("gone").unwrap();
    let mut rules = HashMap::new();
    let _ = rules.insert(
        name.clone(),
        RepositoryRule::new(name.clone(), "local_repository")
            .with_attribute("path", tmp.path().join("missing").to_string_lossy()),
    );

    let func = RepositoryDirectoryFunction::new(tmp.path().join("external"), Arc::new(rules));
    let err = func.repository_state(&name).unwrap_err();
    assert!(matches!(err, RepositoryError::FetchFailed { .. }));
}

//! Resolve a local repository the way a build would see it

use convenient_repository::{
    LocalRepositoryFetcher, RepositoryDirectoryFunction, RepositoryName, RepositoryRule,
    RepositoryState,
};
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::Arc;
use tracing::info;

/// Resolve `source` as local repository `name` under `<output_base>/external`.
///
/// `client_env` supplies values for the variables listed in `environ`.
pub fn resolve(
    source: &Path,
    name: &str,
    output_base: &Path,
    environ: &[String],
    client_env: BTreeMap<String, String>,
) -> Result<RepositoryState, Box<dyn std::error::Error>> {
    let cwd = std::env::current_dir()?;
    let name = RepositoryName::new(name)?;

    let mut rule = RepositoryRule::new(name.clone(), LocalRepositoryFetcher::KIND)
        .with_attribute("path", cwd.join(source).to_string_lossy());
    for variable in environ {
        rule = rule.with_environ(variable);
    }

    let mut rules = HashMap::new();
    rules.insert(name.clone(), rule);

    let function = RepositoryDirectoryFunction::new(cwd.join(output_base).join("external"), Arc::new(rules))
        .with_client_env(client_env);
    Ok(function.repository_state(&name)?)
}

/// Print the resolved state of a local repository.
pub fn execute(
    source: &Path,
    name: &str,
    output_base: &Path,
    environ: &[String],
) -> Result<(), Box<dyn std::error::Error>> {
    // Only the declared variables leave the process environment
    let client_env: BTreeMap<String, String> = environ
        .iter()
        .filter_map(|variable| std::env::var(variable).ok().map(|value| (variable.clone(), value)))
        .collect();

    let state = resolve(source, name, output_base, environ, client_env)?;
    info!("Resolved @{} to {}", name, state);

    println!("📦 @{}", name.trim_start_matches('@'));
    println!("  Path:     {}", state.path().display());
    match state.digest() {
        Some(digest) => println!("  Digest:   {}", digest.to_hex()),
        None => println!("  Digest:   (fetching delayed)"),
    }
    if let Some(listing) = state.source_dir() {
        println!("  Entries:  {}", listing.len());
    }
    Ok(())
}

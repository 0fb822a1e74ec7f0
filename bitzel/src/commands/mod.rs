//! Bitzel command-line interface
//!
//! - `run`: execute one command in a sandbox
//! - `repo`: resolve a local repository and show its state
//! - `strategies`: list registered execution strategies

use clap::{Parser, Subcommand};
use convenient_sandbox::SandboxOptions;
use std::path::PathBuf;

pub mod repo;
pub mod run;
pub mod strategies;

/// Bitzel - sandboxed spawns and external repositories
#[derive(Parser)]
#[command(name = "bitzel")]
#[command(about = "Run build commands in sandboxes and resolve external repositories")]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run a command in a sandbox
    Run {
        #[command(flatten)]
        sandbox: SandboxOptions,

        /// Strategy name, or a comma-separated preference list
        #[arg(long, default_value = "sandboxed")]
        strategy: String,

        /// Declared input, staged at DEST (default: SRC's file name)
        #[arg(long = "input", value_name = "SRC[=DEST]", value_parser = parse_input)]
        inputs: Vec<(PathBuf, PathBuf)>,

        /// Declared output, relative to the execution root
        #[arg(long = "output", value_name = "PATH")]
        outputs: Vec<PathBuf>,

        /// Environment variable for the command; nothing else is passed
        #[arg(long = "env", value_name = "K=V", value_parser = parse_env)]
        env: Vec<(String, String)>,

        /// Timeout in seconds
        #[arg(long, value_name = "SECS")]
        timeout: Option<f64>,

        /// Directory receiving the outputs
        #[arg(long, default_value = ".")]
        exec_root: PathBuf,

        /// Action kind shown in messages
        #[arg(long, default_value = "Run")]
        mnemonic: String,

        /// Print the full result as JSON
        #[arg(long)]
        json: bool,

        /// Command and arguments
        #[arg(last = true, required = true)]
        command: Vec<String>,
    },

    /// Resolve a local repository and print its state
    Repo {
        /// Source directory of the repository
        path: PathBuf,

        /// Repository name
        #[arg(long)]
        name: String,

        /// Output base holding `external/`
        #[arg(long, default_value = "bitzel-out")]
        output_base: PathBuf,

        /// Environment variable the repository depends on (repeatable)
        #[arg(long = "environ", value_name = "NAME")]
        environ: Vec<String>,
    },

    /// List registered execution strategies
    Strategies,
}

/// Malformed command-line values
#[derive(Debug, thiserror::Error)]
pub enum ArgError {
    #[error("expected K=V, got '{0}'")]
    Env(String),

    #[error("input '{0}' has no file name; use SRC=DEST")]
    InputName(String),

    #[error("timeout must be a positive number of seconds, got {0}")]
    Timeout(f64),
}

fn parse_env(value: &str) -> Result<(String, String), ArgError> {
    match value.split_once('=') {
        Some((name, value)) if !name.is_empty() => Ok((name.to_string(), value.to_string())),
        _ => Err(ArgError::Env(value.to_string())),
    }
}

fn parse_input(value: &str) -> Result<(PathBuf, PathBuf), ArgError> {
    if let Some((src, dest)) = value.split_once('=') {
        return Ok((PathBuf::from(src), PathBuf::from(dest)));
    }
    let src = PathBuf::from(value);
    let dest = src
        .file_name()
        .map(PathBuf::from)
        .ok_or_else(|| ArgError::InputName(value.to_string()))?;
    Ok((src, dest))
}

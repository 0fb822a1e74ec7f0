//! Sandbox configuration
//!
//! The same struct serves as clap arguments for the CLI and as a serde
//! section for configuration files. Library code only ever receives a
//! constructed value and never reads the environment itself.

use clap::{Args, ValueEnum};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// How declared inputs become visible inside the execution root
///
/// Linked inputs share storage with the host file and are only safe when
/// the command runs with [`IsolationMode::Namespace`], which mounts them
/// read-only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum InputMode {
    /// Read-only copy
    #[default]
    Copy,
    /// Symlink to the host file, copying when symlinks are unavailable
    Symlink,
    /// Hard link, copying across filesystems
    Hardlink,
}

/// How the command is confined to its scratch directory
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum IsolationMode {
    /// Private mount namespace: other scratch directories are hidden and
    /// inputs are read-only. Spawns fail if it cannot be set up.
    #[default]
    Namespace,
    /// Working directory and cleared environment only. Requires
    /// [`InputMode::Copy`].
    Directory,
}

/// Options for sandboxed strategies.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Args)]
#[serde(default)]
pub struct SandboxOptions {
    /// Directory under which per-spawn scratch directories are created
    #[arg(long, env = "BITZEL_SANDBOX_BASE", default_value_os_t = default_sandbox_base())]
    pub sandbox_base: PathBuf,

    /// Product name used to namespace scratch directories
    #[arg(long, env = "BITZEL_PRODUCT_NAME", default_value = "bitzel")]
    pub product_name: String,

    /// Include command line, environment and sandbox path in failure messages
    #[arg(long, env = "BITZEL_VERBOSE_FAILURES")]
    pub verbose_failures: bool,

    /// Seconds between the termination request and the forced kill
    #[arg(
        long = "local-termination-grace-seconds",
        env = "BITZEL_TERMINATION_GRACE_SECONDS",
        default_value_t = 15
    )]
    pub timeout_grace_seconds: u64,

    /// How inputs are staged into the sandbox
    #[arg(long = "sandbox-input-mode", value_enum, env = "BITZEL_SANDBOX_INPUT_MODE", default_value_t = InputMode::Copy)]
    pub input_mode: InputMode,

    /// How commands are confined
    #[arg(long = "sandbox-isolation", value_enum, env = "BITZEL_SANDBOX_ISOLATION", default_value_t = IsolationMode::Namespace)]
    pub isolation: IsolationMode,

    /// Maximum number of spawns running at once
    #[arg(short = 'j', long = "jobs", env = "BITZEL_JOBS", default_value_t = num_cpus::get())]
    pub max_parallel: usize,
}

fn default_sandbox_base() -> PathBuf {
    std::env::temp_dir()
}

impl Default for SandboxOptions {
    fn default() -> Self {
        Self {
            sandbox_base: default_sandbox_base(),
            product_name: "bitzel".to_string(),
            verbose_failures: false,
            timeout_grace_seconds: 15,
            input_mode: InputMode::default(),
            isolation: IsolationMode::default(),
            max_parallel: num_cpus::get(),
        }
    }
}

impl SandboxOptions {
    /// Options rooted at `sandbox_base`, everything else default
    pub fn with_base(sandbox_base: impl Into<PathBuf>) -> Self {
        Self {
            sandbox_base: sandbox_base.into(),
            ..Self::default()
        }
    }

    /// Grace period between the termination request and the forced kill
    pub fn timeout_grace(&self) -> Duration {
        Duration::from_secs(self.timeout_grace_seconds)
    }

    /// Directory holding every scratch directory of this product:
    /// `<sandbox_base>/<product_name>-sandbox`
    pub fn sandbox_root(&self) -> PathBuf {
        self.sandbox_base.join(format!("{}-sandbox", self.product_name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[derive(Parser)]
    struct Cli {
        #[command(flatten)]
        sandbox: SandboxOptions,
    }

    #[test]
    fn test_defaults() {
        let options = SandboxOptions::with_base("/var/tmp");
        assert_eq!(options.product_name, "bitzel");
        assert_eq!(options.timeout_grace(), Duration::from_secs(15));
        assert_eq!(options.input_mode, InputMode::Copy);
        assert_eq!(options.isolation, IsolationMode::Namespace);
        assert!(options.max_parallel >= 1);
        assert_eq!(options.sandbox_root(), PathBuf::from("/var/tmp/bitzel-sandbox"));
    }

    #[test]
    fn test_parse_flags() {
        let cli = Cli::try_parse_from([
            "bitzel",
            "--sandbox-base",
            "/scratch",
            "--product-name",
            "blaze",
            "--verbose-failures",
            "--local-termination-grace-seconds",
            "2",
            "--sandbox-input-mode",
            "symlink",
            "--sandbox-isolation",
            "directory",
            "-j",
            "3",
        ])
        .unwrap();

        let options = cli.sandbox;
        assert_eq!(options.sandbox_root(), PathBuf::from("/scratch/blaze-sandbox"));
        assert!(options.verbose_failures);
        assert_eq!(options.timeout_grace(), Duration::from_secs(2));
        assert_eq!(options.input_mode, InputMode::Symlink);
        assert_eq!(options.isolation, IsolationMode::Directory);
        assert_eq!(options.max_parallel, 3);
    }
}

//! Bitzel - sandboxed spawns and external repositories from the command line
//!
//! Wires configuration and logging to:
//! 1. convenient-sandbox (strategy registry, executor pool)
//! 2. convenient-repository (local repository resolution)

mod commands;

use clap::Parser;
use commands::{Cli, Commands};
use convenient_sandbox::StrategyRegistry;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                "bitzel=info,convenient_sandbox=info,convenient_repository=info".into()
            }),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            sandbox,
            strategy,
            inputs,
            outputs,
            env,
            timeout,
            exec_root,
            mnemonic,
            json,
            command,
        } => {
            let args = commands::run::RunArgs {
                sandbox,
                strategy,
                inputs,
                outputs,
                env,
                timeout,
                exec_root,
                mnemonic,
                json,
                command,
            };
            let code = commands::run::execute(args).await?;
            std::process::exit(code);
        }

        Commands::Repo {
            path,
            name,
            output_base,
            environ,
        } => {
            commands::repo::execute(&path, &name, &output_base, &environ)?;
        }

        Commands::Strategies => {
            let registry = StrategyRegistry::with_builtin()?.install()?;
            commands::strategies::execute(registry);
        }
    }

    Ok(())
}

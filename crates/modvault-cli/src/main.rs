//! modvault CLI

use anyhow::Result;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use modvault_cli::cmd;
use modvault_cli::{CacheCommands, Cli, Commands};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let policy = cmd::cache_policy(cli.offline, cli.refresh);

    match cli.command {
        Commands::Resolve {
            project,
            configuration,
        } => cmd::resolve::resolve(
            &cli.dir,
            policy,
            project.as_deref(),
            configuration.as_deref(),
        ),
        Commands::WriteVerificationMetadata {
            checksums,
            dry_run,
            export_keys,
        } => {
            cmd::verify::write_verification_metadata(
                &cli.dir,
                policy,
                &checksums,
                dry_run,
                export_keys,
            )
            .await
        }
        Commands::Cache { command } => match command {
            CacheCommands::Info => cmd::cache::info(),
            CacheCommands::Compact => cmd::cache::compact(),
        },
        Commands::Completions { shell } => {
            cmd::completions::completions(shell);
            Ok(())
        }
    }
}

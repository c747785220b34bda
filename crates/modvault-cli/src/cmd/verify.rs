//! write-verification-metadata command

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use crossterm::style::Stylize;
use modvault_core::CachePolicy;
use modvault_core::verification::{VerificationFileWriter, WriterOptions};

/// Resolve the whole workspace and write its verification manifest
pub async fn write_verification_metadata(
    dir: &Path,
    policy: CachePolicy,
    checksums: &[String],
    dry_run: bool,
    export_keys: bool,
) -> Result<()> {
    let (workspace, caches) = super::open_workspace(dir, policy)?;

    let mut options = WriterOptions::new(crate::verification_file(workspace.root()), checksums.to_vec());
    options.dry_run = dry_run;
    options.export_keys = export_keys;
    options.offline = policy.offline;

    let client = reqwest::Client::builder()
        .user_agent(crate::USER_AGENT)
        .build()
        .context("Failed to build HTTP client")?;
    let writer = Arc::new(VerificationFileWriter::new(options)?.with_http_client(client));
    let report = writer.generate(&workspace).await?;
    caches.close().context("Failed to close the module caches")?;

    let lw = 10;
    println!();
    println!("  {} {}", "✓".green(), report.path.display().to_string().white().bold());
    println!("  {:<lw$}{}", "entries", report.entries_written);
    if export_keys {
        println!("  {:<lw$}{}", "keys", report.exported_keys);
    }
    if let Some(warning) = &report.warning {
        eprintln!();
        eprintln!("{}", warning.as_str().yellow());
    }
    Ok(())
}

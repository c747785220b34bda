//! Cache commands

use std::path::Path;

use anyhow::{Context, Result};
use crossterm::style::Stylize;
use walkdir::WalkDir;

use crate::ui::format_size;

/// Files under `dir` and their total size.
fn disk_usage(dir: &Path) -> (usize, u64) {
    WalkDir::new(dir)
        .into_iter()
        .filter_map(Result::ok)
        .filter(|e| e.file_type().is_file())
        .fold((0, 0), |(files, bytes), e| {
            (files + 1, bytes + e.metadata().map_or(0, |m| m.len()))
        })
}

/// Show where the caches live and how much they hold
pub fn info() -> Result<()> {
    let caches = super::open_caches()?;
    let metadata = caches.metadata.len().context("Failed to read the metadata cache")?;
    let artifacts = caches.artifacts.len().context("Failed to read the artifacts cache")?;
    let (files, bytes) = disk_usage(caches.dir());
    caches.close().context("Failed to close the module caches")?;

    let lw = 12;
    println!();
    println!("  {}", caches.dir().display().to_string().white().bold());
    println!("  {:<lw$}{metadata}", "modules");
    println!("  {:<lw$}{artifacts}", "artifacts");
    println!("  {:<lw$}{files} files, {}", "disk", format_size(bytes));
    Ok(())
}

/// Compact the cache journals
pub fn compact() -> Result<()> {
    let caches = super::open_caches()?;
    let (_, before) = disk_usage(caches.dir());
    // Opening the journals is what makes close() compact them.
    caches.metadata.len().context("Failed to read the metadata cache")?;
    caches.artifacts.len().context("Failed to read the artifacts cache")?;
    caches.close().context("Failed to compact the module caches")?;
    let (_, after) = disk_usage(caches.dir());

    println!(
        "  {} {} {}",
        "✓".green(),
        "Compacted".white().bold(),
        format!("{} → {}", format_size(before), format_size(after)).dark_grey()
    );
    Ok(())
}

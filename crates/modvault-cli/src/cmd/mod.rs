//! Command modules - one file per CLI command

pub mod cache;
pub mod completions;
pub mod resolve;
pub mod verify;

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use modvault_core::cache::ModuleCaches;
use modvault_core::clock::SystemClock;
use modvault_core::workspace::BUILD_FILE;
use modvault_core::{CachePolicy, Workspace};

/// Bind the module caches under the modvault home.
pub fn open_caches() -> Result<Arc<ModuleCaches>> {
    let home = crate::try_modvault_home().context("Cannot locate the modvault home; set MODVAULT_HOME")?;
    let dir = crate::modules_cache_dir(&home);
    tracing::debug!("Module caches at {}", dir.display());
    Ok(Arc::new(ModuleCaches::new(&dir, Arc::new(SystemClock))))
}

/// Cache policy for the `--offline` and `--refresh` flags.
pub fn cache_policy(offline: bool, refresh: bool) -> CachePolicy {
    CachePolicy {
        offline,
        refresh,
        ..CachePolicy::default()
    }
}

/// Load the workspace in `dir` on top of the shared caches.
pub fn open_workspace(dir: &Path, policy: CachePolicy) -> Result<(Workspace, Arc<ModuleCaches>)> {
    let caches = open_caches()?;
    let workspace = Workspace::load(dir, Arc::clone(&caches), policy)
        .with_context(|| format!("Failed to load {}", dir.join(BUILD_FILE).display()))?;
    Ok((workspace, caches))
}

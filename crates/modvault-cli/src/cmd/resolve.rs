//! Resolve command

use std::path::Path;

use anyhow::{Context, Result};
use crossterm::style::Stylize;
use modvault_core::{BuildTree, CachePolicy};

use crate::ui::format_size;

/// Resolve the selected configurations and list their artifacts
pub fn resolve(
    dir: &Path,
    policy: CachePolicy,
    project: Option<&str>,
    configuration: Option<&str>,
) -> Result<()> {
    let (workspace, caches) = super::open_workspace(dir, policy)?;

    let projects = match project {
        Some(name) => vec![
            workspace
                .project(name)
                .with_context(|| format!("Project '{name}' is not declared"))?,
        ],
        None => workspace.projects(),
    };

    for project in projects {
        let configurations = match configuration {
            Some(c) => vec![c.to_string()],
            None => project.resolvable_configurations(),
        };
        for c in configurations {
            let resolved = project
                .resolve_configuration(&c, None)
                .with_context(|| format!("Failed to resolve {}:{c}", project.name()))?;

            println!();
            println!(
                "  {} {}",
                format!("{}:{c}", project.name()).white().bold(),
                format!("{} components", resolved.components.len()).dark_grey()
            );
            for artifact in &resolved.artifacts {
                let size = std::fs::metadata(&artifact.file).map_or(0, |m| m.len());
                println!(
                    "  {:<40} {:>10}  {}",
                    artifact.id.file_name(),
                    format_size(size),
                    artifact.id.component.to_string().dark_grey()
                );
            }
        }
    }

    caches.close().context("Failed to close the module caches")?;
    Ok(())
}

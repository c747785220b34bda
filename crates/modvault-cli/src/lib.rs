//! modvault - dependency metadata caches and verification manifests
#![allow(missing_docs)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::doc_markdown)]
//!
//! Resolves the configurations declared in a workspace's `modvault.toml`
//! against file repositories, caching module metadata under the modvault
//! home, and writes the dependency verification manifest.
//!
//! # Directory Layout
//!
//! ```text
//! ~/.modvault/
//! └── caches/modules/
//!     ├── modules.lock
//!     ├── module-metadata.bin
//!     ├── module-artifacts.bin
//!     ├── descriptors/
//!     └── files/
//!
//! <workspace>/
//! ├── modvault.toml
//! └── modvault/
//!     ├── verification-metadata.xml
//!     ├── ascii-armored-keyrings
//!     └── binary-keyrings
//! ```

pub mod cmd;
pub mod ui;

pub use modvault_core::USER_AGENT;
pub use modvault_core::paths::*;

use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Debug, Parser)]
#[command(name = "modvault")]
#[command(author, version, about = "modvault - dependency metadata caches and verification manifests")]
pub struct Cli {
    /// Workspace directory containing modvault.toml
    #[arg(long, global = true, env = "MODVAULT_DIR", default_value = ".")]
    pub dir: PathBuf,

    /// Use cached metadata only; never contact key servers
    #[arg(long, global = true)]
    pub offline: bool,

    /// Ignore cached metadata and read repositories again
    #[arg(long, global = true, conflicts_with = "offline")]
    pub refresh: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Resolve configurations and list their artifacts
    Resolve {
        /// Only this project
        #[arg(long)]
        project: Option<String>,
        /// Only this configuration
        #[arg(long)]
        configuration: Option<String>,
    },
    /// Generate or update the dependency verification manifest
    WriteVerificationMetadata {
        /// Comma separated: md5, sha1, sha256, sha512, pgp
        #[arg(long, value_delimiter = ',', required = true)]
        checksums: Vec<String>,
        /// Write <name>.dryrun.xml instead of the manifest
        #[arg(long)]
        dry_run: bool,
        /// Export the keys the manifest mentions next to it (<name>.dryrun.keys/.gpg on a dry run)
        #[arg(long)]
        export_keys: bool,
    },
    /// Inspect or maintain the module caches
    Cache {
        #[command(subcommand)]
        command: CacheCommands,
    },
    /// Generate shell completions
    Completions {
        /// Shell to generate completions for
        shell: clap_complete::Shell,
    },
}

#[derive(Debug, Subcommand)]
pub enum CacheCommands {
    /// Show the cache location and entry counts
    Info,
    /// Rewrite cache journals without superseded records
    Compact,
}

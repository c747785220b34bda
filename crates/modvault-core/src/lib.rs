//! Module metadata caches, dependency resolution and dependency
//! verification for modvault.
//!
//! [`cache`] holds the persistent descriptor and artifact caches,
//! [`resolver`] walks a workspace's configurations through them and
//! [`verification`] turns what was resolved into a verification manifest.

pub mod cache;
pub mod clock;
pub mod keys;
pub mod openpgp;
pub mod paths;
pub mod queue;
pub mod repository;
pub mod resolver;
pub mod verification;
pub mod workspace;

pub use paths::*;
pub use resolver::{ArtifactKind, ArtifactVerificationOperation, CachePolicy, DependencyResolver};
pub use workspace::{BuildTree, Project, Workspace};

/// User Agent string for core operations.
pub const USER_AGENT: &str = concat!("modvault-core/", env!("CARGO_PKG_VERSION"));

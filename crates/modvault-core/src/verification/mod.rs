//! Dependency verification: the manifest model, its XML form, and the writer
//! that generates it from a build.

pub mod entry;
pub mod grouper;
pub mod model;
pub mod signature;
pub mod writer;
pub mod xml;

use thiserror::Error;

use crate::keys::KeyError;

pub use entry::{ChecksumEntry, ObservedArtifact, PgpEntry, VerificationEntries, VerificationEntry};
pub use model::{
    Checksum, DependencyVerifier, DependencyVerifierBuilder, IgnoredKey, TrustedArtifact, TrustedKey,
    VerificationConfiguration,
};
pub use signature::{
    DefaultSignatureVerificationService, SignatureVerificationResultBuilder, SignatureVerificationService,
};
pub use writer::{VerificationFileWriter, WriteReport, WriterOptions};
pub use xml::{ManifestError, read_manifest, read_manifest_file, write_manifest, write_manifest_file};

/// Failures of manifest generation.
#[derive(Error, Debug)]
pub enum VerificationError {
    /// `pgp` was requested without a checksum kind to fall back on.
    #[error(
        "Generating a file with signature verification requires at least one checksum type (sha256 or sha512) as fallback."
    )]
    PgpWithoutFallback,

    /// The manifest could not be read or written.
    #[error(transparent)]
    Manifest(#[from] ManifestError),

    /// Exported keyrings could not be written.
    #[error("Failed to export keys: {0}")]
    Keys(#[from] KeyError),
}

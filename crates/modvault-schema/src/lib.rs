//! Shared types and wire formats for modvault.
//!
//! Everything here is plain data: module and artifact coordinates, checksum
//! kinds, the descriptor hash, module descriptors and the binary codec used
//! by the persistent caches. No I/O besides hashing files.

pub mod codec;
pub mod coordinates;
pub mod descriptor;
pub mod hash;

// Re-exports
pub use codec::{Codec, CodecError, Decoder, Encoder};
pub use coordinates::*;
pub use descriptor::{ArtifactDescriptor, DependencyDescriptor, DescriptorError, ModuleDescriptor};
pub use hash::*;

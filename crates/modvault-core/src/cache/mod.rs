//! Module metadata caches.
//!
//! Layout of a cache directory:
//!
//! ```text
//! <cache-dir>/
//! ├── modules.lock          # cross-process lock, held while the caches are open
//! ├── module-metadata.bin   # RevisionKey -> CacheEntry journal
//! ├── module-artifacts.bin  # (repository, module, context) -> artifact set journal
//! ├── descriptors/          # stored descriptor payloads
//! └── files/                # downloaded artifacts and signatures
//! ```

pub mod access;
pub mod artifacts;
pub mod metadata;
pub mod persistent;
pub mod store;

use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use modvault_schema::CodecError;
use thiserror::Error;

use crate::clock::TimeProvider;
use crate::paths;

pub use access::CacheAccess;
pub use artifacts::{CachedArtifacts, ModuleArtifactsCache};
pub use metadata::{CacheEntry, CachedMetaData, ModuleMetadataCache, ModuleSource, RevisionKey};
pub use persistent::PersistentIndexedCache;
pub use store::{ArtifactFileStore, ModuleDescriptorStore, PathKeyedFileStore, StoredResource};

/// Failures of the module caches.
#[derive(Error, Debug)]
pub enum CacheError {
    /// A cache file could not be read or written.
    #[error("IO error on {path}: {source}")]
    Io {
        /// File or directory.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: io::Error,
    },

    /// A record could not be encoded or decoded.
    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    /// A journal is damaged beyond its last complete record.
    #[error("Corrupt cache file {path}: {reason}")]
    Corrupt {
        /// Damaged file.
        path: PathBuf,
        /// What is wrong with it.
        reason: String,
    },

    /// Another process held the cache lock for too long.
    #[error("Timed out after {timeout:?} waiting for the cache lock at {path}")]
    LockTimeout {
        /// How long we waited.
        timeout: Duration,
        /// Lock file.
        path: PathBuf,
    },

    /// A thread panicked while holding the in-process lock.
    #[error("Cache lock poisoned")]
    Poisoned,

    /// A stored descriptor could not be parsed.
    #[error("Descriptor error: {0}")]
    Descriptor(#[from] modvault_schema::DescriptorError),
}

impl CacheError {
    /// [`CacheError::Io`] for `path`.
    pub fn io(path: impl Into<PathBuf>, source: io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

/// Every cache of one cache directory, sharing a single lock.
pub struct ModuleCaches {
    access: Arc<CacheAccess>,
    /// Resolved module metadata per repository.
    pub metadata: ModuleMetadataCache,
    /// Artifact sets per repository, module and context.
    pub artifacts: ModuleArtifactsCache,
    /// Downloaded artifact files.
    pub files: ArtifactFileStore,
}

impl ModuleCaches {
    /// Bind the caches to `cache_dir`. Nothing is opened until first use.
    pub fn new(cache_dir: &Path, time: Arc<dyn TimeProvider>) -> Self {
        let access = Arc::new(CacheAccess::new(cache_dir));
        let descriptors =
            ModuleDescriptorStore::new(PathKeyedFileStore::new(paths::descriptor_store_dir(cache_dir)));
        Self {
            metadata: ModuleMetadataCache::new(Arc::clone(&access), descriptors, Arc::clone(&time)),
            artifacts: ModuleArtifactsCache::new(Arc::clone(&access), time),
            files: ArtifactFileStore::new(PathKeyedFileStore::new(paths::artifact_store_dir(
                cache_dir,
            ))),
            access,
        }
    }

    /// The cache directory.
    pub fn dir(&self) -> &Path {
        self.access.dir()
    }

    /// Compact the journals and release the cache lock.
    ///
    /// # Errors
    ///
    /// Returns an error if a journal cannot be rewritten.
    pub fn close(&self) -> Result<(), CacheError> {
        self.metadata.close()?;
        self.artifacts.close()?;
        self.access.close()
    }
}

impl std::fmt::Debug for ModuleCaches {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModuleCaches")
            .field("dir", &self.access.dir())
            .finish_non_exhaustive()
    }
}

//! Module metadata cache: `(repository, module)` to a cache entry, with the
//! descriptor body kept in the descriptor store.
//!
//! Known-absent modules get an entry too, so a 404 is not refetched while the
//! entry is young enough.

use std::sync::Arc;

use modvault_schema::codec::{ModuleComponentIdCodec, PostcardCodec};
use modvault_schema::{
    Codec, CodecError, Decoder, DescriptorHash, Encoder, ModuleComponentId, ModuleDescriptor,
};
use serde::{Deserialize, Serialize};

use super::{CacheAccess, CacheError, ModuleDescriptorStore, PersistentIndexedCache};
use crate::clock::TimeProvider;

const CACHE_NAME: &str = "module-metadata";

/// Where a module's metadata was found. Stored as an opaque blob.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModuleSource {
    /// Repository display name.
    pub repository_name: String,
    /// Path of the descriptor within the repository.
    pub descriptor_location: String,
    /// Resolved timestamp of a snapshot version.
    pub snapshot_timestamp: Option<String>,
}

/// Key of a metadata entry: a module version in one repository.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RevisionKey {
    /// Repository identity.
    pub repository_id: String,
    /// Module version.
    pub component: ModuleComponentId,
}

impl RevisionKey {
    /// Key for `component` in `repository_id`.
    pub fn new(repository_id: &str, component: &ModuleComponentId) -> Self {
        Self {
            repository_id: repository_id.to_string(),
            component: component.clone(),
        }
    }
}

/// `string repository, component`.
#[derive(Debug, Clone, Copy, Default)]
pub struct RevisionKeyCodec;

impl Codec<RevisionKey> for RevisionKeyCodec {
    fn encode(&self, encoder: &mut Encoder, value: &RevisionKey) -> Result<(), CodecError> {
        encoder.write_string(&value.repository_id);
        ModuleComponentIdCodec.encode(encoder, &value.component)
    }

    fn decode(&self, decoder: &mut Decoder<'_>) -> Result<RevisionKey, CodecError> {
        Ok(RevisionKey {
            repository_id: decoder.read_string()?,
            component: ModuleComponentIdCodec.decode(decoder)?,
        })
    }
}

/// One record of the metadata index. Never mutated; a re-resolution writes a
/// new entry under the same key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheEntry {
    /// The repository does not have the module.
    pub is_missing: bool,
    /// The module's contents may change without a version change.
    pub is_changing: bool,
    /// Declared packaging, if any.
    pub packaging: Option<String>,
    /// When the entry was written, epoch milliseconds.
    pub create_timestamp: i64,
    /// Where the metadata came from; `None` when missing.
    pub module_source: Option<ModuleSource>,
    /// Hash of the stored descriptor; zero when missing.
    pub descriptor_hash: DescriptorHash,
}

impl CacheEntry {
    /// Entry for a module the repository does not have.
    pub fn missing(create_timestamp: i64) -> Self {
        Self {
            is_missing: true,
            is_changing: false,
            packaging: None,
            create_timestamp,
            module_source: None,
            descriptor_hash: DescriptorHash::zero(),
        }
    }
}

/// `bool missing, bool changing, string? packaging, i64 timestamp,
/// blob source, bytes hash`.
#[derive(Debug, Default)]
pub struct CacheEntryCodec {
    source: PostcardCodec<Option<ModuleSource>>,
}

impl Codec<CacheEntry> for CacheEntryCodec {
    fn encode(&self, encoder: &mut Encoder, value: &CacheEntry) -> Result<(), CodecError> {
        encoder.write_bool(value.is_missing);
        encoder.write_bool(value.is_changing);
        encoder.write_nullable_string(value.packaging.as_deref());
        encoder.write_long(value.create_timestamp);
        self.source.encode(encoder, &value.module_source)?;
        encoder.write_binary(&value.descriptor_hash.to_bytes());
        Ok(())
    }

    fn decode(&self, decoder: &mut Decoder<'_>) -> Result<CacheEntry, CodecError> {
        Ok(CacheEntry {
            is_missing: decoder.read_bool()?,
            is_changing: decoder.read_bool()?,
            packaging: decoder.read_nullable_string()?,
            create_timestamp: decoder.read_long()?,
            module_source: self.source.decode(decoder)?,
            descriptor_hash: DescriptorHash::from_bytes(&decoder.read_binary()?),
        })
    }
}

/// A cache entry as seen at read time.
#[derive(Debug, Clone)]
pub struct CachedMetaData {
    entry: CacheEntry,
    descriptor: Option<ModuleDescriptor>,
    age_millis: i64,
}

impl CachedMetaData {
    fn new(entry: CacheEntry, descriptor: Option<ModuleDescriptor>, now: i64) -> Self {
        let age_millis = now - entry.create_timestamp;
        Self {
            entry,
            descriptor,
            age_millis,
        }
    }

    /// Whether the module is known to be absent.
    pub fn is_missing(&self) -> bool {
        self.entry.is_missing
    }

    /// Whether the module may change in place.
    pub fn is_changing(&self) -> bool {
        self.entry.is_changing
    }

    /// Where the metadata came from.
    pub fn module_source(&self) -> Option<&ModuleSource> {
        self.entry.module_source.as_ref()
    }

    /// The descriptor; `None` for a missing module.
    pub fn module_version(&self) -> Option<&ModuleDescriptor> {
        self.descriptor.as_ref()
    }

    /// Whether the module carries metadata but no files.
    pub fn is_metadata_only(&self) -> bool {
        self.descriptor
            .as_ref()
            .is_some_and(ModuleDescriptor::is_metadata_only)
    }

    /// Declared packaging.
    pub fn packaging(&self) -> Option<&str> {
        self.entry.packaging.as_deref()
    }

    /// Milliseconds between the entry's creation and the read.
    pub fn age_millis(&self) -> i64 {
        self.age_millis
    }

    /// Hash of the stored descriptor.
    pub fn descriptor_hash(&self) -> &DescriptorHash {
        &self.entry.descriptor_hash
    }
}

/// The `module-metadata` journal plus the descriptor store.
pub struct ModuleMetadataCache {
    index: PersistentIndexedCache<RevisionKey, CacheEntry>,
    store: ModuleDescriptorStore,
    time: Arc<dyn TimeProvider>,
}

impl ModuleMetadataCache {
    /// Bind to the journal under `access`, with descriptors kept in `store`.
    pub fn new(
        access: Arc<CacheAccess>,
        store: ModuleDescriptorStore,
        time: Arc<dyn TimeProvider>,
    ) -> Self {
        Self {
            index: PersistentIndexedCache::new(
                access,
                CACHE_NAME,
                RevisionKeyCodec,
                CacheEntryCodec::default(),
            ),
            store,
            time,
        }
    }

    /// Record that `id` is absent from the repository.
    ///
    /// # Errors
    ///
    /// Fails if the index cannot be written.
    pub fn cache_missing(
        &self,
        repository_id: &str,
        id: &ModuleComponentId,
    ) -> Result<CachedMetaData, CacheError> {
        let now = self.time.now_millis();
        let entry = CacheEntry::missing(now);
        self.index.put(&RevisionKey::new(repository_id, id), &entry)?;
        Ok(CachedMetaData::new(entry, None, now))
    }

    /// Store `descriptor` and index it under `(repository_id, descriptor.id)`.
    ///
    /// # Errors
    ///
    /// Fails if the descriptor or the index entry cannot be written.
    pub fn cache_meta_data(
        &self,
        repository_id: &str,
        descriptor: &ModuleDescriptor,
        module_source: ModuleSource,
    ) -> Result<CachedMetaData, CacheError> {
        let stored = self.store.put(repository_id, descriptor)?;
        let now = self.time.now_millis();
        let entry = CacheEntry {
            is_missing: false,
            is_changing: descriptor.changing,
            packaging: descriptor.computed_packaging(),
            create_timestamp: now,
            module_source: Some(module_source),
            descriptor_hash: stored.content_hash,
        };
        self.index
            .put(&RevisionKey::new(repository_id, &descriptor.id), &entry)?;
        Ok(CachedMetaData::new(entry, Some(descriptor.clone()), now))
    }

    /// Read the entry for `(repository_id, id)`. A present entry whose stored
    /// descriptor has vanished reads as `None`.
    ///
    /// # Errors
    ///
    /// Fails on a broken cache directory or an undecodable record.
    pub fn get_cached_module_descriptor(
        &self,
        repository_id: &str,
        id: &ModuleComponentId,
    ) -> Result<Option<CachedMetaData>, CacheError> {
        let Some(entry) = self.index.get(&RevisionKey::new(repository_id, id))? else {
            return Ok(None);
        };
        let now = self.time.now_millis();
        if entry.is_missing {
            return Ok(Some(CachedMetaData::new(entry, None, now)));
        }
        Ok(self
            .store
            .get(repository_id, id)?
            .map(|descriptor| CachedMetaData::new(entry, Some(descriptor), now)))
    }

    /// Number of indexed modules.
    ///
    /// # Errors
    ///
    /// Fails if the index cannot be opened.
    pub fn len(&self) -> Result<usize, CacheError> {
        self.index.len()
    }

    pub(crate) fn close(&self) -> Result<(), CacheError> {
        self.index.close()
    }
}

impl std::fmt::Debug for ModuleMetadataCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModuleMetadataCache")
            .field("index", &self.index)
            .finish_non_exhaustive()
    }
}

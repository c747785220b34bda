//! Artifact sets per `(repository, module, context)`.
//!
//! Each set remembers the descriptor hash it was computed from. The cache
//! never compares hashes; callers drop a set whose hash no longer matches.

use std::collections::BTreeSet;
use std::sync::Arc;

use modvault_schema::codec::{ArtifactIdentifierCodec, ModuleComponentIdCodec, SetCodec};
use modvault_schema::{
    ArtifactIdentifier, Codec, CodecError, Decoder, DescriptorHash, Encoder, ModuleComponentId,
};

use super::{CacheAccess, CacheError, PersistentIndexedCache};
use crate::clock::TimeProvider;

const CACHE_NAME: &str = "module-artifacts";

/// Key of an artifact set.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ArtifactsAtRepositoryKey {
    /// Repository identity.
    pub repository_id: String,
    /// Module version.
    pub component: ModuleComponentId,
    /// What the set was computed for, for example a configuration.
    pub context: String,
}

/// `string repository, component, string context`.
#[derive(Debug, Clone, Copy, Default)]
pub struct ArtifactsAtRepositoryKeyCodec;

impl Codec<ArtifactsAtRepositoryKey> for ArtifactsAtRepositoryKeyCodec {
    fn encode(
        &self,
        encoder: &mut Encoder,
        value: &ArtifactsAtRepositoryKey,
    ) -> Result<(), CodecError> {
        encoder.write_string(&value.repository_id);
        ModuleComponentIdCodec.encode(encoder, &value.component)?;
        encoder.write_string(&value.context);
        Ok(())
    }

    fn decode(&self, decoder: &mut Decoder<'_>) -> Result<ArtifactsAtRepositoryKey, CodecError> {
        Ok(ArtifactsAtRepositoryKey {
            repository_id: decoder.read_string()?,
            component: ModuleComponentIdCodec.decode(decoder)?,
            context: decoder.read_string()?,
        })
    }
}

/// A stored artifact set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModuleArtifactsCacheEntry {
    /// The artifacts.
    pub artifacts: BTreeSet<ArtifactIdentifier>,
    /// When the set was stored, epoch milliseconds.
    pub create_timestamp: i64,
    /// Hash of the descriptor the set was computed from.
    pub descriptor_hash: DescriptorHash,
}

/// `i64 timestamp, bytes hash, set<artifact>`.
#[derive(Debug, Clone, Copy, Default)]
pub struct ModuleArtifactsCacheEntryCodec;

impl Codec<ModuleArtifactsCacheEntry> for ModuleArtifactsCacheEntryCodec {
    fn encode(
        &self,
        encoder: &mut Encoder,
        value: &ModuleArtifactsCacheEntry,
    ) -> Result<(), CodecError> {
        encoder.write_long(value.create_timestamp);
        encoder.write_binary(&value.descriptor_hash.to_bytes());
        SetCodec(ArtifactIdentifierCodec).encode(encoder, &value.artifacts)
    }

    fn decode(&self, decoder: &mut Decoder<'_>) -> Result<ModuleArtifactsCacheEntry, CodecError> {
        Ok(ModuleArtifactsCacheEntry {
            create_timestamp: decoder.read_long()?,
            descriptor_hash: DescriptorHash::from_bytes(&decoder.read_binary()?),
            artifacts: SetCodec(ArtifactIdentifierCodec).decode(decoder)?,
        })
    }
}

/// An artifact set as read back, with its age.
#[derive(Debug, Clone)]
pub struct CachedArtifacts {
    entry: ModuleArtifactsCacheEntry,
    age_millis: i64,
}

impl CachedArtifacts {
    /// The artifacts.
    pub fn artifacts(&self) -> &BTreeSet<ArtifactIdentifier> {
        &self.entry.artifacts
    }

    /// Hash of the descriptor the set was computed from.
    pub fn descriptor_hash(&self) -> &DescriptorHash {
        &self.entry.descriptor_hash
    }

    /// Milliseconds since the set was stored.
    pub fn age_millis(&self) -> i64 {
        self.age_millis
    }
}

/// The `module-artifacts` journal.
pub struct ModuleArtifactsCache {
    index: PersistentIndexedCache<ArtifactsAtRepositoryKey, ModuleArtifactsCacheEntry>,
    time: Arc<dyn TimeProvider>,
}

impl ModuleArtifactsCache {
    /// Bind to the journal under `access`.
    pub fn new(access: Arc<CacheAccess>, time: Arc<dyn TimeProvider>) -> Self {
        Self {
            index: PersistentIndexedCache::new(
                access,
                CACHE_NAME,
                ArtifactsAtRepositoryKeyCodec,
                ModuleArtifactsCacheEntryCodec,
            ),
            time,
        }
    }

    /// Record the artifacts of `component` for `context`.
    ///
    /// # Errors
    ///
    /// Fails if the index cannot be written.
    pub fn cache_artifacts(
        &self,
        repository_id: &str,
        component: &ModuleComponentId,
        context: &str,
        descriptor_hash: &DescriptorHash,
        artifacts: BTreeSet<ArtifactIdentifier>,
    ) -> Result<CachedArtifacts, CacheError> {
        let entry = ModuleArtifactsCacheEntry {
            artifacts,
            create_timestamp: self.time.now_millis(),
            descriptor_hash: descriptor_hash.clone(),
        };
        self.index
            .put(&key(repository_id, component, context), &entry)?;
        Ok(CachedArtifacts {
            entry,
            age_millis: 0,
        })
    }

    /// # Errors
    ///
    /// Fails on a broken cache directory or an undecodable record.
    pub fn get_cached_artifacts(
        &self,
        repository_id: &str,
        component: &ModuleComponentId,
        context: &str,
    ) -> Result<Option<CachedArtifacts>, CacheError> {
        let now = self.time.now_millis();
        Ok(self
            .index
            .get(&key(repository_id, component, context))?
            .map(|entry| CachedArtifacts {
                age_millis: now - entry.create_timestamp,
                entry,
            }))
    }

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

impl std::fmt::Debug for ModuleArtifactsCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModuleArtifactsCache")
            .field("index", &self.index)
            .finish_non_exhaustive()
    }
}

fn key(repository_id: &str, component: &ModuleComponentId, context: &str) -> ArtifactsAtRepositoryKey {
    ArtifactsAtRepositoryKey {
        repository_id: repository_id.to_string(),
        component: component.clone(),
        context: context.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use modvault_schema::ArtifactName;

    fn component() -> ModuleComponentId {
        ModuleComponentId::new("org.example", "lib", "1.0")
    }

    fn artifacts(classifiers: &[Option<&str>]) -> BTreeSet<ArtifactIdentifier> {
        classifiers
            .iter()
            .map(|c| {
                ArtifactIdentifier::new(
                    component(),
                    ArtifactName::new("lib", "jar", "jar", c.map(String::from)),
                )
            })
            .collect()
    }

    #[test]
    fn contexts_are_separate_slots() {
        let dir = tempfile::tempdir().unwrap();
        let clock = Arc::new(ManualClock::new(0));
        let cache = ModuleArtifactsCache::new(Arc::new(CacheAccess::new(dir.path())), clock.clone());
        let hash = DescriptorHash::of_bytes(b"descriptor");

        cache
            .cache_artifacts("repo", &component(), "compile", &hash, artifacts(&[None]))
            .unwrap();
        cache
            .cache_artifacts("repo", &component(), "test", &hash, artifacts(&[None, Some("tests")]))
            .unwrap();
        clock.advance(42);

        let compile = cache.get_cached_artifacts("repo", &component(), "compile").unwrap().unwrap();
        let test = cache.get_cached_artifacts("repo", &component(), "test").unwrap().unwrap();
        assert_eq!(compile.artifacts().len(), 1);
        assert_eq!(test.artifacts().len(), 2);
        assert_eq!(compile.descriptor_hash(), &hash);
        assert_eq!(compile.age_millis(), 42);
        assert!(cache.get_cached_artifacts("repo", &component(), "runtime").unwrap().is_none());
    }

    #[test]
    fn stale_hash_is_returned_as_stored() {
        let dir = tempfile::tempdir().unwrap();
        let cache = ModuleArtifactsCache::new(
            Arc::new(CacheAccess::new(dir.path())),
            Arc::new(ManualClock::new(0)),
        );
        let old = DescriptorHash::of_bytes(b"old");
        cache
            .cache_artifacts("repo", &component(), "compile", &old, artifacts(&[None]))
            .unwrap();
        let cached = cache.get_cached_artifacts("repo", &component(), "compile").unwrap().unwrap();
        assert_ne!(cached.descriptor_hash(), &DescriptorHash::of_bytes(b"new"));
        assert_eq!(cached.descriptor_hash(), &old);
    }

    #[test]
    fn record_layout_starts_with_timestamp() {
        let entry = ModuleArtifactsCacheEntry {
            artifacts: artifacts(&[None]),
            create_timestamp: 7,
            descriptor_hash: DescriptorHash::from_bytes(&[9]),
        };
        let bytes = ModuleArtifactsCacheEntryCodec.to_bytes(&entry).unwrap();
        assert_eq!(&bytes[..8], &[0, 0, 0, 0, 0, 0, 0, 7]);
        assert_eq!(&bytes[8..11], &[1, 9, 1]);
        assert_eq!(ModuleArtifactsCacheEntryCodec.from_bytes(&bytes).unwrap(), entry);
    }
}

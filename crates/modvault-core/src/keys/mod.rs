//! Public key lookup: exported keyrings, key servers, and their combination.

pub mod keyring;
pub mod server;

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use thiserror::Error;

use crate::openpgp::{KeyId, PgpError, PublicKeyRing};

pub use keyring::{BuildTreeDefinedKeys, KeyringFiles, KeyringFormat};
pub use server::KeyServerClient;

/// Failures looking keys up or exporting them.
#[derive(Error, Debug)]
pub enum KeyError {
    /// No key server could be reached.
    #[error("Key server request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// A keyring file could not be read or written.
    #[error("Failed to access keyring {path}: {source}")]
    Io {
        /// Keyring file.
        path: std::path::PathBuf,
        /// Underlying error.
        source: std::io::Error,
    },

    /// A keyring could not be parsed.
    #[error(transparent)]
    Pgp(#[from] PgpError),
}

/// Finds the key ring holding a key. `Ok(None)` means nobody has it.
#[async_trait]
pub trait PublicKeyService: Send + Sync {
    /// Look up by 64-bit key id.
    ///
    /// # Errors
    ///
    /// Fails when the source cannot be read or returns an unparsable ring.
    async fn find_by_long_id(&self, id: u64) -> Result<Option<PublicKeyRing>, KeyError>;

    /// Look up by v4 fingerprint.
    ///
    /// # Errors
    ///
    /// As [`Self::find_by_long_id`].
    async fn find_by_fingerprint(&self, fingerprint: &[u8]) -> Result<Option<PublicKeyRing>, KeyError>;

    /// Look up by whichever form `id` has.
    ///
    /// # Errors
    ///
    /// As [`Self::find_by_long_id`].
    async fn find(&self, id: &KeyId) -> Result<Option<PublicKeyRing>, KeyError> {
        match id {
            KeyId::Long(long) => self.find_by_long_id(*long).await,
            KeyId::Fingerprint(fp) => self.find_by_fingerprint(fp).await,
        }
    }
}

#[async_trait]
impl PublicKeyService for BuildTreeDefinedKeys {
    async fn find_by_long_id(&self, id: u64) -> Result<Option<PublicKeyRing>, KeyError> {
        Ok(self.find(&KeyId::Long(id)).cloned())
    }

    async fn find_by_fingerprint(&self, fingerprint: &[u8]) -> Result<Option<PublicKeyRing>, KeyError> {
        Ok(self.find(&KeyId::Fingerprint(fingerprint.to_vec())).cloned())
    }
}

#[async_trait]
impl PublicKeyService for KeyServerClient {
    async fn find_by_long_id(&self, id: u64) -> Result<Option<PublicKeyRing>, KeyError> {
        self.lookup(&KeyId::Long(id)).await
    }

    async fn find_by_fingerprint(&self, fingerprint: &[u8]) -> Result<Option<PublicKeyRing>, KeyError> {
        self.lookup(&KeyId::Fingerprint(fingerprint.to_vec())).await
    }
}

/// Local keyrings first, then key servers. Answers, including misses, are
/// memoized for the lifetime of the service.
pub struct CompositePublicKeyService {
    local: Arc<dyn PublicKeyService>,
    remote: Option<Arc<dyn PublicKeyService>>,
    memo: Mutex<HashMap<KeyId, Option<PublicKeyRing>>>,
}

impl std::fmt::Debug for CompositePublicKeyService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompositePublicKeyService")
            .field("remote", &self.remote.is_some())
            .finish_non_exhaustive()
    }
}

impl CompositePublicKeyService {
    /// `remote` is only asked for keys `local` does not have.
    pub fn new(local: Arc<dyn PublicKeyService>, remote: Option<Arc<dyn PublicKeyService>>) -> Self {
        Self {
            local,
            remote,
            memo: Mutex::new(HashMap::new()),
        }
    }

    async fn lookup(&self, id: KeyId) -> Result<Option<PublicKeyRing>, KeyError> {
        let cached = self
            .memo
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&id)
            .cloned();
        if let Some(hit) = cached {
            return Ok(hit);
        }
        let mut found = self.local.find(&id).await?;
        if found.is_none() {
            if let Some(remote) = &self.remote {
                found = remote.find(&id).await?;
            }
        }
        self.memo
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id, found.clone());
        Ok(found)
    }
}

#[async_trait]
impl PublicKeyService for CompositePublicKeyService {
    async fn find_by_long_id(&self, id: u64) -> Result<Option<PublicKeyRing>, KeyError> {
        self.lookup(KeyId::Long(id)).await
    }

    async fn find_by_fingerprint(&self, fingerprint: &[u8]) -> Result<Option<PublicKeyRing>, KeyError> {
        self.lookup(KeyId::Fingerprint(fingerprint.to_vec())).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::openpgp::testkit;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingService {
        rings: Vec<PublicKeyRing>,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl PublicKeyService for CountingService {
        async fn find_by_long_id(&self, id: u64) -> Result<Option<PublicKeyRing>, KeyError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(self.rings.iter().find(|r| r.find_key(&KeyId::Long(id)).is_some()).cloned())
        }

        async fn find_by_fingerprint(&self, fingerprint: &[u8]) -> Result<Option<PublicKeyRing>, KeyError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let id = KeyId::Fingerprint(fingerprint.to_vec());
            Ok(self.rings.iter().find(|r| r.find_key(&id).is_some()).cloned())
        }
    }

    #[tokio::test]
    async fn local_keys_win_and_results_are_memoized() {
        let local_key = testkit::key(31, "Local");
        let remote_key = testkit::key(32, "Remote");
        let local = Arc::new(BuildTreeDefinedKeys::from_rings(vec![local_key.ring.clone()]));
        let remote = Arc::new(CountingService {
            rings: vec![remote_key.ring.clone(), local_key.ring.clone()],
            calls: AtomicUsize::new(0),
        });
        let service = CompositePublicKeyService::new(local, Some(remote.clone()));

        let found = service.find_by_long_id(local_key.ring.key_id()).await.unwrap();
        assert_eq!(found, Some(local_key.ring.clone()));
        assert_eq!(remote.calls.load(Ordering::SeqCst), 0);

        for _ in 0..2 {
            let found = service.find_by_long_id(remote_key.ring.key_id()).await.unwrap();
            assert_eq!(found, Some(remote_key.ring.clone()));
        }
        assert_eq!(remote.calls.load(Ordering::SeqCst), 1);

        assert_eq!(service.find_by_long_id(7).await.unwrap(), None);
        assert_eq!(service.find_by_long_id(7).await.unwrap(), None);
        assert_eq!(remote.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn offline_never_consults_servers() {
        let local = Arc::new(BuildTreeDefinedKeys::default());
        let service = CompositePublicKeyService::new(local, None);
        assert_eq!(service.find_by_long_id(42).await.unwrap(), None);
    }
}

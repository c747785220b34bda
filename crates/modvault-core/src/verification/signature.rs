//! Checking detached signatures against public keys.

use std::collections::BTreeSet;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;

use crate::keys::PublicKeyService;
use crate::openpgp::{KeyId, PublicKey, read_signatures};

/// Receives one callback per signature in a signature file.
pub trait SignatureVerificationResultBuilder: Send {
    /// The signing key could not be found locally or on any key server.
    fn missing_key(&mut self, key_id: &str);

    /// The signature by `key` matched. `trusted` when the key is listed as trusted.
    fn verified(&mut self, key: &PublicKey, trusted: bool);

    /// The signature by `key` did not match.
    fn failed(&mut self, key: &PublicKey);

    /// The signing key is on an ignore list.
    fn ignored(&mut self, key_id: &str);
}

/// Checks detached signatures.
#[async_trait]
pub trait SignatureVerificationService: Send + Sync {
    /// Check every signature of `signature` over `artifact` and report each
    /// outcome to `result`. Unreadable files are logged and report nothing.
    async fn verify(
        &self,
        artifact: &Path,
        signature: &Path,
        trusted_keys: &BTreeSet<String>,
        ignored_keys: &BTreeSet<String>,
        result: &mut dyn SignatureVerificationResultBuilder,
    );

    /// Where keys are looked up.
    fn public_key_service(&self) -> Arc<dyn PublicKeyService>;
}

/// Whether `key` (primary fingerprint or long id) appears in `ids`.
fn listed(ids: &BTreeSet<String>, key: &PublicKey) -> bool {
    let fingerprint = key.fingerprint_hex();
    let long = key.key_id_hex();
    ids.iter()
        .any(|id| id.eq_ignore_ascii_case(&fingerprint) || id.eq_ignore_ascii_case(&long))
}

fn listed_id(ids: &BTreeSet<String>, id: &KeyId) -> bool {
    let display = id.to_string();
    let long = format!("{:016X}", id.long_id());
    ids.iter()
        .any(|i| i.eq_ignore_ascii_case(&display) || i.eq_ignore_ascii_case(&long))
}

/// Looks signing keys up through a [`PublicKeyService`].
pub struct DefaultSignatureVerificationService {
    keys: Arc<dyn PublicKeyService>,
}

impl std::fmt::Debug for DefaultSignatureVerificationService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DefaultSignatureVerificationService").finish_non_exhaustive()
    }
}

impl DefaultSignatureVerificationService {
    /// Verify with the keys `keys` can find.
    pub fn new(keys: Arc<dyn PublicKeyService>) -> Self {
        Self { keys }
    }
}

#[async_trait]
impl SignatureVerificationService for DefaultSignatureVerificationService {
    async fn verify(
        &self,
        artifact: &Path,
        signature: &Path,
        trusted_keys: &BTreeSet<String>,
        ignored_keys: &BTreeSet<String>,
        result: &mut dyn SignatureVerificationResultBuilder,
    ) {
        let (data, sig_data) = match (tokio::fs::read(artifact).await, tokio::fs::read(signature).await) {
            (Ok(data), Ok(sig)) => (data, sig),
            (Err(e), _) | (_, Err(e)) => {
                tracing::warn!("Cannot read {} for signature verification: {e}", artifact.display());
                return;
            }
        };
        let signatures = match read_signatures(&sig_data) {
            Ok(signatures) => signatures,
            Err(e) => {
                tracing::warn!("Unreadable signature file {}: {e}", signature.display());
                return;
            }
        };

        for sig in signatures {
            let Some(issuer) = sig.issuer_key() else {
                tracing::warn!("Signature in {} names no issuer", signature.display());
                continue;
            };
            let issuer_str = issuer.to_string();
            if listed_id(ignored_keys, &issuer) {
                result.ignored(&issuer_str);
                continue;
            }
            let ring = match self.keys.find(&issuer).await {
                Ok(ring) => ring,
                Err(e) => {
                    tracing::warn!("Failed to look up key {issuer}: {e}");
                    None
                }
            };
            let Some(ring) = ring else {
                result.missing_key(&issuer_str);
                continue;
            };
            let Some(key) = ring.find_key(&issuer) else {
                result.missing_key(&issuer_str);
                continue;
            };
            let primary = ring.primary();
            match sig.verify(key, &data) {
                Ok(()) => {
                    tracing::debug!("{} signed by {}", artifact.display(), primary.fingerprint_hex());
                    result.verified(primary, listed(trusted_keys, primary));
                }
                Err(e) => {
                    tracing::debug!("Signature by {issuer} over {} rejected: {e}", artifact.display());
                    result.failed(primary);
                }
            }
        }
    }

    fn public_key_service(&self) -> Arc<dyn PublicKeyService> {
        self.keys.clone()
    }
}

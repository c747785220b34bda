//! Observed artifacts awaiting a checksum or signature check.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, OnceLock, PoisonError};

use modvault_schema::{ArtifactIdentifier, ChecksumKind};

use crate::resolver::{ArtifactKind, SignatureFileFactory};

/// Checksum reason: a signature did not match.
pub const REASON_PGP_FAILED: &str = "PGP signature verification failed!";
/// Checksum reason: no usable key verified the signature.
pub const REASON_KEY_NOT_DOWNLOADED: &str = "A key couldn't be downloaded";
/// Checksum reason: no signature file.
pub const REASON_NOT_SIGNED: &str = "Artifact is not signed";

/// Checksum kinds order after the PGP marker, so an artifact's PGP entry is
/// immediately followed by its checksum entries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum EntryKind {
    /// Signature check.
    Pgp,
    /// Checksum of one kind.
    Checksum(ChecksumKind),
}

/// Identity of an entry: artifact, then kind.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct EntryKey {
    /// Artifact coordinates.
    pub artifact: ArtifactIdentifier,
    /// Checksum kind or PGP.
    pub kind: EntryKind,
}

/// Where an observed artifact came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObservedArtifact {
    /// Coordinates.
    pub id: ArtifactIdentifier,
    /// Regular artifact or module metadata.
    pub kind: ArtifactKind,
    /// Cached file.
    pub file: PathBuf,
    /// Name of the repository that served it.
    pub repository_name: String,
    /// Identity of that repository.
    pub repository_id: String,
}

/// A checksum to compute for one artifact.
#[derive(Debug)]
pub struct ChecksumEntry {
    /// Artifact to hash.
    pub artifact: ObservedArtifact,
    /// Algorithm.
    pub checksum_kind: ChecksumKind,
    value: OnceLock<String>,
}

impl ChecksumEntry {
    /// Entry with no value yet.
    pub fn new(artifact: ObservedArtifact, checksum_kind: ChecksumKind) -> Self {
        Self {
            artifact,
            checksum_kind,
            value: OnceLock::new(),
        }
    }

    /// Set once; later calls are ignored.
    pub fn set_checksum(&self, value: String) {
        let _ = self.value.set(value);
    }

    /// Computed value, once set.
    pub fn checksum(&self) -> Option<&str> {
        self.value.get().map(String::as_str)
    }
}

#[derive(Debug, Default)]
struct PgpState {
    verified: BTreeSet<String>,
    failed: BTreeSet<String>,
    missing: bool,
    grouped: BTreeSet<String>,
}

/// Signature check of one artifact and its outcome.
pub struct PgpEntry {
    /// Signed artifact.
    pub artifact: ObservedArtifact,
    factory: Mutex<Option<SignatureFileFactory>>,
    signature: OnceLock<Option<PathBuf>>,
    state: Mutex<PgpState>,
}

impl std::fmt::Debug for PgpEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PgpEntry")
            .field("artifact", &self.artifact)
            .field("signature", &self.signature.get())
            .field("state", &*self.state())
            .finish_non_exhaustive()
    }
}

impl PgpEntry {
    /// `factory` locates the detached signature; it runs at most once.
    pub fn new(artifact: ObservedArtifact, factory: SignatureFileFactory) -> Self {
        Self {
            artifact,
            factory: Mutex::new(Some(factory)),
            signature: OnceLock::new(),
            state: Mutex::new(PgpState::default()),
        }
    }

    fn state(&self) -> std::sync::MutexGuard<'_, PgpState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// The detached signature file. The factory runs on first call only.
    pub fn signature_file(&self) -> Option<&Path> {
        self.signature
            .get_or_init(|| {
                let factory = self
                    .factory
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .take();
                factory.and_then(|f| f())
            })
            .as_deref()
    }

    /// Whether the signature was looked for and found. `false` until
    /// [`Self::signature_file`] has run.
    pub fn has_signature_file(&self) -> bool {
        matches!(self.signature.get(), Some(Some(_)))
    }

    /// Looked for, and absent.
    pub fn is_unsigned(&self) -> bool {
        matches!(self.signature.get(), Some(None))
    }

    /// Record a key whose signature matched.
    pub fn add_verified_key(&self, key: impl Into<String>) {
        self.state().verified.insert(key.into());
    }

    /// Record a key whose signature did not match.
    pub fn fail(&self, key: impl Into<String>) {
        self.state().failed.insert(key.into());
    }

    /// Record that a signing key could not be found.
    pub fn missing(&self) {
        self.state().missing = true;
    }

    /// Whether any signature failed.
    pub fn is_failed(&self) -> bool {
        !self.state().failed.is_empty()
    }

    /// Whether any signing key was missing.
    pub fn has_missing_keys(&self) -> bool {
        self.state().missing
    }

    /// Signature trust alone is not enough for this artifact.
    pub fn is_requiring_checksums(&self) -> bool {
        let state = self.state();
        !state.failed.is_empty()
            || state.missing
            || !self.has_signature_file()
            || state.verified.is_empty()
    }

    /// Reason attached to the fallback checksum, if any. A signature that
    /// no usable key verified counts as a key that couldn't be downloaded.
    pub fn reason(&self) -> Option<&'static str> {
        if self.is_failed() {
            Some(REASON_PGP_FAILED)
        } else if self.has_missing_keys() {
            Some(REASON_KEY_NOT_DOWNLOADED)
        } else if !self.has_signature_file() {
            Some(REASON_NOT_SIGNED)
        } else if self.state().verified.is_empty() {
            Some(REASON_KEY_NOT_DOWNLOADED)
        } else {
            None
        }
    }

    /// Fingerprints of the keys that verified.
    pub fn verified_keys(&self) -> BTreeSet<String> {
        self.state().verified.clone()
    }

    /// Fingerprints of the keys that failed.
    pub fn failed_keys(&self) -> BTreeSet<String> {
        self.state().failed.clone()
    }

    /// Mark `key` as declared at module or group level.
    pub fn group_key(&self, key: &str) {
        self.state().grouped.insert(key.to_string());
    }

    /// Verified keys that still need an artifact-level declaration.
    pub fn artifact_level_keys(&self) -> BTreeSet<String> {
        let state = self.state();
        state.verified.difference(&state.grouped).cloned().collect()
    }
}

/// A check to run on an observed artifact.
#[derive(Debug)]
pub enum VerificationEntry {
    /// Compute a checksum.
    Checksum(ChecksumEntry),
    /// Check a signature.
    Pgp(PgpEntry),
}

impl VerificationEntry {
    /// Deduplication and ordering key.
    pub fn key(&self) -> EntryKey {
        match self {
            Self::Checksum(c) => EntryKey {
                artifact: c.artifact.id.clone(),
                kind: EntryKind::Checksum(c.checksum_kind),
            },
            Self::Pgp(p) => EntryKey {
                artifact: p.artifact.id.clone(),
                kind: EntryKind::Pgp,
            },
        }
    }

    /// The artifact this entry is about.
    pub fn artifact(&self) -> &ObservedArtifact {
        match self {
            Self::Checksum(c) => &c.artifact,
            Self::Pgp(p) => &p.artifact,
        }
    }
}

/// The set of entries to write; one per artifact and kind, first insert wins.
#[derive(Debug, Default)]
pub struct VerificationEntries {
    entries: Mutex<BTreeMap<EntryKey, Arc<VerificationEntry>>>,
}

impl VerificationEntries {
    /// Empty set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `false` when an entry with the same key already exists.
    pub fn insert(&self, entry: VerificationEntry) -> bool {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        let key = entry.key();
        if entries.contains_key(&key) {
            return false;
        }
        entries.insert(key, Arc::new(entry));
        true
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Whether nothing was observed.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// All entries in natural order.
    pub fn sorted(&self) -> Vec<Arc<VerificationEntry>> {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use modvault_schema::{ArtifactName, ModuleComponentId};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn observed(module: &str) -> ObservedArtifact {
        ObservedArtifact {
            id: ArtifactIdentifier::new(
                ModuleComponentId::new("org.example", module, "1.0"),
                ArtifactName::new(module, "jar", "jar", None),
            ),
            kind: ArtifactKind::Artifact,
            file: PathBuf::from(format!("/cache/{module}-1.0.jar")),
            repository_name: "local".into(),
            repository_id: "abc".into(),
        }
    }

    fn no_signature() -> SignatureFileFactory {
        Box::new(|| None)
    }

    #[test]
    fn pgp_orders_before_checksums() {
        let mut kinds = vec![
            EntryKind::Checksum(ChecksumKind::Sha512),
            EntryKind::Checksum(ChecksumKind::Md5),
            EntryKind::Pgp,
            EntryKind::Checksum(ChecksumKind::Sha256),
        ];
        kinds.sort();
        assert_eq!(
            kinds,
            vec![
                EntryKind::Pgp,
                EntryKind::Checksum(ChecksumKind::Md5),
                EntryKind::Checksum(ChecksumKind::Sha256),
                EntryKind::Checksum(ChecksumKind::Sha512),
            ]
        );
    }

    #[test]
    fn first_insert_wins() {
        let entries = VerificationEntries::new();
        let first = ChecksumEntry::new(observed("a"), ChecksumKind::Sha256);
        first.set_checksum("first".into());
        assert!(entries.insert(VerificationEntry::Checksum(first)));
        assert!(!entries.insert(VerificationEntry::Checksum(ChecksumEntry::new(
            observed("a"),
            ChecksumKind::Sha256
        ))));
        assert!(entries.insert(VerificationEntry::Checksum(ChecksumEntry::new(
            observed("a"),
            ChecksumKind::Sha512
        ))));
        assert_eq!(entries.len(), 2);
        let sorted = entries.sorted();
        let VerificationEntry::Checksum(c) = sorted[0].as_ref() else {
            panic!("expected a checksum entry");
        };
        assert_eq!(c.checksum(), Some("first"));
    }

    #[test]
    fn natural_order_groups_by_artifact() {
        let entries = VerificationEntries::new();
        entries.insert(VerificationEntry::Checksum(ChecksumEntry::new(observed("b"), ChecksumKind::Sha256)));
        entries.insert(VerificationEntry::Checksum(ChecksumEntry::new(observed("a"), ChecksumKind::Sha256)));
        entries.insert(VerificationEntry::Pgp(PgpEntry::new(observed("b"), no_signature())));
        entries.insert(VerificationEntry::Pgp(PgpEntry::new(observed("a"), no_signature())));
        let keys: Vec<_> = entries
            .sorted()
            .iter()
            .map(|e| (e.artifact().id.name.name.clone(), e.key().kind))
            .collect();
        assert_eq!(
            keys,
            vec![
                ("a".to_string(), EntryKind::Pgp),
                ("a".to_string(), EntryKind::Checksum(ChecksumKind::Sha256)),
                ("b".to_string(), EntryKind::Pgp),
                ("b".to_string(), EntryKind::Checksum(ChecksumKind::Sha256)),
            ]
        );
    }

    #[test]
    fn signature_factory_runs_once() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let entry = PgpEntry::new(
            observed("a"),
            Box::new(move || {
                counter.fetch_add(1, Ordering::SeqCst);
                Some(PathBuf::from("/cache/a-1.0.jar.asc"))
            }),
        );
        assert!(!entry.has_signature_file());
        assert_eq!(entry.signature_file(), Some(Path::new("/cache/a-1.0.jar.asc")));
        assert_eq!(entry.signature_file(), Some(Path::new("/cache/a-1.0.jar.asc")));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(entry.has_signature_file());
    }

    #[test]
    fn pgp_state_transitions() {
        let entry = PgpEntry::new(observed("a"), Box::new(|| Some(PathBuf::from("a.asc"))));
        entry.signature_file();
        assert!(entry.is_requiring_checksums());

        entry.add_verified_key("AAAA");
        assert!(!entry.is_requiring_checksums());
        assert_eq!(entry.reason(), None);

        entry.fail("BBBB");
        assert!(entry.is_failed());
        assert!(entry.is_requiring_checksums());
        assert_eq!(entry.reason(), Some(REASON_PGP_FAILED));
        assert_eq!(entry.verified_keys().len(), 1);

        let missing = PgpEntry::new(observed("b"), Box::new(|| Some(PathBuf::from("b.asc"))));
        missing.signature_file();
        missing.missing();
        assert_eq!(missing.reason(), Some(REASON_KEY_NOT_DOWNLOADED));

        let unsigned = PgpEntry::new(observed("c"), no_signature());
        unsigned.signature_file();
        assert!(unsigned.is_unsigned());
        assert_eq!(unsigned.reason(), Some(REASON_NOT_SIGNED));
    }

    #[test]
    fn signature_without_usable_key_needs_a_reason() {
        // Every signature came from an ignored key: nothing verified, failed or missing.
        let entry = PgpEntry::new(observed("d"), Box::new(|| Some(PathBuf::from("d.asc"))));
        entry.signature_file();
        assert!(entry.has_signature_file());
        assert!(!entry.is_failed());
        assert!(!entry.has_missing_keys());
        assert!(entry.is_requiring_checksums());
        assert_eq!(entry.reason(), Some(REASON_KEY_NOT_DOWNLOADED));
    }

    #[test]
    fn grouped_keys_leave_artifact_level() {
        let entry = PgpEntry::new(observed("a"), no_signature());
        entry.add_verified_key("AAAA");
        entry.add_verified_key("BBBB");
        entry.group_key("AAAA");
        assert_eq!(entry.artifact_level_keys().into_iter().collect::<Vec<_>>(), ["BBBB"]);
    }
}

//! Generates the verification manifest from everything a build resolves.
//!
//! The writer is registered as the resolution hook. Every artifact observed
//! while resolving becomes one checksum entry per requested kind and, when
//! `pgp` is requested, one signature entry. Once every configuration of
//! every project has been resolved, checksums are computed and signatures
//! checked concurrently, then entries are written serially in natural order
//! on top of the existing manifest.

use std::collections::BTreeSet;
use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

use modvault_schema::{ArtifactIdentifier, ChecksumKind};

use super::VerificationError;
use super::entry::{
    ChecksumEntry, ObservedArtifact, PgpEntry, REASON_KEY_NOT_DOWNLOADED, REASON_NOT_SIGNED, REASON_PGP_FAILED,
    VerificationEntries, VerificationEntry,
};
use super::grouper::group_keys;
use super::model::{DependencyVerifier, DependencyVerifierBuilder, IgnoredKey, VerificationConfiguration};
use super::signature::{
    DefaultSignatureVerificationService, SignatureVerificationResultBuilder, SignatureVerificationService,
};
use super::xml::{read_manifest_file, write_manifest_file};
use crate::keys::{
    BuildTreeDefinedKeys, CompositePublicKeyService, KeyServerClient, KeyringFiles, KeyringFormat, PublicKeyService,
};
use crate::openpgp::{KeyId, PublicKey};
use crate::paths;
use crate::queue;
use crate::resolver::{ArtifactKind, ArtifactVerificationOperation, SignatureFileFactory};
use crate::workspace::BuildTree;

/// `origin` of every checksum this writer adds.
pub const ORIGIN: &str = "Generated by modvault";
/// Reason of keys ignored because no key server had them.
pub const REASON_KEY_NOT_FOUND: &str = "Key couldn't be downloaded from any key server";
/// Reason of per-artifact keys whose signature did not match.
pub const REASON_VERIFICATION_FAILED: &str = "PGP verification failed";

const PGP: &str = "pgp";

/// What to generate and where.
#[derive(Debug, Clone)]
pub struct WriterOptions {
    /// Manifest to update.
    pub verification_file: PathBuf,
    /// Requested kinds as typed by the user: checksum names and `pgp`.
    pub checksums: Vec<String>,
    /// Write `<base>.dryrun.xml` and dry-run keyrings instead.
    pub dry_run: bool,
    /// Export every key the manifest mentions.
    pub export_keys: bool,
    /// Never contact key servers.
    pub offline: bool,
    /// Concurrent resolutions, checksums and signature checks.
    pub parallelism: usize,
}

impl WriterOptions {
    /// Online, not a dry run, no key export, one unit per CPU.
    pub fn new(verification_file: impl Into<PathBuf>, checksums: Vec<String>) -> Self {
        Self {
            verification_file: verification_file.into(),
            checksums,
            dry_run: false,
            export_keys: false,
            offline: false,
            parallelism: queue::default_parallelism(),
        }
    }
}

/// Outcome of one generation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteReport {
    /// File written: the manifest or its dry-run sibling.
    pub path: PathBuf,
    /// Entries that produced output.
    pub entries_written: usize,
    /// Key rings in the exported keyrings.
    pub exported_keys: usize,
    /// Summary of the problems found, if any.
    pub warning: Option<String>,
}

/// Collects artifacts during resolution and writes the manifest.
pub struct VerificationFileWriter {
    options: WriterOptions,
    kinds: Vec<ChecksumKind>,
    generate_pgp: bool,
    entries: VerificationEntries,
    key_service: Option<Arc<dyn PublicKeyService>>,
    client: reqwest::Client,
}

impl std::fmt::Debug for VerificationFileWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VerificationFileWriter")
            .field("options", &self.options)
            .field("kinds", &self.kinds)
            .field("generate_pgp", &self.generate_pgp)
            .field("entries", &self.entries.len())
            .finish_non_exhaustive()
    }
}

impl VerificationFileWriter {
    /// Validate the requested kinds.
    ///
    /// # Errors
    ///
    /// Fails when `pgp` is requested without any checksum to fall back on.
    pub fn new(options: WriterOptions) -> Result<Self, VerificationError> {
        let mut kinds = BTreeSet::new();
        let mut generate_pgp = false;
        for requested in &options.checksums {
            let requested = requested.trim();
            if requested.eq_ignore_ascii_case(PGP) {
                generate_pgp = true;
                continue;
            }
            match requested.parse::<ChecksumKind>() {
                Ok(kind) => {
                    kinds.insert(kind);
                }
                Err(_) => tracing::warn!(
                    "Invalid checksum type: '{requested}'. You must choose one or more in [md5, sha1, sha256, sha512, pgp]"
                ),
            }
        }
        if generate_pgp && kinds.is_empty() {
            return Err(VerificationError::PgpWithoutFallback);
        }
        if !generate_pgp && !kinds.iter().any(|k| k.is_secure()) {
            tracing::warn!(
                "You chose to generate checksums but they are all considered insecure. \
                 You should consider adding at least one of sha256 or sha512 or pgp."
            );
        }
        Ok(Self {
            options,
            kinds: kinds.into_iter().collect(),
            generate_pgp,
            entries: VerificationEntries::new(),
            key_service: None,
            client: reqwest::Client::new(),
        })
    }

    /// Look keys up through `keys` instead of exported keyrings and key
    /// servers.
    #[must_use]
    pub fn with_public_key_service(mut self, keys: Arc<dyn PublicKeyService>) -> Self {
        self.key_service = Some(keys);
        self
    }

    /// HTTP client for key servers.
    #[must_use]
    pub fn with_http_client(mut self, client: reqwest::Client) -> Self {
        self.client = client;
        self
    }

    /// Resolve the whole build tree and write the manifest.
    ///
    /// # Errors
    ///
    /// Fails when the existing manifest cannot be read, or when the new one
    /// or the exported keyrings cannot be written. Resolution failures are
    /// logged and skipped.
    pub async fn generate(self: Arc<Self>, tree: &dyn BuildTree) -> Result<WriteReport, VerificationError> {
        if self.options.verification_file.exists() {
            tracing::info!("Found dependency verification metadata file, updating");
        }
        let builder = read_manifest_file(&self.options.verification_file)?;
        Arc::clone(&self).resolve_all(tree).await;
        self.build_finished(builder).await
    }

    async fn resolve_all(self: Arc<Self>, tree: &dyn BuildTree) {
        let units: Vec<_> = tree
            .projects()
            .into_iter()
            .map(|project| {
                let writer = Arc::clone(&self);
                async move {
                    let name = project.name().to_string();
                    let outcome = tokio::task::spawn_blocking(move || {
                        let observer: &dyn ArtifactVerificationOperation = writer.as_ref();
                        for configuration in project.resolvable_configurations() {
                            match project.resolve_configuration(&configuration, Some(observer)) {
                                Ok(resolved) => tracing::debug!(
                                    "Resolved {}:{configuration}, {} artifacts",
                                    project.name(),
                                    resolved.artifacts.len()
                                ),
                                Err(e) => tracing::warn!(
                                    "Cannot resolve configuration '{configuration}' of project '{}': {e}",
                                    project.name()
                                ),
                            }
                        }
                    })
                    .await;
                    if let Err(e) = outcome {
                        tracing::error!("Resolution of project '{name}' aborted: {e}");
                    }
                }
            })
            .collect();
        queue::run_all(units, self.options.parallelism).await;
    }

    async fn build_finished(&self, mut builder: DependencyVerifierBuilder) -> Result<WriteReport, VerificationError> {
        let configuration = builder.configuration().clone();
        let keys = self.public_key_service(&configuration);
        let entries = self.entries.sorted();
        tracing::debug!("Computing {} verification entries", entries.len());

        let context = Arc::new(PhaseContext {
            signatures: DefaultSignatureVerificationService::new(Arc::clone(&keys)),
            not_downloaded: Mutex::new(BTreeSet::new()),
        });
        let units: Vec<_> = entries
            .iter()
            .filter(|entry| should_compute(&builder, &configuration, entry))
            .map(|entry| compute_entry(Arc::clone(entry), Arc::clone(&context)))
            .collect();
        queue::run_all(units, self.options.parallelism).await;

        if self.generate_pgp {
            let not_downloaded =
                std::mem::take(&mut *context.not_downloaded.lock().unwrap_or_else(PoisonError::into_inner));
            for key in not_downloaded {
                builder.add_ignored_key(IgnoredKey::new(key, Some(REASON_KEY_NOT_FOUND)));
            }
            for key in group_keys(&entries) {
                builder.add_trusted_key(key);
            }
        }

        let mut problems = Problems::default();
        let entries_written = write_entries(&mut builder, &entries, &mut problems);
        if self.generate_pgp {
            builder.set_verify_signatures(true);
        }
        let verifier = builder.build();

        let path = if self.options.dry_run {
            paths::dry_run_file(&self.options.verification_file)
        } else {
            self.options.verification_file.clone()
        };
        write_manifest_file(&path, &verifier)?;
        tracing::info!("Wrote {} ({entries_written} entries)", path.display());

        let exported_keys = if self.options.export_keys {
            self.export_keys(keys.as_ref(), &verifier).await?
        } else {
            0
        };

        let warning = problems.message();
        if let Some(warning) = &warning {
            tracing::warn!("{warning}");
        }
        Ok(WriteReport {
            path,
            entries_written,
            exported_keys,
            warning,
        })
    }

    fn public_key_service(&self, configuration: &VerificationConfiguration) -> Arc<dyn PublicKeyService> {
        if let Some(keys) = &self.key_service {
            return Arc::clone(keys);
        }
        let format = KeyringFormat::from_config(configuration.keyring_format.as_deref());
        let local = load_exported_keys(&paths::keyring_files(&self.options.verification_file), format);
        let remote = if self.options.offline {
            tracing::info!("Offline: keys are only looked up in exported keyrings");
            None
        } else {
            if !configuration.use_key_servers {
                tracing::info!("Key servers are disabled in the verification metadata, using them anyway to download keys");
            }
            let servers = KeyServerClient::new(self.client.clone(), configuration.effective_key_servers());
            Some(Arc::new(servers) as Arc<dyn PublicKeyService>)
        };
        Arc::new(CompositePublicKeyService::new(Arc::new(local), remote))
    }

    /// Export every key the manifest mentions, merged with the rings already
    /// exported. A dry run writes its own keyring files and leaves the
    /// exported ones untouched.
    async fn export_keys(
        &self,
        keys: &dyn PublicKeyService,
        verifier: &DependencyVerifier,
    ) -> Result<usize, VerificationError> {
        let configuration = verifier.configuration();
        let mut ids: BTreeSet<String> = configuration.trusted_keys.iter().map(|k| k.key_id.clone()).collect();
        ids.extend(configuration.ignored_keys.iter().map(|k| k.key_id.clone()));
        for component in verifier.components() {
            for artifact in component.artifacts.values() {
                ids.extend(artifact.trusted_pgp_keys.iter().cloned());
                ids.extend(artifact.ignored_pgp_keys.iter().map(|k| k.key_id.clone()));
            }
        }

        let format = KeyringFormat::from_config(configuration.keyring_format.as_deref());
        let mut exported = load_exported_keys(&paths::keyring_files(&self.options.verification_file), format);
        for id in &ids {
            let Some(key_id) = KeyId::parse(id) else {
                tracing::warn!("Not exporting '{id}': not a key id");
                continue;
            };
            match keys.find(&key_id).await {
                Ok(Some(ring)) => exported.merge(ring),
                Ok(None) => tracing::debug!("Key {id} not found, not exported"),
                Err(e) => tracing::warn!("Cannot export key {id}: {e}"),
            }
        }
        let target = if self.options.dry_run {
            paths::dry_run_keyring_files(&self.options.verification_file)
        } else {
            paths::keyring_files(&self.options.verification_file)
        };
        for file in exported.export(&target, format)? {
            tracing::info!("Exported {} keys to {}", exported.len(), file.display());
        }
        Ok(exported.len())
    }
}

impl ArtifactVerificationOperation for VerificationFileWriter {
    fn on_artifact(
        &self,
        kind: ArtifactKind,
        id: &ArtifactIdentifier,
        file: &Path,
        signature_file: SignatureFileFactory,
        repository_name: &str,
        repository_id: &str,
    ) {
        let artifact = ObservedArtifact {
            id: id.clone(),
            kind,
            file: file.to_path_buf(),
            repository_name: repository_name.to_string(),
            repository_id: repository_id.to_string(),
        };
        for checksum_kind in &self.kinds {
            self.entries
                .insert(VerificationEntry::Checksum(ChecksumEntry::new(artifact.clone(), *checksum_kind)));
        }
        if self.generate_pgp {
            self.entries
                .insert(VerificationEntry::Pgp(PgpEntry::new(artifact, signature_file)));
        }
    }
}

fn load_exported_keys(files: &KeyringFiles, format: KeyringFormat) -> BuildTreeDefinedKeys {
    BuildTreeDefinedKeys::load(files, format).unwrap_or_else(|e| {
        tracing::warn!("Ignoring unreadable exported keyrings: {e}");
        BuildTreeDefinedKeys::default()
    })
}

/// Shared by all phase (b) units.
struct PhaseContext {
    signatures: DefaultSignatureVerificationService,
    not_downloaded: Mutex<BTreeSet<String>>,
}

fn should_compute(
    builder: &DependencyVerifierBuilder,
    configuration: &VerificationConfiguration,
    entry: &VerificationEntry,
) -> bool {
    let artifact = entry.artifact();
    if builder.is_trusted_artifact(&artifact.id) {
        return false;
    }
    if artifact.kind == ArtifactKind::Metadata && !configuration.verify_metadata {
        return false;
    }
    if !artifact.file.exists() {
        tracing::warn!(
            "Cannot compute checksum for {} because it doesn't exist. It may indicate a corrupt or tampered cache.",
            artifact.file.display()
        );
        return false;
    }
    true
}

async fn compute_entry(entry: Arc<VerificationEntry>, context: Arc<PhaseContext>) {
    match entry.as_ref() {
        VerificationEntry::Checksum(checksum) => {
            let kind = checksum.checksum_kind;
            let file = checksum.artifact.file.clone();
            match tokio::task::spawn_blocking(move || kind.hash_file(&file)).await {
                Ok(Ok(value)) => checksum.set_checksum(value),
                Ok(Err(e)) => tracing::warn!(
                    "Cannot compute {} checksum of {}: {e}",
                    kind.as_str(),
                    checksum.artifact.file.display()
                ),
                Err(e) => tracing::error!("Checksum task failed: {e}"),
            }
        }
        VerificationEntry::Pgp(pgp) => {
            let lookup = Arc::clone(&entry);
            let signature = tokio::task::spawn_blocking(move || match lookup.as_ref() {
                VerificationEntry::Pgp(pgp) => pgp.signature_file().map(Path::to_path_buf),
                VerificationEntry::Checksum(_) => None,
            })
            .await;
            let signature = match signature {
                Ok(Some(signature)) => signature,
                Ok(None) => {
                    tracing::debug!("{} is not signed", pgp.artifact.id);
                    return;
                }
                Err(e) => {
                    tracing::error!("Signature lookup failed: {e}");
                    return;
                }
            };
            let mut result = PgpResult {
                entry: pgp,
                not_downloaded: &context.not_downloaded,
            };
            // Keys listed in the existing manifest are looked up again: a key
            // ignored by an earlier run may be available now.
            let none = BTreeSet::new();
            context
                .signatures
                .verify(&pgp.artifact.file, &signature, &none, &none, &mut result)
                .await;
        }
    }
}

/// Records signature outcomes on a PGP entry.
struct PgpResult<'a> {
    entry: &'a PgpEntry,
    not_downloaded: &'a Mutex<BTreeSet<String>>,
}

impl SignatureVerificationResultBuilder for PgpResult<'_> {
    fn missing_key(&mut self, key_id: &str) {
        self.entry.missing();
        self.not_downloaded
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key_id.to_string());
    }

    fn verified(&mut self, key: &PublicKey, _trusted: bool) {
        self.entry.add_verified_key(key.fingerprint_hex());
    }

    fn failed(&mut self, key: &PublicKey) {
        self.entry.fail(key.fingerprint_hex());
    }

    fn ignored(&mut self, key_id: &str) {
        tracing::debug!("Key {key_id} is ignored for {}", self.entry.artifact.id);
    }
}

/// Write entries in natural order. A PGP entry comes right before the
/// checksums of its artifact; those checksums are only written when the
/// signature is not enough on its own. Returns the number of entries that
/// produced output.
fn write_entries(
    builder: &mut DependencyVerifierBuilder,
    entries: &[Arc<VerificationEntry>],
    problems: &mut Problems,
) -> usize {
    let mut written = 0;
    let mut previous: Option<&PgpEntry> = None;
    for entry in entries {
        let id = &entry.artifact().id;
        if previous.is_some_and(|pgp| pgp.artifact.id != *id) {
            previous = None;
        }
        if builder.is_trusted_artifact(id) {
            continue;
        }
        let file_name = id.file_name();
        match entry.as_ref() {
            VerificationEntry::Pgp(pgp) => {
                previous = Some(pgp);
                let failed = pgp.failed_keys();
                for key in &failed {
                    builder.add_ignored_pgp_key(
                        &id.component,
                        &file_name,
                        IgnoredKey::new(key.clone(), Some(REASON_VERIFICATION_FAILED)),
                    );
                }
                let mut recorded = !failed.is_empty();
                for key in pgp.artifact_level_keys().difference(&failed) {
                    if builder.is_key_trusted_for(key, id) {
                        continue;
                    }
                    builder.add_trusted_pgp_key(&id.component, &file_name, key);
                    recorded = true;
                }
                if recorded {
                    written += 1;
                }
            }
            VerificationEntry::Checksum(checksum) => {
                let Some(value) = checksum.checksum() else {
                    continue;
                };
                let reason = match previous {
                    Some(pgp) if !pgp.is_requiring_checksums() => continue,
                    Some(pgp) => {
                        problems.record(pgp);
                        pgp.reason()
                    }
                    None => None,
                };
                builder.add_checksum(
                    &id.component,
                    &file_name,
                    checksum.checksum_kind,
                    value,
                    Some(ORIGIN),
                    reason,
                );
                written += 1;
            }
        }
    }
    written
}

#[derive(Debug, Default)]
struct Problems {
    unsigned: bool,
    missing_keys: bool,
    failed: bool,
}

impl Problems {
    fn record(&mut self, pgp: &PgpEntry) {
        match pgp.reason() {
            Some(REASON_PGP_FAILED) => self.failed = true,
            Some(REASON_KEY_NOT_DOWNLOADED) => self.missing_keys = true,
            Some(REASON_NOT_SIGNED) => self.unsigned = true,
            _ => {}
        }
    }

    fn message(&self) -> Option<String> {
        if !(self.unsigned || self.missing_keys || self.failed) {
            return None;
        }
        let mut out = String::from("A verification file was generated but some problems were discovered:\n");
        if self.unsigned {
            out.push_str("   - some artifacts aren't signed or the signature couldn't be retrieved.\n");
        }
        if self.missing_keys {
            let _ = writeln!(
                out,
                "   - some keys couldn't be downloaded. They were added as ignored keys; review whether this is \
                 acceptable. Look for entries with the following comment: {REASON_KEY_NOT_FOUND}"
            );
        }
        if self.failed {
            let _ = writeln!(
                out,
                "   - some signature verification failed. Checksums were generated for those artifacts but you \
                 MUST check if there's an actual problem. Look for entries with the following comment: \
                 {REASON_PGP_FAILED}"
            );
        }
        Some(out)
    }
}

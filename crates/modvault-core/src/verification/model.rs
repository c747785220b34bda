//! In-memory form of a verification manifest.

use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};

use modvault_schema::{ArtifactIdentifier, ChecksumKind, ModuleComponentId};
use regex::Regex;

/// Queried when the manifest names no key server.
pub const DEFAULT_KEY_SERVERS: [&str; 2] = ["https://keyserver.ubuntu.com", "https://keys.openpgp.org"];

/// Global settings and trust declarations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerificationConfiguration {
    /// Whether metadata files (descriptors) are verified too.
    pub verify_metadata: bool,
    /// Whether PGP signatures are checked.
    pub verify_signatures: bool,
    /// Whether missing keys may be fetched from key servers.
    pub use_key_servers: bool,
    /// Key server URIs, in declaration order.
    pub key_servers: Vec<String>,
    /// `text`, `gpg`, or unset for both.
    pub keyring_format: Option<String>,
    /// Artifacts exempt from verification.
    pub trusted_artifacts: Vec<TrustedArtifact>,
    /// Keys never used, for any artifact.
    pub ignored_keys: BTreeSet<IgnoredKey>,
    /// Keys trusted for a coordinates pattern.
    pub trusted_keys: Vec<TrustedKey>,
}

impl Default for VerificationConfiguration {
    fn default() -> Self {
        Self {
            verify_metadata: true,
            verify_signatures: false,
            use_key_servers: true,
            key_servers: Vec::new(),
            keyring_format: None,
            trusted_artifacts: Vec::new(),
            ignored_keys: BTreeSet::new(),
            trusted_keys: Vec::new(),
        }
    }
}

impl VerificationConfiguration {
    /// Key servers to query: the configured ones, or the defaults.
    pub fn effective_key_servers(&self) -> Vec<String> {
        if self.key_servers.is_empty() {
            DEFAULT_KEY_SERVERS.iter().map(ToString::to_string).collect()
        } else {
            self.key_servers.clone()
        }
    }
}

/// Artifact coordinates pattern. Unset fields match anything; with `regex`
/// set, fields are full-match regular expressions.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TrustedArtifact {
    /// Group pattern.
    pub group: Option<String>,
    /// Module name pattern.
    pub name: Option<String>,
    /// Version pattern.
    pub version: Option<String>,
    /// Artifact file name pattern.
    pub file: Option<String>,
    /// Treat the patterns as regular expressions.
    pub regex: bool,
    /// Why the artifacts are trusted.
    pub reason: Option<String>,
}

impl TrustedArtifact {
    /// Everything in `group`.
    pub fn group(group: impl Into<String>) -> Self {
        Self {
            group: Some(group.into()),
            ..Self::default()
        }
    }

    /// Every version and file of one module.
    pub fn module(group: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            group: Some(group.into()),
            name: Some(name.into()),
            ..Self::default()
        }
    }

    /// Whether every set pattern matches the corresponding coordinate of `id`.
    /// An invalid regular expression matches nothing.
    pub fn matches(&self, id: &ArtifactIdentifier) -> bool {
        self.field_matches(self.group.as_deref(), &id.component.group)
            && self.field_matches(self.name.as_deref(), &id.component.module)
            && self.field_matches(self.version.as_deref(), &id.component.version)
            && self.field_matches(self.file.as_deref(), &id.file_name())
    }

    fn field_matches(&self, pattern: Option<&str>, value: &str) -> bool {
        match pattern {
            None => true,
            Some(p) if self.regex => match Regex::new(&format!("^(?:{p})$")) {
                Ok(re) => re.is_match(value),
                Err(e) => {
                    tracing::warn!("Invalid trusted artifact pattern '{p}': {e}");
                    false
                }
            },
            Some(p) => p == value,
        }
    }

    fn same_scope(&self, other: &Self) -> bool {
        self.group == other.group
            && self.name == other.name
            && self.version == other.version
            && self.file == other.file
            && self.regex == other.regex
    }
}

/// A key trusted for every artifact matching `trusting`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrustedKey {
    /// Fingerprint or long id in hex.
    pub key_id: String,
    /// Artifacts the key is trusted for.
    pub trusting: TrustedArtifact,
}

/// A key never used for verification. Identity is the key id alone.
#[derive(Debug, Clone, Eq)]
pub struct IgnoredKey {
    /// Fingerprint or long id in hex.
    pub key_id: String,
    /// Why the key is ignored.
    pub reason: Option<String>,
}

impl IgnoredKey {
    /// Ignore `key_id`, optionally saying why.
    pub fn new(key_id: impl Into<String>, reason: Option<&str>) -> Self {
        Self {
            key_id: key_id.into(),
            reason: reason.map(ToString::to_string),
        }
    }
}

impl PartialEq for IgnoredKey {
    fn eq(&self, other: &Self) -> bool {
        self.key_id == other.key_id
    }
}

impl Ord for IgnoredKey {
    fn cmp(&self, other: &Self) -> Ordering {
        self.key_id.cmp(&other.key_id)
    }
}

impl PartialOrd for IgnoredKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// An expected checksum of one kind for one artifact.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Checksum {
    /// Algorithm.
    pub kind: ChecksumKind,
    /// Lowercase hex digest.
    pub value: String,
    /// Other accepted values (`also-trust`).
    pub alternatives: BTreeSet<String>,
    /// Who produced the value.
    pub origin: Option<String>,
    /// Why a checksum was needed, for example a missing key.
    pub reason: Option<String>,
}

impl Checksum {
    /// Whether `value` is the expected digest or one of the alternatives,
    /// ignoring case.
    pub fn accepts(&self, value: &str) -> bool {
        self.value.eq_ignore_ascii_case(value)
            || self.alternatives.iter().any(|a| a.eq_ignore_ascii_case(value))
    }
}

/// Verification data of a single artifact file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactVerificationMetadata {
    /// File name within its component.
    pub file_name: String,
    /// Expected checksums, at most one entry per kind.
    pub checksums: BTreeMap<ChecksumKind, Checksum>,
    /// Keys whose signature is enough for this file.
    pub trusted_pgp_keys: BTreeSet<String>,
    /// Keys never used for this file.
    pub ignored_pgp_keys: BTreeSet<IgnoredKey>,
}

impl ArtifactVerificationMetadata {
    fn new(file_name: &str) -> Self {
        Self {
            file_name: file_name.to_string(),
            checksums: BTreeMap::new(),
            trusted_pgp_keys: BTreeSet::new(),
            ignored_pgp_keys: BTreeSet::new(),
        }
    }
}

/// Verification data of all recorded artifacts of a component.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ComponentVerificationMetadata {
    /// Coordinates.
    pub component: ModuleComponentId,
    /// Keyed by file name.
    pub artifacts: BTreeMap<String, ArtifactVerificationMetadata>,
}

/// A complete, immutable manifest.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DependencyVerifier {
    configuration: VerificationConfiguration,
    components: BTreeMap<ModuleComponentId, ComponentVerificationMetadata>,
}

impl DependencyVerifier {
    /// Global settings and trust declarations.
    pub fn configuration(&self) -> &VerificationConfiguration {
        &self.configuration
    }

    /// Components in coordinate order.
    pub fn components(&self) -> impl Iterator<Item = &ComponentVerificationMetadata> {
        self.components.values()
    }

    /// Entry recorded for `id`, if any.
    pub fn artifact(&self, id: &ArtifactIdentifier) -> Option<&ArtifactVerificationMetadata> {
        self.components
            .get(&id.component)?
            .artifacts
            .get(&id.file_name())
    }
}

/// Accumulates a manifest. Every `add_*` is additive: existing declarations
/// are kept, new ones are merged in.
#[derive(Debug, Clone, Default)]
pub struct DependencyVerifierBuilder {
    configuration: VerificationConfiguration,
    components: BTreeMap<ModuleComponentId, ComponentVerificationMetadata>,
}

impl DependencyVerifierBuilder {
    /// Empty manifest with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Settings accumulated so far.
    pub fn configuration(&self) -> &VerificationConfiguration {
        &self.configuration
    }

    /// Set `verify-metadata`.
    pub fn set_verify_metadata(&mut self, value: bool) {
        self.configuration.verify_metadata = value;
    }

    /// Set `verify-signatures`.
    pub fn set_verify_signatures(&mut self, value: bool) {
        self.configuration.verify_signatures = value;
    }

    /// Set `key-servers enabled`.
    pub fn set_use_key_servers(&mut self, value: bool) {
        self.configuration.use_key_servers = value;
    }

    /// Add a key server unless already listed.
    pub fn add_key_server(&mut self, uri: impl Into<String>) {
        let uri = uri.into();
        if !self.configuration.key_servers.contains(&uri) {
            self.configuration.key_servers.push(uri);
        }
    }

    /// Set the exported keyring format.
    pub fn set_keyring_format(&mut self, format: Option<String>) {
        self.configuration.keyring_format = format;
    }

    /// Add a trusted-artifact pattern unless one with the same scope exists.
    pub fn add_trusted_artifact(&mut self, artifact: TrustedArtifact) {
        if !self
            .configuration
            .trusted_artifacts
            .iter()
            .any(|a| a.same_scope(&artifact))
        {
            self.configuration.trusted_artifacts.push(artifact);
        }
    }

    /// Ignore a key globally. A key already ignored keeps its reason.
    pub fn add_ignored_key(&mut self, key: IgnoredKey) {
        self.configuration.ignored_keys.insert(key);
    }

    /// Trust a key for a pattern unless the same key and scope are declared.
    pub fn add_trusted_key(&mut self, key: TrustedKey) {
        let exists = self
            .configuration
            .trusted_keys
            .iter()
            .any(|k| k.key_id.eq_ignore_ascii_case(&key.key_id) && k.trusting.same_scope(&key.trusting));
        if !exists {
            self.configuration.trusted_keys.push(key);
        }
    }

    /// Whether a trusted-artifact pattern matches `id`.
    pub fn is_trusted_artifact(&self, id: &ArtifactIdentifier) -> bool {
        self.configuration
            .trusted_artifacts
            .iter()
            .any(|a| a.matches(id))
    }

    /// Whether a global trusted-key declaration already covers `key_id` for `id`.
    pub fn is_key_trusted_for(&self, key_id: &str, id: &ArtifactIdentifier) -> bool {
        self.configuration
            .trusted_keys
            .iter()
            .any(|k| k.key_id.eq_ignore_ascii_case(key_id) && k.trusting.matches(id))
    }

    fn artifact_mut(
        &mut self,
        component: &ModuleComponentId,
        file_name: &str,
    ) -> &mut ArtifactVerificationMetadata {
        self.components
            .entry(component.clone())
            .or_insert_with(|| ComponentVerificationMetadata {
                component: component.clone(),
                artifacts: BTreeMap::new(),
            })
            .artifacts
            .entry(file_name.to_string())
            .or_insert_with(|| ArtifactVerificationMetadata::new(file_name))
    }

    /// Record a checksum. A different value for a kind already present is
    /// kept as an alternative.
    pub fn add_checksum(
        &mut self,
        component: &ModuleComponentId,
        file_name: &str,
        kind: ChecksumKind,
        value: &str,
        origin: Option<&str>,
        reason: Option<&str>,
    ) {
        let artifact = self.artifact_mut(component, file_name);
        match artifact.checksums.get_mut(&kind) {
            Some(existing) if existing.accepts(value) => {}
            Some(existing) => {
                existing.alternatives.insert(value.to_string());
            }
            None => {
                artifact.checksums.insert(
                    kind,
                    Checksum {
                        kind,
                        value: value.to_string(),
                        alternatives: BTreeSet::new(),
                        origin: origin.map(ToString::to_string),
                        reason: reason.map(ToString::to_string),
                    },
                );
            }
        }
    }

    /// Trust `key_id` for one artifact file.
    pub fn add_trusted_pgp_key(&mut self, component: &ModuleComponentId, file_name: &str, key_id: &str) {
        self.artifact_mut(component, file_name)
            .trusted_pgp_keys
            .insert(key_id.to_string());
    }

    /// Ignore a key for one artifact file.
    pub fn add_ignored_pgp_key(&mut self, component: &ModuleComponentId, file_name: &str, key: IgnoredKey) {
        self.artifact_mut(component, file_name)
            .ignored_pgp_keys
            .insert(key);
    }

    /// Freeze into a manifest.
    pub fn build(self) -> DependencyVerifier {
        DependencyVerifier {
            configuration: self.configuration,
            components: self.components,
        }
    }
}

impl From<DependencyVerifier> for DependencyVerifierBuilder {
    fn from(verifier: DependencyVerifier) -> Self {
        Self {
            configuration: verifier.configuration,
            components: verifier.components,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use modvault_schema::ArtifactName;

    fn artifact(group: &str, module: &str, version: &str) -> ArtifactIdentifier {
        ArtifactIdentifier::new(
            ModuleComponentId::new(group, module, version),
            ArtifactName::new(module, "jar", "jar", None),
        )
    }

    #[test]
    fn trusted_artifact_exact_and_regex() {
        let exact = TrustedArtifact::module("org.example", "lib");
        assert!(exact.matches(&artifact("org.example", "lib", "1.0")));
        assert!(!exact.matches(&artifact("org.example", "other", "1.0")));

        let regex = TrustedArtifact {
            group: Some("org\\.example(\\..*)?".into()),
            file: Some(".*\\.jar".into()),
            regex: true,
            ..TrustedArtifact::default()
        };
        assert!(regex.matches(&artifact("org.example.sub", "x", "2")));
        assert!(!regex.matches(&artifact("org.examples", "x", "2")));
    }

    #[test]
    fn checksums_merge_additively() {
        let mut builder = DependencyVerifierBuilder::new();
        let id = ModuleComponentId::new("g", "m", "1");
        builder.add_checksum(&id, "m-1.jar", ChecksumKind::Sha256, "aa", Some("Generated by modvault"), None);
        builder.add_checksum(&id, "m-1.jar", ChecksumKind::Sha256, "AA", None, None);
        builder.add_checksum(&id, "m-1.jar", ChecksumKind::Sha256, "bb", None, None);
        let verifier = builder.build();
        let checksum = &verifier.artifact(&artifact("g", "m", "1")).unwrap().checksums[&ChecksumKind::Sha256];
        assert_eq!(checksum.value, "aa");
        assert_eq!(checksum.origin.as_deref(), Some("Generated by modvault"));
        assert_eq!(checksum.alternatives.iter().collect::<Vec<_>>(), ["bb"]);
    }

    #[test]
    fn ignored_keys_dedupe_by_id() {
        let mut builder = DependencyVerifierBuilder::new();
        builder.add_ignored_key(IgnoredKey::new("ABCD", Some("first")));
        builder.add_ignored_key(IgnoredKey::new("ABCD", Some("second")));
        let keys = &builder.configuration().ignored_keys;
        assert_eq!(keys.len(), 1);
        assert_eq!(keys.first().unwrap().reason.as_deref(), Some("first"));
    }

    #[test]
    fn trusted_key_scope() {
        let mut builder = DependencyVerifierBuilder::new();
        builder.add_trusted_key(TrustedKey {
            key_id: "ABCD".into(),
            trusting: TrustedArtifact::group("org.example"),
        });
        builder.add_trusted_key(TrustedKey {
            key_id: "abcd".into(),
            trusting: TrustedArtifact::group("org.example"),
        });
        assert_eq!(builder.configuration().trusted_keys.len(), 1);
        assert!(builder.is_key_trusted_for("ABCD", &artifact("org.example", "lib", "1")));
        assert!(!builder.is_key_trusted_for("ABCD", &artifact("com.other", "lib", "1")));
    }

    #[test]
    fn default_key_servers() {
        let config = VerificationConfiguration::default();
        assert_eq!(config.effective_key_servers().len(), 2);
    }
}

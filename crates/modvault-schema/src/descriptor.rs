//! Module descriptors: the metadata a repository publishes for a module
//! version.
//!
//! Repositories serve descriptors as JSON; the descriptor store persists them
//! as `postcard` bytes.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::coordinates::{ArtifactIdentifier, ArtifactName, ModuleComponentId};

/// Errors raised while reading or writing descriptors.
#[derive(Debug, Error)]
pub enum DescriptorError {
    /// The stored binary payload could not be decoded.
    #[error("Invalid stored descriptor: {0}")]
    Binary(#[from] postcard::Error),

    /// The repository JSON document could not be parsed.
    #[error("Invalid descriptor JSON: {0}")]
    Json(#[from] serde_json::Error),
}

/// Metadata for one module version.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModuleDescriptor {
    /// Coordinate of the module.
    pub id: ModuleComponentId,
    /// Publication status (`release`, `integration`, ...).
    #[serde(default = "default_status")]
    pub status: String,
    /// Whether the content can change without a version bump.
    #[serde(default)]
    pub changing: bool,
    /// Declared packaging, if any.
    #[serde(default)]
    pub packaging: Option<String>,
    /// Direct dependencies.
    #[serde(default)]
    pub dependencies: Vec<DependencyDescriptor>,
    /// Published files.
    #[serde(default)]
    pub artifacts: Vec<ArtifactDescriptor>,
}

fn default_status() -> String {
    "release".to_string()
}

/// A direct dependency declared by a descriptor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DependencyDescriptor {
    /// Group of the dependency.
    pub group: String,
    /// Module name of the dependency.
    pub module: String,
    /// Requested version.
    pub version: String,
}

impl DependencyDescriptor {
    /// Coordinate of the requested module version.
    pub fn component_id(&self) -> ModuleComponentId {
        ModuleComponentId::new(&self.group, &self.module, &self.version)
    }
}

/// A published file, optionally restricted to some resolution contexts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactDescriptor {
    /// Base name of the file.
    pub name: String,
    /// Artifact type.
    #[serde(rename = "type", default = "default_kind")]
    pub kind: String,
    /// File extension.
    #[serde(default = "default_kind")]
    pub extension: String,
    /// Optional classifier.
    #[serde(default)]
    pub classifier: Option<String>,
    /// Contexts (configuration names) the artifact belongs to. Empty means
    /// every context.
    #[serde(default)]
    pub contexts: Vec<String>,
}

fn default_kind() -> String {
    "jar".to_string()
}

impl ModuleDescriptor {
    /// A release descriptor with no dependencies and no artifacts.
    pub fn new(id: ModuleComponentId) -> Self {
        Self {
            id,
            status: default_status(),
            changing: false,
            packaging: None,
            dependencies: Vec::new(),
            artifacts: Vec::new(),
        }
    }

    /// Whether the module only carries metadata (no files).
    pub fn is_metadata_only(&self) -> bool {
        self.artifacts.is_empty()
    }

    /// Packaging recorded in the cache entry: the declared packaging, else
    /// the extension of the main (unclassified) artifact.
    pub fn computed_packaging(&self) -> Option<String> {
        self.packaging.clone().or_else(|| {
            self.artifacts
                .iter()
                .find(|a| a.classifier.is_none())
                .map(|a| a.extension.clone())
        })
    }

    /// Artifacts selected for a resolution context.
    pub fn artifacts_for_context(&self, context: &str) -> BTreeSet<ArtifactIdentifier> {
        self.artifacts
            .iter()
            .filter(|a| a.contexts.is_empty() || a.contexts.iter().any(|c| c == context))
            .map(|a| {
                ArtifactIdentifier::new(
                    self.id.clone(),
                    ArtifactName::new(&a.name, &a.kind, &a.extension, a.classifier.clone()),
                )
            })
            .collect()
    }

    /// Parse a repository JSON document.
    ///
    /// # Errors
    ///
    /// Returns [`DescriptorError::Json`] for malformed documents.
    pub fn from_json(text: &str) -> Result<Self, DescriptorError> {
        Ok(serde_json::from_str(text)?)
    }

    /// Encode for the descriptor store.
    ///
    /// # Errors
    ///
    /// Returns [`DescriptorError::Binary`] if serialization fails.
    pub fn to_bytes(&self) -> Result<Vec<u8>, DescriptorError> {
        Ok(postcard::to_allocvec(self)?)
    }

    /// Decode bytes written by [`ModuleDescriptor::to_bytes`].
    ///
    /// # Errors
    ///
    /// Returns [`DescriptorError::Binary`] for corrupt payloads.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, DescriptorError> {
        Ok(postcard::from_bytes(bytes)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const JSON: &str = r#"{
        "id": { "group": "org.example", "module": "lib", "version": "1.0" },
        "dependencies": [ { "group": "org.example", "module": "core", "version": "2.1" } ],
        "artifacts": [
            { "name": "lib" },
            { "name": "lib", "classifier": "tests", "contexts": ["test"] }
        ]
    }"#;

    #[test]
    fn json_defaults() {
        let d = ModuleDescriptor::from_json(JSON).unwrap();
        assert_eq!(d.status, "release");
        assert!(!d.changing);
        assert_eq!(d.artifacts[0].kind, "jar");
        assert_eq!(d.computed_packaging().as_deref(), Some("jar"));
        assert_eq!(
            d.dependencies[0].component_id().to_string(),
            "org.example:core:2.1"
        );
    }

    #[test]
    fn binary_round_trip() {
        let d = ModuleDescriptor::from_json(JSON).unwrap();
        let bytes = d.to_bytes().unwrap();
        assert_eq!(ModuleDescriptor::from_bytes(&bytes).unwrap(), d);
    }

    #[test]
    fn artifacts_filtered_by_context() {
        let d = ModuleDescriptor::from_json(JSON).unwrap();
        assert_eq!(d.artifacts_for_context("compile").len(), 1);
        let test = d.artifacts_for_context("test");
        assert_eq!(test.len(), 2);
        assert!(test.iter().any(|a| a.file_name() == "lib-1.0-tests.jar"));
    }

    #[test]
    fn metadata_only_module() {
        let d = ModuleDescriptor::new(ModuleComponentId::new("org.example", "bom", "1.0"));
        assert!(d.is_metadata_only());
        assert_eq!(d.computed_packaging(), None);
    }
}

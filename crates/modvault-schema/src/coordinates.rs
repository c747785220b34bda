//! Module and artifact coordinates.

use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Error returned when a textual coordinate cannot be parsed.
#[derive(Debug, Error, PartialEq, Eq)]
#[error("Invalid module coordinate '{0}': expected group:module:version")]
pub struct CoordinateError(pub String);

/// A module without a version (`group:module`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ModuleId {
    /// Group (organisation) of the module.
    pub group: String,
    /// Module name.
    pub module: String,
}

impl ModuleId {
    /// Create a module id from its parts.
    pub fn new(group: impl Into<String>, module: impl Into<String>) -> Self {
        Self {
            group: group.into(),
            module: module.into(),
        }
    }
}

impl fmt::Display for ModuleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.group, self.module)
    }
}

/// A concrete module version (`group:module:version`).
///
/// This is the module coordinate every cache and verification record is
/// keyed by.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ModuleComponentId {
    /// Group (organisation) of the module.
    pub group: String,
    /// Module name.
    pub module: String,
    /// Version string, compared verbatim.
    pub version: String,
}

impl ModuleComponentId {
    /// Create a component id from its parts.
    pub fn new(
        group: impl Into<String>,
        module: impl Into<String>,
        version: impl Into<String>,
    ) -> Self {
        Self {
            group: group.into(),
            module: module.into(),
            version: version.into(),
        }
    }

    /// The versionless module this component belongs to.
    pub fn module_id(&self) -> ModuleId {
        ModuleId::new(&self.group, &self.module)
    }
}

impl fmt::Display for ModuleComponentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.group, self.module, self.version)
    }
}

impl FromStr for ModuleComponentId {
    type Err = CoordinateError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = s.trim().split(':');
        match (parts.next(), parts.next(), parts.next(), parts.next()) {
            (Some(g), Some(m), Some(v), None) if !g.is_empty() && !m.is_empty() && !v.is_empty() => {
                Ok(Self::new(g, m, v))
            }
            _ => Err(CoordinateError(s.to_string())),
        }
    }
}

/// The name part of an artifact: everything but the owning component.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ArtifactName {
    /// Base name, usually the module name.
    pub name: String,
    /// Artifact type (`jar`, `pom`, `module`, ...).
    #[serde(rename = "type")]
    pub kind: String,
    /// File extension without the leading dot. May be empty.
    pub extension: String,
    /// Optional classifier (`sources`, `javadoc`, ...).
    pub classifier: Option<String>,
}

impl ArtifactName {
    /// Create an artifact name from its parts.
    pub fn new(
        name: impl Into<String>,
        kind: impl Into<String>,
        extension: impl Into<String>,
        classifier: Option<String>,
    ) -> Self {
        Self {
            name: name.into(),
            kind: kind.into(),
            extension: extension.into(),
            classifier,
        }
    }
}

/// Identifies one file published by a module component.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ArtifactIdentifier {
    /// Component publishing the artifact.
    pub component: ModuleComponentId,
    /// Name, type, extension and classifier.
    pub name: ArtifactName,
}

impl ArtifactIdentifier {
    /// Create an artifact identifier.
    pub fn new(component: ModuleComponentId, name: ArtifactName) -> Self {
        Self { component, name }
    }

    /// File name as published: `name-version[-classifier][.extension]`.
    pub fn file_name(&self) -> String {
        let mut file = format!("{}-{}", self.name.name, self.component.version);
        if let Some(classifier) = &self.name.classifier {
            file.push('-');
            file.push_str(classifier);
        }
        if !self.name.extension.is_empty() {
            file.push('.');
            file.push_str(&self.name.extension);
        }
        file
    }
}

impl fmt::Display for ArtifactIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.file_name(), self.component)
    }
}

impl Ord for ArtifactIdentifier {
    /// Orders by component, then by file name. Remaining fields only break
    /// ties between artifacts that share a file name.
    fn cmp(&self, other: &Self) -> Ordering {
        self.component
            .cmp(&other.component)
            .then_with(|| self.file_name().cmp(&other.file_name()))
            .then_with(|| self.name.name.cmp(&other.name.name))
            .then_with(|| self.name.kind.cmp(&other.name.kind))
            .then_with(|| self.name.extension.cmp(&other.name.extension))
            .then_with(|| self.name.classifier.cmp(&other.name.classifier))
    }
}

impl PartialOrd for ArtifactIdentifier {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn jar(classifier: Option<&str>) -> ArtifactIdentifier {
        ArtifactIdentifier::new(
            ModuleComponentId::new("org.example", "lib", "1.0"),
            ArtifactName::new("lib", "jar", "jar", classifier.map(String::from)),
        )
    }

    #[test]
    fn parse_component_id() {
        let id: ModuleComponentId = "org.example:lib:1.0".parse().unwrap();
        assert_eq!(id, ModuleComponentId::new("org.example", "lib", "1.0"));
        assert_eq!(id.to_string(), "org.example:lib:1.0");
    }

    #[test]
    fn reject_malformed_coordinates() {
        assert!("org.example:lib".parse::<ModuleComponentId>().is_err());
        assert!("a:b:c:d".parse::<ModuleComponentId>().is_err());
        assert!("a::1.0".parse::<ModuleComponentId>().is_err());
    }

    #[test]
    fn file_names() {
        assert_eq!(jar(None).file_name(), "lib-1.0.jar");
        assert_eq!(jar(Some("sources")).file_name(), "lib-1.0-sources.jar");
    }

    #[test]
    fn artifacts_order_by_component_then_file() {
        let older = ArtifactIdentifier::new(
            ModuleComponentId::new("org.example", "lib", "0.9"),
            ArtifactName::new("lib", "jar", "jar", None),
        );
        let mut ids = vec![jar(Some("sources")), jar(None), older.clone()];
        ids.sort();
        assert_eq!(ids[0], older);
        // '-' sorts before '.'
        assert_eq!(ids[1], jar(Some("sources")));
        assert_eq!(ids[2], jar(None));
    }
}

//! Module repositories.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use modvault_schema::{ArtifactIdentifier, ArtifactName, DescriptorError, ModuleComponentId, ModuleDescriptor};
use thiserror::Error;

/// Extension of descriptor documents in a file repository.
pub const DESCRIPTOR_EXTENSION: &str = "module.json";
/// Extension appended to a file name for its detached signature.
pub const SIGNATURE_EXTENSION: &str = "asc";

/// Failures reading from a repository.
#[derive(Error, Debug)]
pub enum RepositoryError {
    /// A file exists but cannot be read.
    #[error("Failed to read {path}: {source}")]
    Io {
        /// File.
        path: PathBuf,
        /// Underlying error.
        source: io::Error,
    },

    /// A descriptor document does not parse.
    #[error("Invalid descriptor {path}: {source}")]
    Descriptor {
        /// Descriptor file.
        path: PathBuf,
        /// Parse error.
        source: DescriptorError,
    },

    /// A descriptor names a different module version than its location.
    #[error("Descriptor {path} describes {found}, expected {expected}")]
    Mismatch {
        /// Descriptor file.
        path: PathBuf,
        /// Version looked up.
        expected: ModuleComponentId,
        /// Version the document declares.
        found: ModuleComponentId,
    },
}

/// A descriptor as fetched, with the file it came from.
#[derive(Debug, Clone)]
pub struct FetchedDescriptor {
    /// Parsed descriptor.
    pub descriptor: ModuleDescriptor,
    /// Descriptor document.
    pub file: PathBuf,
}

impl FetchedDescriptor {
    /// The descriptor document itself, as an artifact of its component.
    pub fn artifact_id(&self) -> ArtifactIdentifier {
        descriptor_artifact(&self.descriptor.id)
    }
}

/// Coordinates of the descriptor document of `id`.
pub fn descriptor_artifact(id: &ModuleComponentId) -> ArtifactIdentifier {
    ArtifactIdentifier::new(id.clone(), ArtifactName::new(&id.module, "module", DESCRIPTOR_EXTENSION, None))
}

/// A source of module descriptors and files.
pub trait ModuleRepository: Send + Sync {
    /// Stable identifier used in cache keys.
    fn id(&self) -> &str;

    /// Display name, as declared in the build file.
    fn name(&self) -> &str;

    /// `Ok(None)` when the repository does not have the module.
    ///
    /// # Errors
    ///
    /// Fails when the descriptor exists but cannot be read.
    fn fetch_descriptor(&self, id: &ModuleComponentId) -> Result<Option<FetchedDescriptor>, RepositoryError>;

    /// Local path of a published file, if present.
    ///
    /// # Errors
    ///
    /// Fails on I/O errors other than absence.
    fn fetch_file(&self, component: &ModuleComponentId, file_name: &str) -> Result<Option<PathBuf>, RepositoryError>;

    /// Local path of `artifact`, if published.
    ///
    /// # Errors
    ///
    /// As [`Self::fetch_file`].
    fn fetch_artifact(&self, artifact: &ArtifactIdentifier) -> Result<Option<PathBuf>, RepositoryError> {
        self.fetch_file(&artifact.component, &artifact.file_name())
    }

    /// The detached signature published next to `file_name`.
    ///
    /// # Errors
    ///
    /// As [`Self::fetch_file`].
    fn fetch_signature(
        &self,
        component: &ModuleComponentId,
        file_name: &str,
    ) -> Result<Option<PathBuf>, RepositoryError> {
        self.fetch_file(component, &format!("{file_name}.{SIGNATURE_EXTENSION}"))
    }
}

/// A directory laid out as `<group as path>/<module>/<version>/<files>`.
#[derive(Debug, Clone)]
pub struct FileRepository {
    id: String,
    name: String,
    root: PathBuf,
}

impl FileRepository {
    /// Repository named `name` over `root`. Its id derives from the root path.
    pub fn new(name: impl Into<String>, root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        let id = blake3::hash(format!("file:{}", root.display()).as_bytes())
            .to_hex()
            .chars()
            .take(16)
            .collect();
        Self {
            id,
            name: name.into(),
            root,
        }
    }

    /// Root directory.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Directory holding the files of `id`.
    pub fn module_dir(&self, id: &ModuleComponentId) -> PathBuf {
        let mut dir = self.root.clone();
        for part in id.group.split('.') {
            dir.push(part);
        }
        dir.join(&id.module).join(&id.version)
    }
}

impl ModuleRepository for FileRepository {
    fn id(&self) -> &str {
        &self.id
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn fetch_descriptor(&self, id: &ModuleComponentId) -> Result<Option<FetchedDescriptor>, RepositoryError> {
        let path = self.module_dir(id).join(descriptor_artifact(id).file_name());
        let text = match fs::read_to_string(&path) {
            Ok(text) => text,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(source) => return Err(RepositoryError::Io { path, source }),
        };
        let descriptor = ModuleDescriptor::from_json(&text).map_err(|source| RepositoryError::Descriptor {
            path: path.clone(),
            source,
        })?;
        if descriptor.id != *id {
            return Err(RepositoryError::Mismatch {
                path,
                expected: id.clone(),
                found: descriptor.id,
            });
        }
        Ok(Some(FetchedDescriptor { descriptor, file: path }))
    }

    fn fetch_file(&self, component: &ModuleComponentId, file_name: &str) -> Result<Option<PathBuf>, RepositoryError> {
        let path = self.module_dir(component).join(file_name);
        match fs::metadata(&path) {
            Ok(meta) if meta.is_file() => Ok(Some(path)),
            Ok(_) => Ok(None),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(source) => Err(RepositoryError::Io { path, source }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn publish(root: &Path, json: &str, files: &[&str]) {
        let dir = root.join("org/example/lib/1.0");
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join("lib-1.0.module.json"), json).unwrap();
        for file in files {
            fs::write(dir.join(file), file.as_bytes()).unwrap();
        }
    }

    const LIB: &str = r#"{ "id": { "group": "org.example", "module": "lib", "version": "1.0" },
                           "artifacts": [ { "name": "lib" } ] }"#;

    #[test]
    fn fetches_descriptor_and_files() {
        let dir = TempDir::new().unwrap();
        publish(dir.path(), LIB, &["lib-1.0.jar", "lib-1.0.jar.asc"]);
        let repo = FileRepository::new("local", dir.path());
        let id = ModuleComponentId::new("org.example", "lib", "1.0");

        let fetched = repo.fetch_descriptor(&id).unwrap().unwrap();
        assert_eq!(fetched.descriptor.artifacts.len(), 1);
        assert_eq!(fetched.artifact_id().file_name(), "lib-1.0.module.json");

        let artifact = fetched.descriptor.artifacts_for_context("compile").into_iter().next().unwrap();
        assert!(repo.fetch_artifact(&artifact).unwrap().is_some());
        assert!(repo.fetch_signature(&id, "lib-1.0.jar").unwrap().is_some());
        assert!(repo.fetch_signature(&id, "lib-1.0.module.json").unwrap().is_none());
    }

    #[test]
    fn absent_module_is_none() {
        let dir = TempDir::new().unwrap();
        let repo = FileRepository::new("local", dir.path());
        let id = ModuleComponentId::new("org.example", "nope", "1.0");
        assert!(repo.fetch_descriptor(&id).unwrap().is_none());
    }

    #[test]
    fn mismatched_descriptor_is_an_error() {
        let dir = TempDir::new().unwrap();
        publish(dir.path(), LIB.replace("\"1.0\"", "\"2.0\"").as_str(), &[]);
        let repo = FileRepository::new("local", dir.path());
        let id = ModuleComponentId::new("org.example", "lib", "1.0");
        assert!(matches!(repo.fetch_descriptor(&id), Err(RepositoryError::Mismatch { .. })));
    }

    #[test]
    fn id_is_stable_per_root() {
        let a = FileRepository::new("one", "/repo/a");
        let b = FileRepository::new("two", "/repo/a");
        let c = FileRepository::new("one", "/repo/c");
        assert_eq!(a.id(), b.id());
        assert_ne!(a.id(), c.id());
        assert_eq!(a.id().len(), 16);
    }
}

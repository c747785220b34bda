//! Path-keyed file stores: descriptor payloads and downloaded files.

use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use modvault_schema::{ChecksumKind, DescriptorHash, ModuleComponentId, ModuleDescriptor};

use super::CacheError;

/// A file written to (or found in) a store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredResource {
    /// Absolute location.
    pub path: PathBuf,
    /// SHA-1 of the stored bytes.
    pub content_hash: DescriptorHash,
}

/// Stores files under relative paths below a base directory. Writes go to a
/// temp file in the target directory and are renamed into place.
#[derive(Debug, Clone)]
pub struct PathKeyedFileStore {
    base_dir: PathBuf,
}

impl PathKeyedFileStore {
    /// Store rooted at `base_dir`, created on first write.
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
        }
    }

    /// Root directory.
    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    /// Absolute path of `relative`.
    pub fn path_of(&self, relative: &str) -> PathBuf {
        self.base_dir.join(relative)
    }

    /// Read the bytes stored at `relative`; `None` if the file is gone.
    ///
    /// # Errors
    ///
    /// Any I/O error other than "not found".
    pub fn read(&self, relative: &str) -> io::Result<Option<Vec<u8>>> {
        match fs::read(self.path_of(relative)) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Atomically write `bytes` to `relative`.
    ///
    /// # Errors
    ///
    /// Fails if the directory cannot be created or the file written.
    pub fn put(&self, relative: &str, bytes: &[u8]) -> io::Result<StoredResource> {
        let target = self.path_of(relative);
        let dir = target.parent().unwrap_or(&self.base_dir);
        fs::create_dir_all(dir)?;
        let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
        tmp.write_all(bytes)?;
        tmp.persist(&target).map_err(|e| e.error)?;
        Ok(StoredResource {
            path: target,
            content_hash: DescriptorHash::of_bytes(bytes),
        })
    }

    /// Atomically copy `source` to `relative`.
    ///
    /// # Errors
    ///
    /// Fails if `source` cannot be read or the copy cannot be written.
    pub fn put_file(&self, relative: &str, source: &Path) -> io::Result<PathBuf> {
        let target = self.path_of(relative);
        let dir = target.parent().unwrap_or(&self.base_dir);
        fs::create_dir_all(dir)?;
        let tmp = tempfile::NamedTempFile::new_in(dir)?;
        fs::copy(source, tmp.path())?;
        tmp.persist(&target).map_err(|e| e.error)?;
        Ok(target)
    }
}

/// Keeps path segments inside their directory.
fn segment(s: &str) -> String {
    let cleaned: String = s
        .chars()
        .map(|c| if matches!(c, '/' | '\\' | ':') { '_' } else { c })
        .collect();
    if cleaned == "." || cleaned == ".." {
        cleaned.replace('.', "_")
    } else {
        cleaned
    }
}

/// Descriptor payloads at `<group>/<module>/<version>/<repository-id>/descriptor.bin`.
#[derive(Debug, Clone)]
pub struct ModuleDescriptorStore {
    files: PathKeyedFileStore,
}

impl ModuleDescriptorStore {
    /// Keep descriptors in `files`.
    pub fn new(files: PathKeyedFileStore) -> Self {
        Self { files }
    }

    /// Store path of the descriptor of `id` from `repository_id`.
    pub fn relative_path(repository_id: &str, id: &ModuleComponentId) -> String {
        format!(
            "{}/{}/{}/{}/descriptor.bin",
            segment(&id.group),
            segment(&id.module),
            segment(&id.version),
            segment(repository_id)
        )
    }

    /// Load a stored descriptor. A file deleted behind the cache's back is a
    /// miss, not an error.
    ///
    /// # Errors
    ///
    /// Fails on I/O errors or an undecodable payload.
    pub fn get(
        &self,
        repository_id: &str,
        id: &ModuleComponentId,
    ) -> Result<Option<ModuleDescriptor>, CacheError> {
        let relative = Self::relative_path(repository_id, id);
        let Some(bytes) = self
            .files
            .read(&relative)
            .map_err(|e| CacheError::io(self.files.path_of(&relative), e))?
        else {
            tracing::debug!("Stored descriptor for {id} in {repository_id} is gone");
            return Ok(None);
        };
        Ok(Some(ModuleDescriptor::from_bytes(&bytes)?))
    }

    /// Persist `descriptor` for `repository_id`.
    ///
    /// # Errors
    ///
    /// Fails on encoding or I/O errors.
    pub fn put(
        &self,
        repository_id: &str,
        descriptor: &ModuleDescriptor,
    ) -> Result<StoredResource, CacheError> {
        let relative = Self::relative_path(repository_id, &descriptor.id);
        let bytes = descriptor.to_bytes()?;
        self.files
            .put(&relative, &bytes)
            .map_err(|e| CacheError::io(self.files.path_of(&relative), e))
    }
}

/// Downloaded files at `<group>/<module>/<version>/<sha1>/<file-name>`.
#[derive(Debug, Clone)]
pub struct ArtifactFileStore {
    files: PathKeyedFileStore,
}

impl ArtifactFileStore {
    /// Keep downloaded files in `files`.
    pub fn new(files: PathKeyedFileStore) -> Self {
        Self { files }
    }

    /// Root directory.
    pub fn base_dir(&self) -> &Path {
        self.files.base_dir()
    }

    /// Copy `source` into the store, keyed by its SHA-1. Returns the stored path.
    ///
    /// # Errors
    ///
    /// Fails if `source` cannot be hashed or copied.
    pub fn put(
        &self,
        component: &ModuleComponentId,
        file_name: &str,
        source: &Path,
    ) -> Result<PathBuf, CacheError> {
        let sha1 = ChecksumKind::Sha1
            .hash_file(source)
            .map_err(|e| CacheError::io(source, e))?;
        let relative = format!(
            "{}/{}/{}/{}/{}",
            segment(&component.group),
            segment(&component.module),
            segment(&component.version),
            sha1,
            segment(file_name)
        );
        let target = self.files.path_of(&relative);
        if target.exists() {
            return Ok(target);
        }
        self.files
            .put_file(&relative, source)
            .map_err(|e| CacheError::io(target, e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn descriptor() -> ModuleDescriptor {
        ModuleDescriptor::new(ModuleComponentId::new("org.example", "lib", "1.0"))
    }

    #[test]
    fn descriptor_path_pattern() {
        let id = ModuleComponentId::new("org.example", "lib", "1.0");
        assert_eq!(
            ModuleDescriptorStore::relative_path("abc123", &id),
            "org.example/lib/1.0/abc123/descriptor.bin"
        );
        let odd = ModuleComponentId::new("a/b", "..", "1:0");
        assert_eq!(
            ModuleDescriptorStore::relative_path("r", &odd),
            "a_b/__/1_0/r/descriptor.bin"
        );
    }

    #[test]
    fn put_then_get() {
        let dir = tempfile::tempdir().unwrap();
        let store = ModuleDescriptorStore::new(PathKeyedFileStore::new(dir.path()));
        let stored = store.put("repo", &descriptor()).unwrap();
        assert!(stored.path.exists());
        assert_eq!(
            stored.content_hash,
            DescriptorHash::of_bytes(&descriptor().to_bytes().unwrap())
        );
        let loaded = store.get("repo", &descriptor().id).unwrap();
        assert_eq!(loaded, Some(descriptor()));
    }

    #[test]
    fn deleted_payload_is_a_miss() {
        let dir = tempfile::tempdir().unwrap();
        let store = ModuleDescriptorStore::new(PathKeyedFileStore::new(dir.path()));
        let stored = store.put("repo", &descriptor()).unwrap();
        fs::remove_file(stored.path).unwrap();
        assert_eq!(store.get("repo", &descriptor().id).unwrap(), None);
    }

    #[test]
    fn artifact_store_is_content_addressed() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("lib-1.0.jar");
        fs::write(&source, b"jar bytes").unwrap();
        let store = ArtifactFileStore::new(PathKeyedFileStore::new(dir.path().join("files")));
        let id = ModuleComponentId::new("org.example", "lib", "1.0");
        let stored = store.put(&id, "lib-1.0.jar", &source).unwrap();
        let sha1 = ChecksumKind::Sha1.digest(b"jar bytes");
        assert!(stored.ends_with(format!("org.example/lib/1.0/{sha1}/lib-1.0.jar")));
        assert_eq!(fs::read(&stored).unwrap(), b"jar bytes");
        assert_eq!(store.put(&id, "lib-1.0.jar", &source).unwrap(), stored);
    }
}

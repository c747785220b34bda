//! Keyrings exported next to the verification manifest.

use std::fmt::Write as _;
use std::fs;
use std::io::Write as _;
use std::path::{Path, PathBuf};

use tempfile::NamedTempFile;

use super::KeyError;
use crate::openpgp::armor::{self, ArmorKind};
use crate::openpgp::{KeyId, PublicKeyRing, read_keyrings};

/// Armored export file name.
pub const ASCII_KEYRING_FILE: &str = "ascii-armored-keyrings";
/// Binary export file name.
pub const BINARY_KEYRING_FILE: &str = "binary-keyrings";

/// Which keyring files to read and write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyringFormat {
    /// ASCII-armored file only.
    Text,
    /// Binary file only.
    Binary,
    /// Both files.
    Both,
}

impl KeyringFormat {
    /// `text` selects the armored file, `gpg` the binary one; anything else both.
    pub fn from_config(value: Option<&str>) -> Self {
        match value {
            Some("text") => Self::Text,
            Some("gpg") => Self::Binary,
            _ => Self::Both,
        }
    }

    /// Whether the armored file is selected.
    pub fn writes_ascii(self) -> bool {
        matches!(self, Self::Text | Self::Both)
    }

    /// Whether the binary file is selected.
    pub fn writes_binary(self) -> bool {
        matches!(self, Self::Binary | Self::Both)
    }
}

/// Locations of an armored and a binary keyring export.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyringFiles {
    /// ASCII-armored keyring with `pub`/`uid`/`sub` headers.
    pub ascii: PathBuf,
    /// Concatenated binary key rings.
    pub binary: PathBuf,
}

impl KeyringFiles {
    /// The regular export files in `dir`.
    pub fn in_dir(dir: &Path) -> Self {
        Self {
            ascii: dir.join(ASCII_KEYRING_FILE),
            binary: dir.join(BINARY_KEYRING_FILE),
        }
    }

    fn selected(&self, format: KeyringFormat) -> Vec<&Path> {
        let mut files = Vec::with_capacity(2);
        if format.writes_ascii() {
            files.push(self.ascii.as_path());
        }
        if format.writes_binary() {
            files.push(self.binary.as_path());
        }
        files
    }
}

/// Keys shipped with the build tree, one ring per primary key.
#[derive(Debug, Clone, Default)]
pub struct BuildTreeDefinedKeys {
    rings: Vec<PublicKeyRing>,
}

impl BuildTreeDefinedKeys {
    /// Merge `rings` in order.
    pub fn from_rings(rings: Vec<PublicKeyRing>) -> Self {
        let mut keys = Self::default();
        for ring in rings {
            keys.merge(ring);
        }
        keys
    }

    /// Read whichever of `files` `format` selects. Absent files contribute
    /// nothing.
    ///
    /// # Errors
    ///
    /// Fails when a present file cannot be read or parsed.
    pub fn load(files: &KeyringFiles, format: KeyringFormat) -> Result<Self, KeyError> {
        let mut keys = Self::default();
        for path in files.selected(format) {
            let data = match fs::read(path) {
                Ok(data) => data,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(source) => {
                    return Err(KeyError::Io {
                        path: path.to_path_buf(),
                        source,
                    });
                }
            };
            let rings = read_keyrings(&data)?;
            tracing::debug!("Loaded {} key rings from {}", rings.len(), path.display());
            for ring in rings {
                keys.merge(ring);
            }
        }
        Ok(keys)
    }

    /// Rings in insertion order.
    pub fn rings(&self) -> &[PublicKeyRing] {
        &self.rings
    }

    /// Number of rings.
    pub fn len(&self) -> usize {
        self.rings.len()
    }

    /// Whether there are no rings.
    pub fn is_empty(&self) -> bool {
        self.rings.is_empty()
    }

    /// The ring holding `id` as primary key or subkey.
    pub fn find(&self, id: &KeyId) -> Option<&PublicKeyRing> {
        self.rings.iter().find(|r| r.find_key(id).is_some())
    }

    /// Add `ring`. For a primary key already present, the ring with more
    /// keys is kept.
    pub fn merge(&mut self, ring: PublicKeyRing) {
        match self.rings.iter_mut().find(|r| r.key_id() == ring.key_id()) {
            Some(existing) if ring.size() > existing.size() => *existing = ring,
            Some(_) => {}
            None => self.rings.push(ring),
        }
    }

    /// Write whichever of `files` `format` selects, rings ordered by key id.
    ///
    /// # Errors
    ///
    /// Fails when a file cannot be written.
    pub fn export(&self, files: &KeyringFiles, format: KeyringFormat) -> Result<Vec<PathBuf>, KeyError> {
        let mut rings: Vec<&PublicKeyRing> = self.rings.iter().collect();
        rings.sort_by_key(|r| r.key_id());

        let mut written = Vec::new();
        if format.writes_ascii() {
            let mut text = String::new();
            for ring in &rings {
                text.push_str(&describe(ring));
                text.push_str(&armor::encode(ArmorKind::PublicKey, ring.encoded()));
                text.push('\n');
            }
            written.push(write_atomic(&files.ascii, text.as_bytes())?);
        }
        if format.writes_binary() {
            let binary: Vec<u8> = rings.iter().flat_map(|r| r.encoded().iter().copied()).collect();
            written.push(write_atomic(&files.binary, &binary)?);
        }
        Ok(written)
    }
}

/// `pub`/`uid`/`sub` header lines for the armored export.
fn describe(ring: &PublicKeyRing) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "pub    {}", ring.primary().key_id_hex());
    for uid in ring.user_ids() {
        let _ = writeln!(out, "uid    {uid}");
    }
    let subkeys: Vec<_> = ring.keys().iter().filter(|k| k.is_subkey).collect();
    if !subkeys.is_empty() {
        out.push('\n');
        for sub in subkeys {
            let _ = writeln!(out, "sub    {}", sub.key_id_hex());
        }
    }
    out
}

fn write_atomic(path: &Path, data: &[u8]) -> Result<PathBuf, KeyError> {
    let io_err = |source| KeyError::Io {
        path: path.to_path_buf(),
        source,
    };
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(dir).map_err(io_err)?;
    let mut tmp = NamedTempFile::new_in(dir).map_err(io_err)?;
    tmp.write_all(data).map_err(io_err)?;
    tmp.persist(path).map_err(|e| io_err(e.error))?;
    Ok(path.to_path_buf())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::openpgp::testkit;
    use tempfile::TempDir;

    #[test]
    fn format_selection() {
        assert_eq!(KeyringFormat::from_config(Some("text")), KeyringFormat::Text);
        assert_eq!(KeyringFormat::from_config(Some("gpg")), KeyringFormat::Binary);
        assert_eq!(KeyringFormat::from_config(Some("armored")), KeyringFormat::Both);
        assert_eq!(KeyringFormat::from_config(None), KeyringFormat::Both);
    }

    #[test]
    fn larger_ring_wins() {
        let small = testkit::key(41, "Eve");
        let large = testkit::key_with_subkey(41, "Eve");
        let mut keys = BuildTreeDefinedKeys::from_rings(vec![large.ring.clone()]);
        keys.merge(small.ring.clone());
        assert_eq!(keys.len(), 1);
        assert_eq!(keys.rings()[0].size(), 2);

        let mut keys = BuildTreeDefinedKeys::from_rings(vec![small.ring.clone()]);
        keys.merge(large.ring.clone());
        assert_eq!(keys.rings()[0].size(), 2);
    }

    #[test]
    fn export_then_load_each_format() {
        let a = testkit::key_with_subkey(42, "Frank <frank@example.com>");
        let b = testkit::key(43, "Grace");
        let keys = BuildTreeDefinedKeys::from_rings(vec![a.ring.clone(), b.ring.clone()]);

        for format in [KeyringFormat::Text, KeyringFormat::Binary, KeyringFormat::Both] {
            let dir = TempDir::new().unwrap();
            let files = KeyringFiles::in_dir(dir.path());
            let written = keys.export(&files, format).unwrap();
            assert_eq!(written.len(), if format == KeyringFormat::Both { 2 } else { 1 });

            let loaded = BuildTreeDefinedKeys::load(&files, format).unwrap();
            assert_eq!(loaded.len(), 2);
            assert!(loaded.find(&KeyId::Long(a.ring.key_id())).is_some());
            assert!(loaded.find(&KeyId::Long(b.ring.key_id())).is_some());
        }
    }

    #[test]
    fn ascii_export_has_headers() {
        let a = testkit::key_with_subkey(44, "Heidi");
        let dir = TempDir::new().unwrap();
        BuildTreeDefinedKeys::from_rings(vec![a.ring.clone()])
            .export(&KeyringFiles::in_dir(dir.path()), KeyringFormat::Text)
            .unwrap();
        let text = fs::read_to_string(dir.path().join(ASCII_KEYRING_FILE)).unwrap();
        assert!(text.starts_with(&format!("pub    {}\nuid    Heidi\n", a.ring.primary().key_id_hex())));
        assert!(text.contains("\nsub    "));
        assert!(text.contains("-----BEGIN PGP PUBLIC KEY BLOCK-----"));
    }

    #[test]
    fn missing_files_load_empty() {
        let dir = TempDir::new().unwrap();
        let files = KeyringFiles::in_dir(dir.path());
        assert!(BuildTreeDefinedKeys::load(&files, KeyringFormat::Both).unwrap().is_empty());
    }

    #[test]
    fn export_creates_missing_directory() {
        let a = testkit::key(45, "Ivan");
        let dir = TempDir::new().unwrap();
        let files = KeyringFiles {
            ascii: dir.path().join("nested/rings.keys"),
            binary: dir.path().join("nested/rings.gpg"),
        };
        let written = BuildTreeDefinedKeys::from_rings(vec![a.ring.clone()])
            .export(&files, KeyringFormat::Binary)
            .unwrap();
        assert_eq!(written, [files.binary.clone()]);
        assert!(!files.ascii.exists());
        assert_eq!(fs::read(&files.binary).unwrap(), a.ring.encoded());
    }
}

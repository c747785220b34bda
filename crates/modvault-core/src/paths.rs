//! Well-known locations under the modvault home and next to a manifest.

use dirs::home_dir;
use std::path::{Path, PathBuf};

use crate::keys::KeyringFiles;

/// Returns the modvault home directory, or None if the user's home cannot be resolved.
pub fn try_modvault_home() -> Option<PathBuf> {
    if let Ok(val) = std::env::var("MODVAULT_HOME") {
        return Some(PathBuf::from(val));
    }
    home_dir().map(|h| h.join(".modvault"))
}

/// Module cache root: ~/.modvault/caches/modules
pub fn modules_cache_dir(home: &Path) -> PathBuf {
    home.join("caches").join("modules")
}

/// Descriptor store root inside a module cache directory.
pub fn descriptor_store_dir(cache_dir: &Path) -> PathBuf {
    cache_dir.join("descriptors")
}

/// Downloaded artifact files inside a module cache directory.
pub fn artifact_store_dir(cache_dir: &Path) -> PathBuf {
    cache_dir.join("files")
}

/// Verification manifest of a workspace: <workspace>/modvault/verification-metadata.xml
pub fn verification_file(workspace: &Path) -> PathBuf {
    workspace.join("modvault").join("verification-metadata.xml")
}

fn base_name(verification_file: &Path) -> String {
    verification_file
        .file_stem()
        .map_or_else(|| "verification-metadata".into(), |s| s.to_string_lossy().into_owned())
}

/// Dry-run sibling of a manifest: `<base>.dryrun.xml` in the same directory.
pub fn dry_run_file(verification_file: &Path) -> PathBuf {
    verification_file.with_file_name(format!("{}.dryrun.xml", base_name(verification_file)))
}

/// Directory holding exported keyrings (next to the manifest).
pub fn keyrings_dir(verification_file: &Path) -> PathBuf {
    verification_file
        .parent()
        .map_or_else(|| PathBuf::from("."), Path::to_path_buf)
}

/// Exported keyrings of a manifest.
pub fn keyring_files(verification_file: &Path) -> KeyringFiles {
    KeyringFiles::in_dir(&keyrings_dir(verification_file))
}

/// Dry-run keyrings: `<base>.dryrun.keys` and `<base>.dryrun.gpg` next to the manifest.
pub fn dry_run_keyring_files(verification_file: &Path) -> KeyringFiles {
    let dir = keyrings_dir(verification_file);
    let base = base_name(verification_file);
    KeyringFiles {
        ascii: dir.join(format!("{base}.dryrun.keys")),
        binary: dir.join(format!("{base}.dryrun.gpg")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dry_run_file_is_sibling() {
        let manifest = Path::new("/ws/modvault/verification-metadata.xml");
        assert_eq!(
            dry_run_file(manifest),
            Path::new("/ws/modvault/verification-metadata.dryrun.xml")
        );
        assert_eq!(keyrings_dir(manifest), Path::new("/ws/modvault"));
    }

    #[test]
    fn dry_run_keyrings_do_not_clobber_exports() {
        let manifest = Path::new("/ws/modvault/verification-metadata.xml");
        let regular = keyring_files(manifest);
        assert_eq!(regular.ascii, Path::new("/ws/modvault/ascii-armored-keyrings"));
        assert_eq!(regular.binary, Path::new("/ws/modvault/binary-keyrings"));

        let dry_run = dry_run_keyring_files(manifest);
        assert_eq!(dry_run.ascii, Path::new("/ws/modvault/verification-metadata.dryrun.keys"));
        assert_eq!(dry_run.binary, Path::new("/ws/modvault/verification-metadata.dryrun.gpg"));
    }
}

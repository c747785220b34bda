//! Checksum kinds and the descriptor hash.

use std::fmt;
use std::fs::File;
use std::io::{self, Read};
use std::path::Path;
use std::str::FromStr;

use num_bigint::{BigInt, Sign};
use serde::{Deserialize, Serialize};
use sha1::Sha1;
use sha2::{Digest, Sha256, Sha512};
use thiserror::Error;

/// Error returned for a checksum kind name that is not supported.
#[derive(Debug, Error, PartialEq, Eq)]
#[error("Unknown checksum kind '{0}'")]
pub struct UnknownChecksumKind(pub String);

/// Checksum algorithms a verification manifest can record.
///
/// The declaration order is the order entries of one artifact are written
/// in, so `Ord` is meaningful.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChecksumKind {
    /// MD5 (insecure, accepted for legacy repositories).
    Md5,
    /// SHA-1 (insecure).
    Sha1,
    /// SHA-256.
    Sha256,
    /// SHA-512.
    Sha512,
}

impl ChecksumKind {
    /// Every kind, weakest first.
    pub const ALL: [ChecksumKind; 4] = [Self::Md5, Self::Sha1, Self::Sha256, Self::Sha512];

    /// Lower-case name as used in manifests and on the command line.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Md5 => "md5",
            Self::Sha1 => "sha1",
            Self::Sha256 => "sha256",
            Self::Sha512 => "sha512",
        }
    }

    /// Whether the algorithm is strong enough to be the only fallback.
    pub fn is_secure(self) -> bool {
        matches!(self, Self::Sha256 | Self::Sha512)
    }

    /// Hex digest of an in-memory buffer.
    pub fn digest(self, bytes: &[u8]) -> String {
        match self {
            Self::Md5 => hex::encode(md5::Md5::digest(bytes)),
            Self::Sha1 => hex::encode(Sha1::digest(bytes)),
            Self::Sha256 => hex::encode(Sha256::digest(bytes)),
            Self::Sha512 => hex::encode(Sha512::digest(bytes)),
        }
    }

    /// Hex digest of a file, streamed in 64 KiB blocks.
    ///
    /// # Errors
    ///
    /// Returns any I/O error raised while opening or reading `path`.
    pub fn hash_file(self, path: &Path) -> io::Result<String> {
        let file = File::open(path)?;
        match self {
            Self::Md5 => hash_reader::<md5::Md5>(file),
            Self::Sha1 => hash_reader::<Sha1>(file),
            Self::Sha256 => hash_reader::<Sha256>(file),
            Self::Sha512 => hash_reader::<Sha512>(file),
        }
    }
}

fn hash_reader<D: Digest>(mut reader: impl Read) -> io::Result<String> {
    let mut hasher = D::new();
    let mut buf = vec![0u8; 64 * 1024];
    loop {
        let n = reader.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

impl fmt::Display for ChecksumKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ChecksumKind {
    type Err = UnknownChecksumKind;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "md5" => Ok(Self::Md5),
            "sha1" => Ok(Self::Sha1),
            "sha256" => Ok(Self::Sha256),
            "sha512" => Ok(Self::Sha512),
            _ => Err(UnknownChecksumKind(s.to_string())),
        }
    }
}

/// Content hash of a stored module descriptor.
///
/// Held as a signed big integer built from the SHA-1 of the stored bytes and
/// persisted as its big-endian two's-complement encoding. A zero hash marks
/// an entry without a descriptor (missing module).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct DescriptorHash(BigInt);

impl DescriptorHash {
    /// The zero hash.
    pub fn zero() -> Self {
        Self(BigInt::default())
    }

    /// Hash of `bytes`: SHA-1, read as a positive integer.
    pub fn of_bytes(bytes: &[u8]) -> Self {
        Self::from_sha1(&Sha1::digest(bytes))
    }

    /// Wrap an existing SHA-1 digest.
    pub fn from_sha1(digest: &[u8]) -> Self {
        Self(BigInt::from_bytes_be(Sign::Plus, digest))
    }

    /// Decode the two's-complement form written by [`DescriptorHash::to_bytes`].
    pub fn from_bytes(bytes: &[u8]) -> Self {
        Self(BigInt::from_signed_bytes_be(bytes))
    }

    /// Big-endian two's-complement bytes.
    pub fn to_bytes(&self) -> Vec<u8> {
        self.0.to_signed_bytes_be()
    }

    /// Whether this is the zero hash.
    pub fn is_zero(&self) -> bool {
        self.0.sign() == Sign::NoSign
    }
}

impl fmt::Display for DescriptorHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0.to_str_radix(16))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_digests() {
        assert_eq!(
            ChecksumKind::Sha256.digest(b"abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
        assert_eq!(
            ChecksumKind::Sha1.digest(b"abc"),
            "a9993e364706816aba3e25717850c26c9cd0d89d"
        );
        assert_eq!(
            ChecksumKind::Md5.digest(b"abc"),
            "900150983cd24fb0d6963f7d28e17f72"
        );
    }

    #[test]
    fn file_hash_matches_buffer_hash() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.bin");
        let data = vec![7u8; 200_000];
        std::fs::write(&path, &data).unwrap();
        for kind in ChecksumKind::ALL {
            assert_eq!(kind.hash_file(&path).unwrap(), kind.digest(&data));
        }
    }

    #[test]
    fn parse_kinds() {
        assert_eq!("SHA256".parse::<ChecksumKind>(), Ok(ChecksumKind::Sha256));
        assert!("pgp".parse::<ChecksumKind>().is_err());
        assert!(ChecksumKind::Sha512.is_secure());
        assert!(!ChecksumKind::Sha1.is_secure());
    }

    #[test]
    fn descriptor_hash_is_positive() {
        // A digest with the high bit set must not turn negative.
        let hash = DescriptorHash::from_sha1(&[0xff; 20]);
        let bytes = hash.to_bytes();
        assert_eq!(bytes.len(), 21);
        assert_eq!(bytes[0], 0);
        assert_eq!(DescriptorHash::from_bytes(&bytes), hash);
    }

    #[test]
    fn zero_hash() {
        let zero = DescriptorHash::zero();
        assert!(zero.is_zero());
        assert_eq!(DescriptorHash::from_bytes(&zero.to_bytes()), zero);
        assert!(!DescriptorHash::of_bytes(b"descriptor").is_zero());
    }
}

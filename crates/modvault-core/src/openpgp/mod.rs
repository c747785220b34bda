//! Just enough OpenPGP to check detached signatures and export key rings.
//!
//! Supported: v4 public keys (RSA, Ed25519 in both the legacy EdDSA and the
//! native encoding), v4 binary and text document signatures, ASCII armor.

pub mod armor;
pub mod key;
pub mod keyring;
pub mod packet;
pub mod signature;

#[cfg(test)]
pub(crate) mod testkit;

use std::fmt;

use thiserror::Error;

pub use key::{KeyMaterial, PublicKey};
pub use keyring::{PublicKeyRing, read_keyrings};
pub use signature::{Signature, read_signatures};

/// Failures parsing or checking OpenPGP data.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum PgpError {
    /// Truncated or inconsistent packets.
    #[error("Malformed OpenPGP data: {0}")]
    Malformed(String),

    /// Valid OpenPGP this module does not handle.
    #[error("Unsupported OpenPGP feature: {0}")]
    Unsupported(String),

    /// A well-formed signature that does not match the data.
    #[error("Signature does not match")]
    BadSignature,

    /// Bad armor framing, base64 or checksum.
    #[error("Invalid ASCII armor: {0}")]
    Armor(String),
}

impl PgpError {
    pub(crate) fn malformed(msg: impl fmt::Display) -> Self {
        Self::Malformed(msg.to_string())
    }
}

/// A key reference as written in manifests: a 64-bit long id (16 hex
/// digits) or a v4 fingerprint (40 hex digits).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum KeyId {
    /// Low 64 bits of a fingerprint.
    Long(u64),
    /// Full v4 fingerprint (20 bytes).
    Fingerprint(Vec<u8>),
}

impl KeyId {
    /// Parse hex, with or without a `0x` prefix. Up to 16 digits is a long
    /// id, anything longer a fingerprint.
    pub fn parse(s: &str) -> Option<Self> {
        let s = s.trim();
        let s = s.strip_prefix("0x").unwrap_or(s);
        if s.len() <= 16 {
            u64::from_str_radix(s, 16).ok().map(Self::Long)
        } else {
            hex::decode(s).ok().map(Self::Fingerprint)
        }
    }

    /// The long id; for fingerprints, their low 64 bits.
    pub fn long_id(&self) -> u64 {
        match self {
            Self::Long(id) => *id,
            Self::Fingerprint(fp) => long_id_of(fp),
        }
    }
}

impl fmt::Display for KeyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Long(id) => write!(f, "{id:016X}"),
            Self::Fingerprint(fp) => f.write_str(&hex::encode_upper(fp)),
        }
    }
}

pub(crate) fn long_id_of(fingerprint: &[u8]) -> u64 {
    let start = fingerprint.len().saturating_sub(8);
    fingerprint[start..]
        .iter()
        .fold(0u64, |acc, b| (acc << 8) | u64::from(*b))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_key_ids() {
        assert_eq!(KeyId::parse("0x00000000DEADBEEF"), Some(KeyId::Long(0xDEAD_BEEF)));
        let fp = "0123456789ABCDEF0123456789ABCDEF01234567";
        let id = KeyId::parse(fp).unwrap();
        assert_eq!(id.to_string(), fp);
        assert_eq!(id.long_id(), 0x89AB_CDEF_0123_4567);
        assert_eq!(KeyId::parse("not-hex"), None);
    }
}

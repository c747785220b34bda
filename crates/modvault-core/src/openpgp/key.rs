//! Public key packets and v4 fingerprints.

use sha1::{Digest, Sha1};

use super::packet::{read_mpi, take, write_mpi};
use super::{PgpError, long_id_of};

/// RSA (encrypt or sign).
pub const RSA: u8 = 1;
/// RSA sign-only.
pub const RSA_SIGN_ONLY: u8 = 3;
/// EdDSA with a curve OID, as written by GnuPG.
pub const EDDSA_LEGACY: u8 = 22;
/// Native Ed25519.
pub const ED25519: u8 = 27;

/// DER body of the Ed25519 curve OID 1.3.6.1.4.1.11591.15.1.
pub const ED25519_OID: &[u8] = &[0x2b, 0x06, 0x01, 0x04, 0x01, 0xda, 0x47, 0x0f, 0x01];

/// Algorithm-specific public parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeyMaterial {
    /// RSA modulus and exponent, big-endian.
    Rsa {
        /// Modulus.
        n: Vec<u8>,
        /// Public exponent.
        e: Vec<u8>,
    },
    /// Compressed Ed25519 point.
    Ed25519([u8; 32]),
    /// Parsed but not usable for verification here.
    Other,
}

/// A v4 primary key or subkey.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublicKey {
    /// Public key algorithm id.
    pub algorithm: u8,
    /// Creation time, seconds since the epoch.
    pub created: u32,
    /// Public parameters.
    pub material: KeyMaterial,
    /// v4 fingerprint.
    pub fingerprint: Vec<u8>,
    /// Low 64 bits of the fingerprint.
    pub key_id: u64,
    /// Whether this came from a subkey packet.
    pub is_subkey: bool,
}

impl PublicKey {
    /// Parse a public key or subkey packet body.
    ///
    /// # Errors
    ///
    /// Non-v4 keys are [`PgpError::Unsupported`]; truncated bodies are
    /// [`PgpError::Malformed`].
    pub fn parse(body: &[u8], is_subkey: bool) -> Result<Self, PgpError> {
        let mut cursor = body;
        let version = take(&mut cursor, 1)?[0];
        if version != 4 {
            return Err(PgpError::Unsupported(format!("version {version} keys")));
        }
        let created = u32::from_be_bytes(
            take(&mut cursor, 4)?
                .try_into()
                .map_err(|_| PgpError::malformed("creation time"))?,
        );
        let algorithm = take(&mut cursor, 1)?[0];
        let material = match algorithm {
            RSA | 2 | RSA_SIGN_ONLY => {
                let n = read_mpi(&mut cursor)?.to_vec();
                let e = read_mpi(&mut cursor)?.to_vec();
                KeyMaterial::Rsa { n, e }
            }
            EDDSA_LEGACY => {
                let oid_len = usize::from(take(&mut cursor, 1)?[0]);
                let oid = take(&mut cursor, oid_len)?;
                let point = read_mpi(&mut cursor)?;
                match (oid == ED25519_OID, point.split_first()) {
                    (true, Some((&0x40, rest))) if rest.len() == 32 => {
                        KeyMaterial::Ed25519(to_array(rest)?)
                    }
                    _ => KeyMaterial::Other,
                }
            }
            ED25519 => KeyMaterial::Ed25519(to_array(take(&mut cursor, 32)?)?),
            _ => KeyMaterial::Other,
        };

        let fingerprint = v4_fingerprint(body);
        Ok(Self {
            algorithm,
            created,
            material,
            key_id: long_id_of(&fingerprint),
            fingerprint,
            is_subkey,
        })
    }

    /// Long id as 16 uppercase hex digits.
    pub fn key_id_hex(&self) -> String {
        format!("{:016X}", self.key_id)
    }

    /// Fingerprint as uppercase hex.
    pub fn fingerprint_hex(&self) -> String {
        hex::encode_upper(&self.fingerprint)
    }
}

/// SHA-1 over `0x99 || u16 length || body`.
pub fn v4_fingerprint(body: &[u8]) -> Vec<u8> {
    let mut hasher = Sha1::new();
    hasher.update([0x99]);
    hasher.update((body.len() as u16).to_be_bytes());
    hasher.update(body);
    hasher.finalize().to_vec()
}

/// Body of a v4 legacy-EdDSA Ed25519 key.
pub fn ed25519_key_body(created: u32, point: &[u8; 32]) -> Vec<u8> {
    let mut body = vec![4];
    body.extend_from_slice(&created.to_be_bytes());
    body.push(EDDSA_LEGACY);
    body.push(ED25519_OID.len() as u8);
    body.extend_from_slice(ED25519_OID);
    let mut prefixed = Vec::with_capacity(33);
    prefixed.push(0x40);
    prefixed.extend_from_slice(point);
    write_mpi(&mut body, &prefixed);
    body
}

fn to_array(bytes: &[u8]) -> Result<[u8; 32], PgpError> {
    bytes
        .try_into()
        .map_err(|_| PgpError::malformed("expected a 32 byte key"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ed25519_key_round_trip() {
        let point = [7u8; 32];
        let body = ed25519_key_body(1_600_000_000, &point);
        let key = PublicKey::parse(&body, false).unwrap();
        assert_eq!(key.algorithm, EDDSA_LEGACY);
        assert_eq!(key.created, 1_600_000_000);
        assert_eq!(key.material, KeyMaterial::Ed25519(point));
        assert_eq!(key.fingerprint.len(), 20);
        assert_eq!(key.key_id_hex(), key.fingerprint_hex()[24..]);
    }

    #[test]
    fn rsa_key_material() {
        let mut body = vec![4, 0, 0, 0, 1, RSA];
        write_mpi(&mut body, &[0xc5; 256]);
        write_mpi(&mut body, &[0x01, 0x00, 0x01]);
        let key = PublicKey::parse(&body, true).unwrap();
        assert!(key.is_subkey);
        match key.material {
            KeyMaterial::Rsa { n, e } => {
                assert_eq!(n.len(), 256);
                assert_eq!(e, vec![0x01, 0x00, 0x01]);
            }
            other => panic!("unexpected material {other:?}"),
        }
    }

    #[test]
    fn v3_keys_are_unsupported() {
        assert!(matches!(
            PublicKey::parse(&[3, 0, 0, 0, 0], false),
            Err(PgpError::Unsupported(_))
        ));
    }
}

//! v4 document signatures (RFC 4880 section 5.2).

use ed25519_dalek::Verifier;
use rsa::traits::PublicKeyParts;
use rsa::{BigUint, Pkcs1v15Sign, RsaPublicKey};
use sha1::Sha1;
use sha2::{Digest, Sha224, Sha256, Sha384, Sha512};

use super::key::{ED25519, KeyMaterial, PublicKey};
use super::packet::{self, read_mpi, take};
use super::{KeyId, PgpError, armor, long_id_of};

/// Signature over binary data.
pub const BINARY_DOCUMENT: u8 = 0x00;
/// Signature over text with canonical line endings.
pub const TEXT_DOCUMENT: u8 = 0x01;

/// SHA-1 hash algorithm id.
pub const HASH_SHA1: u8 = 2;
/// SHA-256 hash algorithm id.
pub const HASH_SHA256: u8 = 8;
/// SHA-384 hash algorithm id.
pub const HASH_SHA384: u8 = 9;
/// SHA-512 hash algorithm id.
pub const HASH_SHA512: u8 = 10;
/// SHA-224 hash algorithm id.
pub const HASH_SHA224: u8 = 11;

const SUBPACKET_CREATION_TIME: u8 = 2;
const SUBPACKET_ISSUER: u8 = 16;
const SUBPACKET_ISSUER_FINGERPRINT: u8 = 33;

/// A parsed v4 signature packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Signature {
    /// [`BINARY_DOCUMENT`] or [`TEXT_DOCUMENT`] for detached signatures.
    pub sig_type: u8,
    /// Public key algorithm id.
    pub algorithm: u8,
    /// Hash algorithm id.
    pub hash_algorithm: u8,
    /// Creation time subpacket, seconds since the epoch.
    pub created: Option<u32>,
    /// Issuer subpacket.
    pub issuer: Option<u64>,
    /// Issuer fingerprint subpacket.
    pub issuer_fingerprint: Option<Vec<u8>>,
    hashed_area: Vec<u8>,
    digest_prefix: [u8; 2],
    values: Vec<Vec<u8>>,
}

impl Signature {
    /// Parse a signature packet body.
    ///
    /// # Errors
    ///
    /// Non-v4 signatures are [`PgpError::Unsupported`]; truncated bodies are
    /// [`PgpError::Malformed`].
    pub fn parse(body: &[u8]) -> Result<Self, PgpError> {
        let mut cursor = body;
        let header = take(&mut cursor, 4)?;
        if header[0] != 4 {
            return Err(PgpError::Unsupported(format!("version {} signatures", header[0])));
        }
        let (sig_type, algorithm, hash_algorithm) = (header[1], header[2], header[3]);

        let hashed_len = usize::from(u16::from_be_bytes([take(&mut cursor, 1)?[0], take(&mut cursor, 1)?[0]]));
        let hashed_area = take(&mut cursor, hashed_len)?.to_vec();
        let unhashed_len = usize::from(u16::from_be_bytes([take(&mut cursor, 1)?[0], take(&mut cursor, 1)?[0]]));
        let unhashed_area = take(&mut cursor, unhashed_len)?;
        let prefix = take(&mut cursor, 2)?;
        let digest_prefix = [prefix[0], prefix[1]];

        let values = if algorithm == ED25519 {
            vec![take(&mut cursor, 64)?.to_vec()]
        } else {
            let mut values = Vec::new();
            while !cursor.is_empty() {
                values.push(read_mpi(&mut cursor)?.to_vec());
            }
            values
        };

        let mut signature = Self {
            sig_type,
            algorithm,
            hash_algorithm,
            created: None,
            issuer: None,
            issuer_fingerprint: None,
            hashed_area,
            digest_prefix,
            values,
        };
        let hashed = signature.hashed_area.clone();
        signature.read_subpackets(&hashed)?;
        signature.read_subpackets(unhashed_area)?;
        Ok(signature)
    }

    fn read_subpackets(&mut self, mut area: &[u8]) -> Result<(), PgpError> {
        while !area.is_empty() {
            let first = take(&mut area, 1)?[0];
            let len = match first {
                0..=191 => usize::from(first),
                192..=254 => ((usize::from(first) - 192) << 8) + usize::from(take(&mut area, 1)?[0]) + 192,
                255 => {
                    let b = take(&mut area, 4)?;
                    u32::from_be_bytes([b[0], b[1], b[2], b[3]]) as usize
                }
            };
            let data = take(&mut area, len)?;
            let Some((kind, value)) = data.split_first() else {
                continue;
            };
            match kind & 0x7f {
                SUBPACKET_CREATION_TIME if value.len() == 4 => {
                    self.created = Some(u32::from_be_bytes([value[0], value[1], value[2], value[3]]));
                }
                SUBPACKET_ISSUER if value.len() == 8 => {
                    self.issuer.get_or_insert(long_id_of(value));
                }
                SUBPACKET_ISSUER_FINGERPRINT if value.len() > 1 => {
                    self.issuer_fingerprint.get_or_insert(value[1..].to_vec());
                }
                _ => {}
            }
        }
        Ok(())
    }

    /// The issuing key: its fingerprint when the signature names it, else
    /// the long id.
    pub fn issuer_key(&self) -> Option<KeyId> {
        self.issuer_fingerprint
            .clone()
            .map(KeyId::Fingerprint)
            .or(self.issuer.map(KeyId::Long))
    }

    /// Check this signature over `data` with `key`.
    ///
    /// # Errors
    ///
    /// [`PgpError::BadSignature`] when the signature does not match,
    /// [`PgpError::Unsupported`] for algorithms this module cannot check.
    pub fn verify(&self, key: &PublicKey, data: &[u8]) -> Result<(), PgpError> {
        let digest = self.digest(data)?;
        if digest[..2] != self.digest_prefix {
            return Err(PgpError::BadSignature);
        }
        match &key.material {
            KeyMaterial::Rsa { n, e } => self.verify_rsa(n, e, &digest),
            KeyMaterial::Ed25519(point) => self.verify_ed25519(point, &digest),
            KeyMaterial::Other => Err(PgpError::Unsupported(format!(
                "public key algorithm {}",
                key.algorithm
            ))),
        }
    }

    fn digest(&self, data: &[u8]) -> Result<Vec<u8>, PgpError> {
        let document = match self.sig_type {
            BINARY_DOCUMENT => std::borrow::Cow::Borrowed(data),
            TEXT_DOCUMENT => std::borrow::Cow::Owned(canonical_text(data)),
            other => {
                return Err(PgpError::Unsupported(format!("signature type {other:#04x}")));
            }
        };
        let mut trailer = vec![4, self.sig_type, self.algorithm, self.hash_algorithm];
        trailer.extend_from_slice(&(self.hashed_area.len() as u16).to_be_bytes());
        trailer.extend_from_slice(&self.hashed_area);
        trailer.extend_from_slice(&[4, 0xff]);
        trailer.extend_from_slice(&((6 + self.hashed_area.len()) as u32).to_be_bytes());

        Ok(match self.hash_algorithm {
            HASH_SHA1 => hash::<Sha1>(&document, &trailer),
            HASH_SHA224 => hash::<Sha224>(&document, &trailer),
            HASH_SHA256 => hash::<Sha256>(&document, &trailer),
            HASH_SHA384 => hash::<Sha384>(&document, &trailer),
            HASH_SHA512 => hash::<Sha512>(&document, &trailer),
            other => return Err(PgpError::Unsupported(format!("hash algorithm {other}"))),
        })
    }

    fn verify_rsa(&self, n: &[u8], e: &[u8], digest: &[u8]) -> Result<(), PgpError> {
        let key = RsaPublicKey::new(BigUint::from_bytes_be(n), BigUint::from_bytes_be(e))
            .map_err(|e| PgpError::Unsupported(format!("RSA key: {e}")))?;
        let value = self.values.first().ok_or(PgpError::BadSignature)?;
        let size = key.size();
        if value.len() > size {
            return Err(PgpError::BadSignature);
        }
        let mut sig = vec![0u8; size - value.len()];
        sig.extend_from_slice(value);

        let scheme = match self.hash_algorithm {
            HASH_SHA1 => Pkcs1v15Sign::new::<Sha1>(),
            HASH_SHA224 => Pkcs1v15Sign::new::<Sha224>(),
            HASH_SHA256 => Pkcs1v15Sign::new::<Sha256>(),
            HASH_SHA384 => Pkcs1v15Sign::new::<Sha384>(),
            HASH_SHA512 => Pkcs1v15Sign::new::<Sha512>(),
            other => return Err(PgpError::Unsupported(format!("hash algorithm {other}"))),
        };
        key.verify(scheme, digest, &sig)
            .map_err(|_| PgpError::BadSignature)
    }

    fn verify_ed25519(&self, point: &[u8; 32], digest: &[u8]) -> Result<(), PgpError> {
        let bytes: [u8; 64] = match self.values.as_slice() {
            [raw] if raw.len() == 64 => raw.as_slice().try_into().map_err(|_| PgpError::BadSignature)?,
            [r, s] if r.len() <= 32 && s.len() <= 32 => {
                let mut bytes = [0u8; 64];
                bytes[32 - r.len()..32].copy_from_slice(r);
                bytes[64 - s.len()..].copy_from_slice(s);
                bytes
            }
            _ => return Err(PgpError::BadSignature),
        };
        let key = ed25519_dalek::VerifyingKey::from_bytes(point)
            .map_err(|_| PgpError::malformed("invalid Ed25519 point"))?;
        let signature = ed25519_dalek::Signature::from_bytes(&bytes);
        key.verify(digest, &signature)
            .map_err(|_| PgpError::BadSignature)
    }
}

fn hash<D: Digest>(document: &[u8], trailer: &[u8]) -> Vec<u8> {
    let mut hasher = D::new();
    hasher.update(document);
    hasher.update(trailer);
    hasher.finalize().to_vec()
}

/// Line endings normalized to CRLF.
fn canonical_text(data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(data.len() + data.len() / 32);
    let mut i = 0;
    while i < data.len() {
        match data[i] {
            b'\r' if data.get(i + 1) == Some(&b'\n') => {
                out.extend_from_slice(b"\r\n");
                i += 1;
            }
            b'\n' | b'\r' => out.extend_from_slice(b"\r\n"),
            b => out.push(b),
        }
        i += 1;
    }
    out
}

/// Read the signatures of a detached signature file, armored or binary.
///
/// # Errors
///
/// Fails on broken armor, packet framing or signature packets.
pub fn read_signatures(data: &[u8]) -> Result<Vec<Signature>, PgpError> {
    let decoded;
    let data = if armor::is_armored(data) {
        decoded = armor::decode(data)?;
        decoded.as_slice()
    } else {
        data
    };
    packet::parse_packets(data)?
        .into_iter()
        .filter(|p| p.tag == packet::SIGNATURE)
        .map(|p| Signature::parse(p.body))
        .collect()
}

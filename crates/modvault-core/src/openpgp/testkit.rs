//! Deterministic Ed25519 keys and signatures for tests.

use ed25519_dalek::{Signer, SigningKey};
use sha2::{Digest, Sha256};

use super::armor::{self, ArmorKind};
use super::key::{EDDSA_LEGACY, ed25519_key_body};
use super::keyring::{PublicKeyRing, parse_keyrings};
use super::packet::{self, write_mpi, write_packet};
use super::signature::{BINARY_DOCUMENT, HASH_SHA256};

const CREATED: u32 = 1_600_000_000;

/// Keys and detached signatures exported by GnuPG.
const GNUPG_FIXTURES: &str = concat!(env!("CARGO_MANIFEST_DIR"), "/tests/fixtures/gnupg");

pub(crate) fn gnupg_fixture(name: &str) -> Vec<u8> {
    std::fs::read(std::path::Path::new(GNUPG_FIXTURES).join(name)).unwrap()
}

pub(crate) struct TestKey {
    signing: SigningKey,
    pub(crate) ring: PublicKeyRing,
}

pub(crate) fn key(seed: u8, user_id: &str) -> TestKey {
    build(seed, user_id, false)
}

pub(crate) fn key_with_subkey(seed: u8, user_id: &str) -> TestKey {
    build(seed, user_id, true)
}

fn build(seed: u8, user_id: &str, with_subkey: bool) -> TestKey {
    let signing = SigningKey::from_bytes(&[seed; 32]);
    let body = ed25519_key_body(CREATED, signing.verifying_key().as_bytes());
    let mut encoded = Vec::new();
    write_packet(&mut encoded, packet::PUBLIC_KEY, &body);
    write_packet(&mut encoded, packet::USER_ID, user_id.as_bytes());
    if with_subkey {
        let sub = SigningKey::from_bytes(&[seed.wrapping_add(100); 32]);
        let sub_body = ed25519_key_body(CREATED, sub.verifying_key().as_bytes());
        write_packet(&mut encoded, packet::PUBLIC_SUBKEY, &sub_body);
    }
    let ring = parse_keyrings(&encoded)
        .ok()
        .and_then(|mut rings| rings.pop())
        .filter(|r| r.size() == 1 + usize::from(with_subkey))
        .unwrap_or_else(|| panic!("test key {seed} did not parse"));
    TestKey { signing, ring }
}

impl TestKey {
    pub(crate) fn fingerprint(&self) -> String {
        self.ring.primary().fingerprint_hex()
    }

    /// Binary detached signature over `data`.
    pub(crate) fn sign(&self, data: &[u8]) -> Vec<u8> {
        let fingerprint = &self.ring.primary().fingerprint;

        let mut hashed = Vec::new();
        hashed.extend_from_slice(&[5, 2]);
        hashed.extend_from_slice(&CREATED.to_be_bytes());
        hashed.push(22);
        hashed.push(33);
        hashed.push(4);
        hashed.extend_from_slice(fingerprint);

        let mut unhashed = vec![9, 16];
        unhashed.extend_from_slice(&fingerprint[12..]);

        let mut trailer = vec![4, BINARY_DOCUMENT, EDDSA_LEGACY, HASH_SHA256];
        trailer.extend_from_slice(&(hashed.len() as u16).to_be_bytes());
        trailer.extend_from_slice(&hashed);
        trailer.extend_from_slice(&[4, 0xff]);
        trailer.extend_from_slice(&((6 + hashed.len()) as u32).to_be_bytes());

        let mut hasher = Sha256::new();
        hasher.update(data);
        hasher.update(&trailer);
        let digest = hasher.finalize();
        let sig = self.signing.sign(&digest).to_bytes();

        let mut body = trailer[..6 + hashed.len()].to_vec();
        body.extend_from_slice(&(unhashed.len() as u16).to_be_bytes());
        body.extend_from_slice(&unhashed);
        body.extend_from_slice(&digest[..2]);
        write_mpi(&mut body, &sig[..32]);
        write_mpi(&mut body, &sig[32..]);

        let mut out = Vec::new();
        write_packet(&mut out, packet::SIGNATURE, &body);
        out
    }

    pub(crate) fn sign_armored(&self, data: &[u8]) -> String {
        armor::encode(ArmorKind::Signature, &self.sign(data))
    }
}

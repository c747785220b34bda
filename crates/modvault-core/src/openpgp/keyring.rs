//! Transferable public keys: a primary key with its user ids and subkeys.

use super::armor;
use super::key::PublicKey;
use super::packet::{self, Packet};
use super::{KeyId, PgpError};

/// A primary key with its subkeys and user ids, plus the bytes it was read from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublicKeyRing {
    keys: Vec<PublicKey>,
    user_ids: Vec<String>,
    encoded: Vec<u8>,
}

impl PublicKeyRing {
    /// The primary key.
    pub fn primary(&self) -> &PublicKey {
        // parse_ring never builds a ring without its primary key
        &self.keys[0]
    }

    /// Long id of the primary key.
    pub fn key_id(&self) -> u64 {
        self.primary().key_id
    }

    /// Primary key first, then subkeys.
    pub fn keys(&self) -> &[PublicKey] {
        &self.keys
    }

    /// Number of keys (primary plus subkeys).
    pub fn size(&self) -> usize {
        self.keys.len()
    }

    /// User ids, in packet order.
    pub fn user_ids(&self) -> &[String] {
        &self.user_ids
    }

    /// Binary encoding, as read.
    pub fn encoded(&self) -> &[u8] {
        &self.encoded
    }

    /// The primary key or subkey matching `id`.
    pub fn find_key(&self, id: &KeyId) -> Option<&PublicKey> {
        self.keys.iter().find(|k| match id {
            KeyId::Long(long) => k.key_id == *long,
            KeyId::Fingerprint(fp) => k.fingerprint == *fp,
        })
    }
}

/// Read every key ring in `data`, armored or binary.
///
/// Rings whose primary key cannot be parsed (other versions, unknown
/// algorithms) are skipped.
///
/// # Errors
///
/// Fails on broken armor or packet framing.
pub fn read_keyrings(data: &[u8]) -> Result<Vec<PublicKeyRing>, PgpError> {
    if armor::is_armored(data) {
        parse_keyrings(&armor::decode(data)?)
    } else {
        parse_keyrings(data)
    }
}

/// Split a binary packet stream into key rings.
///
/// # Errors
///
/// Fails on broken packet framing.
pub fn parse_keyrings(data: &[u8]) -> Result<Vec<PublicKeyRing>, PgpError> {
    let packets = packet::parse_packets(data)?;
    let mut rings = Vec::new();
    let mut current: Vec<Packet<'_>> = Vec::new();
    for packet in packets {
        if packet.tag == packet::PUBLIC_KEY && !current.is_empty() {
            rings.extend(parse_ring(&current));
            current.clear();
        }
        current.push(packet);
    }
    if !current.is_empty() {
        rings.extend(parse_ring(&current));
    }
    Ok(rings)
}

fn parse_ring(packets: &[Packet<'_>]) -> Option<PublicKeyRing> {
    let first = packets.first()?;
    if first.tag != packet::PUBLIC_KEY {
        tracing::debug!("Skipping packets without a leading public key");
        return None;
    }
    let primary = match PublicKey::parse(first.body, false) {
        Ok(key) => key,
        Err(e) => {
            tracing::debug!("Skipping key ring: {e}");
            return None;
        }
    };
    let mut ring = PublicKeyRing {
        keys: vec![primary],
        user_ids: Vec::new(),
        encoded: Vec::new(),
    };
    for packet in packets {
        ring.encoded.extend_from_slice(packet.raw);
        match packet.tag {
            packet::USER_ID => ring
                .user_ids
                .push(String::from_utf8_lossy(packet.body).into_owned()),
            packet::PUBLIC_SUBKEY => match PublicKey::parse(packet.body, true) {
                Ok(key) => ring.keys.push(key),
                Err(e) => tracing::debug!("Skipping subkey: {e}"),
            },
            _ => {}
        }
    }
    Some(ring)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::openpgp::armor::ArmorKind;
    use crate::openpgp::testkit;

    #[test]
    fn parse_binary_rings() {
        let a = testkit::key(1, "Alice <alice@example.com>");
        let b = testkit::key(2, "Bob <bob@example.com>");
        let mut data = a.ring.encoded().to_vec();
        data.extend_from_slice(b.ring.encoded());

        let rings = read_keyrings(&data).unwrap();
        assert_eq!(rings.len(), 2);
        assert_eq!(rings[0], a.ring);
        assert_eq!(rings[1].user_ids(), ["Bob <bob@example.com>"]);
        assert_eq!(rings[1].size(), 1);
    }

    #[test]
    fn parse_armored_ring() {
        let a = testkit::key(3, "Carol");
        let armored = armor::encode(ArmorKind::PublicKey, a.ring.encoded());
        let rings = read_keyrings(armored.as_bytes()).unwrap();
        assert_eq!(rings, vec![a.ring.clone()]);
        let fp = KeyId::Fingerprint(a.ring.primary().fingerprint.clone());
        assert!(rings[0].find_key(&fp).is_some());
        assert!(rings[0].find_key(&KeyId::Long(a.ring.key_id())).is_some());
        assert!(rings[0].find_key(&KeyId::Long(1)).is_none());
    }

    #[test]
    fn subkeys_belong_to_their_ring() {
        let with_sub = testkit::key_with_subkey(4, "Dave");
        let rings = read_keyrings(with_sub.ring.encoded()).unwrap();
        assert_eq!(rings.len(), 1);
        assert_eq!(rings[0].size(), 2);
        assert!(rings[0].keys()[1].is_subkey);
    }
}

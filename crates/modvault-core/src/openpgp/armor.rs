//! ASCII armor (RFC 4880 section 6) with the CRC-24 checksum line.

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use crc::{CRC_24_OPENPGP, Crc};

use super::PgpError;

const CRC24: Crc<u32> = Crc::<u32>::new(&CRC_24_OPENPGP);
const LINE_WIDTH: usize = 64;

/// Block type named in the armor header line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArmorKind {
    /// `PGP PUBLIC KEY BLOCK`
    PublicKey,
    /// `PGP SIGNATURE`
    Signature,
}

impl ArmorKind {
    fn label(self) -> &'static str {
        match self {
            Self::PublicKey => "PGP PUBLIC KEY BLOCK",
            Self::Signature => "PGP SIGNATURE",
        }
    }
}

/// Whether `data` starts, after whitespace, with an armor header line.
pub fn is_armored(data: &[u8]) -> bool {
    let start = data
        .iter()
        .position(|b| !b.is_ascii_whitespace())
        .unwrap_or(data.len());
    data[start..].starts_with(b"-----BEGIN PGP ")
}

/// Armor `data` with 64-column lines and a CRC-24 line.
pub fn encode(kind: ArmorKind, data: &[u8]) -> String {
    let label = kind.label();
    let body = STANDARD.encode(data);
    let mut out = format!("-----BEGIN {label}-----\n\n");
    for chunk in body.as_bytes().chunks(LINE_WIDTH) {
        out.push_str(&String::from_utf8_lossy(chunk));
        out.push('\n');
    }
    let crc = CRC24.checksum(data).to_be_bytes();
    out.push('=');
    out.push_str(&STANDARD.encode(&crc[1..]));
    out.push('\n');
    out.push_str(&format!("-----END {label}-----\n"));
    out
}

/// Decode every armored block in `data` and concatenate their payloads.
///
/// # Errors
///
/// Returns [`PgpError::Armor`] for unterminated blocks, bad base64 or a
/// checksum mismatch.
pub fn decode(data: &[u8]) -> Result<Vec<u8>, PgpError> {
    let text = String::from_utf8_lossy(data);
    let mut out = Vec::new();
    let mut lines = text.lines().map(str::trim);
    let mut found = false;

    while let Some(line) = lines.next() {
        if !(line.starts_with("-----BEGIN PGP ") && line.ends_with("-----")) {
            continue;
        }
        found = true;
        let mut body = String::new();
        let mut checksum = None;
        let mut in_headers = true;
        let mut terminated = false;
        for line in lines.by_ref() {
            if line.starts_with("-----END PGP ") {
                terminated = true;
                break;
            }
            if in_headers {
                in_headers = false;
                if line.is_empty() {
                    continue;
                }
                if line.contains(": ") {
                    in_headers = true;
                    continue;
                }
            }
            if let Some(sum) = line.strip_prefix('=') {
                checksum = Some(sum.to_string());
            } else {
                body.push_str(line);
            }
        }
        if !terminated {
            return Err(PgpError::Armor("missing END line".into()));
        }
        let payload = STANDARD
            .decode(body.as_bytes())
            .map_err(|e| PgpError::Armor(e.to_string()))?;
        if let Some(sum) = checksum {
            let expected = STANDARD
                .decode(sum.as_bytes())
                .map_err(|e| PgpError::Armor(format!("checksum line: {e}")))?;
            let actual = CRC24.checksum(&payload).to_be_bytes();
            if expected != actual[1..] {
                return Err(PgpError::Armor("checksum mismatch".into()));
            }
        }
        out.extend_from_slice(&payload);
    }
    if !found {
        return Err(PgpError::Armor("no armored block found".into()));
    }
    Ok(out)
}

//! Packet framing (RFC 4880 section 4).

use super::PgpError;

/// Signature packet tag.
pub const SIGNATURE: u8 = 2;
/// Public key packet tag.
pub const PUBLIC_KEY: u8 = 6;
/// User id packet tag.
pub const USER_ID: u8 = 13;
/// Public subkey packet tag.
pub const PUBLIC_SUBKEY: u8 = 14;

/// One packet, borrowed from its input.
#[derive(Debug, Clone, Copy)]
pub struct Packet<'a> {
    /// Packet tag.
    pub tag: u8,
    /// Body without the header.
    pub body: &'a [u8],
    /// Header and body exactly as read.
    pub raw: &'a [u8],
}

/// Split `data` into packets. Partial body lengths are rejected.
///
/// # Errors
///
/// Returns [`PgpError::Malformed`] on bad headers or lengths running past
/// the end of `data`.
pub fn parse_packets(data: &[u8]) -> Result<Vec<Packet<'_>>, PgpError> {
    let mut packets = Vec::new();
    let mut pos = 0;
    while pos < data.len() {
        let start = pos;
        let ctb = data[pos];
        pos += 1;
        if ctb & 0x80 == 0 {
            return Err(PgpError::malformed(format!(
                "invalid packet header byte {ctb:#04x} at offset {start}"
            )));
        }
        let (tag, len) = if ctb & 0x40 != 0 {
            let tag = ctb & 0x3f;
            let first = *byte_at(data, pos)?;
            pos += 1;
            let len = match first {
                0..=191 => usize::from(first),
                192..=223 => {
                    let second = *byte_at(data, pos)?;
                    pos += 1;
                    ((usize::from(first) - 192) << 8) + usize::from(second) + 192
                }
                255 => {
                    let len = be_u32(data, pos)?;
                    pos += 4;
                    len as usize
                }
                _ => return Err(PgpError::Unsupported("partial body lengths".into())),
            };
            (tag, len)
        } else {
            let tag = (ctb >> 2) & 0x0f;
            let len = match ctb & 0x03 {
                0 => {
                    let len = usize::from(*byte_at(data, pos)?);
                    pos += 1;
                    len
                }
                1 => {
                    let len = usize::from(u16::from_be_bytes([
                        *byte_at(data, pos)?,
                        *byte_at(data, pos + 1)?,
                    ]));
                    pos += 2;
                    len
                }
                2 => {
                    let len = be_u32(data, pos)?;
                    pos += 4;
                    len as usize
                }
                _ => data.len() - pos,
            };
            (tag, len)
        };
        let end = pos
            .checked_add(len)
            .filter(|end| *end <= data.len())
            .ok_or_else(|| PgpError::malformed(format!("packet at offset {start} runs past end of data")))?;
        packets.push(Packet {
            tag,
            body: &data[pos..end],
            raw: &data[start..end],
        });
        pos = end;
    }
    Ok(packets)
}

/// Append a new-format packet.
pub fn write_packet(out: &mut Vec<u8>, tag: u8, body: &[u8]) {
    out.push(0xc0 | tag);
    let len = body.len();
    if len < 192 {
        out.push(len as u8);
    } else if len < 8384 {
        let adjusted = len - 192;
        out.push(((adjusted >> 8) + 192) as u8);
        out.push((adjusted & 0xff) as u8);
    } else {
        out.push(255);
        out.extend_from_slice(&(len as u32).to_be_bytes());
    }
    out.extend_from_slice(body);
}

/// Read a multiprecision integer, returning its magnitude bytes.
pub(crate) fn read_mpi<'a>(buf: &mut &'a [u8]) -> Result<&'a [u8], PgpError> {
    if buf.len() < 2 {
        return Err(PgpError::malformed("truncated MPI header"));
    }
    let bits = usize::from(u16::from_be_bytes([buf[0], buf[1]]));
    let len = bits.div_ceil(8);
    if buf.len() < 2 + len {
        return Err(PgpError::malformed("truncated MPI"));
    }
    let value = &buf[2..2 + len];
    *buf = &buf[2 + len..];
    Ok(value)
}

/// Append a multiprecision integer, stripping leading zero bytes.
pub(crate) fn write_mpi(out: &mut Vec<u8>, value: &[u8]) {
    let start = value.iter().position(|b| *b != 0).unwrap_or(value.len());
    let value = &value[start..];
    let bits = value
        .first()
        .map_or(0, |b| (value.len() - 1) * 8 + (8 - b.leading_zeros() as usize));
    out.extend_from_slice(&(bits as u16).to_be_bytes());
    out.extend_from_slice(value);
}

pub(crate) fn take<'a>(buf: &mut &'a [u8], n: usize) -> Result<&'a [u8], PgpError> {
    if buf.len() < n {
        return Err(PgpError::malformed(format!(
            "expected {n} more bytes, found {}",
            buf.len()
        )));
    }
    let (head, tail) = buf.split_at(n);
    *buf = tail;
    Ok(head)
}

fn byte_at(data: &[u8], pos: usize) -> Result<&u8, PgpError> {
    data.get(pos)
        .ok_or_else(|| PgpError::malformed("truncated packet header"))
}

fn be_u32(data: &[u8], pos: usize) -> Result<u32, PgpError> {
    data.get(pos..pos + 4)
        .and_then(|b| b.try_into().ok())
        .map(u32::from_be_bytes)
        .ok_or_else(|| PgpError::malformed("truncated packet length"))
}

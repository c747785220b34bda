//! Binary encoding used by the persistent caches.
//!
//! Layout rules:
//! - booleans are a single `0`/`1` byte,
//! - small integers (lengths, counts) are unsigned LEB128,
//! - `i64` values are eight bytes big-endian,
//! - strings are a small-int byte length followed by UTF-8,
//! - nullable strings carry a boolean presence flag first,
//! - binary blobs are a small-int length followed by the raw bytes.

use std::collections::BTreeSet;
use std::marker::PhantomData;

use bytes::{Buf, BufMut, BytesMut};
use serde::Serialize;
use serde::de::DeserializeOwned;
use thiserror::Error;

use crate::coordinates::{ArtifactIdentifier, ArtifactName, ModuleComponentId};

/// Errors raised while decoding (and, for delegate codecs, encoding) records.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CodecError {
    /// The input ended before the value was complete.
    #[error("Unexpected end of input: {needed} more bytes needed")]
    Truncated {
        /// Bytes missing to finish the current value.
        needed: usize,
    },

    /// A string field did not hold valid UTF-8.
    #[error("Invalid UTF-8 in string field")]
    InvalidUtf8,

    /// A boolean byte other than `0` or `1`.
    #[error("Invalid boolean byte {0:#04x}")]
    InvalidBool(u8),

    /// A small integer did not fit in 32 bits.
    #[error("Small integer overflows 32 bits")]
    VarintOverflow,

    /// Bytes were left over after a complete value.
    #[error("{0} trailing bytes after value")]
    TrailingBytes(usize),

    /// A delegate serializer failed.
    #[error("Delegate codec failed: {0}")]
    Delegate(String),
}

/// Append-only writer for the binary layout.
#[derive(Debug, Default)]
pub struct Encoder {
    buf: BytesMut,
}

impl Encoder {
    /// Create an empty encoder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Write a boolean as one byte.
    pub fn write_bool(&mut self, value: bool) {
        self.buf.put_u8(u8::from(value));
    }

    /// Write a raw byte.
    pub fn write_byte(&mut self, value: u8) {
        self.buf.put_u8(value);
    }

    /// Write an unsigned LEB128 integer.
    pub fn write_small_int(&mut self, mut value: u32) {
        loop {
            let byte = (value & 0x7f) as u8;
            value >>= 7;
            if value == 0 {
                self.buf.put_u8(byte);
                return;
            }
            self.buf.put_u8(byte | 0x80);
        }
    }

    /// Write a 64-bit integer, big-endian.
    pub fn write_long(&mut self, value: i64) {
        self.buf.put_i64(value);
    }

    /// Write a length-prefixed UTF-8 string.
    pub fn write_string(&mut self, value: &str) {
        self.write_binary(value.as_bytes());
    }

    /// Write a presence flag, then the string if present.
    pub fn write_nullable_string(&mut self, value: Option<&str>) {
        self.write_bool(value.is_some());
        if let Some(value) = value {
            self.write_string(value);
        }
    }

    /// Write a length-prefixed byte blob.
    pub fn write_binary(&mut self, value: &[u8]) {
        self.write_small_int(value.len() as u32);
        self.buf.put_slice(value);
    }

    /// Number of bytes written so far.
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    /// Whether nothing has been written yet.
    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Consume the encoder, returning the written bytes.
    pub fn into_bytes(self) -> Vec<u8> {
        self.buf.to_vec()
    }
}

/// Cursor over an encoded buffer.
#[derive(Debug)]
pub struct Decoder<'a> {
    buf: &'a [u8],
}

impl<'a> Decoder<'a> {
    /// Start decoding at the beginning of `buf`.
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf }
    }

    fn ensure(&self, n: usize) -> Result<(), CodecError> {
        if self.buf.remaining() < n {
            return Err(CodecError::Truncated {
                needed: n - self.buf.remaining(),
            });
        }
        Ok(())
    }

    /// Read a boolean byte.
    ///
    /// # Errors
    ///
    /// Fails on end of input or a byte other than `0`/`1`.
    pub fn read_bool(&mut self) -> Result<bool, CodecError> {
        match self.read_byte()? {
            0 => Ok(false),
            1 => Ok(true),
            other => Err(CodecError::InvalidBool(other)),
        }
    }

    /// Read a raw byte.
    ///
    /// # Errors
    ///
    /// Fails on end of input.
    pub fn read_byte(&mut self) -> Result<u8, CodecError> {
        self.ensure(1)?;
        Ok(self.buf.get_u8())
    }

    /// Read an unsigned LEB128 integer.
    ///
    /// # Errors
    ///
    /// Fails on end of input or a value wider than 32 bits.
    pub fn read_small_int(&mut self) -> Result<u32, CodecError> {
        let mut value: u32 = 0;
        let mut shift = 0u32;
        loop {
            let byte = self.read_byte()?;
            if shift >= 32 || (shift == 28 && byte & 0x70 != 0) {
                return Err(CodecError::VarintOverflow);
            }
            value |= u32::from(byte & 0x7f) << shift;
            if byte & 0x80 == 0 {
                return Ok(value);
            }
            shift += 7;
        }
    }

    /// Read a big-endian 64-bit integer.
    ///
    /// # Errors
    ///
    /// Fails on end of input.
    pub fn read_long(&mut self) -> Result<i64, CodecError> {
        self.ensure(8)?;
        Ok(self.buf.get_i64())
    }

    /// Read a length-prefixed UTF-8 string.
    ///
    /// # Errors
    ///
    /// Fails on end of input or invalid UTF-8.
    pub fn read_string(&mut self) -> Result<String, CodecError> {
        let bytes = self.read_binary()?;
        String::from_utf8(bytes).map_err(|_| CodecError::InvalidUtf8)
    }

    /// Read a presence flag and, if set, a string.
    ///
    /// # Errors
    ///
    /// Fails on end of input, a bad flag or invalid UTF-8.
    pub fn read_nullable_string(&mut self) -> Result<Option<String>, CodecError> {
        if self.read_bool()? {
            self.read_string().map(Some)
        } else {
            Ok(None)
        }
    }

    /// Read a length-prefixed byte blob.
    ///
    /// # Errors
    ///
    /// Fails on end of input.
    pub fn read_binary(&mut self) -> Result<Vec<u8>, CodecError> {
        let len = self.read_small_int()? as usize;
        self.ensure(len)?;
        let bytes = self.buf[..len].to_vec();
        self.buf.advance(len);
        Ok(bytes)
    }

    /// Bytes not consumed yet.
    pub fn remaining(&self) -> usize {
        self.buf.remaining()
    }
}

/// Serializer for values of one type.
///
/// Caches are built from a key codec and a value codec; the codec owns the
/// exact byte layout of its type.
pub trait Codec<T>: Send + Sync {
    /// Append `value` to `encoder`.
    ///
    /// # Errors
    ///
    /// Only delegate codecs can fail while encoding.
    fn encode(&self, encoder: &mut Encoder, value: &T) -> Result<(), CodecError>;

    /// Read one value from `decoder`.
    ///
    /// # Errors
    ///
    /// Fails on malformed or truncated input.
    fn decode(&self, decoder: &mut Decoder<'_>) -> Result<T, CodecError>;

    /// Encode a single value into a fresh buffer.
    ///
    /// # Errors
    ///
    /// See [`Codec::encode`].
    fn to_bytes(&self, value: &T) -> Result<Vec<u8>, CodecError> {
        let mut encoder = Encoder::new();
        self.encode(&mut encoder, value)?;
        Ok(encoder.into_bytes())
    }

    /// Decode a buffer holding exactly one value.
    ///
    /// # Errors
    ///
    /// Fails on malformed input or leftover bytes.
    fn from_bytes(&self, bytes: &[u8]) -> Result<T, CodecError> {
        let mut decoder = Decoder::new(bytes);
        let value = self.decode(&mut decoder)?;
        match decoder.remaining() {
            0 => Ok(value),
            n => Err(CodecError::TrailingBytes(n)),
        }
    }
}

/// Codec for plain strings.
#[derive(Debug, Clone, Copy, Default)]
pub struct StringCodec;

impl Codec<String> for StringCodec {
    fn encode(&self, encoder: &mut Encoder, value: &String) -> Result<(), CodecError> {
        encoder.write_string(value);
        Ok(())
    }

    fn decode(&self, decoder: &mut Decoder<'_>) -> Result<String, CodecError> {
        decoder.read_string()
    }
}

/// Codec for `group:module:version` coordinates.
#[derive(Debug, Clone, Copy, Default)]
pub struct ModuleComponentIdCodec;

impl Codec<ModuleComponentId> for ModuleComponentIdCodec {
    fn encode(&self, encoder: &mut Encoder, value: &ModuleComponentId) -> Result<(), CodecError> {
        encoder.write_string(&value.group);
        encoder.write_string(&value.module);
        encoder.write_string(&value.version);
        Ok(())
    }

    fn decode(&self, decoder: &mut Decoder<'_>) -> Result<ModuleComponentId, CodecError> {
        Ok(ModuleComponentId {
            group: decoder.read_string()?,
            module: decoder.read_string()?,
            version: decoder.read_string()?,
        })
    }
}

/// Codec for artifact identifiers: the component, then name, type,
/// extension and nullable classifier.
#[derive(Debug, Clone, Copy, Default)]
pub struct ArtifactIdentifierCodec;

impl Codec<ArtifactIdentifier> for ArtifactIdentifierCodec {
    fn encode(&self, encoder: &mut Encoder, value: &ArtifactIdentifier) -> Result<(), CodecError> {
        ModuleComponentIdCodec.encode(encoder, &value.component)?;
        encoder.write_string(&value.name.name);
        encoder.write_string(&value.name.kind);
        encoder.write_string(&value.name.extension);
        encoder.write_nullable_string(value.name.classifier.as_deref());
        Ok(())
    }

    fn decode(&self, decoder: &mut Decoder<'_>) -> Result<ArtifactIdentifier, CodecError> {
        let component = ModuleComponentIdCodec.decode(decoder)?;
        let name = ArtifactName {
            name: decoder.read_string()?,
            kind: decoder.read_string()?,
            extension: decoder.read_string()?,
            classifier: decoder.read_nullable_string()?,
        };
        Ok(ArtifactIdentifier { component, name })
    }
}

/// Size-prefixed set codec; each element goes through the inner codec.
#[derive(Debug, Clone, Copy, Default)]
pub struct SetCodec<C>(pub C);

impl<T, C> Codec<BTreeSet<T>> for SetCodec<C>
where
    T: Ord,
    C: Codec<T>,
{
    fn encode(&self, encoder: &mut Encoder, value: &BTreeSet<T>) -> Result<(), CodecError> {
        encoder.write_small_int(value.len() as u32);
        for element in value {
            self.0.encode(encoder, element)?;
        }
        Ok(())
    }

    fn decode(&self, decoder: &mut Decoder<'_>) -> Result<BTreeSet<T>, CodecError> {
        let len = decoder.read_small_int()?;
        let mut set = BTreeSet::new();
        for _ in 0..len {
            set.insert(self.0.decode(decoder)?);
        }
        Ok(set)
    }
}

/// Delegate codec writing a `postcard` payload as an opaque blob.
///
/// Used for values whose layout the cache does not care about.
pub struct PostcardCodec<T>(PhantomData<fn() -> T>);

impl<T> PostcardCodec<T> {
    /// Create the codec.
    pub fn new() -> Self {
        Self(PhantomData)
    }
}

impl<T> Default for PostcardCodec<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> std::fmt::Debug for PostcardCodec<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("PostcardCodec")
    }
}

impl<T: Serialize + DeserializeOwned> Codec<T> for PostcardCodec<T> {
    fn encode(&self, encoder: &mut Encoder, value: &T) -> Result<(), CodecError> {
        let bytes = postcard::to_allocvec(value).map_err(|e| CodecError::Delegate(e.to_string()))?;
        encoder.write_binary(&bytes);
        Ok(())
    }

    fn decode(&self, decoder: &mut Decoder<'_>) -> Result<T, CodecError> {
        let bytes = decoder.read_binary()?;
        postcard::from_bytes(&bytes).map_err(|e| CodecError::Delegate(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn small_int_uses_leb128() {
        let mut encoder = Encoder::new();
        encoder.write_small_int(300);
        assert_eq!(encoder.into_bytes(), vec![0xac, 0x02]);
    }

    #[test]
    fn long_is_big_endian() {
        let mut encoder = Encoder::new();
        encoder.write_long(1);
        assert_eq!(encoder.into_bytes(), vec![0, 0, 0, 0, 0, 0, 0, 1]);
    }

    #[test]
    fn nullable_string_layout() {
        let mut encoder = Encoder::new();
        encoder.write_nullable_string(None);
        encoder.write_nullable_string(Some("jar"));
        assert_eq!(encoder.into_bytes(), vec![0, 1, 3, b'j', b'a', b'r']);
    }

    #[test]
    fn truncated_input_is_an_error() {
        let mut decoder = Decoder::new(&[5, b'a', b'b']);
        assert_eq!(
            decoder.read_string(),
            Err(CodecError::Truncated { needed: 3 })
        );
    }

    #[test]
    fn bad_bool_is_an_error() {
        let mut decoder = Decoder::new(&[2]);
        assert_eq!(decoder.read_bool(), Err(CodecError::InvalidBool(2)));
    }

    #[test]
    fn varint_overflow_is_an_error() {
        let mut decoder = Decoder::new(&[0xff, 0xff, 0xff, 0xff, 0x7f]);
        assert_eq!(decoder.read_small_int(), Err(CodecError::VarintOverflow));
    }

    #[test]
    fn trailing_bytes_are_rejected() {
        let mut bytes = StringCodec.to_bytes(&"a".to_string()).unwrap();
        bytes.push(0);
        assert_eq!(
            StringCodec.from_bytes(&bytes),
            Err(CodecError::TrailingBytes(1))
        );
    }

    #[test]
    fn artifact_set_survives_encoding() {
        let component = ModuleComponentId::new("org.example", "lib", "1.0");
        let set: BTreeSet<_> = [
            ArtifactIdentifier::new(
                component.clone(),
                ArtifactName::new("lib", "jar", "jar", None),
            ),
            ArtifactIdentifier::new(
                component,
                ArtifactName::new("lib", "jar", "jar", Some("sources".into())),
            ),
        ]
        .into_iter()
        .collect();

        let codec = SetCodec(ArtifactIdentifierCodec);
        let bytes = codec.to_bytes(&set).unwrap();
        assert_eq!(bytes[0], 2);
        assert_eq!(codec.from_bytes(&bytes).unwrap(), set);
    }
}

//! Big-endian wire serialization, parameterized by negotiated protocol version.

use std::fmt;

/// Wire protocol variant negotiated during the handshake. The two variants
/// differ only in how a handful of length-prefixed types serialize; the
/// reader and writer carry the variant so those types can branch.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ProtocolVersion {
    V1,
    V2,
}

impl ProtocolVersion {
    /// Maps a negotiated numeric version onto a serialization variant.
    pub fn from_negotiated(version: u32) -> Self {
        if version > 1 {
            ProtocolVersion::V2
        } else {
            ProtocolVersion::V1
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum DecodeError {
    UnexpectedEof,
    TrailingBytes,
    CountTooLarge,
    UnsupportedVariant(u8),
    Corrupt(&'static str),
}

impl fmt::Display for DecodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DecodeError::UnexpectedEof => write!(f, "unexpected end of input"),
            DecodeError::TrailingBytes => write!(f, "trailing bytes after decode"),
            DecodeError::CountTooLarge => write!(f, "length prefix exceeds cap"),
            DecodeError::UnsupportedVariant(value) => {
                write!(f, "unsupported enum variant {value}")
            }
            DecodeError::Corrupt(what) => write!(f, "corrupt field: {what}"),
        }
    }
}

impl std::error::Error for DecodeError {}

pub struct Decoder<'a> {
    bytes: &'a [u8],
    pos: usize,
    version: ProtocolVersion,
}

impl<'a> Decoder<'a> {
    pub fn new(bytes: &'a [u8], version: ProtocolVersion) -> Self {
        Self {
            bytes,
            pos: 0,
            version,
        }
    }

    pub fn version(&self) -> ProtocolVersion {
        self.version
    }

    pub fn remaining(&self) -> usize {
        self.bytes.len() - self.pos
    }

    pub fn is_empty(&self) -> bool {
        self.pos == self.bytes.len()
    }

    pub fn read_u8(&mut self) -> Result<u8, DecodeError> {
        let byte = *self.bytes.get(self.pos).ok_or(DecodeError::UnexpectedEof)?;
        self.pos += 1;
        Ok(byte)
    }

    pub fn read_u16(&mut self) -> Result<u16, DecodeError> {
        Ok(u16::from_be_bytes(self.read_fixed::<2>()?))
    }

    pub fn read_u32(&mut self) -> Result<u32, DecodeError> {
        Ok(u32::from_be_bytes(self.read_fixed::<4>()?))
    }

    pub fn read_u64(&mut self) -> Result<u64, DecodeError> {
        Ok(u64::from_be_bytes(self.read_fixed::<8>()?))
    }

    pub fn read_i64(&mut self) -> Result<i64, DecodeError> {
        Ok(i64::from_be_bytes(self.read_fixed::<8>()?))
    }

    pub fn read_fixed<const N: usize>(&mut self) -> Result<[u8; N], DecodeError> {
        let slice = self.read_bytes(N)?;
        let mut out = [0u8; N];
        out.copy_from_slice(slice);
        Ok(out)
    }

    pub fn read_bytes(&mut self, len: usize) -> Result<&'a [u8], DecodeError> {
        if self.remaining() < len {
            return Err(DecodeError::UnexpectedEof);
        }
        let slice = &self.bytes[self.pos..self.pos + len];
        self.pos += len;
        Ok(slice)
    }

    /// Reads a u64-length-prefixed byte vector, refusing prefixes above `cap`.
    pub fn read_var_bytes(&mut self, cap: usize) -> Result<Vec<u8>, DecodeError> {
        let len = self.read_u64()?;
        let len = usize::try_from(len).map_err(|_| DecodeError::CountTooLarge)?;
        if len > cap {
            return Err(DecodeError::CountTooLarge);
        }
        Ok(self.read_bytes(len)?.to_vec())
    }

    pub fn read_var_str(&mut self, cap: usize) -> Result<String, DecodeError> {
        let bytes = self.read_var_bytes(cap)?;
        String::from_utf8(bytes).map_err(|_| DecodeError::Corrupt("utf-8 string"))
    }

    /// Reads a u64 item count, refusing counts above `cap`.
    pub fn read_count(&mut self, cap: usize) -> Result<usize, DecodeError> {
        let count = self.read_u64()?;
        let count = usize::try_from(count).map_err(|_| DecodeError::CountTooLarge)?;
        if count > cap {
            return Err(DecodeError::CountTooLarge);
        }
        Ok(count)
    }

    pub fn expect_empty(&self) -> Result<(), DecodeError> {
        if self.is_empty() {
            Ok(())
        } else {
            Err(DecodeError::TrailingBytes)
        }
    }
}

pub struct Encoder {
    buf: Vec<u8>,
    version: ProtocolVersion,
}

impl Encoder {
    pub fn new(version: ProtocolVersion) -> Self {
        Self {
            buf: Vec::new(),
            version,
        }
    }

    pub fn version(&self) -> ProtocolVersion {
        self.version
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn write_u8(&mut self, value: u8) {
        self.buf.push(value);
    }

    pub fn write_u16(&mut self, value: u16) {
        self.buf.extend_from_slice(&value.to_be_bytes());
    }

    pub fn write_u32(&mut self, value: u32) {
        self.buf.extend_from_slice(&value.to_be_bytes());
    }

    pub fn write_u64(&mut self, value: u64) {
        self.buf.extend_from_slice(&value.to_be_bytes());
    }

    pub fn write_i64(&mut self, value: i64) {
        self.buf.extend_from_slice(&value.to_be_bytes());
    }

    pub fn write_bytes(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    pub fn write_var_bytes(&mut self, bytes: &[u8]) {
        self.write_u64(bytes.len() as u64);
        self.write_bytes(bytes);
    }

    pub fn write_var_str(&mut self, value: &str) {
        self.write_var_bytes(value.as_bytes());
    }

    pub fn into_inner(self) -> Vec<u8> {
        self.buf
    }
}

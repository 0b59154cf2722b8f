//! Length-delimited binary encoding with a trailing whole-buffer checksum.
//!
//! The coder serializes fixed-width integers in little-endian byte order and
//! length-prefixes variable-width fields. [`Encoder::encode_checksum`]
//! appends a CRC32 over every byte written so far; [`Decoder::verify_checksum`]
//! recomputes the CRC32 over the consumed prefix and rejects buffers whose
//! trailing checksum does not match. Corrupted or truncated input never
//! decodes successfully.

use crate::data::Data;
use crate::error::{Result, StorageError};

/// Append-only serializer.
#[derive(Default)]
pub struct Encoder {
    buffer: Vec<u8>,
}

impl Encoder {
    /// Creates an empty encoder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a fixed-width u32.
    pub fn encode_u32(&mut self, value: u32) {
        self.buffer.extend_from_slice(&value.to_le_bytes());
    }

    /// Appends a fixed-width u64.
    pub fn encode_u64(&mut self, value: u64) {
        self.buffer.extend_from_slice(&value.to_le_bytes());
    }

    /// Appends a fixed-width byte array without a length prefix.
    pub fn encode_fixed<const N: usize>(&mut self, value: &[u8; N]) {
        self.buffer.extend_from_slice(value);
    }

    /// Appends a length-prefixed byte slice.
    pub fn encode_bytes(&mut self, value: &[u8]) {
        self.encode_u64(value.len() as u64);
        self.buffer.extend_from_slice(value);
    }

    /// Appends a length-prefixed UTF-8 string.
    pub fn encode_str(&mut self, value: &str) {
        self.encode_bytes(value.as_bytes());
    }

    /// Appends a CRC32 over every byte written so far.
    pub fn encode_checksum(&mut self) {
        let checksum = crc32fast::hash(&self.buffer);
        self.encode_u32(checksum);
    }

    /// Returns the serialized bytes written so far.
    pub fn buffer(&self) -> &[u8] {
        &self.buffer
    }

    /// Consumes the encoder, returning the serialized buffer as a [`Data`].
    pub fn finish(self) -> Data {
        Data::from_vec(self.buffer)
    }
}

/// Cursor-style deserializer over the spans of a [`Data`].
pub struct Decoder<'a> {
    spans: Vec<&'a [u8]>,
    span_index: usize,
    span_offset: usize,
    offset: u64,
    crc: crc32fast::Hasher,
}

impl<'a> Decoder<'a> {
    /// Creates a decoder positioned at the start of `data`.
    pub fn new(data: &'a Data) -> Self {
        Self {
            spans: data.spans().collect(),
            span_index: 0,
            span_offset: 0,
            offset: 0,
            crc: crc32fast::Hasher::new(),
        }
    }

    /// Returns the number of bytes consumed so far.
    pub fn current_offset(&self) -> u64 {
        self.offset
    }

    /// Decodes a fixed-width u32.
    pub fn decode_u32(&mut self) -> Result<u32> {
        let mut buf = [0u8; 4];
        self.read_exact(&mut buf, true)?;
        Ok(u32::from_le_bytes(buf))
    }

    /// Decodes a fixed-width u64.
    pub fn decode_u64(&mut self) -> Result<u64> {
        let mut buf = [0u8; 8];
        self.read_exact(&mut buf, true)?;
        Ok(u64::from_le_bytes(buf))
    }

    /// Decodes a fixed-width byte array written with
    /// [`Encoder::encode_fixed`].
    pub fn decode_fixed<const N: usize>(&mut self) -> Result<[u8; N]> {
        let mut buf = [0u8; N];
        self.read_exact(&mut buf, true)?;
        Ok(buf)
    }

    /// Decodes a length-prefixed byte slice.
    pub fn decode_bytes(&mut self) -> Result<Vec<u8>> {
        let len = self.decode_u64()?;
        if len > self.remaining() {
            return Err(StorageError::BadMetaData);
        }
        let mut buf = vec![0u8; len as usize];
        self.read_exact(&mut buf, true)?;
        Ok(buf)
    }

    /// Decodes a length-prefixed UTF-8 string.
    pub fn decode_str(&mut self) -> Result<String> {
        let bytes = self.decode_bytes()?;
        String::from_utf8(bytes).map_err(|_| StorageError::BadMetaData)
    }

    /// Reads the trailing checksum and compares it against a CRC32 of every
    /// byte consumed before it.
    ///
    /// # Errors
    ///
    /// Returns `StorageError::ChecksumMismatch` if the buffer was modified
    /// anywhere in the consumed prefix or the checksum itself.
    pub fn verify_checksum(&mut self) -> Result<()> {
        let computed = self.crc.clone().finalize();
        let mut buf = [0u8; 4];
        self.read_exact(&mut buf, false)?;
        let stored = u32::from_le_bytes(buf);
        if stored != computed {
            return Err(StorageError::ChecksumMismatch {
                expected: stored,
                actual: computed,
            });
        }
        Ok(())
    }

    fn remaining(&self) -> u64 {
        let mut total = 0u64;
        for (i, span) in self.spans.iter().enumerate().skip(self.span_index) {
            let skip = if i == self.span_index { self.span_offset } else { 0 };
            total += (span.len() - skip) as u64;
        }
        total
    }

    fn read_exact(&mut self, out: &mut [u8], checksummed: bool) -> Result<()> {
        let mut written = 0;
        while written < out.len() {
            let Some(span) = self.spans.get(self.span_index) else {
                return Err(StorageError::BadMetaData);
            };
            let available = span.len() - self.span_offset;
            if available == 0 {
                self.span_index += 1;
                self.span_offset = 0;
                continue;
            }
            let take = available.min(out.len() - written);
            out[written..written + take]
                .copy_from_slice(&span[self.span_offset..self.span_offset + take]);
            self.span_offset += take;
            written += take;
        }
        if checksummed {
            self.crc.update(out);
        }
        self.offset += out.len() as u64;
        Ok(())
    }
}

//! On-disk entry layout and codec.
//!
//! Each entry occupies one file:
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │  Metadata (variable)                                         │
//! │  - version, key, timestamp, checksums, sizes                 │
//! │  - trailing CRC32 over the metadata bytes                    │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Header (header_size bytes, opaque application bytes)        │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Zero padding to the next page boundary (absent if no body)  │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Body (body_size bytes, opaque application bytes)            │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! The page-aligned body offset lets readers map the body region directly
//! and lets updates rewrite the metadata+header slot without touching the
//! body, as long as the page-rounded slot size is unchanged.

use crate::coder::{Decoder, Encoder};
use crate::data::Data;
use crate::error::{Result, StorageError};
use crate::io::{page_size, IoChannel};
use crate::key::{HashType, Key};
use crate::storage::VERSION;
use tracing::debug;

/// A logical cache record.
#[derive(Debug, Clone)]
pub struct Entry {
    /// Identifies the record and its on-disk location.
    pub key: Key,
    /// Milliseconds since the Unix epoch at record creation.
    pub time_stamp: u64,
    /// Opaque application header bytes (typically response headers).
    pub header: Data,
    /// Opaque application body bytes; may be empty.
    pub body: Data,
}

/// Decoded on-disk metadata prefix of an entry file.
#[derive(Debug, Clone)]
pub(crate) struct EntryMetaData {
    pub cache_storage_version: u32,
    pub key: Key,
    pub time_stamp: u64,
    pub header_checksum: u32,
    pub header_size: u64,
    pub body_checksum: u32,
    pub body_size: u64,
    /// Byte position right after the metadata record.
    pub header_offset: u64,
    /// `header_offset + header_size` rounded up to the page size.
    pub body_offset: u64,
}

/// CRC32 over the spans of a blob, streamed without copying.
pub(crate) fn hash_data(data: &Data) -> u32 {
    let mut hasher = crc32fast::Hasher::new();
    for span in data.spans() {
        hasher.update(span);
    }
    hasher.finalize()
}

fn round_up_to_page(value: u64) -> u64 {
    let page = page_size();
    value.div_ceil(page) * page
}

fn encode_entry_meta_data(meta_data: &EntryMetaData) -> Data {
    let mut encoder = Encoder::new();
    encoder.encode_u32(meta_data.cache_storage_version);
    encoder.encode_str(meta_data.key.partition());
    encoder.encode_fixed(meta_data.key.hash());
    encoder.encode_u64(meta_data.time_stamp);
    encoder.encode_u32(meta_data.header_checksum);
    encoder.encode_u64(meta_data.header_size);
    encoder.encode_u32(meta_data.body_checksum);
    encoder.encode_u64(meta_data.body_size);
    encoder.encode_checksum();
    encoder.finish()
}

fn decode_entry_meta_data(file_data: &Data) -> Result<EntryMetaData> {
    let mut decoder = Decoder::new(file_data);
    let cache_storage_version = decoder.decode_u32()?;
    let partition = decoder.decode_str()?;
    if partition.is_empty() {
        return Err(StorageError::BadMetaData);
    }
    let hash: HashType = decoder.decode_fixed()?;
    let time_stamp = decoder.decode_u64()?;
    let header_checksum = decoder.decode_u32()?;
    let header_size = decoder.decode_u64()?;
    let body_checksum = decoder.decode_u32()?;
    let body_size = decoder.decode_u64()?;
    decoder.verify_checksum()?;

    let header_offset = decoder.current_offset();
    // An empty body gets no padding on encode; the file ends right after
    // the header and the body offset must agree.
    let body_offset = if body_size == 0 {
        header_offset + header_size
    } else {
        round_up_to_page(header_offset + header_size)
    };
    Ok(EntryMetaData {
        cache_storage_version,
        key: Key::new(partition, hash),
        time_stamp,
        header_checksum,
        header_size,
        body_checksum,
        body_size,
        header_offset,
        body_offset,
    })
}

/// Encodes the metadata + header region of an entry, padded with zeros to
/// the next page boundary when a body follows. The body itself is written
/// separately by the caller.
pub(crate) fn encode_entry_header(entry: &Entry) -> Data {
    let meta_data = EntryMetaData {
        cache_storage_version: VERSION,
        key: entry.key.clone(),
        time_stamp: entry.time_stamp,
        header_checksum: hash_data(&entry.header),
        header_size: entry.header.len(),
        body_checksum: hash_data(&entry.body),
        body_size: entry.body.len(),
        header_offset: 0,
        body_offset: 0,
    };

    let encoded_meta_data = encode_entry_meta_data(&meta_data);
    let header_data = Data::concatenate(&encoded_meta_data, &entry.header);
    if entry.body.is_empty() {
        return header_data;
    }

    let body_offset = round_up_to_page(header_data.len());
    let filler = Data::from_vec(vec![0u8; (body_offset - header_data.len()) as usize]);
    Data::concatenate(&header_data, &filler)
}

/// Decodes and verifies the metadata + header region from the front of an
/// entry file.
pub(crate) fn decode_entry_header(file_data: &Data) -> Result<(EntryMetaData, Data)> {
    let meta_data = decode_entry_meta_data(file_data)?;
    if meta_data.cache_storage_version != VERSION {
        return Err(StorageError::VersionMismatch {
            expected: VERSION,
            actual: meta_data.cache_storage_version,
        });
    }
    if meta_data.header_offset + meta_data.header_size > meta_data.body_offset {
        return Err(StorageError::SizeMismatch);
    }

    let header_data = file_data.subrange(meta_data.header_offset, meta_data.header_size);
    if header_data.len() != meta_data.header_size {
        return Err(StorageError::SizeMismatch);
    }
    let actual = hash_data(&header_data);
    if actual != meta_data.header_checksum {
        debug!("header checksum mismatch");
        return Err(StorageError::ChecksumMismatch {
            expected: meta_data.header_checksum,
            actual,
        });
    }
    Ok((meta_data, header_data))
}

/// Decodes a complete entry, memory-mapping the body region from the
/// channel's file descriptor.
pub(crate) fn decode_entry(file_data: &Data, channel: &IoChannel, key: &Key) -> Result<Entry> {
    let (meta_data, header_data) = decode_entry_header(file_data)?;

    if meta_data.key != *key {
        return Err(StorageError::KeyMismatch);
    }
    if meta_data.body_offset + meta_data.body_size != file_data.len() {
        return Err(StorageError::SizeMismatch);
    }

    let body_data = channel.map(meta_data.body_offset, meta_data.body_size)?;
    let actual = hash_data(&body_data);
    if actual != meta_data.body_checksum {
        debug!("body checksum mismatch");
        return Err(StorageError::ChecksumMismatch {
            expected: meta_data.body_checksum,
            actual,
        });
    }

    Ok(Entry {
        key: meta_data.key,
        time_stamp: meta_data.time_stamp,
        header: header_data,
        body: body_data,
    })
}

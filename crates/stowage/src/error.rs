//! Error and Result types for stowage operations.

use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// A convenience `Result` type for stowage operations.
pub type Result<T> = std::result::Result<T, StorageError>;

/// The error type for cache storage operations.
#[derive(Debug, Error)]
pub enum StorageError {
    /// The cache base directory could not be created.
    #[error("Failed to create cache directory {0:?}")]
    DirectoryCreation(PathBuf),

    /// Entry was written by an incompatible storage version.
    #[error("Unsupported storage version: expected {expected}, got {actual}")]
    VersionMismatch {
        /// Version this build reads and writes.
        expected: u32,
        /// Version found in the entry metadata.
        actual: u32,
    },

    /// Metadata, header, or body bytes do not match their recorded checksum.
    #[error("Checksum mismatch: expected {expected:#010x}, got {actual:#010x}")]
    ChecksumMismatch {
        /// Expected CRC32 checksum.
        expected: u32,
        /// Actual computed CRC32 checksum.
        actual: u32,
    },

    /// Entry metadata names a different key than the one requested.
    #[error("Entry key does not match requested key")]
    KeyMismatch,

    /// Recorded sizes do not add up to the file size, or the header region
    /// overlaps the body region.
    #[error("Entry region layout is inconsistent with file size")]
    SizeMismatch,

    /// Metadata could not be decoded from the front of the file.
    #[error("Truncated or malformed entry metadata")]
    BadMetaData,

    /// A hash string was not valid fixed-width hex.
    #[error("Malformed hash string: {0:?}")]
    MalformedHash(String),

    /// Memory-mapping the body region failed.
    #[error("Failed to map body region: {0}")]
    MapFailed(io::Error),

    /// Underlying I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

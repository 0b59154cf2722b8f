//! Stowage - persistent network cache storage engine
//!
//! This crate provides a persistent, content-addressed cache for HTTP-style
//! response records. Each record is keyed by a partition name plus a
//! fixed-width content hash and stored as one file: a checksummed metadata
//! record, the opaque response header bytes, zero padding to the next page
//! boundary, and the opaque body bytes. Page alignment lets readers serve
//! bodies straight out of a memory mapping and lets header-only updates
//! leave multi-megabyte bodies untouched on disk.
//!
//! # Components
//!
//! - [`Key`]: partition + content hash identifying an entry
//! - [`Data`]: zero-copy byte blob over owned memory or mmap regions
//! - [`Entry`]: the logical record (key, timestamp, header, body)
//! - [`Storage`]: the engine - retrieve/store/update/traverse/clear with
//!   bounded-parallelism scheduling over two worker queues
//!
//! # Example
//!
//! ```rust,ignore
//! use stowage::{Data, Entry, Key, Storage};
//!
//! let storage = Storage::open(cache_path)?;
//! storage.set_maximum_size(256 * 1024 * 1024);
//!
//! let key = Key::new("example.org", hash);
//! storage.store(
//!     Entry {
//!         key: key.clone(),
//!         time_stamp: now_ms,
//!         header: Data::from_vec(header_bytes),
//!         body: Data::from_vec(body_bytes),
//!     },
//!     |success, _mapped_body| { /* ... */ },
//! );
//!
//! storage.retrieve(key, 0, |entry| {
//!     // None is a miss; returning false rejects (and deletes) the entry.
//!     entry.is_some()
//! });
//! ```

#![deny(missing_docs)]

pub mod coder;
pub mod data;
pub mod error;
pub mod filter;
pub mod io;
pub mod key;
pub mod storage;

pub use data::Data;
pub use error::{Result, StorageError};
pub use key::{HashType, Key};
pub use storage::{Entry, Storage, StorageConfig};

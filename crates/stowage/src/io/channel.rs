//! Per-file I/O channels with positioned reads and writes.
//!
//! A channel wraps one open file descriptor. All operations are synchronous;
//! the storage core supplies asynchrony by dispatching whole operations onto
//! its worker queues. Reads and writes address the file by absolute offset
//! and never move a shared cursor, so one channel can serve concurrent
//! operations.

use crate::data::Data;
use crate::error::{Result, StorageError};
use memmap2::MmapOptions;
use std::fs::{self, File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::OnceLock;

/// How to open an entry file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// Open an existing file read-only.
    Read,
    /// Open an existing file read/write for in-place update.
    Write,
    /// Create the file, materializing parent directories first. The bytes
    /// are staged at a temporary sibling path and appear at the final path
    /// only once [`IoChannel::commit`] renames them there.
    Create,
}

/// A Create-mode file staged at a temporary path until committed.
struct PendingRename {
    temp_path: PathBuf,
    final_path: PathBuf,
}

/// A handle to one entry file.
pub struct IoChannel {
    file: File,
    pending: Option<PendingRename>,
}

/// Distinguishes temp files of concurrent Create-mode channels for the same
/// path; stores of one key are not de-duplicated and may overlap.
static TEMP_COUNTER: AtomicU64 = AtomicU64::new(0);

fn temp_path_for(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|name| name.to_os_string())
        .unwrap_or_default();
    let counter = TEMP_COUNTER.fetch_add(1, Ordering::Relaxed);
    name.push(format!(".{counter}.tmp"));
    path.with_file_name(name)
}

impl IoChannel {
    /// Opens `path` in the given mode.
    pub fn open(path: &Path, mode: Mode) -> Result<Self> {
        match mode {
            Mode::Read => Ok(Self {
                file: File::open(path)?,
                pending: None,
            }),
            Mode::Write => Ok(Self {
                file: OpenOptions::new().read(true).write(true).open(path)?,
                pending: None,
            }),
            Mode::Create => {
                if let Some(parent) = path.parent() {
                    fs::create_dir_all(parent)?;
                }
                let temp_path = temp_path_for(path);
                let file = OpenOptions::new()
                    .read(true)
                    .write(true)
                    .create(true)
                    .truncate(true)
                    .open(&temp_path)?;
                Ok(Self {
                    file,
                    pending: Some(PendingRename {
                        temp_path,
                        final_path: path.to_path_buf(),
                    }),
                })
            }
        }
    }

    /// Publishes a Create-mode file at its final path.
    ///
    /// The atomic rename backs the path with the temp file's inode, so a
    /// replacement never rewrites the inode a previous mapping of the same
    /// path is reading from. No-op for Read and Write channels.
    pub fn commit(&mut self) -> Result<()> {
        if let Some(pending) = self.pending.take() {
            fs::rename(&pending.temp_path, &pending.final_path)?;
        }
        Ok(())
    }

    /// Reads `length` bytes starting at `offset`. `u64::MAX` reads to EOF;
    /// a shorter file yields the bytes that exist past `offset`.
    pub fn read(&self, offset: u64, length: u64) -> Result<Data> {
        let file_size = self.file.metadata()?.len();
        let available = file_size.saturating_sub(offset);
        let length = length.min(available);
        if length == 0 {
            return Ok(Data::default());
        }
        let mut buffer = vec![0u8; length as usize];
        self.file.read_exact_at(&mut buffer, offset)?;
        Ok(Data::from_vec(buffer))
    }

    /// Writes every span of `data` contiguously starting at `offset`.
    pub fn write(&self, offset: u64, data: &Data) -> Result<()> {
        let mut position = offset;
        for span in data.spans() {
            self.file.write_all_at(span, position)?;
            position += span.len() as u64;
        }
        Ok(())
    }

    /// Memory-maps `length` bytes at `offset`. The offset must be
    /// page-aligned; the entry codec only maps the page-aligned body region.
    pub fn map(&self, offset: u64, length: u64) -> Result<Data> {
        if length == 0 {
            return Ok(Data::default());
        }
        // SAFETY: the mapping stays valid as long as the mapped region of
        // this file is never rewritten. Replacements are staged in a fresh
        // temp file and renamed over the path on commit, so they back the
        // path with a new inode and leave prior mappings on the unlinked
        // one; in-place writes (Mode::Write) only touch the metadata+header
        // region, which is never mapped.
        let map = unsafe {
            MmapOptions::new()
                .offset(offset)
                .len(length as usize)
                .map(&self.file)
        }
        .map_err(StorageError::MapFailed)?;
        Ok(Data::from_map(map))
    }
}

impl Drop for IoChannel {
    fn drop(&mut self) {
        // An uncommitted Create-mode file was never published; don't leave
        // its partial bytes behind.
        if let Some(pending) = self.pending.take() {
            let _ = fs::remove_file(&pending.temp_path);
        }
    }
}

/// Returns the platform page size, queried once.
pub fn page_size() -> u64 {
    static PAGE_SIZE: OnceLock<u64> = OnceLock::new();
    *PAGE_SIZE.get_or_init(|| {
        let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
        if size > 0 {
            size as u64
        } else {
            4096
        }
    })
}

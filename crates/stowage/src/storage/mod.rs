//! Storage core: the public cache API and its operation scheduling.
//!
//! The engine keeps one file per entry under
//! `<cache_path>/NetCache/Version N/<partition>/<hex hash>`. All scheduling
//! state lives behind a single mutex with short critical sections; disk work
//! runs on two worker queues (`io` for reads, traversal, and clearing,
//! `background-io` for writes, deletes, initialization, and shrinking).
//! Completion handlers are invoked from worker threads, never while the
//! scheduler lock is held.
//!
//! # Scheduling
//!
//! ```text
//!               retrieve()                     store()/update()
//!                   │                                │
//!      ┌────────────▼─────────────┐     ┌────────────▼────────────┐
//!      │ pending reads, by        │     │ pending writes (FIFO)   │
//!      │ priority (FIFO each)     │     │                         │
//!      └────────────┬─────────────┘     └────────────┬────────────┘
//!                   │ ≤ 5 active                     │ ≤ 3 active
//!      ┌────────────▼─────────────┐     ┌────────────▼────────────┐
//!      │         io queue         │     │   background-io queue   │
//!      └──────────────────────────┘     └─────────────────────────┘
//! ```
//!
//! Entries being written are visible to concurrent retrieves before the file
//! exists (read-your-writes); an in-memory contents filter short-circuits
//! retrieves for keys that are definitely absent, so misses usually cost no
//! disk probe.

pub mod entry;

pub use entry::Entry;

use crate::data::Data;
use crate::error::{Result, StorageError};
use crate::filter::ContentsFilter;
use crate::io::{page_size, IoChannel, Mode, WorkQueue};
use crate::key::Key;
use entry::{decode_entry, decode_entry_header, encode_entry_header};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::debug;

/// Version of the on-disk format. Bumping it orphans older entries; the
/// version directory name keeps them from ever being read.
pub const VERSION: u32 = 2;

/// Highest allowed retrieve priority. Priorities above this are clamped.
pub const MAXIMUM_RETRIEVE_PRIORITY: usize = 3;

const BASE_SUBDIRECTORY: &str = "NetCache";
const VERSION_DIRECTORY_PREFIX: &str = "Version ";

const MAXIMUM_ACTIVE_READ_OPERATIONS: usize = 5;
const MAXIMUM_ACTIVE_WRITE_OPERATIONS: usize = 3;

/// Shrink deletes each traversed file with this probability.
const DELETION_PROBABILITY: f64 = 0.25;

/// Traversal decodes entry headers from a bounded prefix read.
const TRAVERSE_HEADER_READ_SIZE: u64 = 16 * 1024;

/// Completion handler for [`Storage::retrieve`]. Receives the entry, or
/// `None` on a miss. Returning `false` tells the engine the caller rejected
/// the entry; the file is removed.
pub type RetrieveCompletionHandler = Box<dyn FnOnce(Option<Entry>) -> bool + Send>;

/// Completion handler for [`Storage::store`] and [`Storage::update`].
/// Receives success and, for full writes of page-sized bodies, the body
/// mapped back from disk for zero-copy reuse.
pub type StoreCompletionHandler = Box<dyn FnOnce(bool, Data) + Send>;

struct ReadOperation {
    key: Key,
    completion_handler: RetrieveCompletionHandler,
}

struct WriteOperation {
    entry: Entry,
    existing_entry: Option<Entry>,
    completion_handler: StoreCompletionHandler,
}

/// Record of an in-flight write, kept scannable for read-your-writes while
/// the owning operation runs on a worker queue.
struct ActiveWrite {
    id: u64,
    entry: Entry,
}

struct State {
    contents_filter: ContentsFilter,
    pending_reads: [VecDeque<ReadOperation>; MAXIMUM_RETRIEVE_PRIORITY + 1],
    active_read_count: usize,
    pending_writes: VecDeque<WriteOperation>,
    active_writes: Vec<ActiveWrite>,
    next_write_id: u64,
    shrink_in_progress: bool,
}

impl State {
    fn new() -> Self {
        Self {
            contents_filter: ContentsFilter::new(),
            pending_reads: std::array::from_fn(|_| VecDeque::new()),
            active_read_count: 0,
            pending_writes: VecDeque::new(),
            active_writes: Vec::new(),
            next_write_id: 0,
            shrink_in_progress: false,
        }
    }
}

struct StorageInner {
    base_directory: PathBuf,
    directory: PathBuf,
    io_queue: WorkQueue,
    background_io_queue: WorkQueue,
    state: Mutex<State>,
    /// Best-effort sum of on-disk entry sizes; rebuilt by every shrink.
    approximate_size: AtomicU64,
    /// 0 disables the cache.
    maximum_size: AtomicU64,
}

/// Configuration for a [`Storage`] instance.
#[derive(Debug, Clone)]
pub struct StorageConfig {
    /// Worker threads servicing reads, traversal, and clearing.
    pub io_threads: usize,
    /// Worker threads servicing writes, deletions, initialization, and
    /// shrinking.
    pub background_io_threads: usize,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            io_threads: 4,
            background_io_threads: 2,
        }
    }
}

impl StorageConfig {
    /// Sets the number of io-queue worker threads.
    pub fn with_io_threads(mut self, threads: usize) -> Self {
        self.io_threads = threads;
        self
    }

    /// Sets the number of background-io-queue worker threads.
    pub fn with_background_io_threads(mut self, threads: usize) -> Self {
        self.background_io_threads = threads;
        self
    }
}

/// Persistent, content-addressed cache storage.
///
/// Cheap to clone; all clones share one engine.
#[derive(Clone)]
pub struct Storage {
    inner: Arc<StorageInner>,
}

impl Storage {
    /// Opens (creating if necessary) the cache under `cache_path` with the
    /// default configuration.
    ///
    /// The cache starts disabled; call [`Storage::set_maximum_size`] to
    /// admit entries.
    ///
    /// # Errors
    ///
    /// Returns `StorageError::DirectoryCreation` if the base directory
    /// cannot be created.
    pub fn open(cache_path: &Path) -> Result<Storage> {
        Self::open_with_config(cache_path, StorageConfig::default())
    }

    /// Opens the cache with an explicit configuration.
    pub fn open_with_config(cache_path: &Path, config: StorageConfig) -> Result<Storage> {
        let base_directory = cache_path.join(BASE_SUBDIRECTORY);
        fs::create_dir_all(&base_directory)
            .map_err(|_| StorageError::DirectoryCreation(base_directory.clone()))?;
        let directory = base_directory.join(format!("{VERSION_DIRECTORY_PREFIX}{VERSION}"));

        let inner = Arc::new(StorageInner {
            base_directory,
            directory,
            io_queue: WorkQueue::new("stowage-io", config.io_threads),
            background_io_queue: WorkQueue::new("stowage-bg-io", config.background_io_threads),
            state: Mutex::new(State::new()),
            approximate_size: AtomicU64::new(0),
            maximum_size: AtomicU64::new(0),
        });

        delete_old_versions(&inner);
        initialize(&inner);

        Ok(Storage { inner })
    }

    /// Looks up the entry for `key`.
    ///
    /// Higher priorities are dispatched first when a read slot frees up;
    /// same-priority retrieves complete in call order. The handler runs
    /// exactly once. An entry whose write is still in flight is returned
    /// from memory without disk I/O.
    pub fn retrieve(
        &self,
        key: Key,
        priority: usize,
        completion_handler: impl FnOnce(Option<Entry>) -> bool + Send + 'static,
    ) {
        let completion_handler: RetrieveCompletionHandler = Box::new(completion_handler);
        let priority = priority.min(MAXIMUM_RETRIEVE_PRIORITY);

        if self.inner.maximum_size.load(Ordering::Relaxed) == 0 {
            completion_handler(None);
            return;
        }

        {
            let mut state = self.inner.state.lock();
            if !state.contents_filter.may_contain(key.short_hash()) {
                drop(state);
                completion_handler(None);
                return;
            }

            // Read-your-writes: newest matching write wins, so a retrieve
            // racing two stores of the same key observes the later entry.
            let in_flight = state
                .pending_writes
                .iter()
                .rev()
                .find(|op| op.entry.key == key)
                .map(|op| op.entry.clone())
                .or_else(|| {
                    state
                        .active_writes
                        .iter()
                        .rev()
                        .find(|write| write.entry.key == key)
                        .map(|write| write.entry.clone())
                });
            if let Some(entry) = in_flight {
                debug!("found write operation in progress");
                drop(state);
                self.inner.io_queue.dispatch(move || {
                    completion_handler(Some(entry));
                });
                return;
            }

            state.pending_reads[priority].push_back(ReadOperation {
                key,
                completion_handler,
            });
        }
        dispatch_pending_read_operations(&self.inner);
    }

    /// Stores an entry, creating or replacing its file.
    ///
    /// The key becomes visible to retrieves immediately, before the write
    /// completes. On success the handler receives the body mapped back from
    /// disk when the body spans at least one page; callers can drop their
    /// copy and serve from the map.
    pub fn store(&self, entry: Entry, completion_handler: impl FnOnce(bool, Data) + Send + 'static) {
        let completion_handler: StoreCompletionHandler = Box::new(completion_handler);
        if self.inner.maximum_size.load(Ordering::Relaxed) == 0 {
            completion_handler(false, Data::default());
            return;
        }

        {
            let mut state = self.inner.state.lock();
            // Add to the filter already here; retrieves consult pending
            // operations too.
            state.contents_filter.add(entry.key.short_hash());
            state.pending_writes.push_back(WriteOperation {
                entry,
                existing_entry: None,
                completion_handler,
            });
        }
        dispatch_pending_write_operations(&self.inner);
    }

    /// Rewrites the entry for `update_entry.key`, where `existing_entry` is
    /// the entry previously retrieved from this cache.
    ///
    /// When the body is unchanged and the page-rounded metadata+header slot
    /// keeps its size, only that slot is rewritten and the body bytes on
    /// disk are left untouched.
    pub fn update(
        &self,
        update_entry: Entry,
        existing_entry: Entry,
        completion_handler: impl FnOnce(bool, Data) + Send + 'static,
    ) {
        debug_assert_eq!(update_entry.key, existing_entry.key);
        let completion_handler: StoreCompletionHandler = Box::new(completion_handler);
        if self.inner.maximum_size.load(Ordering::Relaxed) == 0 {
            completion_handler(false, Data::default());
            return;
        }

        {
            let mut state = self.inner.state.lock();
            state.pending_writes.push_back(WriteOperation {
                entry: update_entry,
                existing_entry: Some(existing_entry),
                completion_handler,
            });
        }
        dispatch_pending_write_operations(&self.inner);
    }

    /// Visits every entry on disk, without bodies, one partition at a time.
    ///
    /// The handler receives `Some(entry)` per record and a final `None` as
    /// the completion signal.
    pub fn traverse(&self, handler: impl FnMut(Option<&Entry>) + Send + 'static) {
        let inner = Arc::clone(&self.inner);
        self.inner.io_queue.dispatch(move || {
            let mut handler = handler;
            traverse_cache_files(&inner.directory, |file_path, _file_name| {
                let Ok(channel) = IoChannel::open(file_path, Mode::Read) else {
                    return;
                };
                let Ok(file_data) = channel.read(0, TRAVERSE_HEADER_READ_SIZE) else {
                    return;
                };
                if let Ok((meta_data, header_data)) = decode_entry_header(&file_data) {
                    let entry = Entry {
                        key: meta_data.key,
                        time_stamp: meta_data.time_stamp,
                        header: header_data,
                        body: Data::default(),
                    };
                    handler(Some(&entry));
                }
            });
            handler(None);
        });
    }

    /// Forgets and deletes every entry.
    pub fn clear(&self) {
        debug!("clearing cache");
        self.inner.state.lock().contents_filter.clear();
        self.inner.approximate_size.store(0, Ordering::Relaxed);

        let directory = self.inner.directory.clone();
        self.inner.io_queue.dispatch(move || {
            let Ok(partitions) = fs::read_dir(&directory) else {
                return;
            };
            for partition in partitions.flatten() {
                let partition_path = partition.path();
                if !partition_path.is_dir() {
                    continue;
                }
                if let Ok(files) = fs::read_dir(&partition_path) {
                    for file in files.flatten() {
                        let file_path = file.path();
                        if file_path.is_file() {
                            let _ = fs::remove_file(file_path);
                        }
                    }
                }
                let _ = fs::remove_dir(&partition_path);
            }
        });
    }

    /// Sets the approximate size cap in bytes. 0 disables the cache:
    /// subsequent stores fail fast and retrieves report a miss. Lowering the
    /// cap below the current approximate size triggers a shrink.
    pub fn set_maximum_size(&self, size: u64) {
        self.inner.maximum_size.store(size, Ordering::Relaxed);
        shrink_if_needed(&self.inner);
    }

    /// Returns the current best-effort sum of on-disk entry sizes.
    pub fn approximate_size(&self) -> u64 {
        self.inner.approximate_size.load(Ordering::Relaxed)
    }

    /// Returns the versioned directory entries live under.
    pub fn directory_path(&self) -> &Path {
        &self.inner.directory
    }
}

fn file_path_for_key(key: &Key, directory: &Path) -> PathBuf {
    debug_assert!(!key.partition().is_empty());
    directory.join(key.partition()).join(key.hash_as_string())
}

/// Visits every regular file directly under every partition subdirectory.
fn traverse_cache_files(directory: &Path, mut f: impl FnMut(&Path, &str)) {
    let Ok(partitions) = fs::read_dir(directory) else {
        return;
    };
    for partition in partitions.flatten() {
        let partition_path = partition.path();
        if !partition_path.is_dir() {
            continue;
        }
        let Ok(files) = fs::read_dir(&partition_path) else {
            continue;
        };
        for file in files.flatten() {
            let file_path = file.path();
            if !file_path.is_file() {
                continue;
            }
            if let Some(file_name) = file_path.file_name().and_then(|name| name.to_str()) {
                f(&file_path, file_name);
            }
        }
    }
}

fn delete_empty_partition_directories(directory: &Path) {
    let Ok(partitions) = fs::read_dir(directory) else {
        return;
    };
    for partition in partitions.flatten() {
        let partition_path = partition.path();
        if partition_path.is_dir() {
            // Fails on non-empty directories, which is the point.
            let _ = fs::remove_dir(&partition_path);
        }
    }
}

/// Removes the entry's file and its filter membership.
///
/// The approximate size is not corrected downward; the next shrink rebuilds
/// it from the surviving files.
fn remove_entry(inner: &Arc<StorageInner>, key: &Key) {
    {
        let mut state = inner.state.lock();
        let short_hash = key.short_hash();
        if state.contents_filter.may_contain(short_hash) {
            state.contents_filter.remove(short_hash);
        }
    }

    let path = file_path_for_key(key, &inner.directory);
    inner.background_io_queue.dispatch(move || {
        let _ = fs::remove_file(path);
    });
}

fn dispatch_pending_read_operations(inner: &Arc<StorageInner>) {
    let mut to_dispatch = Vec::new();
    {
        let mut state = inner.state.lock();
        for priority in (0..=MAXIMUM_RETRIEVE_PRIORITY).rev() {
            if state.active_read_count >= MAXIMUM_ACTIVE_READ_OPERATIONS {
                debug!("limiting parallel retrieves");
                break;
            }
            if let Some(read) = state.pending_reads[priority].pop_front() {
                state.active_read_count += 1;
                to_dispatch.push(read);
            }
        }
    }
    for read in to_dispatch {
        dispatch_read_operation(inner, read);
    }
}

fn dispatch_read_operation(inner: &Arc<StorageInner>, read: ReadOperation) {
    let task_inner = Arc::clone(inner);
    inner.io_queue.dispatch(move || {
        let ReadOperation {
            key,
            completion_handler,
        } = read;

        let path = file_path_for_key(&key, &task_inner.directory);
        let result = IoChannel::open(&path, Mode::Read).and_then(|channel| {
            let file_data = channel.read(0, u64::MAX)?;
            decode_entry(&file_data, &channel, &key)
        });

        match result {
            Ok(entry) => {
                let accepted = completion_handler(Some(entry));
                debug!("read complete");
                if !accepted {
                    remove_entry(&task_inner, &key);
                }
            }
            Err(err) => {
                // A miss with a file on disk means the file is unreadable or
                // corrupt either way; purge it.
                debug!("read failed: {err}");
                remove_entry(&task_inner, &key);
                completion_handler(None);
            }
        }

        task_inner.state.lock().active_read_count -= 1;
        dispatch_pending_read_operations(&task_inner);
    });
}

fn dispatch_pending_write_operations(inner: &Arc<StorageInner>) {
    loop {
        let (id, write, header_write);
        {
            let mut state = inner.state.lock();
            if state.pending_writes.is_empty() {
                return;
            }
            if state.active_writes.len() >= MAXIMUM_ACTIVE_WRITE_OPERATIONS {
                debug!("limiting parallel writes");
                return;
            }
            let Some(operation) = state.pending_writes.pop_front() else {
                return;
            };
            id = state.next_write_id;
            state.next_write_id += 1;
            header_write = operation.existing_entry.is_some()
                && state
                    .contents_filter
                    .may_contain(operation.entry.key.short_hash());
            state.active_writes.push(ActiveWrite {
                id,
                entry: operation.entry.clone(),
            });
            write = operation;
        }

        if header_write {
            dispatch_header_write_operation(inner, id, write);
        } else {
            dispatch_full_write_operation(inner, id, write);
        }
    }
}

fn dispatch_full_write_operation(inner: &Arc<StorageInner>, id: u64, write: WriteOperation) {
    {
        // An update falling back to a full write arrives without the
        // speculative filter add that store() performs.
        let mut state = inner.state.lock();
        let short_hash = write.entry.key.short_hash();
        if !state.contents_filter.may_contain(short_hash) {
            state.contents_filter.add(short_hash);
        }
    }

    let task_inner = Arc::clone(inner);
    inner.background_io_queue.dispatch(move || {
        let WriteOperation {
            entry,
            completion_handler,
            ..
        } = write;

        let encoded_header = encode_entry_header(&entry);
        let payload = Data::concatenate(&encoded_header, &entry.body);
        let body_offset = encoded_header.len();
        let body_size = entry.body.len();

        let path = file_path_for_key(&entry.key, &task_inner.directory);
        let result = IoChannel::open(&path, Mode::Create).and_then(|mut channel| {
            channel.write(0, &payload)?;
            channel.commit()?;
            Ok(channel)
        });

        let (success, mapped_body) = match result {
            Ok(channel) => {
                let mapped_body = if body_size >= page_size() {
                    channel.map(body_offset, body_size).unwrap_or_default()
                } else {
                    Data::default()
                };
                (true, mapped_body)
            }
            Err(err) => {
                debug!("write failed: {err}");
                // Undo the speculative filter add so retrieves stop finding
                // a key with no file behind it.
                let mut state = task_inner.state.lock();
                let short_hash = entry.key.short_hash();
                if state.contents_filter.may_contain(short_hash) {
                    state.contents_filter.remove(short_hash);
                }
                (false, Data::default())
            }
        };

        // Counted whether or not the write succeeded; the sum is approximate
        // and the next shrink recomputes it from disk.
        task_inner
            .approximate_size
            .fetch_add(body_offset + body_size, Ordering::Relaxed);

        debug!("write complete success={success}");
        completion_handler(success, mapped_body);

        task_inner
            .state
            .lock()
            .active_writes
            .retain(|active| active.id != id);
        dispatch_pending_write_operations(&task_inner);
    });

    shrink_if_needed(inner);
}

fn dispatch_header_write_operation(inner: &Arc<StorageInner>, id: u64, write: WriteOperation) {
    let task_inner = Arc::clone(inner);
    inner.background_io_queue.dispatch(move || {
        let header_data = encode_entry_header(&write.entry);
        let existing_header_data = match &write.existing_entry {
            Some(existing_entry) => encode_entry_header(existing_entry),
            None => Data::default(),
        };

        if header_data.len() != existing_header_data.len() {
            debug!("page-rounded header size changed, storing full entry");
            // The operation keeps its active slot; the full write re-uses it.
            dispatch_full_write_operation(&task_inner, id, write);
            return;
        }

        let WriteOperation {
            entry,
            completion_handler,
            ..
        } = write;

        let path = file_path_for_key(&entry.key, &task_inner.directory);
        let result = IoChannel::open(&path, Mode::Write)
            .and_then(|channel| channel.write(0, &header_data));

        let success = result.is_ok();
        if !success {
            remove_entry(&task_inner, &entry.key);
        }

        debug!("update complete success={success}");
        completion_handler(success, Data::default());

        task_inner
            .state
            .lock()
            .active_writes
            .retain(|active| active.id != id);
        dispatch_pending_write_operations(&task_inner);
    });
}

fn shrink_if_needed(inner: &Arc<StorageInner>) {
    let maximum_size = inner.maximum_size.load(Ordering::Relaxed);
    let approximate_size = inner.approximate_size.load(Ordering::Relaxed);
    if approximate_size <= maximum_size {
        return;
    }
    {
        let mut state = inner.state.lock();
        if state.shrink_in_progress {
            return;
        }
        state.shrink_in_progress = true;
    }

    debug!("shrinking cache approximate_size={approximate_size} maximum_size={maximum_size}");
    inner.approximate_size.store(0, Ordering::Relaxed);

    let task_inner = Arc::clone(inner);
    inner.background_io_queue.dispatch(move || {
        traverse_cache_files(&task_inner.directory, |file_path, file_name| {
            let should_delete = rand::random::<f64>() < DELETION_PROBABILITY;
            if !should_delete {
                if let Ok(metadata) = fs::metadata(file_path) {
                    task_inner
                        .approximate_size
                        .fetch_add(metadata.len(), Ordering::Relaxed);
                }
                return;
            }

            let _ = fs::remove_file(file_path);
            if let Ok(hash) = Key::string_to_hash(file_name) {
                let short_hash = Key::to_short_hash(&hash);
                let mut state = task_inner.state.lock();
                if state.contents_filter.may_contain(short_hash) {
                    state.contents_filter.remove(short_hash);
                }
            }
        });

        delete_empty_partition_directories(&task_inner.directory);
        task_inner.state.lock().shrink_in_progress = false;

        debug!(
            "cache shrink completed approximate_size={}",
            task_inner.approximate_size.load(Ordering::Relaxed)
        );
    });
}

/// Deletes base-directory subdirectories left behind by cache layouts that
/// predate versioned directories. Other `Version *` directories are kept;
/// a rollback to the build that owns one finds it intact.
fn delete_old_versions(inner: &Arc<StorageInner>) {
    let base_directory = inner.base_directory.clone();
    inner.background_io_queue.dispatch(move || {
        let Ok(subdirectories) = fs::read_dir(&base_directory) else {
            return;
        };
        for subdirectory in subdirectories.flatten() {
            let name = subdirectory.file_name();
            let Some(name) = name.to_str() else {
                continue;
            };
            if name.starts_with(VERSION_DIRECTORY_PREFIX) {
                continue;
            }
            let path = subdirectory.path();
            if !path.is_dir() {
                continue;
            }
            if let Ok(files) = fs::read_dir(&path) {
                for file in files.flatten() {
                    let file_path = file.path();
                    if file_path.is_file() {
                        let _ = fs::remove_file(file_path);
                    }
                }
            }
            let _ = fs::remove_dir(&path);
        }
    });
}

/// Rebuilds the contents filter and the approximate size from the files
/// already on disk.
fn initialize(inner: &Arc<StorageInner>) {
    let task_inner = Arc::clone(inner);
    inner.background_io_queue.dispatch(move || {
        traverse_cache_files(&task_inner.directory, |file_path, file_name| {
            let Ok(hash) = Key::string_to_hash(file_name) else {
                return;
            };
            let short_hash = Key::to_short_hash(&hash);
            task_inner.state.lock().contents_filter.add(short_hash);
            if let Ok(metadata) = fs::metadata(file_path) {
                task_inner
                    .approximate_size
                    .fetch_add(metadata.len(), Ordering::Relaxed);
            }
        });
    });
}

//! Worker queues and per-file I/O channels.

pub mod channel;
pub mod queue;

pub use channel::{page_size, IoChannel, Mode};
pub use queue::WorkQueue;

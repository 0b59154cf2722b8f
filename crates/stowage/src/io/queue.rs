//! Worker queues backed by fixed thread pools.
//!
//! A [`WorkQueue`] drains boxed jobs from an unbounded channel with a fixed
//! number of named worker threads. Jobs on the same queue may run
//! concurrently; ordering within a queue is the channel's FIFO order per
//! worker pickup. Dropping the queue disconnects the channel; workers finish
//! the jobs already queued and exit, so every accepted job runs exactly
//! once.

use crossbeam_channel::{unbounded, Sender};
use std::thread;
use tracing::warn;

type Job = Box<dyn FnOnce() + Send + 'static>;

/// A concurrent queue of jobs executed by a fixed pool of worker threads.
pub struct WorkQueue {
    sender: Sender<Job>,
}

impl WorkQueue {
    /// Spawns `threads` named workers draining this queue.
    pub fn new(name: &str, threads: usize) -> Self {
        let threads = threads.max(1);
        let (sender, receiver) = unbounded::<Job>();
        for index in 0..threads {
            let receiver = receiver.clone();
            let thread_name = format!("{name}-{index}");
            let spawned = thread::Builder::new()
                .name(thread_name.clone())
                .spawn(move || {
                    while let Ok(job) = receiver.recv() {
                        job();
                    }
                });
            if spawned.is_err() {
                warn!(thread = %thread_name, "failed to spawn worker thread");
            }
        }
        Self { sender }
    }

    /// Enqueues a job. Never blocks.
    pub fn dispatch(&self, job: impl FnOnce() + Send + 'static) {
        // Send fails only once every worker has exited, which cannot happen
        // while the queue itself is alive.
        let _ = self.sender.send(Box::new(job));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::mpsc;
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn test_jobs_run() {
        let queue = WorkQueue::new("test", 2);
        let (tx, rx) = mpsc::channel();
        for i in 0..10 {
            let tx = tx.clone();
            queue.dispatch(move || {
                tx.send(i).unwrap();
            });
        }
        let mut seen: Vec<i32> = (0..10)
            .map(|_| rx.recv_timeout(Duration::from_secs(5)).unwrap())
            .collect();
        seen.sort_unstable();
        assert_eq!(seen, (0..10).collect::<Vec<_>>());
    }

    #[test]
    fn test_queued_jobs_survive_drop() {
        let counter = Arc::new(AtomicUsize::new(0));
        let (tx, rx) = mpsc::channel();
        {
            let queue = WorkQueue::new("test-drop", 1);
            for _ in 0..100 {
                let counter = Arc::clone(&counter);
                let tx = tx.clone();
                queue.dispatch(move || {
                    counter.fetch_add(1, Ordering::Relaxed);
                    let _ = tx.send(());
                });
            }
            // Queue dropped here with jobs still pending.
        }
        for _ in 0..100 {
            rx.recv_timeout(Duration::from_secs(5)).unwrap();
        }
        assert_eq!(counter.load(Ordering::Relaxed), 100);
    }

    #[test]
    fn test_single_thread_runs_in_order() {
        let queue = WorkQueue::new("test-fifo", 1);
        let (tx, rx) = mpsc::channel();
        for i in 0..50 {
            let tx = tx.clone();
            queue.dispatch(move || {
                tx.send(i).unwrap();
            });
        }
        let seen: Vec<i32> = (0..50)
            .map(|_| rx.recv_timeout(Duration::from_secs(5)).unwrap())
            .collect();
        assert_eq!(seen, (0..50).collect::<Vec<_>>());
    }
}

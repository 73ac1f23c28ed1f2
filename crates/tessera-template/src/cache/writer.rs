//! Deferred cache writes.
//!
//! A bounded queue feeds one worker thread. When the queue is full the
//! caller writes inline instead of blocking. [`BackgroundWriter::drain`]
//! waits until every queued write has finished; dropping the writer drains
//! it and joins the worker.

use std::path::PathBuf;
use std::sync::mpsc::{self, SyncSender, TrySendError};
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::thread::JoinHandle;

use super::lock::{self, LockOptions};

struct Job {
    path: PathBuf,
    contents: Vec<u8>,
}

#[derive(Default)]
struct Pending {
    count: Mutex<usize>,
    idle: Condvar,
}

impl Pending {
    fn add(&self) {
        *self.count.lock().unwrap_or_else(PoisonError::into_inner) += 1;
    }

    fn done(&self) {
        let mut count = self.count.lock().unwrap_or_else(PoisonError::into_inner);
        *count = count.saturating_sub(1);
        if *count == 0 {
            self.idle.notify_all();
        }
    }

    fn wait_idle(&self) {
        let mut count = self.count.lock().unwrap_or_else(PoisonError::into_inner);
        while *count > 0 {
            count = self
                .idle
                .wait(count)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }
}

fn write(job: &Job, options: LockOptions) {
    if let Err(e) = lock::write_locked(&job.path, &job.contents, options) {
        tracing::warn!(path = %job.path.display(), error = %e, "background cache write abandoned");
    }
}

/// A single worker thread writing cache files.
pub struct BackgroundWriter {
    sender: Mutex<Option<SyncSender<Job>>>,
    pending: Arc<Pending>,
    worker: Mutex<Option<JoinHandle<()>>>,
    lock: LockOptions,
}

impl BackgroundWriter {
    /// Starts the worker with room for `capacity` queued writes.
    pub fn new(capacity: usize, lock: LockOptions) -> Self {
        let (sender, receiver) = mpsc::sync_channel::<Job>(capacity.max(1));
        let pending = Arc::new(Pending::default());
        let worker_pending = Arc::clone(&pending);
        let worker = std::thread::Builder::new()
            .name("tessera-cache-writer".to_string())
            .spawn(move || {
                for job in receiver {
                    write(&job, lock);
                    worker_pending.done();
                }
            });
        let worker = match worker {
            Ok(handle) => Some(handle),
            Err(e) => {
                tracing::warn!(error = %e, "cache writer thread unavailable, writing inline");
                None
            }
        };
        let sender = worker.as_ref().map(|_| sender);
        Self {
            sender: Mutex::new(sender),
            pending,
            worker: Mutex::new(worker),
            lock,
        }
    }

    /// Queues a write, or performs it inline if the queue is full.
    pub fn submit(&self, path: PathBuf, contents: Vec<u8>) {
        let job = Job { path, contents };
        let sender = self
            .sender
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        let Some(sender) = sender else {
            write(&job, self.lock);
            return;
        };
        self.pending.add();
        if let Err(TrySendError::Full(job) | TrySendError::Disconnected(job)) = sender.try_send(job) {
            self.pending.done();
            tracing::debug!(path = %job.path.display(), "write queue full, writing inline");
            write(&job, self.lock);
        }
    }

    /// Blocks until every queued write has completed.
    pub fn drain(&self) {
        self.pending.wait_idle();
    }
}

impl std::fmt::Debug for BackgroundWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackgroundWriter")
            .field(
                "pending",
                &*self.pending.count.lock().unwrap_or_else(PoisonError::into_inner),
            )
            .finish_non_exhaustive()
    }
}

impl Drop for BackgroundWriter {
    fn drop(&mut self) {
        self.drain();
        // Closing the channel ends the worker loop.
        self.sender
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let worker = self
            .worker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = worker {
            let _ = handle.join();
        }
    }
}

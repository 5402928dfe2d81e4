//! Fixed-size pool of OS threads for blocking extraction work.
//!
//! Jobs go through a bounded queue; submitters wait for a free slot instead
//! of growing the backlog without limit. Results come back over a oneshot
//! channel so async callers can await them (or abandon them) without ever
//! blocking a runtime thread.

use std::{
    io,
    panic::{self, AssertUnwindSafe},
    sync::{Arc, Mutex, PoisonError},
    thread,
};

use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

type Job = Box<dyn FnOnce() + Send + 'static>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("worker pool is shut down")]
pub struct PoolClosed;

#[derive(Debug)]
pub struct WorkerPool {
    sender: Option<mpsc::Sender<Job>>,
    workers: Vec<thread::JoinHandle<()>>,
}

impl WorkerPool {
    pub fn new(size: usize, queue_capacity: usize) -> io::Result<Self> {
        let (sender, receiver) = mpsc::channel::<Job>(queue_capacity.max(1));
        let receiver = Arc::new(Mutex::new(receiver));

        let workers = (0..size.max(1))
            .map(|id| {
                let receiver = Arc::clone(&receiver);
                thread::Builder::new()
                    .name(format!("download-worker-{id}"))
                    .spawn(move || run_worker(id, receiver))
            })
            .collect::<io::Result<Vec<_>>>()?;

        debug!("started {} download workers", workers.len());

        Ok(Self {
            sender: Some(sender),
            workers,
        })
    }

    pub fn size(&self) -> usize {
        self.workers.len()
    }

    /// Queues `task` and returns a receiver for its result. Waits while the
    /// queue is full. A task that panics drops its sender, so the receiver
    /// reports an error instead of hanging.
    pub async fn submit<F, T>(&self, task: F) -> Result<oneshot::Receiver<T>, PoolClosed>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        let sender = self.sender.as_ref().ok_or(PoolClosed)?;
        let (result_tx, result_rx) = oneshot::channel();
        let job: Job = Box::new(move || {
            let _ = result_tx.send(task());
        });

        sender.send(job).await.map_err(|_| PoolClosed)?;
        Ok(result_rx)
    }

    /// Stops accepting work, lets queued jobs finish and joins every worker.
    /// Blocks the calling thread.
    pub fn shutdown(mut self) {
        self.sender.take();
        for worker in self.workers.drain(..) {
            if worker.join().is_err() {
                warn!("download worker exited abnormally");
            }
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        // Closing the queue is enough; idle workers exit on their own.
        self.sender.take();
    }
}

fn run_worker(id: usize, receiver: Arc<Mutex<mpsc::Receiver<Job>>>) {
    loop {
        let job = receiver
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .blocking_recv();

        let Some(job) = job else {
            break;
        };

        if panic::catch_unwind(AssertUnwindSafe(job)).is_err() {
            warn!("download worker {id}: job panicked");
        }
    }

    debug!("download worker {id} stopped");
}

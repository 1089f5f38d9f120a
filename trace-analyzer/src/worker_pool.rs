//! A fixed-size thread pool draining a queue of boxed closures, shared by the
//! provenance sink and the counter-stats/monitoring dispatch. Each submitted
//! job is a closure capturing an owned copy of its payload. Ordering within
//! one submission batch is preserved by submitting in order to the same
//! queue; ordering across batches handled by different workers is not
//! guaranteed.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

type Job = Box<dyn FnOnce() + Send>;

pub struct WorkerPool {
    tx: Option<crossbeam_channel::Sender<Job>>,
    handles: Vec<JoinHandle<()>>,
    pending: Arc<AtomicUsize>,
}

impl WorkerPool {
    pub fn new(num_workers: usize) -> Self {
        let (tx, rx) = crossbeam_channel::unbounded::<Job>();
        let pending = Arc::new(AtomicUsize::new(0));
        let handles = (0..num_workers.max(1))
            .map(|_| {
                let rx = rx.clone();
                let pending = Arc::clone(&pending);
                std::thread::spawn(move || {
                    while let Ok(job) = rx.recv() {
                        job();
                        pending.fetch_sub(1, Ordering::SeqCst);
                    }
                })
            })
            .collect();
        WorkerPool {
            tx: Some(tx),
            handles,
            pending,
        }
    }

    /// Enqueue `job`; returns immediately without waiting for it to run.
    pub fn submit(&self, job: Job) {
        self.pending.fetch_add(1, Ordering::SeqCst);
        if let Some(tx) = &self.tx {
            let _ = tx.send(job);
        }
    }

    /// Block until every submitted job has completed or `deadline` elapses.
    /// Returns `true` if the queue fully drained.
    pub fn drain(&self, deadline: Duration) -> bool {
        let start = Instant::now();
        while self.pending.load(Ordering::SeqCst) > 0 {
            if start.elapsed() >= deadline {
                return false;
            }
            std::thread::sleep(Duration::from_millis(1));
        }
        true
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.tx.take();
        for handle in self.handles.drain(..) {
            let _ = handle.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    #[test]
    fn drain_waits_for_all_jobs() {
        let pool = WorkerPool::new(4);
        let counter = Arc::new(AtomicU32::new(0));
        for _ in 0..50 {
            let counter = Arc::clone(&counter);
            pool.submit(Box::new(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            }));
        }
        assert!(pool.drain(Duration::from_secs(5)));
        assert_eq!(counter.load(Ordering::SeqCst), 50);
    }
}

//! Worker thread that owns a job queue
//!
//! This is the only place a queue is created implicitly: the spawned thread
//! builds its queue, hands a handle back, and runs it until stopped.
//! Everything else receives the queue handle explicitly.

use super::closure::Closure;
use super::queue::JobQueue;
use crate::error::{Error, Result};
use std::sync::mpsc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, error, info};

/// A named thread running a [`JobQueue`] until dropped
pub struct JobThread {
    name: String,
    queue: JobQueue,
    handle: Option<JoinHandle<()>>,
}

impl JobThread {
    /// Spawn the thread and wait until its queue exists
    pub fn spawn(name: impl Into<String>) -> Result<Self> {
        let name = name.into();
        let (queue_tx, queue_rx) = mpsc::sync_channel(1);

        let handle = thread::Builder::new().name(name.clone()).spawn(move || {
            let queue = JobQueue::new();
            if queue_tx.send(queue.clone()).is_err() {
                return;
            }
            queue.run_until_stopped();
        })?;

        let queue = queue_rx.recv().map_err(|_| {
            Error::InvalidState(format!("job thread '{}' exited during startup", name))
        })?;

        info!("Job thread '{}' started", name);
        Ok(Self {
            name,
            queue,
            handle: Some(handle),
        })
    }

    /// Handle to the thread's queue
    pub fn queue(&self) -> JobQueue {
        self.queue.clone()
    }

    /// Thread name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Schedule `f` on the job thread after `delay`
    pub fn schedule<F>(&self, f: F, delay: Duration) -> Closure
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.queue.schedule_fn(f, delay)
    }

    /// Run `f` on the job thread and block until it returns.
    ///
    /// # Panics
    /// Panics when called from the job thread itself, which would deadlock.
    pub fn run_sync<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce() -> R + Send + 'static,
        R: Send + 'static,
    {
        assert!(
            !self.queue.belongs_to_current_thread(),
            "run_sync() called from job thread '{}'",
            self.name
        );

        let (result_tx, result_rx) = mpsc::channel();
        self.queue.schedule(
            Closure::once(move || {
                let _ = result_tx.send(f());
            }),
            Duration::ZERO,
        );

        result_rx.recv().map_err(|_| {
            Error::InvalidState(format!(
                "job thread '{}' stopped before running the job",
                self.name
            ))
        })
    }
}

impl Drop for JobThread {
    fn drop(&mut self) {
        self.queue.stop_soon();
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                error!("Job thread '{}' panicked", self.name);
            } else {
                debug!("Job thread '{}' joined", self.name);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};

    #[test]
    fn test_run_sync_runs_on_job_thread() {
        let job_thread = JobThread::spawn("test-run-sync").unwrap();
        let caller = thread::current().id();

        let (on_thread, name, id) = job_thread
            .run_sync(|| {
                let queue = JobQueue::current().expect("queue bound on job thread");
                (
                    queue.belongs_to_current_thread(),
                    thread::current().name().map(str::to_owned),
                    thread::current().id(),
                )
            })
            .unwrap();

        assert!(on_thread);
        assert_eq!(name.as_deref(), Some("test-run-sync"));
        assert_ne!(id, caller);
    }

    #[test]
    fn test_jobs_never_overlap() {
        let job_thread = JobThread::spawn("test-serial").unwrap();
        let busy = Arc::new(AtomicBool::new(false));
        let overlaps = Arc::new(AtomicUsize::new(0));
        let thread_ids = Arc::new(Mutex::new(Vec::new()));

        let producers: Vec<_> = (0..4)
            .map(|_| {
                let queue = job_thread.queue();
                let busy = Arc::clone(&busy);
                let overlaps = Arc::clone(&overlaps);
                let thread_ids = Arc::clone(&thread_ids);
                thread::spawn(move || {
                    for _ in 0..50 {
                        let busy = Arc::clone(&busy);
                        let overlaps = Arc::clone(&overlaps);
                        let thread_ids = Arc::clone(&thread_ids);
                        queue.schedule(
                            Closure::new(move || {
                                if busy.swap(true, Ordering::SeqCst) {
                                    overlaps.fetch_add(1, Ordering::SeqCst);
                                }
                                thread_ids.lock().unwrap().push(thread::current().id());
                                busy.store(false, Ordering::SeqCst);
                            }),
                            Duration::ZERO,
                        );
                    }
                })
            })
            .collect();
        for producer in producers {
            producer.join().unwrap();
        }

        let job_thread_id = job_thread.run_sync(|| thread::current().id()).unwrap();
        let ids = thread_ids.lock().unwrap();

        assert_eq!(overlaps.load(Ordering::SeqCst), 0);
        assert_eq!(ids.len(), 200);
        assert!(ids.iter().all(|id| *id == job_thread_id));
    }

    #[test]
    fn test_drop_stops_and_joins() {
        let job_thread = JobThread::spawn("test-drop").unwrap();
        let queue = job_thread.queue();
        drop(job_thread);

        assert!(queue.is_stopped());
    }

    #[test]
    fn test_run_sync_after_stop_returns_error() {
        let job_thread = Arc::new(JobThread::spawn("test-stopped").unwrap());
        job_thread.queue().stop_soon();

        let (done_tx, done_rx) = mpsc::channel();
        let caller = Arc::clone(&job_thread);
        thread::spawn(move || {
            let _ = done_tx.send(caller.run_sync(|| 1));
        });

        let result = done_rx
            .recv_timeout(Duration::from_secs(2))
            .expect("run_sync blocked on a stopped job thread");
        assert!(matches!(result, Err(Error::InvalidState(_))));
        assert_eq!(job_thread.queue().pending_jobs(), 0);
    }
}

//! Job ownership and bulk cancellation

use super::closure::Closure;
use super::queue::{JobQueue, OwnerId, WeakJobQueue};
use std::time::Duration;
use tracing::trace;

/// A component that schedules jobs on a queue and cancels them on drop.
///
/// Dropping the owner removes its pending jobs and unregisters it, so later
/// schedules through an [`OwnerHandle`] are discarded. Drop the owner on the
/// queue's thread: that is what orders cancellation against job bodies.
pub struct JobOwner {
    queue: JobQueue,
    id: OwnerId,
}

impl JobOwner {
    /// Register a new owner on `queue`
    pub fn new(queue: &JobQueue) -> Self {
        let id = queue.register_owner();
        trace!("Job owner {} registered", id);
        Self {
            queue: queue.clone(),
            id,
        }
    }

    /// Register a new owner on the calling thread's queue.
    ///
    /// # Panics
    /// Panics when the calling thread has no queue.
    pub fn current() -> Self {
        let queue = JobQueue::current().expect("JobOwner::current() called on a thread without a JobQueue");
        Self::new(&queue)
    }

    /// The queue this owner schedules onto
    pub fn queue(&self) -> &JobQueue {
        &self.queue
    }

    /// True when called on the owning queue's thread
    pub fn belongs_to_current_thread(&self) -> bool {
        self.queue.belongs_to_current_thread()
    }

    /// Schedule `closure` tagged with this owner
    pub fn schedule(&self, closure: Closure, delay: Duration) {
        self.queue.schedule_job(closure, Some(self.id), delay);
    }

    /// Wrap, schedule and return a closure tagged with this owner
    pub fn schedule_fn<F>(&self, f: F, delay: Duration) -> Closure
    where
        F: Fn() + Send + Sync + 'static,
    {
        let closure = Closure::new(f);
        self.schedule(closure.clone(), delay);
        closure
    }

    /// Remove pending runs of `closure`, whoever scheduled them
    pub fn remove(&self, closure: &Closure) {
        self.queue.remove(closure);
    }

    /// Drop every pending job this owner scheduled. The owner stays usable.
    pub fn cancel_pending_jobs(&self) {
        self.queue.remove_jobs_by_token(self.id);
    }

    /// Thread-safe handle for scheduling on behalf of this owner.
    ///
    /// Foreign threads (native pipeline callbacks) use this to post work
    /// back onto the queue.
    pub fn handle(&self) -> OwnerHandle {
        OwnerHandle {
            queue: self.queue.downgrade(),
            id: self.id,
        }
    }
}

impl Drop for JobOwner {
    fn drop(&mut self) {
        if !std::thread::panicking() {
            debug_assert!(
                self.belongs_to_current_thread(),
                "JobOwner must be dropped on its queue's thread"
            );
        }
        self.queue.unregister_owner(self.id);
    }
}

impl std::fmt::Debug for JobOwner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobOwner").field("id", &self.id).finish()
    }
}

/// Cloneable, `Send + Sync` scheduling capability of a [`JobOwner`].
///
/// Holds no strong reference to the queue and never cancels anything. Jobs
/// scheduled after the owner was dropped, or after the queue is gone, are
/// silently discarded.
#[derive(Clone)]
pub struct OwnerHandle {
    queue: WeakJobQueue,
    id: OwnerId,
}

impl OwnerHandle {
    /// Schedule `closure` on behalf of the owner
    pub fn schedule(&self, closure: &Closure, delay: Duration) {
        match self.queue.upgrade() {
            Some(queue) => queue.schedule_job(closure.clone(), Some(self.id), delay),
            None => trace!("Job queue gone, dropping job for owner {}", self.id),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn counting_closure(count: &Arc<AtomicUsize>) -> Closure {
        let count = Arc::clone(count);
        Closure::new(move || {
            count.fetch_add(1, Ordering::SeqCst);
        })
    }

    #[test]
    fn test_cancel_pending_jobs_keeps_other_owners() {
        let queue = JobQueue::new();
        let mine = Arc::new(AtomicUsize::new(0));
        let theirs = Arc::new(AtomicUsize::new(0));

        let owner_a = JobOwner::new(&queue);
        let owner_b = JobOwner::new(&queue);
        owner_a.schedule(counting_closure(&mine), Duration::ZERO);
        owner_b.schedule(counting_closure(&theirs), Duration::ZERO);

        owner_a.cancel_pending_jobs();
        queue.run_until_idle();

        assert_eq!(mine.load(Ordering::SeqCst), 0);
        assert_eq!(theirs.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_owner_usable_after_cancel() {
        let queue = JobQueue::new();
        let count = Arc::new(AtomicUsize::new(0));
        let owner = JobOwner::new(&queue);

        owner.schedule(counting_closure(&count), Duration::ZERO);
        owner.cancel_pending_jobs();
        owner.schedule(counting_closure(&count), Duration::ZERO);
        queue.run_until_idle();

        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_drop_cancels_pending_jobs() {
        let queue = JobQueue::new();
        let count = Arc::new(AtomicUsize::new(0));

        let owner = JobOwner::new(&queue);
        owner.schedule(counting_closure(&count), Duration::ZERO);
        drop(owner);
        queue.run_until_idle();

        assert_eq!(count.load(Ordering::SeqCst), 0);
        assert_eq!(queue.pending_jobs(), 0);
    }

    #[test]
    fn test_handle_discards_jobs_after_owner_dropped() {
        let queue = JobQueue::new();
        let count = Arc::new(AtomicUsize::new(0));

        let owner = JobOwner::new(&queue);
        let handle = owner.handle();
        drop(owner);

        let remote = std::thread::spawn({
            let closure = counting_closure(&count);
            move || handle.schedule(&closure, Duration::ZERO)
        });
        remote.join().unwrap();
        queue.run_until_idle();

        assert_eq!(queue.pending_jobs(), 0);
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_current_uses_thread_queue() {
        let queue = JobQueue::new();
        let count = Arc::new(AtomicUsize::new(0));

        let owner = JobOwner::current();
        owner.schedule_fn(
            {
                let count = Arc::clone(&count);
                move || {
                    count.fetch_add(1, Ordering::SeqCst);
                }
            },
            Duration::ZERO,
        );
        queue.run_until_idle();

        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    #[should_panic(expected = "without a JobQueue")]
    fn test_current_without_queue_panics() {
        let _owner = JobOwner::current();
    }
}

//! Job queue bound to a single thread
//!
//! Pending jobs live in a map keyed by `(due_time, sequence)`, so iteration
//! order is due-time order with FIFO among equal due times. One mutex guards
//! the map; the condition variable is signalled on every schedule and on
//! stop. Job bodies run with the lock released.

use super::closure::Closure;
use std::cell::RefCell;
use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError, Weak};
use std::thread::{self, ThreadId};
use std::time::{Duration, Instant};
use tracing::{debug, trace};

thread_local! {
    /// Queue bound to this thread, if any
    static CURRENT: RefCell<Weak<Shared>> = RefCell::new(Weak::new());
}

/// Identity of a job owner, unique for the process lifetime
pub(crate) type OwnerId = u64;

static NEXT_OWNER_ID: AtomicU64 = AtomicU64::new(1);

struct Job {
    closure: Closure,
    owner: Option<OwnerId>,
}

struct Pending {
    jobs: BTreeMap<(Instant, u64), Job>,
    next_sequence: u64,
    /// Owners still alive; jobs for anyone else are discarded on schedule
    owners: HashSet<OwnerId>,
    stopped: bool,
}

struct Shared {
    thread_id: ThreadId,
    thread_name: Option<String>,
    pending: Mutex<Pending>,
    condition: Condvar,
}

impl Drop for Shared {
    fn drop(&mut self) {
        let pending = self.pending.get_mut().unwrap_or_else(PoisonError::into_inner);
        if !pending.jobs.is_empty() {
            debug!(
                "Job queue for {:?} dropped with {} pending jobs",
                self.thread_name,
                pending.jobs.len()
            );
        }
    }
}

/// Handle to a thread-affine job queue.
///
/// Cloning the handle does not create a new queue. The queue is bound to the
/// thread that called [`JobQueue::new`]; every job runs on that thread.
#[derive(Clone)]
pub struct JobQueue {
    shared: Arc<Shared>,
}

/// Non-owning handle, used by callers that must not keep the queue alive
#[derive(Clone)]
pub struct WeakJobQueue {
    shared: Weak<Shared>,
}

impl WeakJobQueue {
    /// Recover a strong handle if the queue still exists
    pub fn upgrade(&self) -> Option<JobQueue> {
        self.shared.upgrade().map(|shared| JobQueue { shared })
    }
}

impl JobQueue {
    /// Create a queue bound to the calling thread.
    ///
    /// # Panics
    /// Panics if a live queue is already bound to this thread.
    pub fn new() -> Self {
        let current = thread::current();
        let shared = Arc::new(Shared {
            thread_id: current.id(),
            thread_name: current.name().map(str::to_owned),
            pending: Mutex::new(Pending {
                jobs: BTreeMap::new(),
                next_sequence: 0,
                owners: HashSet::new(),
                stopped: false,
            }),
            condition: Condvar::new(),
        });

        CURRENT.with(|slot| {
            let mut slot = slot.borrow_mut();
            assert!(
                slot.upgrade().is_none(),
                "thread {:?} already has a JobQueue",
                current.name()
            );
            *slot = Arc::downgrade(&shared);
        });

        debug!("Job queue created on thread {:?}", current.name());
        Self { shared }
    }

    /// The queue bound to the calling thread, if any
    pub fn current() -> Option<JobQueue> {
        CURRENT
            .with(|slot| slot.borrow().upgrade())
            .map(|shared| JobQueue { shared })
    }

    /// Non-owning handle to this queue
    pub fn downgrade(&self) -> WeakJobQueue {
        WeakJobQueue {
            shared: Arc::downgrade(&self.shared),
        }
    }

    /// True when called on the queue's affinity thread
    pub fn belongs_to_current_thread(&self) -> bool {
        thread::current().id() == self.shared.thread_id
    }

    /// Schedule `closure` to run after `delay`. Callable from any thread.
    pub fn schedule(&self, closure: Closure, delay: Duration) {
        self.schedule_job(closure, None, delay);
    }

    /// Wrap `f` in a [`Closure`], schedule it, and return the closure so it
    /// can later be passed to [`JobQueue::remove`].
    pub fn schedule_fn<F>(&self, f: F, delay: Duration) -> Closure
    where
        F: Fn() + Send + Sync + 'static,
    {
        let closure = Closure::new(f);
        self.schedule(closure.clone(), delay);
        closure
    }

    /// Remove every pending job whose closure is `closure`
    pub fn remove(&self, closure: &Closure) {
        let mut pending = self.lock();
        pending.jobs.retain(|_, job| job.closure != *closure);
    }

    /// Number of jobs not yet run
    pub fn pending_jobs(&self) -> usize {
        self.lock().jobs.len()
    }

    /// Ask the run loop to exit. Idempotent, callable from any thread.
    ///
    /// Processing may not have stopped when this returns, but it stops
    /// before the next job is picked, so joining the thread afterwards is
    /// safe. Jobs still pending are never run: the run loop drops them on
    /// exit, and later submissions are dropped on arrival.
    pub fn stop_soon(&self) {
        let mut pending = self.lock();
        if !pending.stopped {
            pending.stopped = true;
            debug!("Job queue for {:?} stopping", self.shared.thread_name);
        }
        drop(pending);
        self.shared.condition.notify_all();
    }

    /// True once [`JobQueue::stop_soon`] has been called
    pub fn is_stopped(&self) -> bool {
        self.lock().stopped
    }

    /// Run jobs as they become due until [`JobQueue::stop_soon`] is called.
    ///
    /// # Panics
    /// Panics when called off the queue's thread.
    pub fn run_until_stopped(&self) {
        assert!(
            self.belongs_to_current_thread(),
            "run_until_stopped() must be called on the queue's thread"
        );
        while !self.is_stopped() {
            self.try_run_one_job(true);
        }
        self.discard_pending();
        debug!("Job queue for {:?} run loop exited", self.shared.thread_name);
    }

    /// Run every job that is already due, without blocking.
    ///
    /// # Panics
    /// Panics when called off the queue's thread.
    pub fn run_until_idle(&self) {
        assert!(
            self.belongs_to_current_thread(),
            "run_until_idle() must be called on the queue's thread"
        );
        while self.try_run_one_job(false) {}
        if self.is_stopped() {
            self.discard_pending();
        }
    }

    pub(crate) fn register_owner(&self) -> OwnerId {
        let id = NEXT_OWNER_ID.fetch_add(1, Ordering::Relaxed);
        self.lock().owners.insert(id);
        id
    }

    pub(crate) fn unregister_owner(&self, owner: OwnerId) {
        let mut pending = self.lock();
        pending.owners.remove(&owner);
        let before = pending.jobs.len();
        pending.jobs.retain(|_, job| job.owner != Some(owner));
        let removed = before - pending.jobs.len();
        if removed > 0 {
            trace!("Owner {} released with {} pending jobs cancelled", owner, removed);
        }
    }

    /// Drop every pending job tagged with `owner`.
    ///
    /// Must run on the queue's thread so it is ordered against job bodies.
    pub(crate) fn remove_jobs_by_token(&self, owner: OwnerId) {
        debug_assert!(
            self.belongs_to_current_thread(),
            "jobs may only be cancelled on the queue's thread"
        );
        let mut pending = self.lock();
        let before = pending.jobs.len();
        pending.jobs.retain(|_, job| job.owner != Some(owner));
        let removed = before - pending.jobs.len();
        if removed > 0 {
            trace!("Cancelled {} pending jobs for owner {}", removed, owner);
        }
    }

    pub(crate) fn schedule_job(&self, closure: Closure, owner: Option<OwnerId>, delay: Duration) {
        let due_time = Instant::now() + delay;
        let mut pending = self.lock();

        // The closure is dropped after the guard, releasing anything it
        // captured (such as a run_sync reply channel) without the lock held.
        if pending.stopped {
            trace!("Discarding job scheduled on stopped queue {:?}", self.shared.thread_name);
            return;
        }

        if let Some(owner) = owner {
            if !pending.owners.contains(&owner) {
                trace!("Discarding job for released owner {}", owner);
                return;
            }
        }

        let sequence = pending.next_sequence;
        pending.next_sequence += 1;
        pending.jobs.insert((due_time, sequence), Job { closure, owner });
        drop(pending);

        self.shared.condition.notify_one();
    }

    /// Drop every pending job. Closures are dropped with the lock released,
    /// since they may hold handles to this queue or channels others wait on.
    fn discard_pending(&self) {
        let jobs = std::mem::take(&mut self.lock().jobs);
        if !jobs.is_empty() {
            debug!(
                "Job queue for {:?} discarded {} pending jobs",
                self.shared.thread_name,
                jobs.len()
            );
        }
        drop(jobs);
    }

    /// Run at most one due job. Returns true if a job ran.
    ///
    /// With `wait_for_next_job` the call blocks until the head job is due or
    /// the queue is woken by a new submission or stop. Waking does not
    /// guarantee a job ran; callers loop.
    fn try_run_one_job(&self, wait_for_next_job: bool) -> bool {
        let job = {
            let mut pending = self.lock();
            if pending.stopped {
                return false;
            }

            let head = pending.jobs.keys().next().copied();
            match head {
                None => {
                    if wait_for_next_job {
                        let _unused = self
                            .shared
                            .condition
                            .wait(pending)
                            .unwrap_or_else(PoisonError::into_inner);
                    }
                    return false;
                }
                Some((due_time, _)) => {
                    let now = Instant::now();
                    if due_time > now {
                        if wait_for_next_job {
                            let _unused = self
                                .shared
                                .condition
                                .wait_timeout(pending, due_time - now)
                                .unwrap_or_else(PoisonError::into_inner);
                        }
                        return false;
                    }
                }
            }

            match head.and_then(|key| pending.jobs.remove(&key)) {
                Some(job) => job,
                None => return false,
            }
        };

        job.closure.run();
        true
    }

    fn lock(&self) -> MutexGuard<'_, Pending> {
        self.shared
            .pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for JobQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for JobQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobQueue")
            .field("thread", &self.shared.thread_name)
            .field("pending_jobs", &self.pending_jobs())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize};

    fn recorder() -> (Arc<Mutex<Vec<u32>>>, impl Fn(u32) -> Closure) {
        let order = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&order);
        let make = move |tag: u32| {
            let sink = Arc::clone(&sink);
            Closure::new(move || sink.lock().unwrap().push(tag))
        };
        (order, make)
    }

    #[test]
    fn test_current_is_bound_to_creating_thread() {
        assert!(JobQueue::current().is_none());
        let queue = JobQueue::new();
        assert!(queue.belongs_to_current_thread());
        assert!(JobQueue::current().is_some());

        let other = thread::spawn(|| JobQueue::current().is_none()).join().unwrap();
        assert!(other);
    }

    #[test]
    #[should_panic(expected = "already has a JobQueue")]
    fn test_second_queue_on_thread_panics() {
        let _first = JobQueue::new();
        let _second = JobQueue::new();
    }

    #[test]
    fn test_new_queue_allowed_after_previous_dropped() {
        drop(JobQueue::new());
        let _queue = JobQueue::new();
    }

    #[test]
    fn test_run_until_idle_runs_in_due_order() {
        let queue = JobQueue::new();
        let (order, make) = recorder();

        queue.schedule(make(1), Duration::from_millis(2));
        queue.schedule(make(2), Duration::ZERO);
        queue.schedule(make(3), Duration::ZERO);

        thread::sleep(Duration::from_millis(5));
        queue.run_until_idle();

        assert_eq!(*order.lock().unwrap(), vec![2, 3, 1]);
    }

    #[test]
    fn test_run_until_idle_skips_future_jobs() {
        let queue = JobQueue::new();
        let (order, make) = recorder();

        queue.schedule(make(1), Duration::from_secs(60));
        queue.schedule(make(2), Duration::ZERO);
        queue.run_until_idle();

        assert_eq!(*order.lock().unwrap(), vec![2]);
        assert_eq!(queue.pending_jobs(), 1);
    }

    #[test]
    fn test_remove_matches_closure_identity() {
        let queue = JobQueue::new();
        let (order, make) = recorder();

        let duplicate = make(1);
        queue.schedule(duplicate.clone(), Duration::ZERO);
        queue.schedule(duplicate.clone(), Duration::ZERO);
        queue.schedule(make(2), Duration::ZERO);

        queue.remove(&duplicate);
        queue.run_until_idle();

        assert_eq!(*order.lock().unwrap(), vec![2]);
    }

    #[test]
    fn test_jobs_scheduled_by_jobs_run_in_same_idle_pass() {
        let queue = JobQueue::new();
        let count = Arc::new(AtomicUsize::new(0));

        let inner_count = Arc::clone(&count);
        let inner_queue = queue.clone();
        queue.schedule_fn(
            move || {
                inner_count.fetch_add(1, Ordering::SeqCst);
                let nested = Arc::clone(&inner_count);
                inner_queue.schedule_fn(
                    move || {
                        nested.fetch_add(1, Ordering::SeqCst);
                    },
                    Duration::ZERO,
                );
            },
            Duration::ZERO,
        );

        queue.run_until_idle();
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_stop_soon_from_job_ends_run_loop() {
        let queue = JobQueue::new();
        let ran_late = Arc::new(AtomicBool::new(false));

        let stopper = queue.clone();
        queue.schedule_fn(move || stopper.stop_soon(), Duration::from_millis(10));
        let flag = Arc::clone(&ran_late);
        queue.schedule_fn(
            move || flag.store(true, Ordering::SeqCst),
            Duration::from_millis(200),
        );

        let started = Instant::now();
        queue.run_until_stopped();

        assert!(started.elapsed() < Duration::from_millis(200));
        assert!(!ran_late.load(Ordering::SeqCst));
        assert!(queue.is_stopped());
    }

    #[test]
    fn test_stop_soon_is_idempotent_and_blocks_idle_runs() {
        let queue = JobQueue::new();
        let (order, make) = recorder();

        queue.stop_soon();
        queue.stop_soon();
        queue.schedule(make(1), Duration::ZERO);
        queue.run_until_idle();

        assert!(order.lock().unwrap().is_empty());
        assert_eq!(queue.pending_jobs(), 0);
    }

    #[test]
    fn test_stopped_loop_releases_jobs_holding_the_queue() {
        let queue = JobQueue::new();
        let weak = queue.downgrade();

        let stopper = queue.clone();
        queue.schedule_fn(move || stopper.stop_soon(), Duration::ZERO);
        let keeper = queue.clone();
        queue.schedule_fn(move || keeper.stop_soon(), Duration::from_secs(60));

        queue.run_until_stopped();
        assert_eq!(queue.pending_jobs(), 0);

        drop(queue);
        assert!(weak.upgrade().is_none());
        assert!(JobQueue::current().is_none());
    }

    #[test]
    fn test_schedule_from_other_thread_wakes_run_loop() {
        let queue = JobQueue::new();
        let (order, make) = recorder();

        let remote = queue.clone();
        let job = make(7);
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            remote.schedule(job, Duration::ZERO);
            let stopper = remote.clone();
            remote.schedule_fn(move || stopper.stop_soon(), Duration::from_millis(5));
        });

        queue.run_until_stopped();
        handle.join().unwrap();

        assert_eq!(*order.lock().unwrap(), vec![7]);
    }
}

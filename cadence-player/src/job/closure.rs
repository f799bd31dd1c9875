//! Shareable units of deferred work

use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};

/// A zero-argument callable that can be scheduled any number of times.
///
/// Clones share identity: two `Closure`s compare equal only when one was
/// cloned from the other. [`JobQueue::remove`](super::JobQueue::remove)
/// matches on that identity.
#[derive(Clone)]
pub struct Closure(Arc<dyn Fn() + Send + Sync>);

impl Closure {
    /// Wrap a reusable callable
    pub fn new<F>(f: F) -> Self
    where
        F: Fn() + Send + Sync + 'static,
    {
        Self(Arc::new(f))
    }

    /// Wrap a callable that only makes sense once.
    ///
    /// Running the closure again after the first call is a no-op.
    pub fn once<F>(f: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        let slot = Mutex::new(Some(f));
        Self::new(move || {
            let f = slot.lock().unwrap_or_else(PoisonError::into_inner).take();
            if let Some(f) = f {
                f();
            }
        })
    }

    /// Invoke the closure on the calling thread
    pub fn run(&self) {
        (self.0)()
    }

    fn addr(&self) -> *const () {
        Arc::as_ptr(&self.0) as *const ()
    }
}

impl PartialEq for Closure {
    fn eq(&self, other: &Self) -> bool {
        self.addr() == other.addr()
    }
}

impl Eq for Closure {}

impl fmt::Debug for Closure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Closure({:p})", self.addr())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_clones_share_identity() {
        let a = Closure::new(|| {});
        let b = a.clone();
        let c = Closure::new(|| {});

        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn test_once_runs_a_single_time() {
        let count = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&count);
        let closure = Closure::once(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        closure.run();
        closure.run();
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }
}

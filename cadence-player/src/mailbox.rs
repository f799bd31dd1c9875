//! Single-slot status mailbox
//!
//! Carries one terminal status from the native pipeline's streaming thread
//! to the decoder's job thread. Capacity is exactly one: the backend posts
//! at most one terminal message between resets, and the consumer takes it
//! on the next update tick. A second post before the first is taken means
//! that contract was broken, and is asserted.

use ringbuf::{traits::*, HeapCons, HeapProd, HeapRb};
use std::sync::{Mutex, MutexGuard, PoisonError};

/// Bounded SPSC channel of capacity one
pub struct StatusMailbox<T> {
    producer: Mutex<HeapProd<T>>,
    consumer: Mutex<HeapCons<T>>,
}

impl<T> StatusMailbox<T> {
    pub fn new() -> Self {
        let (producer, consumer) = HeapRb::new(1).split();
        Self {
            producer: Mutex::new(producer),
            consumer: Mutex::new(consumer),
        }
    }

    /// Post a status.
    ///
    /// # Panics
    /// Panics if the previous status has not been taken yet.
    pub fn post(&self, status: T) {
        let rejected = lock(&self.producer).try_push(status).is_err();
        assert!(
            !rejected,
            "status mailbox overwritten before the previous status was taken"
        );
    }

    /// Take the pending status, if any
    pub fn take(&self) -> Option<T> {
        lock(&self.consumer).try_pop()
    }

    pub fn is_empty(&self) -> bool {
        lock(&self.consumer).is_empty()
    }

    /// Discard a pending status. Used on reset.
    pub fn clear(&self) {
        lock(&self.consumer).clear();
    }
}

impl<T> Default for StatusMailbox<T> {
    fn default() -> Self {
        Self::new()
    }
}

fn lock<G>(mutex: &Mutex<G>) -> MutexGuard<'_, G> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_post_then_take() {
        let mailbox = StatusMailbox::new();
        assert!(mailbox.is_empty());

        mailbox.post("eos");
        assert!(!mailbox.is_empty());
        assert_eq!(mailbox.take(), Some("eos"));
        assert_eq!(mailbox.take(), None);
    }

    #[test]
    fn test_slot_reusable_after_take() {
        let mailbox = StatusMailbox::new();
        mailbox.post(1);
        mailbox.take();
        mailbox.post(2);
        assert_eq!(mailbox.take(), Some(2));
    }

    #[test]
    fn test_clear_discards_status() {
        let mailbox = StatusMailbox::new();
        mailbox.post(1);
        mailbox.clear();
        assert!(mailbox.is_empty());
        mailbox.post(2);
        assert_eq!(mailbox.take(), Some(2));
    }

    #[test]
    #[should_panic(expected = "overwritten before the previous status was taken")]
    fn test_overwrite_panics() {
        let mailbox = StatusMailbox::new();
        mailbox.post(1);
        mailbox.post(2);
    }

    #[test]
    fn test_post_from_other_thread() {
        let mailbox = Arc::new(StatusMailbox::new());
        let producer = Arc::clone(&mailbox);
        std::thread::spawn(move || producer.post(String::from("error")))
            .join()
            .unwrap();

        assert_eq!(mailbox.take().as_deref(), Some("error"));
    }
}

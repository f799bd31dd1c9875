//! Thread-affine job scheduling
//!
//! A [`JobQueue`] runs closures on exactly one thread, in due-time order.
//! Any thread may schedule onto it. [`JobOwner`] tags jobs so they can be
//! cancelled together, and cancels them automatically when dropped.
//! [`JobThread`] is the thread bootstrap that owns one queue.

mod closure;
mod owner;
mod queue;
mod thread;

pub use closure::Closure;
pub use owner::{JobOwner, OwnerHandle};
pub use queue::{JobQueue, WeakJobQueue};
pub use thread::JobThread;

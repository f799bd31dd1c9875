//! # Cadence Player Library (cadence-player)
//!
//! Thread-affine job scheduling and the media decoder adapters built on it.
//!
//! **Purpose:** Run every decoder state change on one job thread while a
//! native pipeline pushes and pulls data from its own streaming thread.
//!
//! **Architecture:** [`job::JobQueue`] serialises work onto a single thread.
//! The [`decoder`] adapters bridge a callback-driven [`pipeline`] into that
//! model, with a single-slot [`mailbox`] for terminal status and a bounded
//! [`pool`] of video frames for back-pressure.

pub mod config;
pub mod decoder;
pub mod error;
pub mod job;
pub mod mailbox;
pub mod media;
pub mod pipeline;
pub mod pool;
pub mod session;

pub use config::PlayerConfig;
pub use error::{Error, Result};

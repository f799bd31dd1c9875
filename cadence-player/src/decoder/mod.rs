//! Decoder adapters over native pipelines
//!
//! An adapter owns an input queue fed by [`MediaDecoder::decode`] and an
//! output queue drained by [`MediaDecoder::read`]. The native pipeline pulls
//! from the first and pushes into the second from its own streaming thread;
//! every state change the adapter makes happens on its job queue's thread.
//!
//! The audio and video adapters share one engine and differ only in how a
//! native sample becomes an output buffer.

mod audio;
mod engine;
mod video;

pub use audio::AudioDecoder;
pub use video::VideoDecoder;

use crate::error::Result;
use crate::job::Closure;
use crate::media::InputBuffer;
use serde::Serialize;
use std::sync::Arc;

/// Result of [`MediaDecoder::read`]
#[derive(Debug, Clone)]
pub enum DecoderOutput<T> {
    /// One decoded buffer
    Buffer(T),
    /// The stream is complete; nothing follows until reset
    EndOfStream,
    /// Nothing queued
    Empty,
}

impl<T> DecoderOutput<T> {
    pub fn is_end_of_stream(&self) -> bool {
        matches!(self, DecoderOutput::EndOfStream)
    }

    pub fn into_buffer(self) -> Option<T> {
        match self {
            DecoderOutput::Buffer(buffer) => Some(buffer),
            _ => None,
        }
    }
}

/// Cumulative adapter counters. Survive `reset()`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PipelineStats {
    pub inputs_queued: u64,
    pub inputs_consumed: u64,
    pub outputs_delivered: u64,
    /// Deliveries declined because no output buffer was available
    pub backpressure_retries: u64,
    pub enough_data_signals: u64,
    pub flow_pauses: u64,
    pub flow_resumes: u64,
    pub errors: u64,
    pub eos_delivered: u64,
}

/// Operations shared by the audio and video adapters.
///
/// Every method must be called on the adapter's job queue thread.
pub trait MediaDecoder {
    type Output;

    /// Register the output and error callbacks.
    ///
    /// `output_cb` is scheduled once per queued output (including the
    /// end-of-stream marker). `error_cb` is scheduled once per failure.
    ///
    /// # Panics
    /// Panics when called twice.
    fn initialize(&self, output_cb: Closure, error_cb: Closure);

    /// Queue `input` for the native pipeline. `consumed_cb` is scheduled
    /// once the pipeline has taken it.
    fn decode(&self, input: Arc<InputBuffer>, consumed_cb: Closure);

    /// Mark the input complete. Stays set until [`MediaDecoder::reset`].
    fn write_end_of_stream(&self);

    fn end_of_stream_written(&self) -> bool;

    /// Pop the oldest decoded output
    fn read(&self) -> DecoderOutput<Self::Output>;

    /// Drop all queued data and pending callbacks and re-arm the pipeline
    fn reset(&self) -> Result<()>;

    fn stats(&self) -> PipelineStats;

    /// First failure reported since the last reset
    fn error(&self) -> Option<String>;
}

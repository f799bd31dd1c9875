//! Native pipeline boundary
//!
//! A native pipeline runs its own streaming thread and talks to the decoder
//! through callbacks. The decoder implements [`PipelineSink`]; the backend
//! implements [`NativePipeline`]. Sink callbacks arrive on the backend's
//! thread and must only hand data over and post jobs, never run decoder
//! logic directly.

pub mod loopback;

pub use loopback::{LoopbackPipeline, PassthroughAudio, PlanarVideo, SampleTransform};

use crate::error::Result;
use crate::media::{InputBuffer, PcmFormat};
use crate::pool::FrameGeometry;
use std::fmt;
use std::sync::Arc;

/// Native pipeline state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PipelineState {
    /// Resources released
    Null,
    /// Configured, no data flowing, buffered samples dropped
    Ready,
    /// Data flow held
    Paused,
    /// Data flowing
    Playing,
}

impl fmt::Display for PipelineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PipelineState::Null => "null",
            PipelineState::Ready => "ready",
            PipelineState::Paused => "paused",
            PipelineState::Playing => "playing",
        };
        f.write_str(name)
    }
}

/// Answer to a need-data request
#[derive(Debug, Clone)]
pub enum Feed {
    /// Next input buffer
    Buffer(Arc<InputBuffer>),
    /// No more input will arrive
    EndOfStream,
    /// Nothing queued yet; ask again later
    Pending,
}

/// Terminal status posted by the backend
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BusMessage {
    EndOfStream,
    Error(String),
}

/// Layout of a native sample
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SampleFormat {
    /// PCM in the backend's own encoding and layout
    Audio { channels: u16, pcm: PcmFormat },
    /// Planar YUV 4:2:0 picture
    Video(FrameGeometry),
}

/// One decoded unit produced by the backend
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NativeSample {
    pub data: Vec<u8>,
    /// Presentation time in nanoseconds
    pub pts_nanos: i64,
    pub format: SampleFormat,
}

/// Callbacks invoked on the backend's streaming thread
pub trait PipelineSink: Send + Sync {
    /// The backend wants more input
    fn on_need_data(&self) -> Feed;

    /// The backend's input queue is full
    fn on_enough_data(&self);

    /// A decoded sample is ready
    fn on_new_sample(&self, sample: NativeSample);

    /// End of stream or a fatal error
    fn on_message(&self, message: BusMessage);
}

/// A native decode pipeline driven from the decoder's job thread.
///
/// After `set_state(PipelineState::Ready)` returns the backend has dropped
/// every buffered sample and does not call the sink again until it is set
/// back to `Playing`.
pub trait NativePipeline: Send {
    /// Attach the sink receiving callbacks. Called once, before `Playing`.
    fn connect(&mut self, sink: Arc<dyn PipelineSink>);

    fn set_state(&mut self, state: PipelineState) -> Result<()>;

    fn state(&self) -> PipelineState;
}

//! Software loopback backend
//!
//! Stands in for a native decode pipeline: a streaming thread pulls input
//! through need-data callbacks into a bounded feed queue, runs each input
//! through a [`SampleTransform`], and emits the result as a new sample.
//! After the last input it posts end-of-stream; a failed transform posts an
//! error. Either halts the stream until the pipeline is reset to `Ready`.
//!
//! Sink callbacks are made with the backend lock held, so a `set_state`
//! call never overlaps a callback in flight.

use super::{BusMessage, Feed, NativePipeline, NativeSample, PipelineSink, PipelineState, SampleFormat};
use crate::error::{Error, Result};
use crate::media::{media_time_to_nanos, InputBuffer, PcmFormat, SampleType, StorageType};
use crate::pool::FrameGeometry;
use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, error, trace, warn};

/// Back-off while the sink has nothing to feed
const STARVED_WAIT: Duration = Duration::from_millis(1);

/// Turns one input buffer into one native sample
pub trait SampleTransform: Send + 'static {
    fn transform(&mut self, input: &InputBuffer) -> Result<NativeSample>;
}

impl<F> SampleTransform for F
where
    F: FnMut(&InputBuffer) -> Result<NativeSample> + Send + 'static,
{
    fn transform(&mut self, input: &InputBuffer) -> Result<NativeSample> {
        self(input)
    }
}

/// Treats input bytes as already-decoded PCM
#[derive(Debug, Clone, Copy)]
pub struct PassthroughAudio {
    channels: u16,
    pcm: PcmFormat,
}

impl PassthroughAudio {
    /// Interleaved Float32 input
    pub fn new(channels: u16) -> Self {
        Self::with_format(channels, PcmFormat::new(SampleType::Float32, StorageType::Interleaved))
    }

    pub fn with_format(channels: u16, pcm: PcmFormat) -> Self {
        Self { channels, pcm }
    }
}

impl SampleTransform for PassthroughAudio {
    fn transform(&mut self, input: &InputBuffer) -> Result<NativeSample> {
        if input.size() == 0 {
            return Err(Error::Decode(format!(
                "empty audio payload at {}us",
                input.timestamp()
            )));
        }
        Ok(NativeSample {
            data: input.data().to_vec(),
            pts_nanos: media_time_to_nanos(input.timestamp()),
            format: SampleFormat::Audio {
                channels: self.channels,
                pcm: self.pcm,
            },
        })
    }
}

/// Lays input bytes into a zero-filled planar frame of fixed geometry
#[derive(Debug, Clone, Copy)]
pub struct PlanarVideo {
    geometry: FrameGeometry,
}

impl PlanarVideo {
    pub fn new(geometry: FrameGeometry) -> Self {
        Self { geometry }
    }
}

impl SampleTransform for PlanarVideo {
    fn transform(&mut self, input: &InputBuffer) -> Result<NativeSample> {
        let frame_len = self.geometry.byte_len();
        if input.size() > frame_len {
            return Err(Error::Decode(format!(
                "{} byte payload exceeds {}x{} frame",
                input.size(),
                self.geometry.width,
                self.geometry.height
            )));
        }
        let mut data = vec![0u8; frame_len];
        data[..input.size()].copy_from_slice(input.data());
        Ok(NativeSample {
            data,
            pts_nanos: media_time_to_nanos(input.timestamp()),
            format: SampleFormat::Video(self.geometry),
        })
    }
}

struct LoopbackState {
    state: PipelineState,
    sink: Option<Arc<dyn PipelineSink>>,
    feed: VecDeque<Arc<InputBuffer>>,
    input_ended: bool,
    /// A terminal message was posted; nothing more until reset
    halted: bool,
    shutdown: bool,
}

struct LoopbackShared {
    name: String,
    feed_limit: usize,
    state: Mutex<LoopbackState>,
    condition: Condvar,
}

impl LoopbackShared {
    fn lock(&self) -> MutexGuard<'_, LoopbackState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// In-process [`NativePipeline`] with its own streaming thread
pub struct LoopbackPipeline {
    shared: Arc<LoopbackShared>,
    handle: Option<JoinHandle<()>>,
}

impl LoopbackPipeline {
    /// Start a backend in the `Null` state.
    ///
    /// `feed_queue_limit` bounds how many inputs are pulled ahead of the
    /// transform; reaching it signals enough-data.
    pub fn new(
        name: impl Into<String>,
        transform: impl SampleTransform,
        feed_queue_limit: usize,
    ) -> Result<Self> {
        let name = name.into();
        if feed_queue_limit == 0 {
            return Err(Error::Config(format!(
                "loopback '{}' needs a feed queue limit above zero",
                name
            )));
        }

        let shared = Arc::new(LoopbackShared {
            name: name.clone(),
            feed_limit: feed_queue_limit,
            state: Mutex::new(LoopbackState {
                state: PipelineState::Null,
                sink: None,
                feed: VecDeque::new(),
                input_ended: false,
                halted: false,
                shutdown: false,
            }),
            condition: Condvar::new(),
        });

        let thread_shared = Arc::clone(&shared);
        let handle = thread::Builder::new()
            .name(format!("{}-stream", name))
            .spawn(move || stream_loop(thread_shared, transform))?;

        debug!("Loopback pipeline '{}' created", name);
        Ok(Self {
            shared,
            handle: Some(handle),
        })
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }
}

impl NativePipeline for LoopbackPipeline {
    fn connect(&mut self, sink: Arc<dyn PipelineSink>) {
        let mut state = self.shared.lock();
        if state.sink.is_some() {
            warn!("Loopback '{}' sink replaced", self.shared.name);
        }
        state.sink = Some(sink);
    }

    fn set_state(&mut self, target: PipelineState) -> Result<()> {
        let mut state = self.shared.lock();
        if target == PipelineState::Playing && state.sink.is_none() {
            return Err(Error::Pipeline(format!(
                "loopback '{}' cannot play without a sink",
                self.shared.name
            )));
        }

        if matches!(target, PipelineState::Ready | PipelineState::Null) {
            let dropped = state.feed.len();
            state.feed.clear();
            state.input_ended = false;
            state.halted = false;
            if dropped > 0 {
                trace!("Loopback '{}' dropped {} queued inputs", self.shared.name, dropped);
            }
        }

        if state.state != target {
            debug!("Loopback '{}' {} -> {}", self.shared.name, state.state, target);
            state.state = target;
        }
        drop(state);

        self.shared.condition.notify_all();
        Ok(())
    }

    fn state(&self) -> PipelineState {
        self.shared.lock().state
    }
}

impl Drop for LoopbackPipeline {
    fn drop(&mut self) {
        self.shared.lock().shutdown = true;
        self.shared.condition.notify_all();
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                error!("Loopback '{}' streaming thread panicked", self.shared.name);
            }
        }
        debug!("Loopback pipeline '{}' destroyed", self.shared.name);
    }
}

fn stream_loop(shared: Arc<LoopbackShared>, mut transform: impl SampleTransform) {
    let mut guard = shared.lock();
    loop {
        if guard.shutdown {
            break;
        }

        let running = guard.state == PipelineState::Playing && !guard.halted;
        let sink = match (running, guard.sink.clone()) {
            (true, Some(sink)) => sink,
            _ => {
                guard = shared
                    .condition
                    .wait(guard)
                    .unwrap_or_else(PoisonError::into_inner);
                continue;
            }
        };

        while !guard.input_ended && guard.feed.len() < shared.feed_limit {
            match sink.on_need_data() {
                Feed::Buffer(input) => {
                    guard.feed.push_back(input);
                    if guard.feed.len() == shared.feed_limit {
                        sink.on_enough_data();
                    }
                }
                Feed::EndOfStream => guard.input_ended = true,
                Feed::Pending => break,
            }
        }

        if let Some(input) = guard.feed.pop_front() {
            match transform.transform(&input) {
                Ok(sample) => sink.on_new_sample(sample),
                Err(e) => {
                    warn!("Loopback '{}' failed at {}us: {}", shared.name, input.timestamp(), e);
                    guard.halted = true;
                    sink.on_message(BusMessage::Error(e.to_string()));
                }
            }
            continue;
        }

        if guard.input_ended {
            debug!("Loopback '{}' reached end of stream", shared.name);
            guard.halted = true;
            sink.on_message(BusMessage::EndOfStream);
            continue;
        }

        guard = shared
            .condition
            .wait_timeout(guard, STARVED_WAIT)
            .unwrap_or_else(PoisonError::into_inner)
            .0;
    }
    trace!("Loopback '{}' streaming thread exiting", shared.name);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    #[derive(Debug, Clone, PartialEq)]
    enum Event {
        Sample(i64),
        EnoughData,
        Message(BusMessage),
    }

    #[derive(Default)]
    struct RecordingSink {
        inputs: Mutex<VecDeque<Feed>>,
        events: Mutex<Vec<Event>>,
    }

    impl RecordingSink {
        fn with_inputs(count: i64, end: bool) -> Arc<Self> {
            let sink = Self::default();
            {
                let mut inputs = sink.inputs.lock().unwrap();
                for i in 0..count {
                    inputs.push_back(Feed::Buffer(Arc::new(InputBuffer::new(vec![1, 2], i * 10))));
                }
                if end {
                    inputs.push_back(Feed::EndOfStream);
                }
            }
            Arc::new(sink)
        }

        fn events(&self) -> Vec<Event> {
            self.events.lock().unwrap().clone()
        }

        fn wait_for(&self, timeout: Duration, done: impl Fn(&[Event]) -> bool) -> bool {
            let deadline = Instant::now() + timeout;
            while Instant::now() < deadline {
                if done(&self.events()) {
                    return true;
                }
                thread::sleep(Duration::from_millis(1));
            }
            false
        }
    }

    impl PipelineSink for RecordingSink {
        fn on_need_data(&self) -> Feed {
            self.inputs.lock().unwrap().pop_front().unwrap_or(Feed::Pending)
        }

        fn on_enough_data(&self) {
            self.events.lock().unwrap().push(Event::EnoughData);
        }

        fn on_new_sample(&self, sample: NativeSample) {
            self.events.lock().unwrap().push(Event::Sample(sample.pts_nanos));
        }

        fn on_message(&self, message: BusMessage) {
            self.events.lock().unwrap().push(Event::Message(message));
        }
    }

    fn samples(events: &[Event]) -> Vec<i64> {
        events
            .iter()
            .filter_map(|event| match event {
                Event::Sample(pts) => Some(*pts),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_plays_inputs_then_posts_eos() {
        let sink = RecordingSink::with_inputs(3, true);
        let mut pipeline = LoopbackPipeline::new("test-eos", PassthroughAudio::new(1), 4).unwrap();
        pipeline.connect(sink.clone());
        pipeline.set_state(PipelineState::Playing).unwrap();

        assert!(sink.wait_for(Duration::from_secs(2), |events| {
            events.contains(&Event::Message(BusMessage::EndOfStream))
        }));

        let events = sink.events();
        assert_eq!(samples(&events), vec![0, 10_000, 20_000]);
        assert_eq!(events.last(), Some(&Event::Message(BusMessage::EndOfStream)));
    }

    #[test]
    fn test_enough_data_when_feed_fills() {
        let sink = RecordingSink::with_inputs(5, false);
        let mut pipeline = LoopbackPipeline::new("test-enough", PassthroughAudio::new(1), 2).unwrap();
        pipeline.connect(sink.clone());
        pipeline.set_state(PipelineState::Playing).unwrap();

        assert!(sink.wait_for(Duration::from_secs(2), |events| samples(events).len() == 5));
        assert!(sink.events().contains(&Event::EnoughData));
    }

    #[test]
    fn test_ready_stops_callbacks() {
        let sink = RecordingSink::with_inputs(2, false);
        let mut pipeline = LoopbackPipeline::new("test-ready", PassthroughAudio::new(1), 4).unwrap();
        pipeline.connect(sink.clone());
        pipeline.set_state(PipelineState::Playing).unwrap();
        assert!(sink.wait_for(Duration::from_secs(2), |events| samples(events).len() == 2));

        pipeline.set_state(PipelineState::Ready).unwrap();
        let seen = sink.events().len();
        sink.inputs
            .lock()
            .unwrap()
            .push_back(Feed::Buffer(Arc::new(InputBuffer::new(vec![3], 99))));
        thread::sleep(Duration::from_millis(20));

        assert_eq!(sink.events().len(), seen);
        assert_eq!(pipeline.state(), PipelineState::Ready);
    }

    #[test]
    fn test_transform_error_posts_message_and_halts() {
        let sink = RecordingSink::with_inputs(3, true);
        let failing = |input: &InputBuffer| -> Result<NativeSample> {
            Err(Error::Decode(format!("corrupt input at {}", input.timestamp())))
        };
        let mut pipeline = LoopbackPipeline::new("test-error", failing, 4).unwrap();
        pipeline.connect(sink.clone());
        pipeline.set_state(PipelineState::Playing).unwrap();

        assert!(sink.wait_for(Duration::from_secs(2), |events| {
            events.iter().any(|event| matches!(event, Event::Message(_)))
        }));
        thread::sleep(Duration::from_millis(20));

        let messages: Vec<_> = sink
            .events()
            .into_iter()
            .filter(|event| matches!(event, Event::Message(_)))
            .collect();
        assert_eq!(messages.len(), 1);
        assert!(matches!(&messages[0], Event::Message(BusMessage::Error(text)) if text.contains("corrupt")));
    }

    #[test]
    fn test_play_without_sink_fails() {
        let mut pipeline = LoopbackPipeline::new("test-nosink", PassthroughAudio::new(1), 4).unwrap();
        assert!(matches!(
            pipeline.set_state(PipelineState::Playing),
            Err(Error::Pipeline(_))
        ));
        assert_eq!(pipeline.state(), PipelineState::Null);
    }

    #[test]
    fn test_planar_video_pads_frame() {
        let geometry = FrameGeometry::new(4, 2, 4, 2);
        let mut transform = PlanarVideo::new(geometry);
        let sample = transform.transform(&InputBuffer::new(vec![9; 3], 5)).unwrap();

        assert_eq!(sample.data.len(), geometry.byte_len());
        assert_eq!(&sample.data[..4], &[9, 9, 9, 0]);
        assert_eq!(sample.pts_nanos, 5_000);
        assert_eq!(sample.format, SampleFormat::Video(geometry));

        let oversized = InputBuffer::new(vec![0; 64], 0);
        assert!(transform.transform(&oversized).is_err());
    }

    #[test]
    fn test_zero_feed_limit_rejected() {
        assert!(LoopbackPipeline::new("test-zero", PassthroughAudio::new(1), 0).is_err());
    }
}

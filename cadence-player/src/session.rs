//! Demo playback session
//!
//! Wires synthetic streams through loopback pipelines into the decoders and
//! plays the renderer's part: feeding input as it is consumed, reading every
//! announced output and holding the newest few. Everything here runs on the
//! session's job thread.

use crate::config::PlayerConfig;
use crate::decoder::{AudioDecoder, DecoderOutput, MediaDecoder, PipelineStats, VideoDecoder};
use crate::error::{Error, Result};
use crate::job::{Closure, JobQueue};
use crate::media::{AudioHeader, InputBuffer, MediaTime};
use crate::pipeline::{LoopbackPipeline, PassthroughAudio, PlanarVideo};
use crate::pool::{FrameGeometry, PoolStats};
use serde::Serialize;
use std::collections::VecDeque;
use std::f32::consts::TAU;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Instant;
use tracing::{debug, info, warn};

const AUDIO_CHANNELS: u16 = 2;
const AUDIO_SAMPLE_RATE: u32 = 48_000;
const AUDIO_FRAMES_PER_BUFFER: usize = 256;
const AUDIO_TONE_HZ: f32 = 440.0;

const VIDEO_FRAME_INTERVAL: MediaTime = 33_333;
const VIDEO_GEOMETRY: FrameGeometry = FrameGeometry {
    width: 64,
    height: 36,
    stride: 64,
    slice_height: 36,
};

/// Outputs the renderer keeps before releasing the oldest
const HELD_OUTPUTS: usize = 3;

/// Which streams to play and how much input to push
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionPlan {
    pub audio: bool,
    pub video: bool,
    pub buffers_per_stream: usize,
    /// Inputs handed to a decoder before waiting for consumption
    pub max_in_flight: usize,
}

impl Default for SessionPlan {
    fn default() -> Self {
        Self {
            audio: true,
            video: true,
            buffers_per_stream: 120,
            max_in_flight: 8,
        }
    }
}

/// Outcome of one stream
#[derive(Debug, Clone, Serialize)]
pub struct StreamReport {
    pub stats: PipelineStats,
    pub outputs_read: u64,
    pub finished: bool,
    pub error: Option<String>,
}

/// Outcome of a session
#[derive(Debug, Clone, Serialize)]
pub struct SessionReport {
    pub audio: Option<StreamReport>,
    pub video: Option<StreamReport>,
    pub frame_pool: Option<PoolStats>,
    pub elapsed_ms: u64,
}

/// Fires the completion callback once every stream has finished
struct Completion {
    remaining: usize,
    on_complete: Option<Box<dyn FnOnce() + Send>>,
}

impl Completion {
    fn stream_finished(completion: &Mutex<Completion>) {
        let on_complete = {
            let mut completion = lock(completion);
            completion.remaining = completion.remaining.saturating_sub(1);
            if completion.remaining > 0 {
                return;
            }
            completion.on_complete.take()
        };
        if let Some(on_complete) = on_complete {
            on_complete();
        }
    }
}

/// Renderer-side state for one decoder
struct StreamDriver<D: MediaDecoder> {
    name: &'static str,
    decoder: D,
    inputs: VecDeque<Arc<InputBuffer>>,
    consumed_cb: Closure,
    in_flight: usize,
    max_in_flight: usize,
    outputs_read: u64,
    held: VecDeque<D::Output>,
    finished: bool,
    completion: Arc<Mutex<Completion>>,
}

impl<D: MediaDecoder> StreamDriver<D> {
    /// Hand inputs to the decoder up to the in-flight limit
    fn feed(&mut self) {
        while self.in_flight < self.max_in_flight {
            let Some(input) = self.inputs.pop_front() else {
                break;
            };
            self.decoder.decode(input, self.consumed_cb.clone());
            self.in_flight += 1;
        }
        if self.inputs.is_empty() && !self.decoder.end_of_stream_written() {
            debug!("{}: all input submitted", self.name);
            self.decoder.write_end_of_stream();
        }
    }

    fn on_consumed(&mut self) {
        self.in_flight = self.in_flight.saturating_sub(1);
        self.feed();
    }

    fn on_output(&mut self) {
        match self.decoder.read() {
            DecoderOutput::Buffer(output) => {
                self.outputs_read += 1;
                self.held.push_back(output);
                while self.held.len() > HELD_OUTPUTS {
                    self.held.pop_front();
                }
            }
            DecoderOutput::EndOfStream => {
                info!("{}: played {} outputs", self.name, self.outputs_read);
                self.held.clear();
                self.finish();
            }
            DecoderOutput::Empty => {}
        }
    }

    fn on_error(&mut self) {
        warn!(
            "{}: stopping on decoder error: {}",
            self.name,
            self.decoder.error().unwrap_or_default()
        );
        self.held.clear();
        self.finish();
    }

    fn finish(&mut self) {
        if self.finished {
            return;
        }
        self.finished = true;
        Completion::stream_finished(&self.completion);
    }

    fn report(&self) -> StreamReport {
        StreamReport {
            stats: self.decoder.stats(),
            outputs_read: self.outputs_read,
            finished: self.finished,
            error: self.decoder.error(),
        }
    }
}

type SharedDriver<D> = Arc<Mutex<StreamDriver<D>>>;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Job that forwards to the driver if it still exists
fn driver_job<D, F>(driver: &Weak<Mutex<StreamDriver<D>>>, f: F) -> Closure
where
    D: MediaDecoder + Send + 'static,
    D::Output: Send + 'static,
    F: Fn(&mut StreamDriver<D>) + Send + Sync + 'static,
{
    let driver = driver.clone();
    Closure::new(move || {
        if let Some(driver) = driver.upgrade() {
            f(&mut lock(&driver));
        }
    })
}

fn start_driver<D>(
    name: &'static str,
    decoder: D,
    inputs: Vec<InputBuffer>,
    max_in_flight: usize,
    completion: Arc<Mutex<Completion>>,
) -> SharedDriver<D>
where
    D: MediaDecoder + Send + 'static,
    D::Output: Send + 'static,
{
    let driver = Arc::new_cyclic(|weak: &Weak<Mutex<StreamDriver<D>>>| {
        Mutex::new(StreamDriver {
            name,
            decoder,
            inputs: inputs.into_iter().map(Arc::new).collect(),
            consumed_cb: driver_job(weak, StreamDriver::on_consumed),
            in_flight: 0,
            max_in_flight,
            outputs_read: 0,
            held: VecDeque::new(),
            finished: false,
            completion,
        })
    });

    let weak = Arc::downgrade(&driver);
    {
        let mut state = lock(&driver);
        state.decoder.initialize(
            driver_job(&weak, StreamDriver::on_output),
            driver_job(&weak, StreamDriver::on_error),
        );
        state.feed();
    }
    driver
}

/// Synthetic stereo float tone, one buffer per call
fn audio_inputs(count: usize) -> Vec<InputBuffer> {
    let frames_per_buffer = AUDIO_FRAMES_PER_BUFFER as i64;
    (0..count)
        .map(|index| {
            let first_frame = index * AUDIO_FRAMES_PER_BUFFER;
            let mut data = Vec::with_capacity(
                AUDIO_FRAMES_PER_BUFFER * AUDIO_CHANNELS as usize * std::mem::size_of::<f32>(),
            );
            for frame in first_frame..first_frame + AUDIO_FRAMES_PER_BUFFER {
                let phase = TAU * AUDIO_TONE_HZ * frame as f32 / AUDIO_SAMPLE_RATE as f32;
                let value = phase.sin() * 0.25;
                for _ in 0..AUDIO_CHANNELS {
                    data.extend_from_slice(&value.to_le_bytes());
                }
            }
            let timestamp = index as i64 * frames_per_buffer * 1_000_000 / AUDIO_SAMPLE_RATE as i64;
            InputBuffer::new(data, timestamp)
        })
        .collect()
}

/// Synthetic luma-only pictures; the loopback pads the chroma planes
fn video_inputs(count: usize) -> Vec<InputBuffer> {
    let luma = VIDEO_GEOMETRY.stride as usize * VIDEO_GEOMETRY.slice_height as usize;
    (0..count)
        .map(|index| {
            InputBuffer::new(vec![index as u8; luma], index as i64 * VIDEO_FRAME_INTERVAL)
        })
        .collect()
}

/// A running audio/video playback driven by one job queue.
///
/// Create and drop it on the queue's thread.
pub struct PlaybackSession {
    audio: Option<SharedDriver<AudioDecoder>>,
    video: Option<SharedDriver<VideoDecoder>>,
    started: Instant,
}

impl PlaybackSession {
    /// Build the requested streams and start feeding them.
    ///
    /// `on_complete` runs on the job thread once every stream has reached
    /// end of stream or failed. It runs inside a stream callback and must
    /// not call back into the session.
    pub fn start(
        queue: &JobQueue,
        config: &PlayerConfig,
        plan: SessionPlan,
        on_complete: impl FnOnce() + Send + 'static,
    ) -> Result<Self> {
        if !plan.audio && !plan.video {
            return Err(Error::Config("session needs at least one stream".to_string()));
        }
        if plan.max_in_flight == 0 {
            return Err(Error::Config("max_in_flight must be > 0".to_string()));
        }

        let streams = usize::from(plan.audio) + usize::from(plan.video);
        let completion = Arc::new(Mutex::new(Completion {
            remaining: streams,
            on_complete: Some(Box::new(on_complete)),
        }));

        let audio = if plan.audio {
            let pipeline = LoopbackPipeline::new(
                "audio",
                PassthroughAudio::new(AUDIO_CHANNELS),
                config.feed_queue_limit,
            )?;
            let header = AudioHeader {
                channels: AUDIO_CHANNELS,
                samples_per_second: AUDIO_SAMPLE_RATE,
            };
            let decoder = AudioDecoder::new(queue, header, Box::new(pipeline), config)?;
            info!(
                "Audio stream: {} ch @ {} Hz, {:?}",
                decoder.channels(),
                decoder.samples_per_second(),
                decoder.sample_type()
            );
            Some(start_driver(
                "audio",
                decoder,
                audio_inputs(plan.buffers_per_stream),
                plan.max_in_flight,
                Arc::clone(&completion),
            ))
        } else {
            None
        };

        let video = if plan.video {
            let pipeline = LoopbackPipeline::new(
                "video",
                PlanarVideo::new(VIDEO_GEOMETRY),
                config.feed_queue_limit,
            )?;
            let decoder = VideoDecoder::new(queue, Box::new(pipeline), config)?;
            info!(
                "Video stream: {}x{}, {} frame pool",
                VIDEO_GEOMETRY.width, VIDEO_GEOMETRY.height, config.frame_pool_size
            );
            Some(start_driver(
                "video",
                decoder,
                video_inputs(plan.buffers_per_stream),
                plan.max_in_flight,
                Arc::clone(&completion),
            ))
        } else {
            None
        };

        Ok(Self {
            audio,
            video,
            started: Instant::now(),
        })
    }

    /// True once every stream has finished
    pub fn is_complete(&self) -> bool {
        let audio_done = self.audio.as_ref().map_or(true, |driver| lock(driver).finished);
        let video_done = self.video.as_ref().map_or(true, |driver| lock(driver).finished);
        audio_done && video_done
    }

    pub fn report(&self) -> SessionReport {
        SessionReport {
            audio: self.audio.as_ref().map(|driver| lock(driver).report()),
            video: self.video.as_ref().map(|driver| lock(driver).report()),
            frame_pool: self.frame_pool_stats(),
            elapsed_ms: self.started.elapsed().as_millis() as u64,
        }
    }

    pub fn frame_pool_stats(&self) -> Option<PoolStats> {
        self.video
            .as_ref()
            .map(|driver| lock(driver).decoder.frame_pool_stats())
    }
}

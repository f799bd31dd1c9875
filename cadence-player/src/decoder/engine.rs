//! Shared decoder engine
//!
//! State is split by which thread touches it:
//!
//! - [`DecoderShared`] is the sink handed to the native pipeline. Its queues
//!   are the only data the streaming thread reaches, each behind its own
//!   short-lived lock, and it never calls back into the engine: it hands
//!   data over and posts jobs.
//! - [`CoreState`] is everything else. Only jobs on the decoder's queue and
//!   the public methods (asserted to run on that same thread) lock it, so
//!   the mutex is never contended; it exists because jobs must be `Sync`.
//!
//! Neither side holds a sink lock while calling into the pipeline, which is
//! what keeps `set_state` free to wait for an in-flight callback.

use super::{DecoderOutput, PipelineStats};
use crate::config::PlayerConfig;
use crate::error::Result;
use crate::job::{Closure, JobOwner, JobQueue, OwnerHandle};
use crate::mailbox::StatusMailbox;
use crate::media::InputBuffer;
use crate::pipeline::{BusMessage, Feed, NativePipeline, NativeSample, PipelineSink, PipelineState};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;
use tracing::{debug, error, info, trace, warn};

/// Turns native samples into the adapter's output type
pub(crate) trait OutputStage: Send + 'static {
    type Output: Send + 'static;

    fn convert(&mut self, sample: NativeSample) -> Result<StageResult<Self::Output>>;
}

/// Outcome of one conversion attempt
pub(crate) enum StageResult<T> {
    Delivered(T),
    /// No output buffer available; the sample is handed back for a retry
    Saturated(NativeSample),
}

struct InputQueue {
    pending: VecDeque<(Arc<InputBuffer>, Closure)>,
    end_of_stream: bool,
}

/// The part of a decoder the native streaming thread may touch
pub(crate) struct DecoderShared {
    name: String,
    input: Mutex<InputQueue>,
    samples: Mutex<VecDeque<NativeSample>>,
    mailbox: StatusMailbox<BusMessage>,
    handle: OwnerHandle,
    drain: Closure,
    drain_scheduled: AtomicBool,
    inputs_consumed: AtomicU64,
    enough_data_signals: AtomicU64,
}

impl DecoderShared {
    fn input(&self) -> MutexGuard<'_, InputQueue> {
        self.input.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn samples(&self) -> MutexGuard<'_, VecDeque<NativeSample>> {
        self.samples.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Forget everything queued in either direction
    fn clear(&self) {
        let mut input = self.input();
        input.pending.clear();
        input.end_of_stream = false;
        drop(input);

        self.samples().clear();
        self.mailbox.clear();
        self.drain_scheduled.store(false, Ordering::Release);
    }
}

impl PipelineSink for DecoderShared {
    fn on_need_data(&self) -> Feed {
        let mut input = self.input();
        match input.pending.pop_front() {
            Some((buffer, consumed_cb)) => {
                drop(input);
                self.inputs_consumed.fetch_add(1, Ordering::Relaxed);
                self.handle.schedule(&consumed_cb, Duration::ZERO);
                Feed::Buffer(buffer)
            }
            None if input.end_of_stream => Feed::EndOfStream,
            None => Feed::Pending,
        }
    }

    fn on_enough_data(&self) {
        self.enough_data_signals.fetch_add(1, Ordering::Relaxed);
        trace!("{}: native input queue full", self.name);
    }

    fn on_new_sample(&self, sample: NativeSample) {
        self.samples().push_back(sample);
        if !self.drain_scheduled.swap(true, Ordering::AcqRel) {
            self.handle.schedule(&self.drain, Duration::ZERO);
        }
    }

    fn on_message(&self, message: BusMessage) {
        trace!("{}: bus message {:?}", self.name, message);
        self.mailbox.post(message);
    }
}

struct CoreState<S: OutputStage> {
    stage: S,
    pipeline: Box<dyn NativePipeline>,
    output_cb: Option<Closure>,
    error_cb: Option<Closure>,
    outputs: VecDeque<DecoderOutput<S::Output>>,
    native_eos: bool,
    eos_queued: bool,
    error: Option<String>,
    flow_paused: bool,
    stats: PipelineStats,
}

struct Inner<S: OutputStage> {
    name: String,
    shared: Arc<DecoderShared>,
    state: Mutex<CoreState<S>>,
    high_water_mark: usize,
    low_water_mark: usize,
    update_interval: Duration,
    update: Closure,
}

impl<S: OutputStage> Inner<S> {
    fn lock(&self) -> MutexGuard<'_, CoreState<S>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Periodic tick: pick up status, deliver output, then adjust flow
    fn on_update(&self) {
        self.poll_status();
        self.deliver();
        self.apply_flow_control();
        self.shared.handle.schedule(&self.update, self.update_interval);
    }

    fn on_drain(&self) {
        self.shared.drain_scheduled.store(false, Ordering::Release);
        self.deliver();
    }

    fn poll_status(&self) {
        let Some(message) = self.shared.mailbox.take() else {
            return;
        };
        let mut state = self.lock();
        match message {
            BusMessage::EndOfStream => {
                debug!("{}: native end of stream", self.name);
                state.native_eos = true;
            }
            BusMessage::Error(text) => self.report_error(&mut state, text),
        }
    }

    fn report_error(&self, state: &mut CoreState<S>, text: String) {
        state.stats.errors += 1;
        if state.error.is_some() {
            warn!("{}: further error ignored until reset: {}", self.name, text);
            return;
        }
        error!("{}: pipeline error: {}", self.name, text);
        state.error = Some(text);
        if let Some(error_cb) = &state.error_cb {
            self.shared.handle.schedule(error_cb, Duration::ZERO);
        }
    }

    /// Convert queued samples until they run out or the stage saturates
    fn deliver(&self) {
        let mut state = self.lock();
        loop {
            let Some(sample) = self.shared.samples().pop_front() else {
                break;
            };
            match state.stage.convert(sample) {
                Ok(StageResult::Delivered(output)) => {
                    state.outputs.push_back(DecoderOutput::Buffer(output));
                    state.stats.outputs_delivered += 1;
                    self.notify_output(&state);
                }
                Ok(StageResult::Saturated(sample)) => {
                    self.shared.samples().push_front(sample);
                    state.stats.backpressure_retries += 1;
                    trace!("{}: output saturated, retrying next tick", self.name);
                    return;
                }
                Err(e) => self.report_error(&mut state, e.to_string()),
            }
        }

        if state.native_eos && !state.eos_queued {
            state.outputs.push_back(DecoderOutput::EndOfStream);
            state.eos_queued = true;
            state.stats.eos_delivered += 1;
            info!("{}: end of stream delivered", self.name);
            self.notify_output(&state);
        }
    }

    fn notify_output(&self, state: &CoreState<S>) {
        if let Some(output_cb) = &state.output_cb {
            self.shared.handle.schedule(output_cb, Duration::ZERO);
        }
    }

    /// Two-threshold hysteresis on buffered output
    fn apply_flow_control(&self) {
        let mut state = self.lock();
        let buffered = self.shared.samples().len() + state.outputs.len();

        let target = if !state.flow_paused && buffered > self.high_water_mark {
            PipelineState::Paused
        } else if state.flow_paused && buffered < self.low_water_mark {
            PipelineState::Playing
        } else {
            return;
        };

        if let Err(e) = state.pipeline.set_state(target) {
            self.report_error(&mut state, e.to_string());
            return;
        }
        state.flow_paused = target == PipelineState::Paused;
        if state.flow_paused {
            state.stats.flow_pauses += 1;
            debug!("{}: paused with {} buffered", self.name, buffered);
        } else {
            state.stats.flow_resumes += 1;
            debug!("{}: resumed with {} buffered", self.name, buffered);
        }
    }
}

/// Engine shared by the audio and video adapters.
///
/// Create, use and drop it on the queue's thread.
pub(crate) struct DecoderCore<S: OutputStage> {
    inner: Arc<Inner<S>>,
    owner: JobOwner,
}

impl<S: OutputStage> DecoderCore<S> {
    /// Connect `pipeline`, start it playing and schedule the first update
    pub(crate) fn new(
        name: &str,
        queue: &JobQueue,
        stage: S,
        mut pipeline: Box<dyn NativePipeline>,
        config: &PlayerConfig,
    ) -> Result<Self> {
        config.validate()?;
        assert!(
            queue.belongs_to_current_thread(),
            "{} must be created on its job queue's thread",
            name
        );

        let owner = JobOwner::new(queue);
        let inner = Arc::new_cyclic(|weak: &Weak<Inner<S>>| {
            let drain = {
                let weak = weak.clone();
                Closure::new(move || {
                    if let Some(inner) = weak.upgrade() {
                        inner.on_drain();
                    }
                })
            };
            let update = {
                let weak = weak.clone();
                Closure::new(move || {
                    if let Some(inner) = weak.upgrade() {
                        inner.on_update();
                    }
                })
            };

            let shared = Arc::new(DecoderShared {
                name: name.to_string(),
                input: Mutex::new(InputQueue {
                    pending: VecDeque::new(),
                    end_of_stream: false,
                }),
                samples: Mutex::new(VecDeque::new()),
                mailbox: StatusMailbox::new(),
                handle: owner.handle(),
                drain,
                drain_scheduled: AtomicBool::new(false),
                inputs_consumed: AtomicU64::new(0),
                enough_data_signals: AtomicU64::new(0),
            });
            pipeline.connect(Arc::clone(&shared) as Arc<dyn PipelineSink>);

            Inner {
                name: name.to_string(),
                shared,
                state: Mutex::new(CoreState {
                    stage,
                    pipeline,
                    output_cb: None,
                    error_cb: None,
                    outputs: VecDeque::new(),
                    native_eos: false,
                    eos_queued: false,
                    error: None,
                    flow_paused: false,
                    stats: PipelineStats::default(),
                }),
                high_water_mark: config.high_water_mark,
                low_water_mark: config.low_water_mark,
                update_interval: config.update_interval(),
                update,
            }
        });

        inner.lock().pipeline.set_state(PipelineState::Playing)?;
        owner.schedule(inner.update.clone(), inner.update_interval);

        debug!("{}: created", name);
        Ok(Self { inner, owner })
    }

    fn assert_on_thread(&self, operation: &str) {
        assert!(
            self.owner.belongs_to_current_thread(),
            "{}: {}() called off the decoder's job thread",
            self.inner.name,
            operation
        );
    }

    pub(crate) fn initialize(&self, output_cb: Closure, error_cb: Closure) {
        self.assert_on_thread("initialize");
        let mut state = self.inner.lock();
        assert!(
            state.output_cb.is_none(),
            "{}: initialize() called twice",
            self.inner.name
        );
        state.output_cb = Some(output_cb);
        state.error_cb = Some(error_cb);
    }

    pub(crate) fn decode(&self, input: Arc<InputBuffer>, consumed_cb: Closure) {
        self.assert_on_thread("decode");
        let mut queue = self.inner.shared.input();
        debug_assert!(
            !queue.end_of_stream,
            "{}: decode() after write_end_of_stream()",
            self.inner.name
        );
        queue.pending.push_back((input, consumed_cb));
        drop(queue);
        self.inner.lock().stats.inputs_queued += 1;
    }

    pub(crate) fn write_end_of_stream(&self) {
        self.assert_on_thread("write_end_of_stream");
        let mut queue = self.inner.shared.input();
        if !queue.end_of_stream {
            debug!("{}: end of stream written", self.inner.name);
            queue.end_of_stream = true;
        }
    }

    pub(crate) fn end_of_stream_written(&self) -> bool {
        self.inner.shared.input().end_of_stream
    }

    /// Pop one output.
    ///
    /// Call only after `output_cb` announced one; an empty read is a usage
    /// error in debug builds and returns `Empty` otherwise.
    pub(crate) fn read(&self) -> DecoderOutput<S::Output> {
        self.assert_on_thread("read");
        match self.inner.lock().outputs.pop_front() {
            Some(output) => output,
            None => {
                debug_assert!(false, "{}: read() with no output queued", self.inner.name);
                DecoderOutput::Empty
            }
        }
    }

    pub(crate) fn reset(&self) -> Result<()> {
        self.assert_on_thread("reset");
        let mut state = self.inner.lock();

        // The backend is silent once Ready returns, so clearing below races
        // with nothing.
        state.pipeline.set_state(PipelineState::Ready)?;
        self.inner.shared.clear();
        self.owner.cancel_pending_jobs();

        state.outputs.clear();
        state.native_eos = false;
        state.eos_queued = false;
        state.error = None;
        state.flow_paused = false;

        self.owner
            .schedule(self.inner.update.clone(), self.inner.update_interval);
        state.pipeline.set_state(PipelineState::Playing)?;

        info!("{}: reset", self.inner.name);
        Ok(())
    }

    pub(crate) fn stats(&self) -> PipelineStats {
        let mut stats = self.inner.lock().stats.clone();
        stats.inputs_consumed = self.inner.shared.inputs_consumed.load(Ordering::Relaxed);
        stats.enough_data_signals = self.inner.shared.enough_data_signals.load(Ordering::Relaxed);
        stats
    }

    /// Inputs not yet taken by the pipeline
    pub(crate) fn pending_inputs(&self) -> usize {
        self.inner.shared.input().pending.len()
    }

    /// Outputs waiting for `read()`
    pub(crate) fn pending_outputs(&self) -> usize {
        self.inner.lock().outputs.len()
    }

    pub(crate) fn is_flow_paused(&self) -> bool {
        self.inner.lock().flow_paused
    }

    /// First error reported since the last reset
    pub(crate) fn error(&self) -> Option<String> {
        self.inner.lock().error.clone()
    }

    pub(crate) fn pipeline_state(&self) -> PipelineState {
        self.inner.lock().pipeline.state()
    }

    pub(crate) fn with_stage<R>(&self, f: impl FnOnce(&S) -> R) -> R {
        f(&self.inner.lock().stage)
    }
}

impl<S: OutputStage> Drop for DecoderCore<S> {
    fn drop(&mut self) {
        self.owner.cancel_pending_jobs();
        let mut state = self.inner.lock();
        if let Err(e) = state.pipeline.set_state(PipelineState::Null) {
            warn!("{}: failed to stop pipeline: {}", self.inner.name, e);
        }
        debug!("{}: destroyed", self.inner.name);
    }
}

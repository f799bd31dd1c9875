//! Audio decoder adapter

use super::engine::{DecoderCore, OutputStage, StageResult};
use super::{DecoderOutput, MediaDecoder, PipelineStats};
use crate::config::PlayerConfig;
use crate::error::{Error, Result};
use crate::job::{Closure, JobQueue};
use crate::media::{
    nanos_to_media_time, AudioHeader, DecodedAudio, InputBuffer, PcmFormat, SampleType,
    StorageType,
};
use crate::pipeline::{NativePipeline, NativeSample, PipelineState, SampleFormat};
use std::sync::Arc;

struct AudioStage {
    channels: u16,
    sample_type: SampleType,
}

impl AudioStage {
    fn output_format(&self) -> PcmFormat {
        PcmFormat::new(self.sample_type, StorageType::Interleaved)
    }
}

impl OutputStage for AudioStage {
    type Output = Arc<DecodedAudio>;

    fn convert(&mut self, sample: NativeSample) -> Result<StageResult<Self::Output>> {
        let (channels, pcm) = match sample.format {
            SampleFormat::Audio { channels, pcm } => (channels, pcm),
            SampleFormat::Video(_) => {
                return Err(Error::UnsupportedFormat(
                    "video sample on an audio pipeline".to_string(),
                ))
            }
        };
        if channels != self.channels {
            return Err(Error::UnsupportedFormat(format!(
                "expected {} channels, pipeline produced {}",
                self.channels, channels
            )));
        }

        let frame_bytes = pcm.frame_bytes(channels);
        if sample.data.len() % frame_bytes != 0 {
            return Err(Error::Decode(format!(
                "{} bytes is not a whole number of {} byte frames",
                sample.data.len(),
                frame_bytes
            )));
        }

        let native = DecodedAudio::new(
            channels,
            pcm.sample_type,
            pcm.storage_type,
            nanos_to_media_time(sample.pts_nanos),
            sample.data,
        );
        let target = self.output_format();
        let output = native.switch_format_to(target.sample_type, target.storage_type)?;
        Ok(StageResult::Delivered(Arc::new(output)))
    }
}

/// Decodes an audio stream into interleaved PCM buffers
pub struct AudioDecoder {
    core: DecoderCore<AudioStage>,
    samples_per_second: u32,
}

impl AudioDecoder {
    /// Build a decoder on `queue`'s thread and start `pipeline`
    pub fn new(
        queue: &JobQueue,
        header: AudioHeader,
        pipeline: Box<dyn NativePipeline>,
        config: &PlayerConfig,
    ) -> Result<Self> {
        header.validate()?;
        let stage = AudioStage {
            channels: header.channels,
            sample_type: SampleType::preferred(config.prefer_float_samples),
        };
        let core = DecoderCore::new("audio-decoder", queue, stage, pipeline, config)?;
        Ok(Self {
            core,
            samples_per_second: header.samples_per_second,
        })
    }

    pub fn sample_type(&self) -> SampleType {
        self.core.with_stage(|stage| stage.sample_type)
    }

    pub fn storage_type(&self) -> StorageType {
        self.core.with_stage(|stage| stage.output_format().storage_type)
    }

    pub fn samples_per_second(&self) -> u32 {
        self.samples_per_second
    }

    pub fn channels(&self) -> u16 {
        self.core.with_stage(|stage| stage.channels)
    }

    pub fn pending_inputs(&self) -> usize {
        self.core.pending_inputs()
    }

    pub fn pending_outputs(&self) -> usize {
        self.core.pending_outputs()
    }

    pub fn is_flow_paused(&self) -> bool {
        self.core.is_flow_paused()
    }

    pub fn pipeline_state(&self) -> PipelineState {
        self.core.pipeline_state()
    }
}

impl MediaDecoder for AudioDecoder {
    type Output = Arc<DecodedAudio>;

    fn initialize(&self, output_cb: Closure, error_cb: Closure) {
        self.core.initialize(output_cb, error_cb);
    }

    fn decode(&self, input: Arc<InputBuffer>, consumed_cb: Closure) {
        self.core.decode(input, consumed_cb);
    }

    fn write_end_of_stream(&self) {
        self.core.write_end_of_stream();
    }

    fn end_of_stream_written(&self) -> bool {
        self.core.end_of_stream_written()
    }

    fn read(&self) -> DecoderOutput<Self::Output> {
        self.core.read()
    }

    fn reset(&self) -> Result<()> {
        self.core.reset()
    }

    fn stats(&self) -> PipelineStats {
        self.core.stats()
    }

    fn error(&self) -> Option<String> {
        self.core.error()
    }
}

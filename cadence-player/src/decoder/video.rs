//! Video decoder adapter
//!
//! Decoded pictures are copied into slots of a bounded [`FramePool`]. When
//! every slot is held downstream the sample stays queued and delivery is
//! retried on the next drain or update tick.

use super::engine::{DecoderCore, OutputStage, StageResult};
use super::{DecoderOutput, MediaDecoder, PipelineStats};
use crate::config::PlayerConfig;
use crate::error::{Error, Result};
use crate::job::{Closure, JobQueue};
use crate::media::{nanos_to_media_time, InputBuffer, VideoFrame};
use crate::pipeline::{NativePipeline, NativeSample, PipelineState, SampleFormat};
use crate::pool::{FramePool, PoolStats};
use std::sync::Arc;

struct VideoStage {
    pool: FramePool,
}

impl OutputStage for VideoStage {
    type Output = VideoFrame;

    fn convert(&mut self, sample: NativeSample) -> Result<StageResult<Self::Output>> {
        let geometry = match sample.format {
            SampleFormat::Video(geometry) => geometry,
            SampleFormat::Audio { .. } => {
                return Err(Error::UnsupportedFormat(
                    "audio sample on a video pipeline".to_string(),
                ))
            }
        };

        let Some(lease) = self.pool.alloc(geometry) else {
            return Ok(StageResult::Saturated(sample));
        };
        lease.write(&sample.data)?;
        Ok(StageResult::Delivered(VideoFrame::new(
            lease,
            nanos_to_media_time(sample.pts_nanos),
        )))
    }
}

/// Decodes a video stream into pooled frames
pub struct VideoDecoder {
    core: DecoderCore<VideoStage>,
}

impl VideoDecoder {
    /// Build a decoder on `queue`'s thread with a pool of
    /// `config.frame_pool_size` frames and start `pipeline`
    pub fn new(
        queue: &JobQueue,
        pipeline: Box<dyn NativePipeline>,
        config: &PlayerConfig,
    ) -> Result<Self> {
        let stage = VideoStage {
            pool: FramePool::new(config.frame_pool_size),
        };
        let core = DecoderCore::new("video-decoder", queue, stage, pipeline, config)?;
        Ok(Self { core })
    }

    pub fn frame_pool_stats(&self) -> PoolStats {
        self.core.with_stage(|stage| stage.pool.stats())
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

impl MediaDecoder for VideoDecoder {
    type Output = VideoFrame;

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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::{PcmFormat, SampleType, StorageType};
    use crate::pool::FrameGeometry;

    fn picture(pts_nanos: i64) -> NativeSample {
        let geometry = FrameGeometry::new(4, 2, 4, 2);
        NativeSample {
            data: vec![5; geometry.byte_len()],
            pts_nanos,
            format: SampleFormat::Video(geometry),
        }
    }

    #[test]
    fn test_saturated_pool_hands_sample_back() {
        let mut stage = VideoStage {
            pool: FramePool::new(1),
        };

        let held = match stage.convert(picture(1_000)).unwrap() {
            StageResult::Delivered(frame) => frame,
            StageResult::Saturated(_) => panic!("pool has a free slot"),
        };
        assert_eq!(held.timestamp(), 1);
        assert!(held.with_data(|data| data.iter().all(|b| *b == 5)));

        match stage.convert(picture(2_000)).unwrap() {
            StageResult::Saturated(sample) => assert_eq!(sample.pts_nanos, 2_000),
            StageResult::Delivered(_) => panic!("pool should be saturated"),
        }

        drop(held);
        assert!(matches!(
            stage.convert(picture(2_000)).unwrap(),
            StageResult::Delivered(_)
        ));
    }

    #[test]
    fn test_audio_sample_rejected() {
        let mut stage = VideoStage {
            pool: FramePool::new(1),
        };
        let audio = NativeSample {
            data: vec![0; 4],
            pts_nanos: 0,
            format: SampleFormat::Audio {
                channels: 1,
                pcm: PcmFormat::new(SampleType::Float32, StorageType::Interleaved),
            },
        };
        assert!(matches!(stage.convert(audio), Err(Error::UnsupportedFormat(_))));
    }
}

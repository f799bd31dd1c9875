//! PCM sample format switching
//!
//! Converts between Int16 and Float32 samples and between interleaved
//! (`[L, R, L, R, ...]`) and planar (`[L, L, ..., R, R, ...]`) layouts.
//! Samples are little-endian. Int16 is normalized by `i16::MAX`, so
//! `i16::MAX` maps to 1.0 and floats outside [-1.0, 1.0] clamp.

use super::buffer::{SampleType, StorageType};
use crate::error::{Error, Result};

/// Encoding and layout of a PCM buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PcmFormat {
    pub sample_type: SampleType,
    pub storage_type: StorageType,
}

impl PcmFormat {
    pub fn new(sample_type: SampleType, storage_type: StorageType) -> Self {
        Self {
            sample_type,
            storage_type,
        }
    }

    /// Bytes in one frame of `channels` samples
    pub fn frame_bytes(&self, channels: u16) -> usize {
        channels as usize * self.sample_type.bytes_per_sample()
    }
}

/// Re-encode `data` from one PCM format to another
pub fn switch_format(
    data: &[u8],
    channels: u16,
    from: PcmFormat,
    to: PcmFormat,
) -> Result<Vec<u8>> {
    if channels == 0 {
        return Err(Error::UnsupportedFormat("audio buffer has no channels".to_string()));
    }
    let frame_bytes = from.frame_bytes(channels);
    if data.len() % frame_bytes != 0 {
        return Err(Error::Decode(format!(
            "{} bytes is not a whole number of {} byte frames",
            data.len(),
            frame_bytes
        )));
    }
    if from == to {
        return Ok(data.to_vec());
    }

    let mut samples = decode_samples(data, from.sample_type);
    let channels = channels as usize;
    if from.storage_type == StorageType::Planar {
        samples = interleave(&samples, channels);
    }
    if to.storage_type == StorageType::Planar {
        samples = deinterleave(&samples, channels);
    }
    Ok(encode_samples(&samples, to.sample_type))
}

fn decode_samples(data: &[u8], sample_type: SampleType) -> Vec<f32> {
    match sample_type {
        SampleType::Int16 => data
            .chunks_exact(2)
            .map(|b| i16::from_le_bytes([b[0], b[1]]) as f32 / i16::MAX as f32)
            .collect(),
        SampleType::Float32 => data
            .chunks_exact(4)
            .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
            .collect(),
    }
}

fn encode_samples(samples: &[f32], sample_type: SampleType) -> Vec<u8> {
    let mut out = Vec::with_capacity(samples.len() * sample_type.bytes_per_sample());
    match sample_type {
        SampleType::Int16 => {
            for sample in samples {
                let value = (sample.clamp(-1.0, 1.0) * i16::MAX as f32).round() as i16;
                out.extend_from_slice(&value.to_le_bytes());
            }
        }
        SampleType::Float32 => {
            for sample in samples {
                out.extend_from_slice(&sample.to_le_bytes());
            }
        }
    }
    out
}

/// Planar planes to interleaved frames
fn interleave(planar: &[f32], channels: usize) -> Vec<f32> {
    let frames = planar.len() / channels;
    let mut out = Vec::with_capacity(planar.len());
    for frame in 0..frames {
        for channel in 0..channels {
            out.push(planar[channel * frames + frame]);
        }
    }
    out
}

/// Interleaved frames to planar planes
fn deinterleave(interleaved: &[f32], channels: usize) -> Vec<f32> {
    let frames = interleaved.len() / channels;
    let mut out = Vec::with_capacity(interleaved.len());
    for channel in 0..channels {
        for frame in 0..frames {
            out.push(interleaved[frame * channels + channel]);
        }
    }
    out
}

//! Input and decoded buffer types
//!
//! Buffers are immutable once filled and shared by reference count: the
//! decoder and the renderer may both hold one, and it is freed when the last
//! reference drops.

use super::convert::{switch_format, PcmFormat};
use super::MediaTime;
use crate::error::{Error, Result};
use crate::pool::{FrameGeometry, FrameHandle, FrameLease};

/// Encoded payload handed to a decoder
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InputBuffer {
    data: Vec<u8>,
    timestamp: MediaTime,
}

impl InputBuffer {
    pub fn new(data: Vec<u8>, timestamp: MediaTime) -> Self {
        Self { data, timestamp }
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn size(&self) -> usize {
        self.data.len()
    }

    pub fn timestamp(&self) -> MediaTime {
        self.timestamp
    }
}

/// PCM sample encoding
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub enum SampleType {
    Int16,
    Float32,
}

impl SampleType {
    /// Float32 when the output side supports it, Int16 otherwise
    pub fn preferred(float_supported: bool) -> Self {
        if float_supported {
            SampleType::Float32
        } else {
            SampleType::Int16
        }
    }

    pub fn bytes_per_sample(self) -> usize {
        match self {
            SampleType::Int16 => 2,
            SampleType::Float32 => 4,
        }
    }
}

/// Channel layout of decoded audio frames
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub enum StorageType {
    Interleaved,
    Planar,
}

/// Stream-level audio parameters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AudioHeader {
    pub channels: u16,
    pub samples_per_second: u32,
}

impl AudioHeader {
    /// Reject headers no decoder can be built for
    pub fn validate(&self) -> Result<()> {
        if self.channels == 0 {
            return Err(Error::UnsupportedFormat("audio stream has no channels".to_string()));
        }
        if self.samples_per_second == 0 {
            return Err(Error::UnsupportedFormat("audio sample rate is zero".to_string()));
        }
        Ok(())
    }
}

/// Decoded PCM audio
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedAudio {
    channels: u16,
    sample_type: SampleType,
    storage_type: StorageType,
    timestamp: MediaTime,
    data: Vec<u8>,
}

impl DecodedAudio {
    pub fn new(
        channels: u16,
        sample_type: SampleType,
        storage_type: StorageType,
        timestamp: MediaTime,
        data: Vec<u8>,
    ) -> Self {
        Self {
            channels,
            sample_type,
            storage_type,
            timestamp,
            data,
        }
    }

    pub fn channels(&self) -> u16 {
        self.channels
    }

    pub fn sample_type(&self) -> SampleType {
        self.sample_type
    }

    pub fn storage_type(&self) -> StorageType {
        self.storage_type
    }

    pub fn format(&self) -> PcmFormat {
        PcmFormat::new(self.sample_type, self.storage_type)
    }

    pub fn timestamp(&self) -> MediaTime {
        self.timestamp
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Re-encode into `sample_type` / `storage_type`, keeping channels and
    /// timestamp
    pub fn switch_format_to(
        self,
        sample_type: SampleType,
        storage_type: StorageType,
    ) -> Result<Self> {
        let target = PcmFormat::new(sample_type, storage_type);
        if target == self.format() {
            return Ok(self);
        }
        let data = switch_format(&self.data, self.channels, self.format(), target)?;
        Ok(Self {
            sample_type,
            storage_type,
            data,
            ..self
        })
    }

    pub fn size(&self) -> usize {
        self.data.len()
    }

    /// Number of complete frames (one sample per channel) in the buffer
    pub fn frames(&self) -> usize {
        let frame_bytes = self.channels as usize * self.sample_type.bytes_per_sample();
        if frame_bytes == 0 {
            0
        } else {
            self.data.len() / frame_bytes
        }
    }
}

/// Decoded video frame backed by a frame pool slot.
///
/// Cloning shares the slot. The slot returns to the pool when the last
/// clone is dropped, on whatever thread that happens.
#[derive(Debug, Clone)]
pub struct VideoFrame {
    lease: FrameLease,
    timestamp: MediaTime,
}

impl VideoFrame {
    pub fn new(lease: FrameLease, timestamp: MediaTime) -> Self {
        Self { lease, timestamp }
    }

    pub fn timestamp(&self) -> MediaTime {
        self.timestamp
    }

    pub fn geometry(&self) -> FrameGeometry {
        self.lease.geometry()
    }

    pub fn width(&self) -> u32 {
        self.geometry().width
    }

    pub fn height(&self) -> u32 {
        self.geometry().height
    }

    /// Pool handle identifying the backing slot
    pub fn handle(&self) -> FrameHandle {
        self.lease.handle()
    }

    /// Borrow the frame bytes
    pub fn with_data<R>(&self, f: impl FnOnce(&[u8]) -> R) -> R {
        self.lease.with_data(f)
    }
}

//! Media payload types shared by the decoders and the native pipeline
//!
//! Playback timestamps are [`MediaTime`] microseconds. Native pipelines
//! count in nanoseconds; conversion happens at the pipeline boundary.

pub mod buffer;
pub mod convert;

pub use buffer::{
    AudioHeader, DecodedAudio, InputBuffer, SampleType, StorageType, VideoFrame,
};
pub use convert::{switch_format, PcmFormat};

/// Signed, monotonic playback time in microseconds
pub type MediaTime = i64;

const NANOS_PER_MICRO: i64 = 1_000;

/// Convert a playback timestamp to native pipeline nanoseconds
pub fn media_time_to_nanos(time: MediaTime) -> i64 {
    time.saturating_mul(NANOS_PER_MICRO)
}

/// Convert native pipeline nanoseconds to a playback timestamp
pub fn nanos_to_media_time(nanos: i64) -> MediaTime {
    nanos / NANOS_PER_MICRO
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_time_conversion_truncates_sub_microsecond() {
        assert_eq!(media_time_to_nanos(33_333), 33_333_000);
        assert_eq!(nanos_to_media_time(33_333_999), 33_333);
        assert_eq!(nanos_to_media_time(-1_500), -1);
    }

    #[test]
    fn test_time_conversion_saturates() {
        assert_eq!(media_time_to_nanos(i64::MAX), i64::MAX);
    }
}

//! Sample layouts and the canonical on-disk format
//!
//! Every recording is stored as 16-bit stereo PCM at 8kHz regardless of what
//! the capture device delivers.

use hound::{SampleFormat, WavSpec};
use serde::{Deserialize, Serialize};

/// Channel count of every channel file
pub const CANONICAL_CHANNELS: u16 = 2;
/// Sample rate of every channel file
pub const CANONICAL_SAMPLE_RATE: u32 = 8_000;
/// Bit depth of every channel file
pub const CANONICAL_BITS: u16 = 16;

/// Interleaved f32 stream layout as seen by a device or a file
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamFormat {
    pub sample_rate: u32,
    pub channels: u16,
}

impl StreamFormat {
    pub fn new(sample_rate: u32, channels: u16) -> Self {
        Self {
            sample_rate,
            channels,
        }
    }

    /// Layout of the channel files
    pub fn canonical() -> Self {
        Self::new(CANONICAL_SAMPLE_RATE, CANONICAL_CHANNELS)
    }

    /// Number of interleaved samples in `frames` frames
    pub fn samples_for_frames(&self, frames: usize) -> usize {
        frames * usize::from(self.channels.max(1))
    }

    pub fn duration_seconds(&self, frames: u64) -> f64 {
        if self.sample_rate == 0 {
            return 0.0;
        }
        frames as f64 / self.sample_rate as f64
    }
}

impl From<WavSpec> for StreamFormat {
    fn from(spec: WavSpec) -> Self {
        Self::new(spec.sample_rate, spec.channels)
    }
}

/// WAV header for the canonical format
pub fn canonical_spec() -> WavSpec {
    WavSpec {
        channels: CANONICAL_CHANNELS,
        sample_rate: CANONICAL_SAMPLE_RATE,
        bits_per_sample: CANONICAL_BITS,
        sample_format: SampleFormat::Int,
    }
}

/// Check whether a header matches the canonical format exactly
pub fn is_canonical(spec: &WavSpec) -> bool {
    *spec == canonical_spec()
}

/// Quantize a float sample to 16-bit PCM, clamping out-of-range input
pub fn f32_to_i16(sample: f32) -> i16 {
    let clamped = sample.clamp(-1.0, 1.0);
    (clamped * i16::MAX as f32).round() as i16
}

/// Scale a 16-bit PCM sample into `[-1.0, 1.0]`
pub fn i16_to_f32(sample: i16) -> f32 {
    (sample as f32 / i16::MAX as f32).max(-1.0)
}

/// Scale an integer sample of the given bit depth into `[-1.0, 1.0]`
pub fn int_to_f32(sample: i32, bits: u16) -> f32 {
    let bits = bits.clamp(2, 32);
    let max_value = ((1u64 << (bits - 1)) - 1) as f32;
    (sample as f32 / max_value).clamp(-1.0, 1.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_canonical_spec_is_stereo_8k_16bit() {
        let spec = canonical_spec();
        assert_eq!(spec.channels, 2);
        assert_eq!(spec.sample_rate, 8000);
        assert_eq!(spec.bits_per_sample, 16);
        assert!(is_canonical(&spec));
        assert_eq!(StreamFormat::from(spec), StreamFormat::canonical());
    }

    #[test]
    fn test_i16_round_trip_is_exact() {
        for sample in [-32767i16, -1000, -1, 0, 1, 1234, 32767] {
            assert_eq!(f32_to_i16(i16_to_f32(sample)), sample);
        }
    }

    #[test]
    fn test_f32_to_i16_clamps() {
        assert_eq!(f32_to_i16(0.0), 0);
        assert_eq!(f32_to_i16(1.0), i16::MAX);
        assert_eq!(f32_to_i16(2.5), i16::MAX);
        assert_eq!(f32_to_i16(-2.5), -i16::MAX);
    }

    #[test]
    fn test_int_to_f32_scales_by_depth() {
        assert_eq!(int_to_f32(127, 8), 1.0);
        assert_eq!(int_to_f32(8_388_607, 24), 1.0);
        assert!((int_to_f32(-4_194_304, 24) + 0.5).abs() < 1e-6);
    }

    #[test]
    fn test_duration_seconds() {
        let format = StreamFormat::canonical();
        assert_eq!(format.duration_seconds(16_000), 2.0);
        assert_eq!(format.samples_for_frames(10), 20);
    }
}

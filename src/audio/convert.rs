//! Streaming format conversion between interleaved f32 layouts
//!
//! Channels are remapped first, then the rate is changed by a band-limited
//! rubato sinc resampler. Audio arrives in buffers of arbitrary size, so input
//! frames are accumulated until the resampler has a full chunk. Feeding a
//! signal in many small buffers gives exactly the output of feeding it at once.

use super::format::StreamFormat;
use crate::error::{LoopError, Result};
use rubato::{
    Resampler, SincFixedIn, SincInterpolationParameters, SincInterpolationType, WindowFunction,
};

/// Input frames per resampler call
const CHUNK_FRAMES: usize = 1024;

/// Upper bound on zero-filled calls needed to drain the filter
const MAX_DRAIN_PASSES: usize = 16;

pub struct FormatConverter {
    from: StreamFormat,
    to: StreamFormat,
    rate: Option<RateStage>,
    remapped: Vec<f32>,
}

impl FormatConverter {
    pub fn new(from: StreamFormat, to: StreamFormat) -> Result<Self> {
        let same_rate = from.sample_rate == to.sample_rate;
        let rate = if same_rate || from.sample_rate == 0 || to.sample_rate == 0 {
            None
        } else {
            let stage = RateStage::new(from.sample_rate, to.sample_rate, to.channels).map_err(|e| {
                LoopError::DeviceUnavailable(format!(
                    "cannot convert {}Hz to {}Hz: {}",
                    from.sample_rate, to.sample_rate, e
                ))
            })?;
            Some(stage)
        };
        Ok(Self {
            from,
            to,
            rate,
            remapped: Vec::new(),
        })
    }

    pub fn source_format(&self) -> StreamFormat {
        self.from
    }

    pub fn target_format(&self) -> StreamFormat {
        self.to
    }

    /// Convert one buffer, appending whatever is ready to `output`
    ///
    /// A trailing partial frame in `input` is ignored.
    pub fn process(&mut self, input: &[f32], output: &mut Vec<f32>) -> Result<()> {
        let mut remapped = std::mem::take(&mut self.remapped);
        remapped.clear();
        remap_channels(input, self.from.channels, self.to.channels, &mut remapped);

        let result = match &mut self.rate {
            None => {
                output.extend_from_slice(&remapped);
                Ok(())
            }
            Some(stage) => stage.push(&remapped, output),
        };

        self.remapped = remapped;
        result
    }

    /// Flush frames still held by the resampler
    ///
    /// Afterwards the total output is the input length scaled by the rate
    /// ratio, rounded to the nearest frame.
    pub fn finish(&mut self, output: &mut Vec<f32>) -> Result<()> {
        match &mut self.rate {
            None => Ok(()),
            Some(stage) => stage.finish(output),
        }
    }
}

fn resample_error(err: rubato::ResampleError) -> LoopError {
    LoopError::Decode(format!("resampling failed: {}", err))
}

/// Sample-rate stage over planar buffers
struct RateStage {
    resampler: SincFixedIn<f32>,
    ratio: f64,
    /// Frames waiting for a full chunk, one vector per channel
    pending: Vec<Vec<f32>>,
    chunk: Vec<Vec<f32>>,
    out: Vec<Vec<f32>>,
    /// Leading output frames still to discard for the filter delay
    skip: usize,
    frames_in: u64,
    frames_out: u64,
}

impl RateStage {
    fn new(
        from_rate: u32,
        to_rate: u32,
        channels: u16,
    ) -> std::result::Result<Self, rubato::ResamplerConstructionError> {
        let channels = usize::from(channels.max(1));
        let ratio = to_rate as f64 / from_rate as f64;

        let params = SincInterpolationParameters {
            sinc_len: 128,
            f_cutoff: 0.95,
            interpolation: SincInterpolationType::Linear,
            oversampling_factor: 128,
            window: WindowFunction::BlackmanHarris2,
        };
        let resampler = SincFixedIn::<f32>::new(ratio, 1.0, params, CHUNK_FRAMES, channels)?;
        let out = resampler.output_buffer_allocate(true);
        let skip = resampler.output_delay();

        Ok(Self {
            resampler,
            ratio,
            pending: vec![Vec::new(); channels],
            chunk: vec![Vec::with_capacity(CHUNK_FRAMES); channels],
            out,
            skip,
            frames_in: 0,
            frames_out: 0,
        })
    }

    fn push(&mut self, interleaved: &[f32], output: &mut Vec<f32>) -> Result<()> {
        let channels = self.pending.len();
        for frame in interleaved.chunks_exact(channels) {
            for (lane, &sample) in self.pending.iter_mut().zip(frame) {
                lane.push(sample);
            }
        }
        self.frames_in += (interleaved.len() / channels) as u64;

        loop {
            let needed = self.resampler.input_frames_next();
            if self.pending[0].len() < needed {
                return Ok(());
            }
            for (chunk, lane) in self.chunk.iter_mut().zip(self.pending.iter_mut()) {
                chunk.clear();
                chunk.extend(lane.drain(..needed));
            }
            let (_, written) = self
                .resampler
                .process_into_buffer(&self.chunk, &mut self.out, None)
                .map_err(resample_error)?;
            self.emit(written, u64::MAX, output);
        }
    }

    fn finish(&mut self, output: &mut Vec<f32>) -> Result<()> {
        let expected = (self.frames_in as f64 * self.ratio).round() as u64;
        let channels = self.pending.len();
        let mut tail = Some(std::mem::replace(&mut self.pending, vec![Vec::new(); channels]));

        for _ in 0..MAX_DRAIN_PASSES {
            if self.frames_out >= expected {
                break;
            }
            let (_, written) = match tail.take() {
                Some(rest) => self
                    .resampler
                    .process_partial_into_buffer(Some(rest.as_slice()), &mut self.out, None),
                None => self
                    .resampler
                    .process_partial_into_buffer(None::<&[Vec<f32>]>, &mut self.out, None),
            }
            .map_err(resample_error)?;
            self.emit(written, expected, output);
        }
        Ok(())
    }

    /// Interleave `written` frames of `out`, dropping the delay and stopping at `limit`
    fn emit(&mut self, written: usize, limit: u64, output: &mut Vec<f32>) {
        for i in 0..written {
            if self.skip > 0 {
                self.skip -= 1;
                continue;
            }
            if self.frames_out >= limit {
                return;
            }
            for lane in &self.out {
                output.push(lane[i]);
            }
            self.frames_out += 1;
        }
    }
}

/// Map interleaved frames from `from` channels to `to` channels.
///
/// Mono is duplicated, surplus channels are averaged into the output channel
/// they fold onto, and missing channels repeat the source layout.
pub fn remap_channels(input: &[f32], from: u16, to: u16, output: &mut Vec<f32>) {
    let from = usize::from(from.max(1));
    let to = usize::from(to.max(1));
    let frames = input.len() / from;

    if from == to {
        output.extend_from_slice(&input[..frames * from]);
        return;
    }

    output.reserve(frames * to);
    for frame in input.chunks_exact(from) {
        if from < to {
            for ch in 0..to {
                output.push(frame[ch % from]);
            }
        } else {
            for ch in 0..to {
                let mut acc = 0.0f32;
                let mut count = 0usize;
                for sample in frame.iter().skip(ch).step_by(to) {
                    acc += *sample;
                    count += 1;
                }
                output.push(acc / count.max(1) as f32);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sine(rate: u32, channels: u16, freq: f32, frames: usize) -> Vec<f32> {
        let mut out = Vec::with_capacity(frames * channels as usize);
        for i in 0..frames {
            let v = (2.0 * std::f32::consts::PI * freq * i as f32 / rate as f32).sin() * 0.5;
            for _ in 0..channels {
                out.push(v);
            }
        }
        out
    }

    fn convert_all(from: StreamFormat, to: StreamFormat, input: &[f32]) -> Vec<f32> {
        let mut conv = FormatConverter::new(from, to).unwrap();
        let mut out = Vec::new();
        conv.process(input, &mut out).unwrap();
        conv.finish(&mut out).unwrap();
        out
    }

    /// RMS of the middle half, away from filter edges
    fn steady_rms(samples: &[f32]) -> f32 {
        let middle = &samples[samples.len() / 4..samples.len() * 3 / 4];
        (middle.iter().map(|s| s * s).sum::<f32>() / middle.len() as f32).sqrt()
    }

    #[test]
    fn test_mono_is_duplicated_to_stereo() {
        let mut out = Vec::new();
        remap_channels(&[0.1, 0.2, 0.3], 1, 2, &mut out);
        assert_eq!(out, vec![0.1, 0.1, 0.2, 0.2, 0.3, 0.3]);
    }

    #[test]
    fn test_stereo_is_averaged_to_mono() {
        let mut out = Vec::new();
        remap_channels(&[0.2, 0.4, -1.0, 1.0], 2, 1, &mut out);
        assert_eq!(out.len(), 2);
        assert!((out[0] - 0.3).abs() < 1e-6);
        assert!(out[1].abs() < 1e-6);
    }

    #[test]
    fn test_surround_folds_onto_stereo() {
        let mut out = Vec::new();
        // 4 channels: L, R, Ls, Rs
        remap_channels(&[1.0, 0.0, 0.0, 1.0], 4, 2, &mut out);
        assert_eq!(out, vec![0.5, 0.5]);
    }

    #[test]
    fn test_partial_frame_is_ignored() {
        let mut out = Vec::new();
        remap_channels(&[0.1, 0.2, 0.3], 2, 2, &mut out);
        assert_eq!(out, vec![0.1, 0.2]);
    }

    #[test]
    fn test_same_format_is_passthrough() {
        let format = StreamFormat::new(8_000, 2);
        let input = sine(8_000, 2, 440.0, 100);
        assert_eq!(convert_all(format, format, &input), input);
    }

    #[test]
    fn test_downsample_scales_length() {
        let input = sine(48_000, 2, 440.0, 48_000);
        let out = convert_all(StreamFormat::new(48_000, 2), StreamFormat::canonical(), &input);
        assert_eq!(out.len() / 2, 8_000);
    }

    #[test]
    fn test_upsample_scales_length() {
        let input = sine(8_000, 2, 440.0, 8_000);
        let out = convert_all(StreamFormat::canonical(), StreamFormat::new(44_100, 2), &input);
        assert_eq!(out.len() / 2, 44_100);
    }

    #[test]
    fn test_passband_tone_keeps_its_level() {
        let from = StreamFormat::new(48_000, 1);
        let to = StreamFormat::new(8_000, 1);
        let out = convert_all(from, to, &sine(48_000, 1, 440.0, 48_000));
        let rms = steady_rms(&out);
        assert!((rms - 0.3536).abs() < 0.02, "rms = {rms}");
    }

    #[test]
    fn test_tone_above_target_nyquist_is_removed() {
        // 6kHz cannot be represented at 8kHz and must not fold back to 2kHz
        let from = StreamFormat::new(48_000, 1);
        let to = StreamFormat::new(8_000, 1);
        let out = convert_all(from, to, &sine(48_000, 1, 6_000.0, 48_000));
        let rms = steady_rms(&out);
        assert!(rms < 0.01, "rms = {rms}");
    }

    #[test]
    fn test_chunked_input_matches_single_pass() {
        let from = StreamFormat::new(44_100, 1);
        let to = StreamFormat::canonical();
        let input = sine(44_100, 1, 330.0, 4_410);

        let whole = convert_all(from, to, &input);

        let mut chunked = Vec::new();
        let mut conv = FormatConverter::new(from, to).unwrap();
        for chunk in input.chunks(37) {
            conv.process(chunk, &mut chunked).unwrap();
        }
        conv.finish(&mut chunked).unwrap();

        assert_eq!(whole.len(), chunked.len());
        assert_eq!(whole.len(), 800 * 2);
        for (a, b) in whole.iter().zip(&chunked) {
            assert!((a - b).abs() < 1e-6);
        }
    }

    #[test]
    fn test_short_input_is_released_by_finish() {
        let mut conv =
            FormatConverter::new(StreamFormat::new(16_000, 1), StreamFormat::new(8_000, 1)).unwrap();
        let mut out = Vec::new();
        for i in 0..100 {
            conv.process(&[i as f32 / 100.0], &mut out).unwrap();
        }
        // Less than one chunk is held back until the end
        assert!(out.is_empty());
        conv.finish(&mut out).unwrap();
        assert_eq!(out.len(), 50);
    }
}

//! Endless sample source over a recorded WAV file
//!
//! When the reader hits the end of the data chunk it seeks back to the first
//! frame inside the same read call, so the consumer sees one unbroken stream.

use super::format::{i16_to_f32, int_to_f32, is_canonical, StreamFormat};
use crate::error::{LoopError, Result};
use hound::{SampleFormat, WavReader, WavSpec};
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};

pub struct LoopingSource {
    path: PathBuf,
    reader: WavReader<BufReader<File>>,
    spec: WavSpec,
    /// Completed passes over the file
    cycles: u64,
    /// Samples read since the last rewind
    pass_samples: u64,
}

impl LoopingSource {
    /// Open a recording for looped decoding
    ///
    /// Fails with `FileNotFound` when there is nothing at `path` and with
    /// `Decode` when the file cannot be looped.
    pub fn open(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Err(LoopError::FileNotFound(path.to_path_buf()));
        }

        let reader = WavReader::open(path).map_err(LoopError::from_read)?;
        let spec = reader.spec();

        match (spec.sample_format, spec.bits_per_sample) {
            (SampleFormat::Int, 8..=32) | (SampleFormat::Float, 32) => {}
            (format, bits) => {
                return Err(LoopError::Decode(format!(
                    "unsupported sample layout {:?}/{} bits in {}",
                    format,
                    bits,
                    path.display()
                )))
            }
        }

        if spec.channels == 0 || reader.duration() == 0 {
            return Err(LoopError::Decode(format!(
                "{} contains no audio frames",
                path.display()
            )));
        }

        if !is_canonical(&spec) {
            log::debug!(
                "{} is {}Hz x{} {:?}/{}, converting on playback",
                path.display(),
                spec.sample_rate,
                spec.channels,
                spec.sample_format,
                spec.bits_per_sample
            );
        }

        Ok(Self {
            path: path.to_path_buf(),
            reader,
            spec,
            cycles: 0,
            pass_samples: 0,
        })
    }

    pub fn format(&self) -> StreamFormat {
        StreamFormat::from(self.spec)
    }

    /// Number of frames in one pass
    pub fn frames(&self) -> u32 {
        self.reader.duration()
    }

    pub fn cycles(&self) -> u64 {
        self.cycles
    }

    /// Append exactly `frames` interleaved frames to `out`, wrapping at the end
    pub fn read_frames(&mut self, frames: usize, out: &mut Vec<f32>) -> Result<()> {
        let wanted = self.format().samples_for_frames(frames);
        let mut got = 0usize;

        while got < wanted {
            let read = self.read_samples(wanted - got, out)?;
            if read == 0 {
                self.rewind()?;
                continue;
            }
            got += read;
            self.pass_samples += read as u64;
        }
        Ok(())
    }

    fn rewind(&mut self) -> Result<()> {
        if self.pass_samples == 0 {
            return Err(LoopError::Decode(format!(
                "{} yielded no samples",
                self.path.display()
            )));
        }
        self.reader
            .seek(0)
            .map_err(|e| LoopError::Io(format!("cannot rewind {}: {}", self.path.display(), e)))?;
        self.cycles += 1;
        self.pass_samples = 0;
        log::trace!("{} wrapped (cycle {})", self.path.display(), self.cycles);
        Ok(())
    }

    fn read_samples(&mut self, max: usize, out: &mut Vec<f32>) -> Result<usize> {
        let before = out.len();
        let bits = self.spec.bits_per_sample;

        match self.spec.sample_format {
            SampleFormat::Float => {
                for sample in self.reader.samples::<f32>().take(max) {
                    out.push(sample.map_err(LoopError::from_read)?);
                }
            }
            SampleFormat::Int if bits <= 16 => {
                for sample in self.reader.samples::<i16>().take(max) {
                    let sample = sample.map_err(LoopError::from_read)?;
                    out.push(if bits == 16 {
                        i16_to_f32(sample)
                    } else {
                        int_to_f32(i32::from(sample), bits)
                    });
                }
            }
            SampleFormat::Int => {
                for sample in self.reader.samples::<i32>().take(max) {
                    let sample = sample.map_err(LoopError::from_read)?;
                    out.push(int_to_f32(sample, bits));
                }
            }
        }

        Ok(out.len() - before)
    }
}

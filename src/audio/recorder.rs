//! Channel file management using hound
//!
//! Each channel owns exactly one WAV file, named from its index, holding the
//! most recent recording in the canonical format.

use super::format::{canonical_spec, StreamFormat};
use crate::error::{LoopError, Result};
use hound::{WavReader, WavSpec, WavWriter};
use std::fs::File;
use std::io::BufWriter;
use std::path::{Path, PathBuf};

pub type ChannelWriter = WavWriter<BufWriter<File>>;

/// Summary of a recording on disk
#[derive(Clone, Debug, PartialEq)]
pub struct RecordingInfo {
    pub spec: WavSpec,
    pub frames: u32,
}

impl RecordingInfo {
    pub fn duration_seconds(&self) -> f64 {
        StreamFormat::from(self.spec).duration_seconds(u64::from(self.frames))
    }
}

/// Locates and creates channel files
#[derive(Clone, Debug)]
pub struct ChannelFiles {
    recordings_dir: PathBuf,
}

impl ChannelFiles {
    pub fn new(recordings_dir: impl AsRef<Path>) -> Self {
        Self {
            recordings_dir: recordings_dir.as_ref().to_path_buf(),
        }
    }

    /// Get the recordings directory
    pub fn recordings_dir(&self) -> &Path {
        &self.recordings_dir
    }

    /// Ensure the recordings directory exists
    pub fn ensure_dir(&self) -> std::io::Result<()> {
        std::fs::create_dir_all(&self.recordings_dir)
    }

    /// Path of the file backing `channel`
    pub fn channel_file(&self, channel: usize) -> PathBuf {
        self.recordings_dir.join(format!("{}test.wav", channel))
    }

    /// Create (or truncate) a canonical-format writer at `path`
    pub fn create_writer(path: &Path) -> Result<ChannelWriter> {
        WavWriter::create(path, canonical_spec()).map_err(LoopError::from_write)
    }

    /// Read the header of a recording without decoding it
    pub fn inspect(path: &Path) -> Result<RecordingInfo> {
        if !path.exists() {
            return Err(LoopError::FileNotFound(path.to_path_buf()));
        }
        let reader = WavReader::open(path).map_err(LoopError::from_read)?;
        Ok(RecordingInfo {
            spec: reader.spec(),
            frames: reader.duration(),
        })
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::audio::format::f32_to_i16;

    /// Fresh directory under the system temp dir
    pub(crate) fn scratch_dir(label: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("loopstation-{}-{}", label, uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).expect("create scratch dir");
        dir
    }

    /// Write interleaved canonical samples straight to disk
    pub(crate) fn write_canonical(path: &Path, samples: &[f32]) {
        let mut writer = ChannelFiles::create_writer(path).expect("create writer");
        for &s in samples {
            writer.write_sample(f32_to_i16(s)).expect("write sample");
        }
        writer.finalize().expect("finalize");
    }

    #[test]
    fn test_channel_file_is_named_from_index() {
        let files = ChannelFiles::new("/tmp/loops");
        assert_eq!(files.channel_file(0), PathBuf::from("/tmp/loops/0test.wav"));
        assert_eq!(files.channel_file(7), PathBuf::from("/tmp/loops/7test.wav"));
    }

    #[test]
    fn test_inspect_missing_file() {
        let dir = scratch_dir("inspect-missing");
        let path = ChannelFiles::new(&dir).channel_file(3);
        assert!(matches!(
            ChannelFiles::inspect(&path),
            Err(LoopError::FileNotFound(_))
        ));
    }

    #[test]
    fn test_inspect_reports_duration() {
        let dir = scratch_dir("inspect");
        let path = ChannelFiles::new(&dir).channel_file(0);
        // One second of stereo silence
        write_canonical(&path, &vec![0.0; 16_000]);

        let info = ChannelFiles::inspect(&path).unwrap();
        assert_eq!(info.spec, canonical_spec());
        assert_eq!(info.frames, 8_000);
        assert_eq!(info.duration_seconds(), 1.0);
    }

    #[test]
    fn test_inspect_rejects_garbage() {
        let dir = scratch_dir("inspect-garbage");
        let path = dir.join("0test.wav");
        std::fs::write(&path, b"definitely not a wave file").unwrap();
        assert!(matches!(
            ChannelFiles::inspect(&path),
            Err(LoopError::Decode(_))
        ));
    }
}

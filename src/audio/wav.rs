//! WAV file I/O in the pipeline format (16 kHz, mono, 16-bit)

use std::path::{Path, PathBuf};

use super::SAMPLE_RATE;
use crate::{Error, Result};

fn pipeline_spec() -> hound::WavSpec {
    hound::WavSpec {
        channels: 1,
        sample_rate: SAMPLE_RATE,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    }
}

/// Append `.wav` when the path has no extension
#[must_use]
pub fn with_wav_extension(path: &Path) -> PathBuf {
    if path.extension().is_some() {
        path.to_path_buf()
    } else {
        path.with_extension("wav")
    }
}

/// Read a WAV file that is already in the pipeline format
///
/// # Errors
///
/// Returns error if the file cannot be read or is in another format
pub fn read_wav(path: &Path) -> Result<Vec<i16>> {
    let reader = hound::WavReader::open(path)?;
    let spec = reader.spec();

    if spec != pipeline_spec() {
        return Err(Error::Audio(format!(
            "{}: expected {SAMPLE_RATE} Hz mono 16-bit, found {} Hz {}-channel {}-bit",
            path.display(),
            spec.sample_rate,
            spec.channels,
            spec.bits_per_sample
        )));
    }

    reader
        .into_samples::<i16>()
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(Error::from)
}

/// Write samples as a pipeline-format WAV file
///
/// # Errors
///
/// Returns error if the file cannot be created or written
pub fn write_wav(path: &Path, samples: &[i16]) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let mut writer = hound::WavWriter::create(path, pipeline_spec())?;
    for &sample in samples {
        writer.write_sample(sample)?;
    }
    writer.finalize()?;

    tracing::debug!(path = %path.display(), samples = samples.len(), "wrote wav");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_write_then_read() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("tone.wav");
        let samples: Vec<i16> = (0..800i16).map(|i| i * 40 - 16_000).collect();

        write_wav(&path, &samples).unwrap();
        assert_eq!(read_wav(&path).unwrap(), samples);
    }

    #[test]
    fn test_rejects_other_formats() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stereo.wav");
        let spec = hound::WavSpec {
            channels: 2,
            ..pipeline_spec()
        };
        let mut writer = hound::WavWriter::create(&path, spec).unwrap();
        writer.write_sample(0i16).unwrap();
        writer.write_sample(0i16).unwrap();
        writer.finalize().unwrap();

        assert!(matches!(read_wav(&path), Err(Error::Audio(_))));
    }

    #[test]
    fn test_extension_appended_only_when_missing() {
        assert_eq!(
            with_wav_extension(Path::new("/audio/ready")),
            PathBuf::from("/audio/ready.wav")
        );
        assert_eq!(
            with_wav_extension(Path::new("/audio/ready.wav")),
            PathBuf::from("/audio/ready.wav")
        );
    }
}

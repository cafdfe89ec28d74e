//! Chunked, interruptible PCM output

use std::path::Path;
use std::time::Duration;

use thiserror::Error;

use super::{AudioHandle, SAMPLE_RATE, wav};
use crate::{Error, Result};

/// Device-level write failures
#[derive(Debug, Error)]
pub enum SinkError {
    /// Transient underrun or stream hiccup; recoverable
    #[error("device underrun")]
    Underrun,
    /// The device is unusable
    #[error("device error: {0}")]
    Device(String),
}

/// Destination for PCM samples
///
/// Implementations are owned by the worker thread and need not be `Send`.
pub trait PcmSink {
    /// Queue samples for playback, blocking while the device buffer is full
    ///
    /// Must give up early (returning `Ok`) once `cancelled()` is true.
    ///
    /// # Errors
    ///
    /// [`SinkError::Underrun`] for a transient fault, [`SinkError::Device`]
    /// when the device is gone
    fn write(
        &mut self,
        samples: &[i16],
        cancelled: &dyn Fn() -> bool,
    ) -> std::result::Result<(), SinkError>;

    /// Discard everything buffered but not yet played
    fn drop_buffered(&mut self);

    /// Re-open the device after an underrun
    ///
    /// # Errors
    ///
    /// [`SinkError::Device`] if the device cannot be brought back
    fn recover(&mut self) -> std::result::Result<(), SinkError>;

    /// Samples queued but not yet played
    fn buffered(&self) -> usize;

    /// Human-readable description for logs
    fn describe(&self) -> String;
}

/// How a playback call ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlayOutcome {
    Completed,
    Interrupted,
}

/// The audio output engine
///
/// Serves speech, cached PCM and files alike so volume, device selection and
/// interrupt handling are uniform. Beeps bypass this type entirely and go
/// through the [`AudioHandle`] straight to the device.
pub struct AudioOutput {
    sink: Box<dyn PcmSink>,
    handle: AudioHandle,
    chunk_samples: usize,
}

impl AudioOutput {
    /// Wrap a sink
    #[must_use]
    pub fn new(sink: Box<dyn PcmSink>, handle: AudioHandle, chunk: Duration) -> Self {
        let chunk_samples = super::chunk_samples(chunk);
        tracing::debug!(sink = %sink.describe(), chunk_samples, "audio output ready");

        Self {
            sink,
            handle,
            chunk_samples,
        }
    }

    #[must_use]
    pub const fn handle(&self) -> &AudioHandle {
        &self.handle
    }

    #[must_use]
    pub const fn chunk_samples(&self) -> usize {
        self.chunk_samples
    }

    /// Write samples chunk by chunk
    ///
    /// The interrupt flag is checked at every chunk boundary; on interrupt the
    /// device buffer is dropped and the rest of `samples` is discarded.
    ///
    /// # Errors
    ///
    /// Returns error only when the device is unusable; underruns are
    /// recovered and the chunk retried once
    pub fn write(&mut self, samples: &[i16]) -> Result<PlayOutcome> {
        for chunk in samples.chunks(self.chunk_samples) {
            if self.handle.is_interrupted() {
                self.sink.drop_buffered();
                return Ok(PlayOutcome::Interrupted);
            }
            self.write_chunk(chunk)?;
        }

        if self.handle.is_interrupted() {
            self.sink.drop_buffered();
            return Ok(PlayOutcome::Interrupted);
        }
        Ok(PlayOutcome::Completed)
    }

    fn write_chunk(&mut self, chunk: &[i16]) -> Result<()> {
        let handle = self.handle.clone();
        let cancelled = move || handle.is_interrupted();

        match self.sink.write(chunk, &cancelled) {
            Ok(()) => Ok(()),
            Err(SinkError::Underrun) => {
                tracing::warn!("audio underrun, recovering device");
                self.sink
                    .recover()
                    .map_err(|e| Error::Audio(e.to_string()))?;
                match self.sink.write(chunk, &cancelled) {
                    Ok(()) => Ok(()),
                    Err(SinkError::Underrun) => {
                        tracing::warn!(samples = chunk.len(), "underrun persisted, chunk skipped");
                        Ok(())
                    }
                    Err(SinkError::Device(msg)) => Err(Error::Audio(msg)),
                }
            }
            Err(SinkError::Device(msg)) => Err(Error::Audio(msg)),
        }
    }

    /// Wait until the device has played everything queued
    ///
    /// Returns early on interrupt, dropping the remainder.
    pub fn finish(&mut self) -> PlayOutcome {
        let limit = self.buffered_duration() + Duration::from_millis(500);
        let start = std::time::Instant::now();

        while self.sink.buffered() > 0 && start.elapsed() < limit {
            if self.handle.is_interrupted() {
                self.sink.drop_buffered();
                return PlayOutcome::Interrupted;
            }
            std::thread::sleep(Duration::from_millis(5));
        }

        if self.handle.is_interrupted() {
            PlayOutcome::Interrupted
        } else {
            PlayOutcome::Completed
        }
    }

    fn buffered_duration(&self) -> Duration {
        let samples = u64::try_from(self.sink.buffered()).unwrap_or(u64::MAX);
        Duration::from_millis(samples.saturating_mul(1000) / u64::from(SAMPLE_RATE))
    }

    /// Play a complete PCM buffer and wait for it to finish
    ///
    /// # Errors
    ///
    /// Returns error if the device fails
    pub fn play_pcm(&mut self, samples: &[i16]) -> Result<PlayOutcome> {
        match self.write(samples)? {
            PlayOutcome::Completed => Ok(self.finish()),
            PlayOutcome::Interrupted => Ok(PlayOutcome::Interrupted),
        }
    }

    /// Play a pipeline-format WAV file; `.wav` is appended when missing
    ///
    /// # Errors
    ///
    /// Returns error if the file is missing, in another format, or the device
    /// fails
    pub fn play_file(&mut self, path: &Path) -> Result<PlayOutcome> {
        let path = wav::with_wav_extension(path);
        let samples = wav::read_wav(&path)?;
        tracing::debug!(path = %path.display(), samples = samples.len(), "playing file");
        self.play_pcm(&samples)
    }
}

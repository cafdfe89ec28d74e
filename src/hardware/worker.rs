//! Serial worker lanes
//!
//! Each lane runs its jobs one at a time on a dedicated thread. The audio lane
//! owns the output device, the speech engine and the phrase cache; the keypad
//! lane owns the key source and its state machine.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use crate::Result;
use crate::audio::{AudioHandle, AudioOutput, PlayOutcome, pcm_from_bytes, pcm_to_bytes, wav};
use crate::cache::PhraseCache;
use crate::keypad::{DebounceSettings, KeySource, Keypad, Layout};
use crate::protocol::{KeyReport, Packet, PacketKind, Status};
use crate::queue::{BoundedQueue, QueueError};
use crate::speech::{SpeakOutcome, SpeechEngine};
use crate::transport::PacketWriter;

/// How often an idle lane wakes to check for shutdown
const IDLE_WAKE: Duration = Duration::from_secs(1);

/// Minimum spacing between attempts to reopen a failed keypad
const KEYPAD_RETRY: Duration = Duration::from_secs(2);

/// Longest file name stem for persisted speech
const MAX_STEM: usize = 64;

/// A queued request and where to answer it
#[derive(Debug)]
pub struct Job<T> {
    pub tag: u16,
    /// Interrupt generation current when the job was queued
    pub generation: u64,
    pub work: T,
    pub reply: PacketWriter,
}

impl<T> Job<T> {
    /// Answer with a status payload
    pub fn reply_status(&self, kind: PacketKind, status: Status) {
        send_reply(&self.reply, kind, self.tag, &status.encode());
    }
}

/// Send a reply, logging instead of failing
pub fn send_reply(writer: &PacketWriter, kind: PacketKind, tag: u16, payload: &[u8]) {
    let result = Packet::new(kind, tag, payload.to_vec())
        .map_err(crate::Error::from)
        .and_then(|packet| writer.send(&packet));
    if let Err(e) = result {
        tracing::warn!(tag, %kind, error = %e, "failed to send reply");
    }
}

/// Work for the audio lane
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AudioWork {
    Speak(String),
    PlayFile(PathBuf),
    Persist(String),
    SetSpeed(u8),
}

impl AudioWork {
    /// Whether an interrupt cancels this job
    #[must_use]
    pub const fn is_playback(&self) -> bool {
        !matches!(self, Self::SetSpeed(_))
    }

    /// Kind used for the reply
    #[must_use]
    pub const fn reply_kind(&self) -> PacketKind {
        match self {
            Self::SetSpeed(_) => PacketKind::Config,
            _ => PacketKind::Audio,
        }
    }
}

/// Work for the keypad lane
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeypadWork {
    Read,
    SetLayout(Layout),
}

/// Audio lane state; lives entirely on the lane's thread
pub struct AudioWorker {
    pub output: Option<AudioOutput>,
    pub engine: Option<Box<dyn SpeechEngine>>,
    pub cache: Option<PhraseCache>,
    pub handle: AudioHandle,
    pub pregen_dir: PathBuf,
}

impl AudioWorker {
    /// Run jobs until the queue is closed
    pub fn run(mut self, jobs: &BoundedQueue<Job<AudioWork>>, ready: &AtomicBool) {
        ready.store(self.output.is_some(), Ordering::Release);
        tracing::debug!(
            output = self.output.is_some(),
            engine = ?self.engine.as_ref().map(|e| e.describe()),
            "audio lane started"
        );

        loop {
            let job = match jobs.pop_timeout(IDLE_WAKE) {
                Ok(job) => job,
                Err(QueueError::TimedOut) => continue,
                Err(QueueError::Closed) => break,
            };

            let started = Instant::now();
            let status = self.execute(&job);
            tracing::debug!(
                tag = job.tag,
                work = ?job.work,
                ?status,
                elapsed_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX),
                "audio job finished"
            );
            job.reply_status(job.work.reply_kind(), status);
        }

        tracing::debug!("audio lane stopped");
    }

    fn execute(&mut self, job: &Job<AudioWork>) -> Status {
        if job.work.is_playback() && !self.handle.arm(job.generation) {
            return Status::Interrupted;
        }

        match &job.work {
            AudioWork::Speak(text) => self.speak(text),
            AudioWork::PlayFile(path) => self.play_file(path),
            AudioWork::Persist(text) => self.persist(text),
            AudioWork::SetSpeed(percent) => self.set_speed(*percent),
        }
    }

    /// Speak `text`, from the cache when possible
    pub fn speak(&mut self, text: &str) -> Status {
        let Self {
            output,
            engine,
            cache,
            ..
        } = self;

        let Some(output) = output.as_mut() else {
            tracing::warn!("no audio output, cannot speak");
            return Status::Failed;
        };

        if let Some(bytes) = cache.as_mut().and_then(|c| c.lookup(text)) {
            return match output.play_pcm(&pcm_from_bytes(&bytes)) {
                Ok(outcome) => outcome_status(outcome),
                Err(e) => {
                    tracing::error!(error = %e, "cached playback failed");
                    Status::Failed
                }
            };
        }

        let Some(engine) = engine.as_mut() else {
            tracing::warn!("no speech engine configured");
            return Status::Failed;
        };

        let mut device_error = None;
        let result = engine.speak(text, &mut |chunk| match output.write(chunk) {
            Ok(PlayOutcome::Completed) => true,
            Ok(PlayOutcome::Interrupted) => false,
            Err(e) => {
                device_error = Some(e);
                false
            }
        });

        if let Some(e) = device_error {
            tracing::error!(error = %e, "audio device failed during speech");
            return Status::Failed;
        }

        match result {
            Ok(SpeakOutcome::Completed(pcm)) => {
                let outcome = output.finish();
                if let Some(cache) = cache.as_mut()
                    && let Err(e) = cache.store(text, &pcm_to_bytes(&pcm))
                {
                    tracing::warn!(error = %e, "failed to cache phrase");
                }
                outcome_status(outcome)
            }
            Ok(SpeakOutcome::Interrupted) => Status::Interrupted,
            Err(e) => {
                tracing::error!(error = %e, "speech synthesis failed");
                Status::Failed
            }
        }
    }

    fn play_file(&mut self, path: &Path) -> Status {
        let Some(output) = self.output.as_mut() else {
            return Status::Failed;
        };
        match output.play_file(path) {
            Ok(outcome) => outcome_status(outcome),
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "file playback failed");
                Status::Failed
            }
        }
    }

    /// Synthesise without playing and write a WAV named after the text
    fn persist(&mut self, text: &str) -> Status {
        match self.synthesize(text) {
            Ok(Some(pcm)) => {
                let path = self.pregen_dir.join(format!("{}.wav", file_stem(text)));
                match wav::write_wav(&path, &pcm) {
                    Ok(()) => {
                        tracing::info!(path = %path.display(), "persisted speech");
                        Status::Ok
                    }
                    Err(e) => {
                        tracing::error!(
                            path = %path.display(),
                            error = %e,
                            "failed to write speech file"
                        );
                        Status::Failed
                    }
                }
            }
            Ok(None) => Status::Interrupted,
            Err(e) => {
                tracing::error!(error = %e, "speech synthesis failed");
                Status::Failed
            }
        }
    }

    /// PCM for `text` from the cache or the engine, without playing it
    fn synthesize(&mut self, text: &str) -> Result<Option<Vec<i16>>> {
        if let Some(bytes) = self.cache.as_mut().and_then(|c| c.lookup(text)) {
            return Ok(Some(pcm_from_bytes(&bytes)));
        }

        let Some(engine) = self.engine.as_mut() else {
            return Err(crate::Error::Speech("no speech engine configured".into()));
        };

        let handle = self.handle.clone();
        match engine.speak(text, &mut |_| !handle.is_interrupted())? {
            SpeakOutcome::Completed(pcm) => {
                if let Some(cache) = self.cache.as_mut()
                    && let Err(e) = cache.store(text, &pcm_to_bytes(&pcm))
                {
                    tracing::warn!(error = %e, "failed to cache phrase");
                }
                Ok(Some(pcm))
            }
            SpeakOutcome::Interrupted => Ok(None),
        }
    }

    fn set_speed(&mut self, percent: u8) -> Status {
        let Some(engine) = self.engine.as_mut() else {
            return Status::Failed;
        };
        match engine.set_speed(percent) {
            Ok(()) => Status::Ok,
            Err(e) => {
                tracing::error!(error = %e, "failed to change speech speed");
                Status::Failed
            }
        }
    }
}

const fn outcome_status(outcome: PlayOutcome) -> Status {
    match outcome {
        PlayOutcome::Completed => Status::Ok,
        PlayOutcome::Interrupted => Status::Interrupted,
    }
}

/// File name stem for persisted speech: lowercase alphanumerics and `_`
#[must_use]
pub fn file_stem(text: &str) -> String {
    let mut stem = String::with_capacity(text.len().min(MAX_STEM));
    for c in text.trim().chars() {
        if stem.len() >= MAX_STEM {
            break;
        }
        if c.is_ascii_alphanumeric() {
            stem.push(c.to_ascii_lowercase());
        } else if !stem.ends_with('_') {
            stem.push('_');
        }
    }
    let stem = stem.trim_matches('_').to_string();

    if stem.is_empty() {
        PhraseCache::key(text)[..16].to_string()
    } else {
        stem
    }
}

/// Factory reopening the key source after a failure
pub type KeySourceFactory = Box<dyn FnMut() -> Result<Box<dyn KeySource>> + Send>;

/// Keypad lane state
pub struct KeypadWorker {
    pub open_source: KeySourceFactory,
    pub settings: DebounceSettings,
    pub keypad: Option<Keypad>,
    pub last_attempt: Option<Instant>,
}

impl KeypadWorker {
    #[must_use]
    pub fn new(open_source: KeySourceFactory, settings: DebounceSettings) -> Self {
        Self {
            open_source,
            settings,
            keypad: None,
            last_attempt: None,
        }
    }

    /// Run jobs until the queue is closed
    pub fn run(mut self, jobs: &BoundedQueue<Job<KeypadWork>>) {
        self.ensure_open();
        loop {
            let job = match jobs.pop_timeout(IDLE_WAKE) {
                Ok(job) => job,
                Err(QueueError::TimedOut) => continue,
                Err(QueueError::Closed) => break,
            };

            match job.work {
                KeypadWork::Read => {
                    let report = self.read();
                    send_reply(&job.reply, PacketKind::Keypad, job.tag, &report.encode());
                }
                KeypadWork::SetLayout(layout) => {
                    self.settings.layout = layout;
                    if let Some(keypad) = self.keypad.as_mut() {
                        keypad.set_layout(layout);
                    }
                    job.reply_status(PacketKind::Config, Status::Ok);
                }
            }
        }
        tracing::debug!("keypad lane stopped");
    }

    /// Poll the keypad once
    pub fn read(&mut self) -> KeyReport {
        self.ensure_open();
        let Some(keypad) = self.keypad.as_mut() else {
            return KeyReport::NONE;
        };

        match keypad.read() {
            Ok(event) if event.valid => KeyReport {
                symbol: Some(event.symbol),
                is_hold: event.is_hold,
            },
            Ok(_) => KeyReport::NONE,
            Err(e) => {
                tracing::error!(error = %e, "keypad read failed, will reopen");
                self.keypad = None;
                KeyReport::NONE
            }
        }
    }

    fn ensure_open(&mut self) {
        if self.keypad.is_some() {
            return;
        }
        if self
            .last_attempt
            .is_some_and(|at| at.elapsed() < KEYPAD_RETRY)
        {
            return;
        }
        self.last_attempt = Some(Instant::now());

        match (self.open_source)() {
            Ok(source) => self.keypad = Some(Keypad::new(source, self.settings)),
            Err(e) => tracing::warn!(error = %e, "keypad unavailable"),
        }
    }
}

/// Shared flag telling readers whether the audio lane has a device
pub type AudioReady = Arc<AtomicBool>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_file_stem_sanitised() {
        assert_eq!(file_stem("Fourteen point two!"), "fourteen_point_two");
        assert_eq!(file_stem("  a/b\\c  "), "a_b_c");
        assert_eq!(file_stem("???").len(), 16);
        assert!(file_stem(&"x".repeat(200)).len() <= MAX_STEM);
    }

    #[test]
    fn test_speed_change_survives_interrupt() {
        assert!(!AudioWork::SetSpeed(120).is_playback());
        assert!(AudioWork::Persist("x".into()).is_playback());
        assert_eq!(AudioWork::SetSpeed(120).reply_kind(), PacketKind::Config);
    }
}

//! Persistent synthesis subprocess
//!
//! One engine process lives for the whole hardware process. Text goes in one
//! line per utterance on stdin; raw 16 kHz mono S16LE PCM comes back on
//! stdout. A reader thread turns stdout into a channel of chunks so reads can
//! carry a timeout.

use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStdin, Command, Stdio};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::thread;
use std::time::{Duration, Instant};

use super::boundary::{IdleTimeout, Silence, UtteranceBoundary};
use super::engine::{SpeakOutcome, SpeechEngine};
use crate::{Error, Result};

/// Read size for the stdout pump
const READ_BLOCK: usize = 4096;

/// Longest time spent discarding output left over from an interrupted utterance
const DISCARD_LIMIT: Duration = Duration::from_secs(3);

/// Program and arguments used to start the engine
#[derive(Debug, Clone, PartialEq)]
pub struct EngineCommand {
    pub program: PathBuf,
    pub args: Vec<String>,
}

impl EngineCommand {
    /// Arbitrary command line, mainly for tests and alternative engines
    #[must_use]
    pub fn new(program: impl Into<PathBuf>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }

    /// Piper streaming raw PCM for the given voice model
    ///
    /// Speed is in percent of normal; Piper's length scale is its inverse.
    ///
    /// # Errors
    ///
    /// Returns error if the program cannot be found on `PATH`
    pub fn piper(program: &str, model: &Path, speed_percent: u8) -> Result<Self> {
        let program = which::which(program)
            .map_err(|e| Error::Speech(format!("cannot find {program}: {e}")))?;

        Ok(Self {
            program,
            args: vec![
                "--model".into(),
                model.display().to_string(),
                "--output_raw".into(),
                "--length_scale".into(),
                length_scale(speed_percent),
            ],
        })
    }

    /// Same command with Piper's length scale replaced
    #[must_use]
    pub fn with_speed(&self, speed_percent: u8) -> Self {
        let mut next = self.clone();
        if let Some(pos) = next.args.iter().position(|a| a == "--length_scale")
            && let Some(value) = next.args.get_mut(pos + 1)
        {
            *value = length_scale(speed_percent);
        }
        next
    }
}

/// Piper length scale for a speed in percent (100 = 1.0, 200 = 0.5)
#[must_use]
pub fn length_scale(speed_percent: u8) -> String {
    format!("{:.2}", 100.0 / f32::from(speed_percent.max(1)))
}

enum Output {
    Chunk(Vec<u8>),
    Eof,
    Failed(io::Error),
}

/// A running engine process and its stdout pump
struct Running {
    child: Child,
    stdin: ChildStdin,
    output: Receiver<Output>,
}

impl Running {
    fn spawn(command: &EngineCommand) -> Result<Self> {
        let mut child = Command::new(&command.program)
            .args(&command.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|e| {
                Error::Speech(format!(
                    "failed to start {}: {e}",
                    command.program.display()
                ))
            })?;

        let (Some(stdin), Some(mut stdout)) = (child.stdin.take(), child.stdout.take()) else {
            let _ = child.kill();
            let _ = child.wait();
            return Err(Error::Speech("engine pipes unavailable".to_string()));
        };

        let (tx, output) = mpsc::channel();
        thread::Builder::new()
            .name("speech-stdout".into())
            .spawn(move || {
                let mut block = vec![0u8; READ_BLOCK];
                loop {
                    let message = match stdout.read(&mut block) {
                        Ok(0) => Output::Eof,
                        Ok(n) => Output::Chunk(block[..n].to_vec()),
                        Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                        Err(e) => Output::Failed(e),
                    };
                    let last = !matches!(message, Output::Chunk(_));
                    if tx.send(message).is_err() || last {
                        return;
                    }
                }
            })?;

        tracing::info!(
            pid = child.id(),
            program = %command.program.display(),
            "speech engine started"
        );
        Ok(Self {
            child,
            stdin,
            output,
        })
    }

    fn terminate(mut self) {
        // Closing stdin lets a well-behaved engine exit on its own
        drop(self.stdin);
        match self.child.try_wait() {
            Ok(Some(_)) => {}
            _ => {
                let _ = self.child.kill();
                let _ = self.child.wait();
            }
        }
    }
}

/// Supervised synthesis process
pub struct SynthesisProcess {
    command: EngineCommand,
    boundary: Box<dyn UtteranceBoundary>,
    running: Option<Running>,
    /// Output of an interrupted utterance may still be arriving
    stale: bool,
    restarts: u32,
}

impl SynthesisProcess {
    /// Start the engine
    ///
    /// # Errors
    ///
    /// Returns error if the process cannot be spawned
    pub fn spawn(command: EngineCommand, boundary: Box<dyn UtteranceBoundary>) -> Result<Self> {
        let running = Running::spawn(&command)?;
        Ok(Self {
            command,
            boundary,
            running: Some(running),
            stale: false,
            restarts: 0,
        })
    }

    /// Start the engine with the default idle-timeout boundary
    ///
    /// # Errors
    ///
    /// Returns error if the process cannot be spawned
    pub fn with_defaults(command: EngineCommand) -> Result<Self> {
        Self::spawn(command, Box::new(IdleTimeout::default()))
    }

    /// Number of times the engine has been restarted
    #[must_use]
    pub const fn restarts(&self) -> u32 {
        self.restarts
    }

    /// Process id of the running engine
    #[must_use]
    pub fn pid(&self) -> Option<u32> {
        self.running.as_ref().map(|r| r.child.id())
    }

    /// Whether the engine process is still alive
    pub fn is_alive(&mut self) -> bool {
        self.running
            .as_mut()
            .is_some_and(|r| matches!(r.child.try_wait(), Ok(None)))
    }

    /// Replace the engine process in place
    fn respawn(&mut self, reason: &str) {
        if let Some(old) = self.running.take() {
            old.terminate();
        }
        self.stale = false;
        self.restarts += 1;
        tracing::warn!(reason, restarts = self.restarts, "restarting speech engine");

        match Running::spawn(&self.command) {
            Ok(running) => self.running = Some(running),
            Err(e) => tracing::error!(error = %e, "speech engine restart failed"),
        }
    }

    /// Fail the current request and restart the engine
    fn fail(&mut self, reason: &str) -> Error {
        self.respawn(reason);
        Error::Speech(reason.to_string())
    }

    /// Drop output left over from an interrupted utterance
    fn discard_stale(&mut self) {
        let Some(running) = self.running.as_ref() else {
            return;
        };

        if !self.stale {
            // Nothing expected, but never mix old bytes into a new utterance
            while let Ok(Output::Chunk(_)) = running.output.try_recv() {}
            return;
        }

        let idle = self.boundary.next_timeout(1);
        let start = Instant::now();
        let mut discarded = 0usize;
        loop {
            match running.output.recv_timeout(idle) {
                Ok(Output::Chunk(bytes)) => discarded += bytes.len(),
                Err(RecvTimeoutError::Timeout) => break,
                Ok(Output::Eof | Output::Failed(_)) | Err(RecvTimeoutError::Disconnected) => {
                    self.respawn("engine exited while discarding output");
                    return;
                }
            }
            if start.elapsed() > DISCARD_LIMIT {
                self.respawn("interrupted utterance never went quiet");
                return;
            }
        }

        tracing::trace!(discarded, "discarded interrupted output");
        self.stale = false;
    }
}

impl SpeechEngine for SynthesisProcess {
    fn speak(
        &mut self,
        text: &str,
        on_chunk: &mut dyn FnMut(&[i16]) -> bool,
    ) -> Result<SpeakOutcome> {
        // Newlines delimit utterances on the engine's stdin
        let line: String = text
            .chars()
            .map(|c| if c.is_control() { ' ' } else { c })
            .collect();
        let line = line.trim();
        if line.is_empty() {
            return Ok(SpeakOutcome::Completed(Vec::new()));
        }

        if self.running.is_none() {
            self.respawn("engine was not running");
        }
        self.discard_stale();

        let Some(running) = self.running.as_mut() else {
            return Err(Error::Speech("speech engine unavailable".to_string()));
        };

        if let Err(e) = writeln!(running.stdin, "{line}").and_then(|()| running.stdin.flush()) {
            return Err(self.fail(&format!("write to engine failed: {e}")));
        }
        tracing::debug!(chars = line.len(), "utterance sent to engine");

        let mut pcm: Vec<i16> = Vec::new();
        let mut carry: Option<u8> = None;
        let mut received = 0usize;

        loop {
            let Some(running) = self.running.as_ref() else {
                return Err(Error::Speech("speech engine unavailable".to_string()));
            };

            let timeout = self.boundary.next_timeout(received);
            match running.output.recv_timeout(timeout) {
                Ok(Output::Chunk(bytes)) => {
                    received += bytes.len();
                    let samples = decode(&mut carry, &bytes);
                    if samples.is_empty() {
                        continue;
                    }
                    tracing::trace!(samples = samples.len(), "engine chunk");
                    pcm.extend_from_slice(&samples);
                    if !on_chunk(&samples) {
                        self.stale = true;
                        return Ok(SpeakOutcome::Interrupted);
                    }
                }
                Err(RecvTimeoutError::Timeout) => match self.boundary.on_silence(received) {
                    Silence::EndOfUtterance => {
                        tracing::debug!(samples = pcm.len(), "utterance complete");
                        return Ok(SpeakOutcome::Completed(pcm));
                    }
                    Silence::Stalled => return Err(self.fail("engine produced no output")),
                },
                Ok(Output::Failed(e)) => {
                    return Err(self.fail(&format!("engine output failed: {e}")));
                }
                Ok(Output::Eof) | Err(RecvTimeoutError::Disconnected) => {
                    return Err(self.fail("engine exited mid-utterance"));
                }
            }
        }
    }

    fn set_speed(&mut self, percent: u8) -> Result<()> {
        if percent == 0 {
            return Err(Error::Speech("speed must be positive".to_string()));
        }
        self.command = self.command.with_speed(percent);
        tracing::info!(percent, "speech speed changed");
        self.respawn("speed changed");
        if self.running.is_some() {
            Ok(())
        } else {
            Err(Error::Speech("engine failed to restart".to_string()))
        }
    }

    fn describe(&self) -> String {
        format!(
            "{} {}",
            self.command.program.display(),
            self.command.args.join(" ")
        )
    }
}

impl Drop for SynthesisProcess {
    fn drop(&mut self) {
        if let Some(running) = self.running.take() {
            running.terminate();
        }
    }
}

/// Decode little-endian samples, carrying an odd trailing byte forward
fn decode(carry: &mut Option<u8>, bytes: &[u8]) -> Vec<i16> {
    let mut joined;
    let bytes = match carry.take() {
        Some(first) => {
            joined = Vec::with_capacity(bytes.len() + 1);
            joined.push(first);
            joined.extend_from_slice(bytes);
            joined.as_slice()
        }
        None => bytes,
    };

    if bytes.len() % 2 == 1 {
        *carry = bytes.last().copied();
    }
    crate::audio::pcm_from_bytes(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn quick() -> Box<dyn UtteranceBoundary> {
        Box::new(IdleTimeout {
            first_byte: Duration::from_millis(500),
            idle: Duration::from_millis(80),
        })
    }

    #[test]
    fn test_length_scale() {
        assert_eq!(length_scale(100), "1.00");
        assert_eq!(length_scale(200), "0.50");
        assert_eq!(length_scale(50), "2.00");
    }

    #[test]
    fn test_with_speed_rewrites_length_scale() {
        let command = EngineCommand::new(
            "piper",
            vec!["--model".into(), "m.onnx".into(), "--length_scale".into(), "1.00".into()],
        );
        assert_eq!(command.with_speed(200).args[3], "0.50");
    }

    #[test]
    fn test_decode_carries_odd_byte() {
        let mut carry = None;
        assert_eq!(decode(&mut carry, &[0x01, 0x00, 0x02]), vec![1]);
        assert_eq!(carry, Some(0x02));
        assert_eq!(decode(&mut carry, &[0x00]), vec![2]);
        assert_eq!(carry, None);
    }

    #[test]
    fn test_echo_engine_completes_utterance() {
        // `cat` echoes the line back: "hello\n" is six bytes, three samples
        let mut engine =
            SynthesisProcess::spawn(EngineCommand::new("cat", Vec::new()), quick()).unwrap();
        let mut chunks = 0;
        let outcome = engine
            .speak("hello", &mut |_| {
                chunks += 1;
                true
            })
            .unwrap();

        let expected = crate::audio::pcm_from_bytes(b"hello\n");
        assert_eq!(outcome, SpeakOutcome::Completed(expected));
        assert!(chunks >= 1);
        assert!(engine.is_alive());
    }

    #[test]
    fn test_process_reused_across_utterances() {
        let mut engine =
            SynthesisProcess::spawn(EngineCommand::new("cat", Vec::new()), quick()).unwrap();
        let pid = engine.pid();
        engine.speak("one", &mut |_| true).unwrap();
        engine.speak("two", &mut |_| true).unwrap();
        assert_eq!(engine.pid(), pid);
        assert_eq!(engine.restarts(), 0);
    }

    #[test]
    fn test_dead_engine_reports_failure_and_restarts() {
        let mut engine =
            SynthesisProcess::spawn(EngineCommand::new("true", Vec::new()), quick()).unwrap();
        std::thread::sleep(Duration::from_millis(50));

        let result = engine.speak("anything", &mut |_| true);
        assert!(matches!(result, Err(Error::Speech(_))));
        assert!(engine.restarts() >= 1);
    }

    #[test]
    fn test_silent_engine_times_out() {
        let mut engine = SynthesisProcess::spawn(
            EngineCommand::new("sh", vec!["-c".into(), "read line; sleep 5".into()]),
            quick(),
        )
        .unwrap();

        let start = Instant::now();
        assert!(engine.speak("hello", &mut |_| true).is_err());
        assert!(start.elapsed() < Duration::from_secs(3));
    }

    #[test]
    fn test_interrupt_stops_early() {
        let mut engine =
            SynthesisProcess::spawn(EngineCommand::new("cat", Vec::new()), quick()).unwrap();
        let outcome = engine.speak("stop right there", &mut |_| false).unwrap();
        assert_eq!(outcome, SpeakOutcome::Interrupted);

        // The next utterance is not polluted by the abandoned one
        let outcome = engine.speak("ok", &mut |_| true).unwrap();
        let expected = crate::audio::pcm_from_bytes(b"ok\n");
        assert_eq!(outcome, SpeakOutcome::Completed(expected));
    }

    #[test]
    fn test_missing_program_fails_to_spawn() {
        let result = SynthesisProcess::with_defaults(EngineCommand::new(
            "/nonexistent/engine",
            Vec::new(),
        ));
        assert!(result.is_err());
    }
}

//! End-of-utterance detection
//!
//! The synthesis engine streams raw PCM with no framing, so the end of an
//! utterance has to be inferred. The policy is a trait so it can be swapped
//! and tested on its own.

use std::fmt::Debug;
use std::time::Duration;

/// What a quiet output stream means
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Silence {
    /// The utterance is complete
    EndOfUtterance,
    /// The engine is stuck; the request failed
    Stalled,
}

/// Policy deciding when a quiet output stream ends an utterance
pub trait UtteranceBoundary: Debug + Send {
    /// How long to wait for more output after `received` bytes
    fn next_timeout(&self, received: usize) -> Duration;

    /// Interpret a wait that timed out after `received` bytes
    fn on_silence(&self, received: usize) -> Silence;
}

/// Idle-timeout heuristic
///
/// Waits up to `first_byte` for output to start, then treats `idle` with no
/// new bytes as the end of the utterance. A slow start longer than
/// `first_byte` is reported as a stall; a pause inside one utterance longer
/// than `idle` splits it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IdleTimeout {
    pub first_byte: Duration,
    pub idle: Duration,
}

impl Default for IdleTimeout {
    fn default() -> Self {
        Self {
            first_byte: Duration::from_secs(5),
            idle: Duration::from_millis(50),
        }
    }
}

impl UtteranceBoundary for IdleTimeout {
    fn next_timeout(&self, received: usize) -> Duration {
        if received == 0 { self.first_byte } else { self.idle }
    }

    fn on_silence(&self, received: usize) -> Silence {
        if received == 0 {
            Silence::Stalled
        } else {
            Silence::EndOfUtterance
        }
    }
}

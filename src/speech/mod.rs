//! Speech synthesis
//!
//! [`SynthesisProcess`] keeps one engine process alive and streams text in
//! and PCM out; [`UtteranceBoundary`] decides when an utterance has ended.

mod boundary;
mod engine;
mod process;

pub use boundary::{IdleTimeout, Silence, UtteranceBoundary};
pub use engine::{SpeakOutcome, SpeechEngine};
pub use process::{EngineCommand, SynthesisProcess, length_scale};

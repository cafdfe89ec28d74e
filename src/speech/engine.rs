//! Speech engine abstraction

use crate::Result;

/// How a `speak` call ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SpeakOutcome {
    /// The whole utterance was synthesised; carries its PCM for caching
    Completed(Vec<i16>),
    /// The consumer asked to stop; remaining output is discarded
    Interrupted,
}

/// Text-to-PCM engine used by the audio worker
pub trait SpeechEngine: Send {
    /// Synthesise `text`, handing each PCM chunk to `on_chunk` as it arrives
    ///
    /// `on_chunk` returns `false` to stop early.
    ///
    /// # Errors
    ///
    /// Returns error when the engine fails; it must never hang
    fn speak(
        &mut self,
        text: &str,
        on_chunk: &mut dyn FnMut(&[i16]) -> bool,
    ) -> Result<SpeakOutcome>;

    /// Change speaking rate, in percent of normal
    ///
    /// # Errors
    ///
    /// Returns error if the engine cannot apply the new rate
    fn set_speed(&mut self, percent: u8) -> Result<()>;

    /// Human-readable description for logs
    fn describe(&self) -> String;
}

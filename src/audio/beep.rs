//! RAM-resident beep tones

use std::path::Path;
use std::sync::Arc;

use super::{SAMPLE_RATE, wav};
use crate::protocol::BeepKind;

/// Peak amplitude of generated tones
const AMPLITUDE: f32 = 16_000.0;

/// Fade length at each end of a tone, avoiding clicks
const FADE_MS: u32 = 5;

/// Frequency in Hz and length in ms for each beep
const fn tone_shape(kind: BeepKind) -> (f32, u32) {
    match kind {
        BeepKind::Keypress => (1000.0, 50),
        BeepKind::Hold => (700.0, 50),
        BeepKind::Error => (400.0, 100),
    }
}

/// The three beeps, ready to hand to the device
#[derive(Debug, Clone)]
pub struct BeepSet {
    keypress: Arc<[i16]>,
    hold: Arc<[i16]>,
    error: Arc<[i16]>,
}

impl BeepSet {
    /// Generate all beeps as sine tones
    #[must_use]
    pub fn generate() -> Self {
        Self {
            keypress: tone(BeepKind::Keypress).into(),
            hold: tone(BeepKind::Hold).into(),
            error: tone(BeepKind::Error).into(),
        }
    }

    /// Load `beep_<kind>.wav` from `dir` where present, generating the rest
    #[must_use]
    pub fn load(dir: Option<&Path>) -> Self {
        let load_one = |kind: BeepKind| -> Arc<[i16]> {
            let Some(dir) = dir else {
                return tone(kind).into();
            };
            let path = dir.join(format!("beep_{}.wav", kind.name()));
            if !path.exists() {
                return tone(kind).into();
            }
            match wav::read_wav(&path) {
                Ok(samples) if !samples.is_empty() => {
                    tracing::debug!(path = %path.display(), "loaded beep");
                    samples.into()
                }
                Ok(_) => tone(kind).into(),
                Err(e) => {
                    tracing::warn!(
                        path = %path.display(),
                        error = %e,
                        "unusable beep file, generating tone"
                    );
                    tone(kind).into()
                }
            }
        };

        Self {
            keypress: load_one(BeepKind::Keypress),
            hold: load_one(BeepKind::Hold),
            error: load_one(BeepKind::Error),
        }
    }

    /// PCM for a beep kind
    #[must_use]
    pub fn get(&self, kind: BeepKind) -> Arc<[i16]> {
        match kind {
            BeepKind::Keypress => Arc::clone(&self.keypress),
            BeepKind::Hold => Arc::clone(&self.hold),
            BeepKind::Error => Arc::clone(&self.error),
        }
    }
}

/// Sine tone with linear fade in and out
#[allow(
    clippy::cast_precision_loss,
    clippy::cast_possible_truncation,
    clippy::cast_sign_loss
)]
fn tone(kind: BeepKind) -> Vec<i16> {
    let (freq, ms) = tone_shape(kind);
    let len = (SAMPLE_RATE * ms / 1000) as usize;
    let fade = (SAMPLE_RATE * FADE_MS / 1000) as usize;
    let rate = SAMPLE_RATE as f32;

    (0..len)
        .map(|i| {
            let edge = i.min(len - 1 - i);
            let gain = if edge < fade {
                edge as f32 / fade as f32
            } else {
                1.0
            };
            let phase = 2.0 * std::f32::consts::PI * freq * i as f32 / rate;
            (phase.sin() * AMPLITUDE * gain) as i16
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tone_lengths() {
        let beeps = BeepSet::generate();
        assert_eq!(beeps.get(BeepKind::Keypress).len(), 800);
        assert_eq!(beeps.get(BeepKind::Hold).len(), 800);
        assert_eq!(beeps.get(BeepKind::Error).len(), 1600);
    }

    #[test]
    fn test_tone_fades_in_and_stays_in_range() {
        let samples = tone(BeepKind::Keypress);
        assert_eq!(samples[0], 0);
        assert!(samples.iter().any(|&s| s > 10_000));
        assert!(samples.iter().all(|&s| f32::from(s).abs() <= AMPLITUDE + 1.0));
    }

    #[test]
    fn test_load_prefers_files() {
        let dir = tempfile::tempdir().unwrap();
        let custom = vec![7i16; 320];
        wav::write_wav(&dir.path().join("beep_hold.wav"), &custom).unwrap();

        let beeps = BeepSet::load(Some(dir.path()));
        assert_eq!(&*beeps.get(BeepKind::Hold), custom.as_slice());
        assert_eq!(beeps.get(BeepKind::Keypress).len(), 800);
    }
}

//! TOML configuration file loading
//!
//! Supports `~/.config/keyvox/config.toml` as a persistent config source.
//! All fields are optional; the file is a partial overlay on top of defaults.

use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::keypad::Layout;
use crate::{Error, Result};

/// Top-level TOML configuration file schema
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct KeyvoxConfigFile {
    #[serde(default)]
    pub keypad: KeypadFileConfig,

    #[serde(default)]
    pub timeouts: TimeoutsFileConfig,

    #[serde(default)]
    pub cache: CacheFileConfig,

    #[serde(default)]
    pub audio: AudioFileConfig,

    #[serde(default)]
    pub speech: SpeechFileConfig,

    #[serde(default)]
    pub transport: TransportFileConfig,
}

/// Keypad polling and debounce
#[derive(Debug, Default, Deserialize)]
pub struct KeypadFileConfig {
    pub hold_threshold_ms: Option<u64>,
    pub poll_interval_ms: Option<u64>,
    pub release_polls: Option<u32>,
    /// Overrides the layout's own double-key window
    pub debounce_window_ms: Option<u64>,
    pub layout: Option<Layout>,
    /// evdev path (defaults to the first keyboard in `/dev/input/by-id`)
    pub device: Option<PathBuf>,
    /// Beep on every key event from the application-side poller
    pub key_beep: Option<bool>,
}

/// Response timeouts
#[derive(Debug, Default, Deserialize)]
pub struct TimeoutsFileConfig {
    pub keypad_ms: Option<u64>,
    pub audio_ms: Option<u64>,
    pub config_ms: Option<u64>,
    pub liveness_ms: Option<u64>,
}

/// Phrase cache
#[derive(Debug, Default, Deserialize)]
pub struct CacheFileConfig {
    pub dir: Option<PathBuf>,
    pub max_bytes: Option<u64>,
}

/// Audio output
#[derive(Debug, Default, Deserialize)]
pub struct AudioFileConfig {
    /// Output device name (substring match)
    pub device: Option<String>,
    pub volume: Option<u8>,
    pub chunk_ms: Option<u64>,
    /// Directory holding `beep_{keypress,hold,error}.wav`
    pub beep_dir: Option<PathBuf>,
    /// Where persisted speech is written
    pub pregen_dir: Option<PathBuf>,
}

/// Speech synthesis engine
#[derive(Debug, Default, Deserialize)]
pub struct SpeechFileConfig {
    pub program: Option<String>,
    pub model: Option<PathBuf>,
    /// Percent of normal speaking rate
    pub speed: Option<u8>,
    pub idle_ms: Option<u64>,
    pub first_byte_ms: Option<u64>,
}

/// Inter-process channels
#[derive(Debug, Default, Deserialize)]
pub struct TransportFileConfig {
    pub socket_dir: Option<PathBuf>,
    pub queue_capacity: Option<usize>,
    pub job_capacity: Option<usize>,
}

/// Load the TOML config file from the standard path
///
/// Returns `KeyvoxConfigFile::default()` if the file doesn't exist or can't be parsed.
pub fn load_config_file() -> KeyvoxConfigFile {
    let Some(path) = config_file_path() else {
        return KeyvoxConfigFile::default();
    };

    if !path.exists() {
        return KeyvoxConfigFile::default();
    }

    match load_from(&path) {
        Ok(config) => config,
        Err(e) => {
            tracing::warn!(
                path = %path.display(),
                error = %e,
                "failed to load config file, using defaults"
            );
            KeyvoxConfigFile::default()
        }
    }
}

/// Load an explicitly named config file
///
/// # Errors
///
/// Returns error if the file cannot be read or parsed
pub fn load_from(path: &Path) -> Result<KeyvoxConfigFile> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| Error::Config(format!("cannot read {}: {e}", path.display())))?;
    let config = toml::from_str(&content)?;
    tracing::info!(path = %path.display(), "loaded config file");
    Ok(config)
}

/// Return the config file path: `~/.config/keyvox/config.toml`
pub fn config_file_path() -> Option<PathBuf> {
    directories::BaseDirs::new().map(|d| d.config_dir().join("keyvox").join("config.toml"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_file_parses() {
        let file: KeyvoxConfigFile = toml::from_str(
            r#"
            [keypad]
            hold_threshold_ms = 600
            layout = "phone"

            [cache]
            max_bytes = 1048576
            "#,
        )
        .unwrap();

        assert_eq!(file.keypad.hold_threshold_ms, Some(600));
        assert_eq!(file.keypad.layout, Some(Layout::Phone));
        assert_eq!(file.cache.max_bytes, Some(1_048_576));
        assert!(file.speech.model.is_none());
    }

    #[test]
    fn test_unknown_section_rejected() {
        let parsed = toml::from_str::<KeyvoxConfigFile>("[radio]\nport = 1");
        assert!(parsed.is_err());
    }

    #[test]
    fn test_load_from_reports_parse_errors() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[keypad\nbroken").unwrap();
        assert!(matches!(load_from(&path), Err(Error::Toml(_))));
    }
}

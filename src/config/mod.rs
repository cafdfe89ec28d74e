//! Configuration for both processes
//!
//! Precedence: defaults, then the TOML file, then `KEYVOX_*` environment
//! variables, then command-line flags (applied by the binary).

pub mod file;

use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::keypad::{DebounceSettings, Layout};
use crate::speech::IdleTimeout;
use crate::{Error, Result};

/// Runtime configuration
#[derive(Debug, Clone, Default)]
pub struct Config {
    pub keypad: KeypadConfig,
    pub timeouts: Timeouts,
    pub cache: CacheConfig,
    pub audio: AudioConfig,
    pub speech: SpeechConfig,
    pub transport: TransportConfig,
}

/// Keypad polling and debounce
#[derive(Debug, Clone)]
pub struct KeypadConfig {
    /// Time a key must stay down to count as held
    pub hold_threshold: Duration,

    /// Interval between keypad reads on the application side
    pub poll_interval: Duration,

    /// Silent polls that count as a release for sources without key-up
    pub release_polls: u32,

    /// Double-key window; `None` uses the layout's own default
    pub debounce_window: Option<Duration>,

    pub layout: Layout,

    /// evdev device path; `None` searches `/dev/input/by-id`
    pub device: Option<PathBuf>,

    /// Beep on key events from the poller
    pub key_beep: bool,
}

impl Default for KeypadConfig {
    fn default() -> Self {
        Self {
            hold_threshold: Duration::from_millis(500),
            poll_interval: Duration::from_millis(50),
            release_polls: 6,
            debounce_window: None,
            layout: Layout::Calculator,
            device: None,
            key_beep: true,
        }
    }
}

/// Response and liveness timeouts
#[derive(Debug, Clone)]
pub struct Timeouts {
    pub keypad: Duration,
    pub audio: Duration,
    pub config: Duration,
    /// Router progress older than this counts as stalled
    pub liveness: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            keypad: Duration::from_secs(5),
            audio: Duration::from_secs(30),
            config: Duration::from_secs(5),
            liveness: Duration::from_secs(3),
        }
    }
}

/// Phrase cache location and ceiling
#[derive(Debug, Clone)]
pub struct CacheConfig {
    pub dir: PathBuf,
    pub max_bytes: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            dir: directories::BaseDirs::new().map_or_else(
                || PathBuf::from(".cache/keyvox/phrases"),
                |d| d.cache_dir().join("keyvox").join("phrases"),
            ),
            max_bytes: 64 * 1024 * 1024,
        }
    }
}

/// Audio output
#[derive(Debug, Clone)]
pub struct AudioConfig {
    /// Output device name (substring match); `None` uses the default device
    pub device: Option<String>,
    pub volume: u8,
    pub chunk: Duration,
    pub beep_dir: Option<PathBuf>,
    pub pregen_dir: PathBuf,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            device: None,
            volume: 100,
            chunk: Duration::from_millis(50),
            beep_dir: None,
            pregen_dir: directories::BaseDirs::new().map_or_else(
                || PathBuf::from(".local/share/keyvox/pregen"),
                |d| d.data_dir().join("keyvox").join("pregen"),
            ),
        }
    }
}

/// Speech engine
#[derive(Debug, Clone)]
pub struct SpeechConfig {
    pub program: String,
    /// Voice model; speech is unavailable without one
    pub model: Option<PathBuf>,
    /// Percent of normal speaking rate
    pub speed: u8,
    pub idle: Duration,
    pub first_byte: Duration,
}

impl Default for SpeechConfig {
    fn default() -> Self {
        Self {
            program: "piper".to_string(),
            model: None,
            speed: 100,
            idle: Duration::from_millis(50),
            first_byte: Duration::from_secs(5),
        }
    }
}

/// Inter-process channels
#[derive(Debug, Clone)]
pub struct TransportConfig {
    pub socket_dir: PathBuf,
    /// Capacity of each application-side response queue
    pub queue_capacity: usize,
    /// Capacity of each hardware-side job queue
    pub job_capacity: usize,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            socket_dir: directories::BaseDirs::new()
                .and_then(|d| d.runtime_dir().map(|r| r.join("keyvox")))
                .unwrap_or_else(|| std::env::temp_dir().join("keyvox")),
            queue_capacity: 16,
            job_capacity: 32,
        }
    }
}

fn ms(value: u64) -> Duration {
    Duration::from_millis(value)
}

impl Config {
    /// Load configuration (env > toml > default)
    ///
    /// With `path`, that file must exist and parse; without it the standard
    /// location is used when present.
    ///
    /// # Errors
    ///
    /// Returns error if an explicit file is unusable or the result is invalid
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let fc = match path {
            Some(path) => file::load_from(path)?,
            None => file::load_config_file(),
        };

        let mut config = Self::default();
        config.apply_file(fc);
        config.apply_env(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    /// Overlay values from the TOML file
    pub fn apply_file(&mut self, fc: file::KeyvoxConfigFile) {
        let k = fc.keypad;
        if let Some(v) = k.hold_threshold_ms {
            self.keypad.hold_threshold = ms(v);
        }
        if let Some(v) = k.poll_interval_ms {
            self.keypad.poll_interval = ms(v);
        }
        if let Some(v) = k.release_polls {
            self.keypad.release_polls = v;
        }
        if let Some(v) = k.debounce_window_ms {
            self.keypad.debounce_window = Some(ms(v));
        }
        if let Some(v) = k.layout {
            self.keypad.layout = v;
        }
        if k.device.is_some() {
            self.keypad.device = k.device;
        }
        if let Some(v) = k.key_beep {
            self.keypad.key_beep = v;
        }

        let t = fc.timeouts;
        if let Some(v) = t.keypad_ms {
            self.timeouts.keypad = ms(v);
        }
        if let Some(v) = t.audio_ms {
            self.timeouts.audio = ms(v);
        }
        if let Some(v) = t.config_ms {
            self.timeouts.config = ms(v);
        }
        if let Some(v) = t.liveness_ms {
            self.timeouts.liveness = ms(v);
        }

        if let Some(v) = fc.cache.dir {
            self.cache.dir = v;
        }
        if let Some(v) = fc.cache.max_bytes {
            self.cache.max_bytes = v;
        }

        let a = fc.audio;
        if a.device.is_some() {
            self.audio.device = a.device;
        }
        if let Some(v) = a.volume {
            self.audio.volume = v;
        }
        if let Some(v) = a.chunk_ms {
            self.audio.chunk = ms(v);
        }
        if a.beep_dir.is_some() {
            self.audio.beep_dir = a.beep_dir;
        }
        if let Some(v) = a.pregen_dir {
            self.audio.pregen_dir = v;
        }

        let s = fc.speech;
        if let Some(v) = s.program {
            self.speech.program = v;
        }
        if s.model.is_some() {
            self.speech.model = s.model;
        }
        if let Some(v) = s.speed {
            self.speech.speed = v;
        }
        if let Some(v) = s.idle_ms {
            self.speech.idle = ms(v);
        }
        if let Some(v) = s.first_byte_ms {
            self.speech.first_byte = ms(v);
        }

        let tr = fc.transport;
        if let Some(v) = tr.socket_dir {
            self.transport.socket_dir = v;
        }
        if let Some(v) = tr.queue_capacity {
            self.transport.queue_capacity = v;
        }
        if let Some(v) = tr.job_capacity {
            self.transport.job_capacity = v;
        }
    }

    /// Overlay `KEYVOX_*` environment variables read through `lookup`
    ///
    /// Unparseable numeric values are logged and ignored.
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        fn parsed<T: std::str::FromStr>(name: &str, value: Option<String>) -> Option<T> {
            let value = value?;
            match value.parse() {
                Ok(v) => Some(v),
                Err(_) => {
                    tracing::warn!(name, value, "ignoring unparseable environment variable");
                    None
                }
            }
        }

        if let Some(v) = lookup("KEYVOX_SOCKET_DIR") {
            self.transport.socket_dir = PathBuf::from(v);
        }
        if let Some(v) = lookup("KEYVOX_CACHE_DIR") {
            self.cache.dir = PathBuf::from(v);
        }
        if let Some(v) = parsed("KEYVOX_CACHE_MAX_BYTES", lookup("KEYVOX_CACHE_MAX_BYTES")) {
            self.cache.max_bytes = v;
        }
        if let Some(v) = lookup("KEYVOX_SPEECH_PROGRAM") {
            self.speech.program = v;
        }
        if let Some(v) = lookup("KEYVOX_SPEECH_MODEL") {
            self.speech.model = Some(PathBuf::from(v));
        }
        if let Some(v) = lookup("KEYVOX_AUDIO_DEVICE") {
            self.audio.device = Some(v);
        }
        if let Some(v) = parsed("KEYVOX_VOLUME", lookup("KEYVOX_VOLUME")) {
            self.audio.volume = v;
        }
        if let Some(v) = lookup("KEYVOX_KEYPAD_DEVICE") {
            self.keypad.device = Some(PathBuf::from(v));
        }
        if let Some(v) = parsed("KEYVOX_LAYOUT", lookup("KEYVOX_LAYOUT")) {
            self.keypad.layout = v;
        }
    }

    /// Reject values that would break timing or bounds
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] naming the first bad value
    pub fn validate(&self) -> Result<()> {
        let zero_durations = [
            ("keypad.hold_threshold_ms", self.keypad.hold_threshold),
            ("keypad.poll_interval_ms", self.keypad.poll_interval),
            ("timeouts.keypad_ms", self.timeouts.keypad),
            ("timeouts.audio_ms", self.timeouts.audio),
            ("timeouts.config_ms", self.timeouts.config),
            ("timeouts.liveness_ms", self.timeouts.liveness),
            ("audio.chunk_ms", self.audio.chunk),
            ("speech.idle_ms", self.speech.idle),
            ("speech.first_byte_ms", self.speech.first_byte),
        ];
        if let Some((name, _)) = zero_durations.iter().find(|(_, d)| d.is_zero()) {
            return Err(Error::Config(format!("{name} must be greater than zero")));
        }

        if self.keypad.release_polls == 0 {
            return Err(Error::Config("keypad.release_polls must be greater than zero".into()));
        }
        if self.transport.queue_capacity == 0 || self.transport.job_capacity == 0 {
            return Err(Error::Config("queue capacities must be greater than zero".into()));
        }
        if self.cache.max_bytes == 0 {
            return Err(Error::Config("cache.max_bytes must be greater than zero".into()));
        }
        if self.audio.volume > 100 {
            return Err(Error::Config(format!(
                "audio.volume {} exceeds 100",
                self.audio.volume
            )));
        }
        if self.speech.speed == 0 {
            return Err(Error::Config("speech.speed must be greater than zero".into()));
        }
        Ok(())
    }

    /// State machine tuning for the configured keypad
    #[must_use]
    pub const fn debounce_settings(&self) -> DebounceSettings {
        DebounceSettings {
            layout: self.keypad.layout,
            hold_threshold: self.keypad.hold_threshold,
            release_polls: self.keypad.release_polls,
            debounce_window: self.keypad.debounce_window,
            source_reports_release: true,
        }
    }

    /// End-of-utterance policy for the speech engine
    #[must_use]
    pub const fn utterance_boundary(&self) -> IdleTimeout {
        IdleTimeout {
            first_byte: self.speech.first_byte,
            idle: self.speech.idle,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = Config::default();
        config.validate().unwrap();
        assert_eq!(config.keypad.hold_threshold, Duration::from_millis(500));
        assert_eq!(config.timeouts.audio, Duration::from_secs(30));
        assert_eq!(config.transport.queue_capacity, 16);
        assert_eq!(config.cache.max_bytes, 64 * 1024 * 1024);
    }

    #[test]
    fn test_file_overlays_defaults() {
        let fc: file::KeyvoxConfigFile = toml::from_str(
            r#"
            [keypad]
            poll_interval_ms = 20
            debounce_window_ms = 40

            [speech]
            model = "/opt/voices/en.onnx"
            speed = 150
            "#,
        )
        .unwrap();

        let mut config = Config::default();
        config.apply_file(fc);

        assert_eq!(config.keypad.poll_interval, Duration::from_millis(20));
        assert_eq!(
            config.keypad.debounce_window,
            Some(Duration::from_millis(40))
        );
        assert_eq!(config.keypad.hold_threshold, Duration::from_millis(500));
        assert_eq!(
            config.speech.model,
            Some(PathBuf::from("/opt/voices/en.onnx"))
        );
        assert_eq!(config.speech.speed, 150);
    }

    #[test]
    fn test_env_overrides_file() {
        let env: HashMap<&str, &str> = HashMap::from([
            ("KEYVOX_SOCKET_DIR", "/run/keyvox"),
            ("KEYVOX_LAYOUT", "phone"),
            ("KEYVOX_VOLUME", "loud"),
        ]);

        let mut config = Config::default();
        config.apply_env(|k| env.get(k).map(ToString::to_string));

        assert_eq!(config.transport.socket_dir, PathBuf::from("/run/keyvox"));
        assert_eq!(config.keypad.layout, Layout::Phone);
        assert_eq!(config.audio.volume, 100);
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut config = Config::default();
        config.keypad.poll_interval = Duration::ZERO;
        assert!(matches!(config.validate(), Err(Error::Config(_))));

        let mut config = Config::default();
        config.audio.volume = 120;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.transport.queue_capacity = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_explicit_missing_file_is_an_error() {
        let path = Path::new("/nonexistent/keyvox.toml");
        assert!(Config::load(Some(path)).is_err());
    }
}

//! Typed request and response payloads
//!
//! Payload content never influences routing; these helpers only give the
//! receiving side a typed view of what a packet of a given kind carries.

use std::path::PathBuf;

use super::{PacketKind, ProtocolError};
use crate::keypad::Layout;

/// Keypad symbol sent when no key is down
pub const NO_KEY: u8 = b'-';

/// Config subcommand of the hardware-ready handshake
pub const READY: u8 = b'R';

/// Short confirmation tones
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BeepKind {
    /// A key was pressed
    Keypress,
    /// A key crossed the hold threshold
    Hold,
    /// Something went wrong
    Error,
}

impl BeepKind {
    /// Wire letter
    #[must_use]
    pub const fn code(self) -> u8 {
        match self {
            Self::Keypress => b'k',
            Self::Hold => b'h',
            Self::Error => b'e',
        }
    }

    /// Decode a wire letter; unknown letters mean a keypress beep
    #[must_use]
    pub const fn from_code(code: u8) -> Self {
        match code {
            b'h' => Self::Hold,
            b'e' => Self::Error,
            _ => Self::Keypress,
        }
    }

    /// File stem used for pre-rendered beep assets
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Keypress => "keypress",
            Self::Hold => "hold",
            Self::Error => "error",
        }
    }
}

impl std::str::FromStr for BeepKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "keypress" | "k" => Ok(Self::Keypress),
            "hold" | "h" => Ok(Self::Hold),
            "error" | "e" => Ok(Self::Error),
            other => Err(format!("unknown beep kind: {other}")),
        }
    }
}

/// Request carried by an `Audio` packet
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AudioRequest {
    /// `'d'`: synthesise and speak
    Speak(String),
    /// `'p'`: play a pre-rendered WAV file
    PlayFile(PathBuf),
    /// `'s'`: synthesise into a file without playing
    Persist(String),
    /// `'i'`: silence current playback and drop queued jobs
    Interrupt,
    /// `'b'`: play a beep ahead of everything else
    Beep(BeepKind),
}

impl AudioRequest {
    /// Longest text argument that fits in one packet
    pub const MAX_TEXT: usize = super::MAX_PAYLOAD - 2;

    /// Decode an audio payload
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::Malformed`] for an empty payload, an unknown
    /// subcommand, a missing argument or non-UTF-8 text
    pub fn parse(payload: &[u8]) -> Result<Self, ProtocolError> {
        let (&sub, rest) = payload
            .split_first()
            .ok_or_else(|| ProtocolError::malformed(PacketKind::Audio, "empty payload"))?;

        match sub {
            b'i' => Ok(Self::Interrupt),
            b'b' => Ok(Self::Beep(BeepKind::from_code(
                rest.first().copied().unwrap_or(b'k'),
            ))),
            b'd' => argument(rest).map(Self::Speak),
            b's' => argument(rest).map(Self::Persist),
            b'p' => argument(rest).map(|path| Self::PlayFile(PathBuf::from(path))),
            other => Err(ProtocolError::malformed(
                PacketKind::Audio,
                format!("unknown subcommand {:?}", char::from(other)),
            )),
        }
    }

    /// Encode as `subcommand + argument + NUL`
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::Oversized`] if the argument does not fit
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        let (sub, arg): (u8, Option<&[u8]>) = match self {
            Self::Speak(text) => (b'd', Some(text.as_bytes())),
            Self::Persist(text) => (b's', Some(text.as_bytes())),
            Self::PlayFile(path) => (b'p', Some(path.as_os_str().as_encoded_bytes())),
            Self::Interrupt => (b'i', None),
            Self::Beep(kind) => return Ok(vec![b'b', kind.code()]),
        };

        let mut out = vec![sub];
        if let Some(arg) = arg {
            if arg.len() > Self::MAX_TEXT {
                return Err(ProtocolError::Oversized {
                    len: arg.len() + 2,
                    tag: 0,
                });
            }
            out.extend_from_slice(arg);
            out.push(0);
        }
        Ok(out)
    }
}

/// Text argument up to the first NUL
fn argument(rest: &[u8]) -> Result<String, ProtocolError> {
    let end = rest.iter().position(|&b| b == 0).unwrap_or(rest.len());
    let text = std::str::from_utf8(&rest[..end])
        .map_err(|e| ProtocolError::malformed(PacketKind::Audio, e.to_string()))?;

    if text.trim().is_empty() {
        return Err(ProtocolError::malformed(PacketKind::Audio, "missing argument"));
    }
    Ok(text.to_string())
}

/// Request carried by a `Keypad` packet
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeypadRequest {
    /// `'r'`: report the current key state
    Read,
}

impl KeypadRequest {
    /// Decode a keypad payload
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::Malformed`] for anything but `'r'`
    pub fn parse(payload: &[u8]) -> Result<Self, ProtocolError> {
        match payload.first() {
            Some(b'r') => Ok(Self::Read),
            other => Err(ProtocolError::malformed(
                PacketKind::Keypad,
                format!("unknown subcommand {other:?}"),
            )),
        }
    }

    /// Wire payload
    #[must_use]
    pub fn encode(self) -> Vec<u8> {
        match self {
            Self::Read => vec![b'r'],
        }
    }
}

/// Keypad response: the semantic key and whether it is a hold event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeyReport {
    /// Key symbol, or `None` when no key is down
    pub symbol: Option<char>,
    /// Set on the single hold event of a long press
    pub is_hold: bool,
}

impl KeyReport {
    /// The "no key" report
    pub const NONE: Self = Self {
        symbol: None,
        is_hold: false,
    };

    /// Wire payload: `[symbol or '-', hold flag]`
    #[must_use]
    pub fn encode(self) -> Vec<u8> {
        let symbol = self
            .symbol
            .and_then(|c| u8::try_from(c).ok())
            .unwrap_or(NO_KEY);
        vec![symbol, u8::from(self.is_hold)]
    }

    /// Decode a keypad response
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::Malformed`] for an empty payload
    pub fn parse(payload: &[u8]) -> Result<Self, ProtocolError> {
        let &symbol = payload
            .first()
            .ok_or_else(|| ProtocolError::malformed(PacketKind::Keypad, "empty response"))?;

        Ok(Self {
            symbol: (symbol != NO_KEY).then_some(char::from(symbol)),
            is_hold: payload.get(1).is_some_and(|&b| b != 0),
        })
    }
}

/// Runtime setting carried by a `Config` packet
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigCommand {
    /// `0x01`: switch keypad layout
    SetLayout(Layout),
    /// `0x02`: output volume in percent
    SetVolume(u8),
    /// `0x03`: speech speed in percent of normal
    SetSpeechSpeed(u8),
}

impl ConfigCommand {
    /// Decode a config payload
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::Malformed`] for a short payload, unknown
    /// subcommand or out-of-range value
    pub fn parse(payload: &[u8]) -> Result<Self, ProtocolError> {
        let &[sub, value, ..] = payload else {
            return Err(ProtocolError::malformed(
                PacketKind::Config,
                "expected [subcommand, value]",
            ));
        };

        match sub {
            0x01 => Layout::from_code(value)
                .map(Self::SetLayout)
                .ok_or_else(|| {
                    ProtocolError::malformed(PacketKind::Config, format!("unknown layout {value}"))
                }),
            0x02 if value <= 100 => Ok(Self::SetVolume(value)),
            0x03 if value > 0 => Ok(Self::SetSpeechSpeed(value)),
            _ => Err(ProtocolError::malformed(
                PacketKind::Config,
                format!("bad command {sub:#04x} value {value}"),
            )),
        }
    }

    /// Wire payload
    #[must_use]
    pub const fn encode(self) -> [u8; 2] {
        match self {
            Self::SetLayout(layout) => [0x01, layout.code()],
            Self::SetVolume(value) => [0x02, value],
            Self::SetSpeechSpeed(value) => [0x03, value],
        }
    }
}

/// Status code carried by audio and config responses
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    /// Completed normally
    Ok,
    /// Interrupted, cancelled or evicted before completion
    Interrupted,
    /// Failed (engine error, missing device, bad request)
    Failed,
}

impl Status {
    /// Wire value
    #[must_use]
    pub const fn code(self) -> i32 {
        match self {
            Self::Ok => 0,
            Self::Interrupted => 1,
            Self::Failed => -1,
        }
    }

    /// Four-byte little-endian payload
    #[must_use]
    pub const fn encode(self) -> [u8; 4] {
        self.code().to_le_bytes()
    }

    /// Decode a status payload; unknown values count as failure
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::Malformed`] when fewer than four bytes arrive
    pub fn parse(payload: &[u8]) -> Result<Self, ProtocolError> {
        let bytes: [u8; 4] = payload
            .get(..4)
            .and_then(|b| b.try_into().ok())
            .ok_or_else(|| ProtocolError::malformed(PacketKind::Audio, "short status"))?;

        Ok(match i32::from_le_bytes(bytes) {
            0 => Self::Ok,
            1 => Self::Interrupted,
            _ => Self::Failed,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_audio_request_parse() {
        assert_eq!(
            AudioRequest::parse(b"dfourteen point two\0").unwrap(),
            AudioRequest::Speak("fourteen point two".into())
        );
        assert_eq!(
            AudioRequest::parse(b"p/opt/audio/ready").unwrap(),
            AudioRequest::PlayFile(PathBuf::from("/opt/audio/ready"))
        );
        assert_eq!(AudioRequest::parse(b"i").unwrap(), AudioRequest::Interrupt);
        assert_eq!(
            AudioRequest::parse(b"bh").unwrap(),
            AudioRequest::Beep(BeepKind::Hold)
        );
        assert_eq!(
            AudioRequest::parse(b"bz").unwrap(),
            AudioRequest::Beep(BeepKind::Keypress)
        );
    }

    #[test]
    fn test_audio_request_rejects_garbage() {
        assert!(AudioRequest::parse(b"").is_err());
        assert!(AudioRequest::parse(b"x").is_err());
        assert!(AudioRequest::parse(b"d\0").is_err());
        assert!(AudioRequest::parse(b"d\xff\xfe").is_err());
    }

    #[test]
    fn test_audio_request_encode_appends_nul() {
        let bytes = AudioRequest::Speak("two".into()).encode().unwrap();
        assert_eq!(bytes, b"dtwo\0");
        assert_eq!(
            AudioRequest::parse(&bytes).unwrap(),
            AudioRequest::Speak("two".into())
        );
    }

    #[test]
    fn test_audio_request_text_limit() {
        let text = "a".repeat(AudioRequest::MAX_TEXT);
        assert_eq!(
            AudioRequest::Speak(text.clone()).encode().unwrap().len(),
            super::super::MAX_PAYLOAD
        );
        let too_long = format!("{text}a");
        assert!(AudioRequest::Speak(too_long).encode().is_err());
    }

    #[test]
    fn test_key_report_wire_format() {
        let held = KeyReport {
            symbol: Some('5'),
            is_hold: true,
        };
        assert_eq!(held.encode(), vec![b'5', 1]);
        assert_eq!(KeyReport::parse(&held.encode()).unwrap(), held);
        assert_eq!(KeyReport::NONE.encode(), vec![b'-', 0]);
        assert_eq!(KeyReport::parse(b"-").unwrap(), KeyReport::NONE);
    }

    #[test]
    fn test_config_command_parse() {
        assert_eq!(
            ConfigCommand::parse(&[0x01, 1]).unwrap(),
            ConfigCommand::SetLayout(Layout::Phone)
        );
        assert_eq!(
            ConfigCommand::parse(&[0x02, 80]).unwrap(),
            ConfigCommand::SetVolume(80)
        );
        assert!(ConfigCommand::parse(&[0x02, 101]).is_err());
        assert!(ConfigCommand::parse(&[0x03, 0]).is_err());
        assert!(ConfigCommand::parse(&[0x01]).is_err());
        assert!(ConfigCommand::parse(&[0x09, 1]).is_err());
    }

    #[test]
    fn test_status_codes() {
        assert_eq!(Status::parse(&Status::Ok.encode()).unwrap(), Status::Ok);
        assert_eq!(
            Status::parse(&1i32.to_le_bytes()).unwrap(),
            Status::Interrupted
        );
        assert_eq!(
            Status::parse(&(-7i32).to_le_bytes()).unwrap(),
            Status::Failed
        );
        assert!(Status::parse(&[0, 0]).is_err());
    }
}

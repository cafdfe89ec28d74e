//! Raw key sources
//!
//! The production source reads Linux evdev `input_event` records from the USB
//! keypad. Records are decoded from bytes; the kernel struct layout is
//! `timeval` followed by `type: u16`, `code: u16`, `value: i32`.

use std::fs::File;
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::sync::mpsc::{self, Receiver, SyncSender, TryRecvError, TrySendError};
use std::thread;
use std::time::Instant;

use super::debounce::{KeyAction, RawKeySignal};
use crate::{Error, Result};

/// Directory holding stable names for input devices
const BY_ID_DIR: &str = "/dev/input/by-id";

/// `input_event.type` for key events
const EV_KEY: u16 = 1;

/// Signals held for a poller that has fallen behind; newer ones are dropped
const SIGNAL_BACKLOG: usize = 64;

#[cfg(target_pointer_width = "64")]
const EVENT_SIZE: usize = 24;
#[cfg(not(target_pointer_width = "64"))]
const EVENT_SIZE: usize = 16;

/// Producer of raw key signals
///
/// Implementations must not block: `read_signals` returns whatever arrived
/// since the previous call.
pub trait KeySource: Send {
    /// Append the signals received since the last call
    ///
    /// # Errors
    ///
    /// Returns an error when the device is gone or unreadable
    fn read_signals(&mut self, out: &mut Vec<RawKeySignal>) -> Result<()>;

    /// Whether the source delivers key-up signals
    fn reports_release(&self) -> bool {
        true
    }

    /// Human-readable description for logs
    fn describe(&self) -> String;
}

/// Linux evdev keypad
///
/// A background thread performs the blocking reads and forwards decoded
/// signals over a bounded channel, so polling never blocks and an unpolled
/// keypad holds at most [`SIGNAL_BACKLOG`] signals. The thread ends on the
/// first read error or once the source has been dropped and another event
/// arrives.
pub struct EvdevSource {
    path: PathBuf,
    rx: Receiver<io::Result<RawKeySignal>>,
}

impl EvdevSource {
    /// Open the keypad at `path`, or the first keyboard under
    /// `/dev/input/by-id` when no path is given
    ///
    /// # Errors
    ///
    /// Returns error if no device is found or it cannot be opened
    pub fn open(path: Option<&Path>) -> Result<Self> {
        let path = match path {
            Some(p) => p.to_path_buf(),
            None => find_keypad()?,
        };

        let file = File::open(&path)
            .map_err(|e| Error::Keypad(format!("failed to open {}: {e}", path.display())))?;

        let (tx, rx) = mpsc::sync_channel(SIGNAL_BACKLOG);
        thread::Builder::new()
            .name("keypad-evdev".into())
            .spawn(move || forward_events(file, &tx))?;

        tracing::info!(path = %path.display(), "keypad opened");
        Ok(Self { path, rx })
    }
}

impl KeySource for EvdevSource {
    fn read_signals(&mut self, out: &mut Vec<RawKeySignal>) -> Result<()> {
        loop {
            match self.rx.try_recv() {
                Ok(Ok(signal)) => out.push(signal),
                Ok(Err(e)) => {
                    return Err(Error::Keypad(format!(
                        "read from {} failed: {e}",
                        self.path.display()
                    )));
                }
                Err(TryRecvError::Empty) => return Ok(()),
                Err(TryRecvError::Disconnected) => {
                    return Err(Error::Keypad(format!("{} closed", self.path.display())));
                }
            }
        }
    }

    fn describe(&self) -> String {
        format!("evdev {}", self.path.display())
    }
}

/// First `*-event-kbd` entry under `/dev/input/by-id`
fn find_keypad() -> Result<PathBuf> {
    let mut candidates: Vec<PathBuf> = std::fs::read_dir(BY_ID_DIR)
        .map_err(|e| Error::Keypad(format!("cannot list {BY_ID_DIR}: {e}")))?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|p| {
            p.file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| n.ends_with("-event-kbd"))
        })
        .collect();
    candidates.sort();

    candidates
        .into_iter()
        .next()
        .ok_or_else(|| Error::Keypad(format!("no keyboard device under {BY_ID_DIR}")))
}

/// Decode records from `input` until it fails or the receiver goes away
fn forward_events(mut input: impl Read, tx: &SyncSender<io::Result<RawKeySignal>>) {
    let mut record = [0u8; EVENT_SIZE];
    let mut dropped = 0u64;
    loop {
        let item = match input.read_exact(&mut record) {
            Ok(()) => match decode_event(&record, Instant::now()) {
                Some(signal) => Ok(signal),
                None => continue,
            },
            Err(e) => Err(e),
        };
        let failed = item.is_err();

        match tx.try_send(item) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                dropped += 1;
                if dropped.is_power_of_two() {
                    tracing::debug!(dropped, "keypad not polled, dropping signals");
                }
            }
            Err(TrySendError::Disconnected(_)) => return,
        }
        if failed {
            return;
        }
    }
}

/// Decode one `input_event` record; non-key events yield `None`
fn decode_event(record: &[u8; EVENT_SIZE], at: Instant) -> Option<RawKeySignal> {
    let body = &record[EVENT_SIZE - 8..];
    let kind = u16::from_ne_bytes([body[0], body[1]]);
    let code = u16::from_ne_bytes([body[2], body[3]]);
    let value = i32::from_ne_bytes([body[4], body[5], body[6], body[7]]);

    if kind != EV_KEY {
        return None;
    }

    let action = match value {
        0 => KeyAction::Up,
        1 => KeyAction::Down,
        2 => KeyAction::Repeat,
        _ => return None,
    };
    Some(RawKeySignal::new(code, action, at))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(kind: u16, code: u16, value: i32) -> [u8; EVENT_SIZE] {
        let mut rec = [0u8; EVENT_SIZE];
        let body = EVENT_SIZE - 8;
        rec[body..body + 2].copy_from_slice(&kind.to_ne_bytes());
        rec[body + 2..body + 4].copy_from_slice(&code.to_ne_bytes());
        rec[body + 4..].copy_from_slice(&value.to_ne_bytes());
        rec
    }

    #[test]
    fn test_decode_key_events() {
        let now = Instant::now();
        let down = decode_event(&record(EV_KEY, 76, 1), now).unwrap();
        assert_eq!(down.code, 76);
        assert_eq!(down.action, KeyAction::Down);
        assert_eq!(
            decode_event(&record(EV_KEY, 76, 2), now).unwrap().action,
            KeyAction::Repeat
        );
        assert_eq!(
            decode_event(&record(EV_KEY, 76, 0), now).unwrap().action,
            KeyAction::Up
        );
    }

    #[test]
    fn test_non_key_events_skipped() {
        let now = Instant::now();
        // EV_SYN and EV_MSC
        assert!(decode_event(&record(0, 0, 0), now).is_none());
        assert!(decode_event(&record(4, 4, 458_840), now).is_none());
    }

    #[test]
    fn test_unpolled_backlog_is_bounded() {
        let mut bytes = Vec::new();
        for _ in 0..SIGNAL_BACKLOG * 2 {
            bytes.extend_from_slice(&record(EV_KEY, 79, 1));
            bytes.extend_from_slice(&record(EV_KEY, 79, 0));
        }
        let (tx, rx) = mpsc::sync_channel(SIGNAL_BACKLOG);
        forward_events(io::Cursor::new(bytes), &tx);
        drop(tx);

        let held: Vec<_> = rx.iter().collect();
        assert_eq!(held.len(), SIGNAL_BACKLOG);
        assert!(held.iter().all(std::result::Result::is_ok));
    }

    #[test]
    fn test_open_reads_records_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("events");
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&record(EV_KEY, 79, 1));
        bytes.extend_from_slice(&record(0, 0, 0));
        bytes.extend_from_slice(&record(EV_KEY, 79, 0));
        std::fs::write(&path, bytes).unwrap();

        let mut source = EvdevSource::open(Some(&path)).unwrap();
        let mut signals = Vec::new();
        let deadline = Instant::now() + std::time::Duration::from_secs(2);
        // The file ends after two key events, so the reader reports EOF last
        while signals.len() < 2 && Instant::now() < deadline {
            let _ = source.read_signals(&mut signals);
            std::thread::sleep(std::time::Duration::from_millis(5));
        }
        assert_eq!(signals.len(), 2);
        assert_eq!(signals[0].action, KeyAction::Down);
        assert_eq!(signals[1].action, KeyAction::Up);
    }
}

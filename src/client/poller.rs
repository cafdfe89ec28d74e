//! Background keypad polling for mode logic

use std::sync::Arc;
use std::sync::mpsc::{self, RecvTimeoutError, Sender};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use super::Client;
use crate::Result;
use crate::protocol::{BeepKind, KeyReport};

/// Consecutive hard errors after which polling stops
pub const MAX_CONSECUTIVE_ERRORS: u32 = 3;

/// Polls the keypad on its own thread and hands key events to a callback
pub struct KeypadPoller {
    stop: Option<Sender<()>>,
    thread: Option<JoinHandle<()>>,
}

impl KeypadPoller {
    /// Start polling every `interval`
    ///
    /// With `beep` set, each press (and hold) is acknowledged with the
    /// matching tone before the callback runs. Timeouts are retried; the
    /// poller gives up after [`MAX_CONSECUTIVE_ERRORS`] other failures in a
    /// row, or as soon as the hardware side disconnects.
    ///
    /// # Errors
    ///
    /// Returns error if the thread cannot be spawned
    pub fn start(
        client: Arc<Client>,
        interval: Duration,
        beep: bool,
        mut on_key: impl FnMut(KeyReport) + Send + 'static,
    ) -> Result<Self> {
        let (stop, stopped) = mpsc::channel::<()>();
        let thread = thread::Builder::new()
            .name("keypad-poller".into())
            .spawn(move || {
                let mut errors = 0u32;
                loop {
                    match stopped.recv_timeout(interval) {
                        Err(RecvTimeoutError::Timeout) => {}
                        Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                    }

                    match client.read_keypad() {
                        Ok(report) => {
                            errors = 0;
                            if report.symbol.is_none() {
                                continue;
                            }
                            if beep {
                                let kind = if report.is_hold {
                                    BeepKind::Hold
                                } else {
                                    BeepKind::Keypress
                                };
                                if let Err(e) = client.beep(kind) {
                                    tracing::debug!(error = %e, "key beep failed");
                                }
                            }
                            on_key(report);
                        }
                        Err(e) if e.is_timeout() => {
                            tracing::warn!(error = %e, "keypad poll timed out, retrying");
                        }
                        Err(crate::Error::Closed(reason)) => {
                            tracing::info!(reason, "hardware disconnected, keypad polling stopped");
                            break;
                        }
                        Err(e) => {
                            errors += 1;
                            tracing::error!(error = %e, errors, "keypad poll failed");
                            if errors >= MAX_CONSECUTIVE_ERRORS {
                                tracing::error!("too many keypad errors, polling stopped");
                                break;
                            }
                        }
                    }
                }
            })?;

        Ok(Self {
            stop: Some(stop),
            thread: Some(thread),
        })
    }

    /// Whether the polling thread has exited on its own
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.thread.as_ref().is_none_or(JoinHandle::is_finished)
    }

    /// Stop polling and wait for the thread
    pub fn stop(&mut self) {
        self.stop.take();
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }

    /// Block until polling ends on its own
    pub fn join(mut self) {
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

impl Drop for KeypadPoller {
    fn drop(&mut self) {
        self.stop();
    }
}

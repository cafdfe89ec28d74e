//! Application side: connection to the hardware process
//!
//! [`Client`] is the context mode logic talks to. It exposes the core verbs
//! (keypad read, audio request, interrupt, beep) plus the runtime settings,
//! each as a send/await pair and as a blocking convenience call.

mod poller;
pub mod router;
mod watchdog;

pub use poller::{KeypadPoller, MAX_CONSECUTIVE_ERRORS};
pub use router::{ResponseQueues, Router};
pub use watchdog::{CHECK_INTERVAL, Watchdog, check as watchdog_check};

use std::path::Path;
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use crate::config::{Config, Timeouts};
use crate::keypad::Layout;
use crate::protocol::request::READY;
use crate::protocol::{
    AudioRequest, BeepKind, ConfigCommand, KeyReport, KeypadRequest, Packet, PacketKind,
    ReadEvent, Status,
};
use crate::transport::{self, Channel, ChannelSet};
use crate::{Error, Result};

/// Tag reserved for unsolicited packets such as the ready signal
const UNSOLICITED_TAG: u16 = 0;

/// Read granularity while waiting for the ready signal
const READY_TICK: Duration = Duration::from_millis(100);

/// Connected application-side context
pub struct Client {
    channels: Arc<ChannelSet>,
    router: Arc<Router>,
    watchdog: Mutex<Option<Watchdog>>,
    timeouts: Timeouts,
    next_tag: AtomicU16,
}

impl Client {
    /// Connect to the hardware process at the configured socket directory
    ///
    /// # Errors
    ///
    /// Returns error if the channels cannot be established or the hardware
    /// never signals readiness
    pub fn connect(config: &Config) -> Result<Self> {
        let channels = transport::connect(&config.transport.socket_dir, config.timeouts.config)?;
        Self::from_channels(
            channels,
            config.timeouts.clone(),
            config.transport.queue_capacity,
        )
    }

    /// Build a client over already-connected channels
    ///
    /// Waits for the ready signal, then starts the router and its watchdog.
    ///
    /// # Errors
    ///
    /// Returns error if readiness is not signalled within the config timeout
    /// or the router cannot start
    pub fn from_channels(
        channels: ChannelSet,
        timeouts: Timeouts,
        capacity: usize,
    ) -> Result<Self> {
        wait_ready(&channels, timeouts.config)?;

        let channels = Arc::new(channels);
        let router = Arc::new(Router::start(Arc::clone(&channels), capacity)?);
        let watchdog = Watchdog::start(Arc::clone(&router), CHECK_INTERVAL, timeouts.liveness)?;
        tracing::info!("connected to hardware");

        Ok(Self {
            channels,
            router,
            watchdog: Mutex::new(Some(watchdog)),
            timeouts,
            next_tag: AtomicU16::new(1),
        })
    }

    #[must_use]
    pub fn router(&self) -> &Router {
        &self.router
    }

    /// Whether the hardware side is still connected
    #[must_use]
    pub fn is_connected(&self) -> bool {
        !self.router.is_closed()
    }

    fn next_tag(&self) -> u16 {
        loop {
            let tag = self.next_tag.fetch_add(1, Ordering::Relaxed);
            if tag != UNSOLICITED_TAG {
                return tag;
            }
        }
    }

    fn send(&self, channel: Channel, kind: PacketKind, payload: Vec<u8>) -> Result<u16> {
        let tag = self.next_tag();
        let packet = Packet::new(kind, tag, payload)?;
        self.channels.link(channel).writer().send(&packet)?;
        tracing::debug!(%kind, tag, "request sent");
        Ok(tag)
    }

    /// Ask for the current key state
    ///
    /// # Errors
    ///
    /// Returns error if the request cannot be sent
    pub fn send_keypad_read(&self) -> Result<u16> {
        self.send(
            Channel::Keypad,
            PacketKind::Keypad,
            KeypadRequest::Read.encode(),
        )
    }

    /// Wait for the keypad reply to `tag`
    ///
    /// # Errors
    ///
    /// Returns [`Error::Timeout`] after the keypad timeout
    pub fn await_keypad(&self, tag: u16) -> Result<KeyReport> {
        let packet = self
            .router
            .await_packet(PacketKind::Keypad, Some(tag), self.timeouts.keypad)?;
        Ok(KeyReport::parse(packet.payload())?)
    }

    /// Read the keypad once
    ///
    /// # Errors
    ///
    /// Returns error on send failure or timeout
    pub fn read_keypad(&self) -> Result<KeyReport> {
        let tag = self.send_keypad_read()?;
        self.await_keypad(tag)
    }

    /// Send an audio request without waiting for it to finish
    ///
    /// # Errors
    ///
    /// Returns error if the request does not fit a packet or cannot be sent
    pub fn send_audio(&self, request: &AudioRequest) -> Result<u16> {
        self.send(Channel::Audio, PacketKind::Audio, request.encode()?)
    }

    /// Wait for the status of audio request `tag`
    ///
    /// # Errors
    ///
    /// Returns [`Error::Timeout`] after the audio timeout
    pub fn await_audio(&self, tag: u16) -> Result<Status> {
        self.await_status(PacketKind::Audio, tag, self.timeouts.audio)
    }

    fn await_status(&self, kind: PacketKind, tag: u16, timeout: Duration) -> Result<Status> {
        let packet = self.router.await_packet(kind, Some(tag), timeout)?;
        Ok(Status::parse(packet.payload())?)
    }

    fn audio(&self, request: &AudioRequest) -> Result<Status> {
        let tag = self.send_audio(request)?;
        self.await_audio(tag)
    }

    /// Speak `text`, returning once playback ends
    ///
    /// # Errors
    ///
    /// Returns error on send failure or timeout
    pub fn speak(&self, text: &str) -> Result<Status> {
        self.audio(&AudioRequest::Speak(text.to_string()))
    }

    /// Play a pre-rendered WAV file
    ///
    /// # Errors
    ///
    /// Returns error on send failure or timeout
    pub fn play_file(&self, path: &Path) -> Result<Status> {
        self.audio(&AudioRequest::PlayFile(path.to_path_buf()))
    }

    /// Synthesise `text` into the pre-generated speech directory
    ///
    /// # Errors
    ///
    /// Returns error on send failure or timeout
    pub fn save_speech(&self, text: &str) -> Result<Status> {
        self.audio(&AudioRequest::Persist(text.to_string()))
    }

    /// Silence playback and cancel queued audio
    ///
    /// # Errors
    ///
    /// Returns error on send failure or timeout
    pub fn interrupt(&self) -> Result<Status> {
        self.audio(&AudioRequest::Interrupt)
    }

    /// Play a short tone ahead of queued audio
    ///
    /// # Errors
    ///
    /// Returns error on send failure or timeout
    pub fn beep(&self, kind: BeepKind) -> Result<Status> {
        self.audio(&AudioRequest::Beep(kind))
    }

    fn configure(&self, command: ConfigCommand) -> Result<Status> {
        let payload = command.encode().to_vec();
        let tag = self.send(Channel::Control, PacketKind::Config, payload)?;
        self.await_status(PacketKind::Config, tag, self.timeouts.config)
    }

    /// Switch the keypad layout
    ///
    /// # Errors
    ///
    /// Returns error on send failure or timeout
    pub fn set_layout(&self, layout: Layout) -> Result<Status> {
        self.configure(ConfigCommand::SetLayout(layout))
    }

    /// Set output volume in percent (0-100)
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] above 100, otherwise as for any request
    pub fn set_volume(&self, percent: u8) -> Result<Status> {
        if percent > 100 {
            return Err(Error::Config(format!("volume {percent} exceeds 100")));
        }
        self.configure(ConfigCommand::SetVolume(percent))
    }

    /// Set speech speed in percent of normal
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] for zero, otherwise as for any request
    pub fn set_speech_speed(&self, percent: u8) -> Result<Status> {
        if percent == 0 {
            return Err(Error::Config("speech speed must be greater than zero".into()));
        }
        self.configure(ConfigCommand::SetSpeechSpeed(percent))
    }

    /// Stop the router and close the channels
    pub fn shutdown(&self) {
        if let Some(mut watchdog) = self
            .watchdog
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            watchdog.stop();
        }
        self.router.shutdown();
        self.channels.shutdown();
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Block until the hardware announces readiness on the control channel
fn wait_ready(channels: &ChannelSet, timeout: Duration) -> Result<()> {
    let mut reader = channels.control.reader(Some(READY_TICK))?;
    let deadline = Instant::now() + timeout;

    while Instant::now() < deadline {
        match reader.read_packet() {
            Ok(ReadEvent::Packet(packet))
                if packet.kind() == PacketKind::Config
                    && packet.payload().first() == Some(&READY) =>
            {
                return Ok(());
            }
            Ok(ReadEvent::Packet(packet)) => {
                tracing::warn!(
                    kind = %packet.kind(),
                    tag = packet.tag(),
                    "ignoring packet before ready"
                );
            }
            Ok(ReadEvent::Idle) => {}
            Ok(ReadEvent::Closed) => return Err(Error::Closed("control channel".into())),
            Err(e) if e.is_recoverable() => tracing::warn!(error = %e, "bad packet before ready"),
            Err(e) => return Err(e.into()),
        }
    }
    Err(Error::Timeout("hardware ready signal".into()))
}

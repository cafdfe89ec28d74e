//! Channel set between the two processes
//!
//! Each logical conversation (keypad, audio, control) runs over its own Unix
//! domain socket. A connected socket is split into an inbound half, read by
//! exactly one thread, and an outbound half shared by writers under a lock so
//! packets never interleave.

use std::fmt;
use std::fs;
use std::io;
use std::net::Shutdown;
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use crate::protocol::{Packet, PacketKind, PacketReader, write_packet};
use crate::{Error, Result};

/// Delay between connection attempts while the hardware process starts
const CONNECT_RETRY: Duration = Duration::from_millis(100);

/// Logical conversation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Channel {
    Keypad,
    Audio,
    Control,
}

impl Channel {
    pub const ALL: [Self; 3] = [Self::Keypad, Self::Audio, Self::Control];

    /// Socket file name inside the socket directory
    #[must_use]
    pub const fn socket_name(self) -> &'static str {
        match self {
            Self::Keypad => "keypad.sock",
            Self::Audio => "audio.sock",
            Self::Control => "control.sock",
        }
    }

    /// Packet kind normally carried by this channel
    #[must_use]
    pub const fn kind(self) -> PacketKind {
        match self {
            Self::Keypad => PacketKind::Keypad,
            Self::Audio => PacketKind::Audio,
            Self::Control => PacketKind::Config,
        }
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Keypad => write!(f, "keypad"),
            Self::Audio => write!(f, "audio"),
            Self::Control => write!(f, "control"),
        }
    }
}

/// Outbound half of a channel, shareable between threads
#[derive(Debug, Clone)]
pub struct PacketWriter {
    channel: Channel,
    stream: Arc<Mutex<UnixStream>>,
}

impl PacketWriter {
    /// Send one packet
    ///
    /// # Errors
    ///
    /// Returns [`Error::Closed`] when the peer has gone away, or
    /// [`Error::Transport`] for other write failures
    pub fn send(&self, packet: &Packet) -> Result<()> {
        let mut stream = self.stream.lock().unwrap_or_else(PoisonError::into_inner);
        write_packet(&mut *stream, packet).map_err(|e| match e.kind() {
            io::ErrorKind::BrokenPipe | io::ErrorKind::ConnectionReset => {
                Error::Closed(format!("{} channel", self.channel))
            }
            _ => Error::Transport(format!("{} channel write failed: {e}", self.channel)),
        })?;
        tracing::trace!(
            channel = %self.channel,
            kind = %packet.kind(),
            tag = packet.tag(),
            len = packet.payload().len(),
            "packet sent"
        );
        Ok(())
    }

    #[must_use]
    pub const fn channel(&self) -> Channel {
        self.channel
    }
}

/// One connected channel
#[derive(Debug)]
pub struct Link {
    channel: Channel,
    inbound: UnixStream,
    writer: PacketWriter,
}

impl Link {
    /// Split a connected stream into inbound and outbound halves
    ///
    /// # Errors
    ///
    /// Returns error if the stream cannot be duplicated
    pub fn new(channel: Channel, stream: UnixStream) -> Result<Self> {
        let inbound = stream.try_clone()?;
        Ok(Self {
            channel,
            inbound,
            writer: PacketWriter {
                channel,
                stream: Arc::new(Mutex::new(stream)),
            },
        })
    }

    #[must_use]
    pub const fn channel(&self) -> Channel {
        self.channel
    }

    /// Outbound half
    #[must_use]
    pub fn writer(&self) -> PacketWriter {
        self.writer.clone()
    }

    /// A fresh packet reader over the inbound half
    ///
    /// `tick` bounds each blocking read so a reader loop can do periodic
    /// work (heartbeats, shutdown checks) while the channel is quiet.
    ///
    /// # Errors
    ///
    /// Returns error if the stream cannot be duplicated or configured
    pub fn reader(&self, tick: Option<Duration>) -> Result<PacketReader<UnixStream>> {
        let stream = self.inbound.try_clone()?;
        stream.set_read_timeout(tick)?;
        Ok(PacketReader::new(stream))
    }

    /// Close both directions; blocked readers on either side see end-of-stream
    pub fn shutdown(&self) {
        let _ = self.inbound.shutdown(Shutdown::Both);
    }
}

/// The three channels of one side
#[derive(Debug)]
pub struct ChannelSet {
    pub keypad: Link,
    pub audio: Link,
    pub control: Link,
}

impl ChannelSet {
    /// Link for a channel
    #[must_use]
    pub const fn link(&self, channel: Channel) -> &Link {
        match channel {
            Channel::Keypad => &self.keypad,
            Channel::Audio => &self.audio,
            Channel::Control => &self.control,
        }
    }

    /// Close every channel
    pub fn shutdown(&self) {
        for channel in Channel::ALL {
            self.link(channel).shutdown();
        }
    }

    fn from_streams(mut streams: impl FnMut(Channel) -> Result<UnixStream>) -> Result<Self> {
        Ok(Self {
            keypad: Link::new(Channel::Keypad, streams(Channel::Keypad)?)?,
            audio: Link::new(Channel::Audio, streams(Channel::Audio)?)?,
            control: Link::new(Channel::Control, streams(Channel::Control)?)?,
        })
    }
}

/// Two connected channel sets in one process, for tests and local runs
///
/// # Errors
///
/// Returns error if socket pairs cannot be created
pub fn pair() -> Result<(ChannelSet, ChannelSet)> {
    let mut far = Vec::new();
    let near = ChannelSet::from_streams(|_| {
        let (a, b) = UnixStream::pair()?;
        far.push(b);
        Ok(a)
    })?;
    let mut far = far.into_iter();
    let other = ChannelSet::from_streams(|channel| {
        far.next()
            .ok_or_else(|| Error::Transport(format!("missing {channel} stream")))
    })?;
    Ok((near, other))
}

/// Bound sockets awaiting the application process
pub struct Listener {
    dir: PathBuf,
    listeners: Vec<(Channel, UnixListener)>,
}

impl Listener {
    /// Bind one socket per channel in `dir`, replacing stale socket files
    ///
    /// # Errors
    ///
    /// Returns [`Error::Transport`] if the directory or sockets cannot be set up
    pub fn bind(dir: &Path) -> Result<Self> {
        fs::create_dir_all(dir).map_err(|e| {
            Error::Transport(format!("cannot create socket dir {}: {e}", dir.display()))
        })?;

        let mut listeners = Vec::with_capacity(Channel::ALL.len());
        for channel in Channel::ALL {
            let path = dir.join(channel.socket_name());
            if path.exists() {
                let _ = fs::remove_file(&path);
            }
            let listener = UnixListener::bind(&path).map_err(|e| {
                Error::Transport(format!("cannot bind {}: {e}", path.display()))
            })?;
            listeners.push((channel, listener));
        }

        tracing::info!(dir = %dir.display(), "channels listening");
        Ok(Self {
            dir: dir.to_path_buf(),
            listeners,
        })
    }

    /// Wait for the peer to connect every channel
    ///
    /// # Errors
    ///
    /// Returns [`Error::Transport`] if an accept fails
    pub fn accept(&self) -> Result<ChannelSet> {
        let set = ChannelSet::from_streams(|channel| {
            let listener = self
                .listeners
                .iter()
                .find(|(c, _)| *c == channel)
                .map(|(_, l)| l)
                .ok_or_else(|| Error::Transport(format!("no listener for {channel}")))?;
            let (stream, _) = listener
                .accept()
                .map_err(|e| Error::Transport(format!("{channel} accept failed: {e}")))?;
            tracing::debug!(%channel, "channel accepted");
            Ok(stream)
        })?;
        tracing::info!("all channels connected");
        Ok(set)
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        for channel in Channel::ALL {
            let _ = fs::remove_file(self.dir.join(channel.socket_name()));
        }
    }
}

/// Connect every channel in `dir`, retrying until `timeout`
///
/// # Errors
///
/// Returns [`Error::Transport`] if a channel cannot be connected in time
pub fn connect(dir: &Path, timeout: Duration) -> Result<ChannelSet> {
    let deadline = Instant::now() + timeout;
    ChannelSet::from_streams(|channel| {
        let path = dir.join(channel.socket_name());
        loop {
            match UnixStream::connect(&path) {
                Ok(stream) => {
                    tracing::debug!(%channel, "channel connected");
                    return Ok(stream);
                }
                Err(e) if Instant::now() < deadline => {
                    tracing::trace!(%channel, error = %e, "hardware not ready, retrying");
                    std::thread::sleep(CONNECT_RETRY);
                }
                Err(e) => {
                    return Err(Error::Transport(format!(
                        "cannot connect {}: {e}",
                        path.display()
                    )));
                }
            }
        }
    })
}

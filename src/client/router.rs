//! Application-side router
//!
//! One pump thread per inbound channel reads complete packets and pushes each
//! into the response queue for its kind. Callers block on a queue with a
//! timeout. Pumps read with a short tick so they can report progress even on
//! a quiet channel; a stalled or dead pump is visible through
//! [`Router::stalled_channels`].

use std::os::unix::net::UnixStream;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crate::protocol::{Packet, PacketKind, PacketReader, ReadEvent};
use crate::queue::{BoundedQueue, QueueError};
use crate::transport::{Channel, ChannelSet};
use crate::{Error, Result};

/// Longest a pump blocks in one read before reporting progress
const PUMP_TICK: Duration = Duration::from_millis(250);

/// Longest a direct-mode caller holds a channel in one read
const DIRECT_TICK: Duration = Duration::from_millis(50);

/// Reader a direct-mode caller borrows for one tick at a time
type DirectReader = Mutex<Option<PacketReader<UnixStream>>>;

/// One bounded FIFO per routable packet kind
pub struct ResponseQueues {
    keypad: BoundedQueue<Packet>,
    audio: BoundedQueue<Packet>,
    config: BoundedQueue<Packet>,
}

impl ResponseQueues {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            keypad: BoundedQueue::new("keypad-responses", capacity),
            audio: BoundedQueue::new("audio-responses", capacity),
            config: BoundedQueue::new("config-responses", capacity),
        }
    }

    /// Queue for `kind`; `Serial` has none
    #[must_use]
    pub const fn queue(&self, kind: PacketKind) -> Option<&BoundedQueue<Packet>> {
        match kind {
            PacketKind::Keypad => Some(&self.keypad),
            PacketKind::Audio => Some(&self.audio),
            PacketKind::Config => Some(&self.config),
            PacketKind::Serial => None,
        }
    }

    /// Push a packet onto the queue for its kind
    ///
    /// Never blocks: a full queue drops its oldest entry.
    pub fn route(&self, packet: Packet) {
        let kind = packet.kind();
        match self.queue(kind) {
            Some(queue) => {
                tracing::debug!(%kind, tag = packet.tag(), "routed response");
                queue.push(packet);
            }
            None => {
                tracing::warn!(%kind, tag = packet.tag(), "no queue for packet kind, dropped");
            }
        }
    }

    /// Wake every waiter with a closed result
    pub fn close(&self) {
        self.keypad.close();
        self.audio.close();
        self.config.close();
    }
}

/// Progress marker for one pump
#[derive(Debug)]
struct Heartbeat {
    origin: Instant,
    last_ms: AtomicU64,
}

impl Heartbeat {
    fn new() -> Self {
        Self {
            origin: Instant::now(),
            last_ms: AtomicU64::new(0),
        }
    }

    fn elapsed_ms(&self) -> u64 {
        u64::try_from(self.origin.elapsed().as_millis()).unwrap_or(u64::MAX)
    }

    fn beat(&self) {
        self.last_ms.store(self.elapsed_ms(), Ordering::Release);
    }

    fn age(&self) -> Duration {
        let last = self.last_ms.load(Ordering::Acquire);
        Duration::from_millis(self.elapsed_ms().saturating_sub(last))
    }
}

struct Pump {
    channel: Channel,
    heartbeat: Arc<Heartbeat>,
    thread: JoinHandle<()>,
}

/// Fans inbound packets out into [`ResponseQueues`]
pub struct Router {
    channels: Arc<ChannelSet>,
    queues: Arc<ResponseQueues>,
    pumps: Mutex<Vec<Pump>>,
    stop: Arc<AtomicBool>,
    closed: Arc<AtomicBool>,
    direct: AtomicBool,
    direct_readers: Vec<(Channel, DirectReader)>,
    restarts: AtomicU64,
}

impl Router {
    /// Start one pump per channel
    ///
    /// # Errors
    ///
    /// Returns error if a channel reader or pump thread cannot be created
    pub fn start(channels: Arc<ChannelSet>, capacity: usize) -> Result<Self> {
        let router = Self {
            channels,
            queues: Arc::new(ResponseQueues::new(capacity)),
            pumps: Mutex::new(Vec::with_capacity(Channel::ALL.len())),
            stop: Arc::new(AtomicBool::new(false)),
            closed: Arc::new(AtomicBool::new(false)),
            direct: AtomicBool::new(false),
            direct_readers: Channel::ALL
                .iter()
                .map(|&c| (c, Mutex::new(None)))
                .collect(),
            restarts: AtomicU64::new(0),
        };

        for channel in Channel::ALL {
            let pump = router.spawn_pump(channel)?;
            router.lock_pumps().push(pump);
        }
        Ok(router)
    }

    fn lock_pumps(&self) -> MutexGuard<'_, Vec<Pump>> {
        self.pumps.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn spawn_pump(&self, channel: Channel) -> Result<Pump> {
        let mut reader = self.channels.link(channel).reader(Some(PUMP_TICK))?;
        let heartbeat = Arc::new(Heartbeat::new());
        let queues = Arc::clone(&self.queues);
        let stop = Arc::clone(&self.stop);
        let closed = Arc::clone(&self.closed);
        let beat = Arc::clone(&heartbeat);

        let thread = thread::Builder::new()
            .name(format!("{channel}-pump"))
            .spawn(move || {
                while !stop.load(Ordering::Acquire) {
                    beat.beat();
                    match reader.read_packet() {
                        Ok(ReadEvent::Packet(packet)) => queues.route(packet),
                        Ok(ReadEvent::Idle) => {}
                        Ok(ReadEvent::Closed) => {
                            tracing::info!(%channel, "hardware closed channel");
                            closed.store(true, Ordering::Release);
                            queues.close();
                            break;
                        }
                        Err(e) if e.is_recoverable() => {
                            tracing::warn!(%channel, error = %e, "dropped inbound packet");
                        }
                        Err(e) => {
                            tracing::error!(%channel, error = %e, "channel read failed");
                            closed.store(true, Ordering::Release);
                            queues.close();
                            break;
                        }
                    }
                }
                tracing::debug!(%channel, "pump stopped");
            })?;

        Ok(Pump {
            channel,
            heartbeat,
            thread,
        })
    }

    #[must_use]
    pub fn queues(&self) -> &ResponseQueues {
        &self.queues
    }

    /// Whether the hardware side has gone away
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Whether callers read replies straight from the channels
    #[must_use]
    pub fn is_direct(&self) -> bool {
        self.direct.load(Ordering::Acquire)
    }

    /// Number of pump restarts so far
    #[must_use]
    pub fn restarts(&self) -> u64 {
        self.restarts.load(Ordering::Relaxed)
    }

    /// Channels whose pump has died or not made progress within `max_age`
    ///
    /// Empty once the hardware has closed the connection.
    #[must_use]
    pub fn stalled_channels(&self, max_age: Duration) -> Vec<Channel> {
        if self.is_closed() || self.stop.load(Ordering::Acquire) {
            return Vec::new();
        }
        self.lock_pumps()
            .iter()
            .filter(|p| p.thread.is_finished() || p.heartbeat.age() > max_age)
            .map(|p| p.channel)
            .collect()
    }

    /// Whether every pump has made progress within `max_age`
    #[must_use]
    pub fn is_live(&self, max_age: Duration) -> bool {
        self.stalled_channels(max_age).is_empty()
    }

    /// Replace the pump for `channel`
    ///
    /// Only a pump whose thread has exited can be replaced; a live thread
    /// stuck elsewhere still owns the read side of its channel.
    ///
    /// # Errors
    ///
    /// Returns error if the old pump is still running or a new one cannot
    /// be started
    pub fn restart(&self, channel: Channel) -> Result<()> {
        let mut pumps = self.lock_pumps();
        let Some(index) = pumps.iter().position(|p| p.channel == channel) else {
            return Err(Error::Transport(format!("no pump for {channel}")));
        };
        if !pumps[index].thread.is_finished() {
            return Err(Error::Transport(format!("{channel} pump is stuck")));
        }

        let replacement = self.spawn_pump(channel)?;
        let old = std::mem::replace(&mut pumps[index], replacement);
        drop(pumps);
        let _ = old.thread.join();

        self.restarts.fetch_add(1, Ordering::Relaxed);
        tracing::warn!(%channel, "restarted router pump");
        Ok(())
    }

    /// Switch callers to reading replies themselves
    ///
    /// Pumps that are still healthy stop at their next tick so only one
    /// reader consumes each channel.
    pub fn enter_direct_mode(&self) {
        if !self.direct.swap(true, Ordering::AcqRel) {
            tracing::error!("router unrecoverable, switching to direct replies");
            self.stop.store(true, Ordering::Release);
        }
    }

    /// Wait for the next packet of `kind`, or the one carrying `tag`
    ///
    /// # Errors
    ///
    /// Returns [`Error::Timeout`] when nothing arrives in time and
    /// [`Error::Closed`] once the hardware side is gone
    pub fn await_packet(
        &self,
        kind: PacketKind,
        tag: Option<u16>,
        timeout: Duration,
    ) -> Result<Packet> {
        let Some(queue) = self.queues.queue(kind) else {
            return Err(Error::Transport(format!("{kind} packets are not routed")));
        };

        if self.is_direct() {
            return self.await_direct(kind, tag, timeout);
        }

        let result = match tag {
            Some(tag) => queue.pop_where(timeout, |p| p.tag() == tag),
            None => queue.pop_timeout(timeout),
        };
        result.map_err(|e| match e {
            QueueError::TimedOut => Error::Timeout(describe_wait(kind, tag)),
            QueueError::Closed => Error::Closed(format!("{kind} responses")),
        })
    }

    /// Read the channel directly until the wanted packet shows up
    ///
    /// Packets for other callers are still queued for them. The channel's
    /// reader is held for one read at a time, so callers waiting on the same
    /// channel take turns and callers on other channels never wait.
    fn await_direct(
        &self,
        kind: PacketKind,
        tag: Option<u16>,
        timeout: Duration,
    ) -> Result<Packet> {
        let channel = channel_for(kind);
        let queue = self.queues.queue(kind);
        let deadline = Instant::now() + timeout;

        let matches = |p: &Packet| p.kind() == kind && tag.is_none_or(|t| p.tag() == t);

        let Some((_, slot)) = self.direct_readers.iter().find(|(c, _)| *c == channel) else {
            return Err(Error::Transport(format!("no direct reader for {channel}")));
        };

        loop {
            // Another caller, or a pump that was still draining, may have queued it
            if let Some(queue) = queue
                && let Ok(packet) = queue.pop_where(Duration::ZERO, matches)
            {
                return Ok(packet);
            }
            if Instant::now() >= deadline {
                return Err(Error::Timeout(describe_wait(kind, tag)));
            }

            let event = {
                let mut reader = slot.lock().unwrap_or_else(PoisonError::into_inner);
                if reader.is_none() {
                    *reader = Some(self.channels.link(channel).reader(Some(DIRECT_TICK))?);
                }
                let Some(reader) = reader.as_mut() else {
                    continue;
                };
                reader.read_packet()
            };

            match event {
                Ok(ReadEvent::Packet(packet)) if matches(&packet) => return Ok(packet),
                Ok(ReadEvent::Packet(packet)) => self.queues.route(packet),
                Ok(ReadEvent::Idle) => {}
                Ok(ReadEvent::Closed) => {
                    self.closed.store(true, Ordering::Release);
                    return Err(Error::Closed(format!("{channel} channel")));
                }
                Err(e) if e.is_recoverable() => {
                    tracing::warn!(%channel, error = %e, "dropped inbound packet");
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Stop every pump and wake all waiters
    pub fn shutdown(&self) {
        self.stop.store(true, Ordering::Release);
        self.queues.close();
        let pumps = std::mem::take(&mut *self.lock_pumps());
        for pump in pumps {
            let _ = pump.thread.join();
        }
    }
}

impl Drop for Router {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Channel that carries replies of `kind`
const fn channel_for(kind: PacketKind) -> Channel {
    match kind {
        PacketKind::Keypad => Channel::Keypad,
        PacketKind::Audio => Channel::Audio,
        PacketKind::Config | PacketKind::Serial => Channel::Control,
    }
}

fn describe_wait(kind: PacketKind, tag: Option<u16>) -> String {
    match tag {
        Some(tag) => format!("{kind} response tag {tag}"),
        None => format!("{kind} response"),
    }
}

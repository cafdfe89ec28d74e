//! Packet framing and the incremental packet reader

use std::fmt;
use std::io::{self, Read, Write};

use thiserror::Error;

/// Size of the fixed packet header in bytes
pub const HEADER_LEN: usize = 8;

/// Largest payload a single packet may carry
pub const MAX_PAYLOAD: usize = 256;

/// Read granularity for the underlying byte stream
const READ_CHUNK: usize = 512;

/// Protocol-level failures
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Payload longer than [`MAX_PAYLOAD`]
    #[error("payload of {len} bytes exceeds the {MAX_PAYLOAD}-byte limit (tag {tag})")]
    Oversized { len: usize, tag: u16 },

    /// Header carried a kind value this build does not know
    #[error("unknown packet kind {code} (tag {tag})")]
    UnknownKind { code: u32, tag: u16 },

    /// Payload did not decode into a request of its kind
    #[error("malformed {kind} payload: {reason}")]
    Malformed { kind: PacketKind, reason: String },

    /// Underlying stream failure
    #[error("stream error: {0}")]
    Io(#[from] io::Error),
}

impl ProtocolError {
    /// Whether the stream is still in sync after this error
    ///
    /// Oversized and unknown-kind packets are consumed whole before the error
    /// is reported, so the reader may keep going.
    #[must_use]
    pub const fn is_recoverable(&self) -> bool {
        !matches!(self, Self::Io(_))
    }

    pub(crate) fn malformed(kind: PacketKind, reason: impl Into<String>) -> Self {
        Self::Malformed {
            kind,
            reason: reason.into(),
        }
    }
}

/// Packet kind, the sole routing key
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PacketKind {
    /// Keypad read requests and key reports
    Keypad,
    /// Speech, playback, interrupt and beep requests and their status replies
    Audio,
    /// Reserved for the radio serial bridge; never routed by this core
    Serial,
    /// Ready handshake and runtime settings
    Config,
}

impl PacketKind {
    /// All kinds, in wire-code order
    pub const ALL: [Self; 4] = [Self::Keypad, Self::Audio, Self::Serial, Self::Config];

    /// Wire code for this kind
    #[must_use]
    pub const fn code(self) -> u32 {
        match self {
            Self::Keypad => 0,
            Self::Audio => 1,
            Self::Serial => 2,
            Self::Config => 3,
        }
    }

    /// Decode a wire code
    #[must_use]
    pub const fn from_code(code: u32) -> Option<Self> {
        match code {
            0 => Some(Self::Keypad),
            1 => Some(Self::Audio),
            2 => Some(Self::Serial),
            3 => Some(Self::Config),
            _ => None,
        }
    }
}

impl fmt::Display for PacketKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Keypad => write!(f, "keypad"),
            Self::Audio => write!(f, "audio"),
            Self::Serial => write!(f, "serial"),
            Self::Config => write!(f, "config"),
        }
    }
}

/// A typed, length-prefixed, tagged message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    kind: PacketKind,
    tag: u16,
    payload: Vec<u8>,
}

impl Packet {
    /// Build a packet
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::Oversized`] if the payload exceeds [`MAX_PAYLOAD`]
    pub fn new(
        kind: PacketKind,
        tag: u16,
        payload: impl Into<Vec<u8>>,
    ) -> Result<Self, ProtocolError> {
        let payload = payload.into();
        if payload.len() > MAX_PAYLOAD {
            return Err(ProtocolError::Oversized {
                len: payload.len(),
                tag,
            });
        }
        Ok(Self { kind, tag, payload })
    }

    /// Packet kind
    #[must_use]
    pub const fn kind(&self) -> PacketKind {
        self.kind
    }

    /// Correlation tag chosen by the requester and echoed in the reply
    #[must_use]
    pub const fn tag(&self) -> u16 {
        self.tag
    }

    /// Payload bytes
    #[must_use]
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Encode header and payload into one contiguous buffer
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(HEADER_LEN + self.payload.len());
        out.extend_from_slice(&self.kind.code().to_le_bytes());
        // Bounded by MAX_PAYLOAD in the constructor
        #[allow(clippy::cast_possible_truncation)]
        out.extend_from_slice(&(self.payload.len() as u16).to_le_bytes());
        out.extend_from_slice(&self.tag.to_le_bytes());
        out.extend_from_slice(&self.payload);
        out
    }
}

/// Write a packet as one logical unit
///
/// Header and payload go out in a single `write_all` so that concurrent
/// writers serialised by a lock never interleave partial packets.
///
/// # Errors
///
/// Returns the underlying stream error; a closed peer surfaces as
/// `BrokenPipe`
pub fn write_packet<W: Write>(writer: &mut W, packet: &Packet) -> io::Result<()> {
    writer.write_all(&packet.encode())?;
    writer.flush()
}

/// Outcome of one [`PacketReader::read_packet`] call
#[derive(Debug)]
pub enum ReadEvent {
    /// A complete packet
    Packet(Packet),
    /// The stream's read timeout elapsed before a packet completed
    ///
    /// Any partial bytes stay buffered for the next call.
    Idle,
    /// The peer closed the channel
    Closed,
}

/// Incremental reader that assembles packets from a byte stream
///
/// Partial reads are retried until a header and its payload are complete. A
/// zero-byte read means the peer closed the channel.
pub struct PacketReader<R> {
    inner: R,
    buf: Vec<u8>,
}

impl<R: Read> PacketReader<R> {
    /// Wrap a byte stream
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            buf: Vec::with_capacity(HEADER_LEN + MAX_PAYLOAD),
        }
    }

    /// Read the next complete packet
    ///
    /// # Errors
    ///
    /// Returns a recoverable [`ProtocolError`] for oversized or unknown-kind
    /// packets (already consumed from the stream), or [`ProtocolError::Io`]
    /// when the stream fails
    pub fn read_packet(&mut self) -> Result<ReadEvent, ProtocolError> {
        loop {
            if let Some(packet) = self.take_frame()? {
                return Ok(ReadEvent::Packet(packet));
            }

            let mut chunk = [0u8; READ_CHUNK];
            match self.inner.read(&mut chunk) {
                Ok(0) => {
                    if !self.buf.is_empty() {
                        tracing::debug!(
                            pending = self.buf.len(),
                            "peer closed channel mid-packet"
                        );
                    }
                    return Ok(ReadEvent::Closed);
                }
                Ok(n) => self.buf.extend_from_slice(&chunk[..n]),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e)
                    if matches!(
                        e.kind(),
                        io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut
                    ) =>
                {
                    return Ok(ReadEvent::Idle);
                }
                Err(e) => return Err(ProtocolError::Io(e)),
            }
        }
    }

    /// Split one complete frame off the front of the buffer, if present
    fn take_frame(&mut self) -> Result<Option<Packet>, ProtocolError> {
        if self.buf.len() < HEADER_LEN {
            return Ok(None);
        }

        let code = u32::from_le_bytes([self.buf[0], self.buf[1], self.buf[2], self.buf[3]]);
        let len = usize::from(u16::from_le_bytes([self.buf[4], self.buf[5]]));
        let tag = u16::from_le_bytes([self.buf[6], self.buf[7]]);

        if self.buf.len() < HEADER_LEN + len {
            return Ok(None);
        }

        let payload: Vec<u8> = self
            .buf
            .drain(..HEADER_LEN + len)
            .skip(HEADER_LEN)
            .collect();

        if len > MAX_PAYLOAD {
            return Err(ProtocolError::Oversized { len, tag });
        }

        let kind = PacketKind::from_code(code).ok_or(ProtocolError::UnknownKind { code, tag })?;
        Ok(Some(Packet { kind, tag, payload }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Reader that hands out at most `step` bytes per call
    struct Trickle {
        data: Vec<u8>,
        pos: usize,
        step: usize,
    }

    impl Read for Trickle {
        fn read(&mut self, out: &mut [u8]) -> io::Result<usize> {
            let n = self.step.min(out.len()).min(self.data.len() - self.pos);
            out[..n].copy_from_slice(&self.data[self.pos..self.pos + n]);
            self.pos += n;
            Ok(n)
        }
    }

    #[test]
    fn test_header_layout() {
        let packet = Packet::new(PacketKind::Audio, 0x0102, b"dhi".to_vec()).unwrap();
        let bytes = packet.encode();

        assert_eq!(bytes.len(), HEADER_LEN + 3);
        assert_eq!(&bytes[0..4], &1u32.to_le_bytes());
        assert_eq!(&bytes[4..6], &3u16.to_le_bytes());
        assert_eq!(&bytes[6..8], &[0x02, 0x01]);
        assert_eq!(&bytes[8..], b"dhi");
    }

    #[test]
    fn test_oversized_payload_rejected() {
        let err = Packet::new(PacketKind::Audio, 1, vec![0u8; MAX_PAYLOAD + 1]).unwrap_err();
        assert!(matches!(err, ProtocolError::Oversized { len: 257, tag: 1 }));
        let largest = Packet::new(PacketKind::Audio, 1, vec![0u8; MAX_PAYLOAD]);
        assert!(largest.is_ok());
    }

    #[test]
    fn test_partial_reads_assemble_one_packet() {
        let packet = Packet::new(PacketKind::Keypad, 7, b"r".to_vec()).unwrap();
        let mut reader = PacketReader::new(Trickle {
            data: packet.encode(),
            pos: 0,
            step: 1,
        });

        match reader.read_packet().unwrap() {
            ReadEvent::Packet(p) => assert_eq!(p, packet),
            other => panic!("expected packet, got {other:?}"),
        }
        assert!(matches!(reader.read_packet().unwrap(), ReadEvent::Closed));
    }

    #[test]
    fn test_unknown_kind_is_skipped() {
        let mut data = Vec::new();
        data.extend_from_slice(&9u32.to_le_bytes());
        data.extend_from_slice(&2u16.to_le_bytes());
        data.extend_from_slice(&5u16.to_le_bytes());
        data.extend_from_slice(b"zz");
        let next = Packet::new(PacketKind::Config, 6, vec![b'R']).unwrap();
        data.extend_from_slice(&next.encode());

        let mut reader = PacketReader::new(Trickle {
            data,
            pos: 0,
            step: 64,
        });

        let err = reader.read_packet().unwrap_err();
        assert!(matches!(err, ProtocolError::UnknownKind { code: 9, tag: 5 }));
        assert!(err.is_recoverable());

        match reader.read_packet().unwrap() {
            ReadEvent::Packet(p) => {
                assert_eq!(p.kind(), PacketKind::Config);
                assert_eq!(p.tag(), 6);
            }
            other => panic!("expected packet, got {other:?}"),
        }
    }

    #[test]
    fn test_empty_stream_reports_closed() {
        let mut reader = PacketReader::new(io::empty());
        assert!(matches!(reader.read_packet().unwrap(), ReadEvent::Closed));
    }
}

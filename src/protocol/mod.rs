//! Inter-process packet protocol
//!
//! Every message between the hardware and application processes is a
//! [`Packet`]: an 8-byte little-endian header (`kind: u32`, `length: u16`,
//! `tag: u16`) followed by exactly `length` payload bytes (at most
//! [`MAX_PAYLOAD`]). The kind is the only routing key; payloads are decoded by
//! the typed request helpers in [`request`].

mod packet;
pub mod request;

pub use packet::{
    HEADER_LEN, MAX_PAYLOAD, Packet, PacketKind, PacketReader, ProtocolError, ReadEvent,
    write_packet,
};
pub use request::{AudioRequest, BeepKind, ConfigCommand, KeyReport, KeypadRequest, Status};

//! Keyvox - keypad and spoken-audio controller core
//!
//! Lets an operator run a transceiver from a tactile keypad with spoken
//! feedback instead of a display. Two processes cooperate over three socket
//! channels:
//!
//! ```text
//! ┌──────────────────────────────┐         ┌──────────────────────────────┐
//! │     Application process      │         │       Hardware process       │
//! │                              │ keypad  │                              │
//! │  mode logic ──► Client ──────┼────────►│ readers ──► keypad lane      │
//! │                  │           │ audio   │    │   ──► audio lane        │
//! │  Router pumps ◄──┘     ◄─────┼─────────┤    └─► interrupt / beep      │
//! │  (queue per kind)            │ control │                              │
//! └──────────────────────────────┘         └──────────────────────────────┘
//! ```
//!
//! The hardware side owns the keypad ([`keypad`]), the audio device
//! ([`audio`]), a long-lived synthesis process ([`speech`]) and the phrase
//! cache ([`cache`]). The application side talks to it through
//! [`client::Client`].

pub mod audio;
pub mod cache;
pub mod client;
pub mod config;
pub mod error;
pub mod hardware;
pub mod keypad;
pub mod protocol;
pub mod queue;
pub mod speech;
pub mod transport;

pub use cache::{CacheStats, PhraseCache};
pub use client::{Client, KeypadPoller};
pub use config::Config;
pub use error::{Error, Result};
pub use keypad::{KeyEvent, Layout};
pub use protocol::{AudioRequest, BeepKind, KeyReport, Packet, PacketKind, Status};
pub use queue::BoundedQueue;

//! # mirror-core
//!
//! Shared library for device mirroring containing the wire codecs for the
//! video and control channels, and the pure domain rules that both ends of a
//! mirroring session rely on.
//!
//! This crate has zero dependencies on OS APIs, UI frameworks, or network
//! sockets.
//!
//! # Architecture overview (for beginners)
//!
//! Device mirroring shows the screen of a phone or emulator inside a desktop
//! application and lets the user interact with it.  A small agent runs on the
//! device and talks to the desktop viewer over two byte streams:
//!
//! - the **video channel** carries encoded frames, each preceded by a fixed
//!   40-byte header describing its size, orientation, and timing;
//! - the **control channel** carries input events and settings from the
//!   viewer to the device, and notifications (such as clipboard changes) back.
//!
//! This crate defines:
//!
//! - **`protocol`** – How bytes travel on both channels.  Control messages
//!   are varint-encoded and self-delimiting; video packets use a fixed
//!   little-endian header.
//!
//! - **`domain`** – Pure rules with no I/O: the per-device bit-rate hysteresis
//!   controller, and the geometry that fits video into a resolution cap and
//!   maps viewer coordinates back to device pixels.

pub mod domain;
pub mod protocol;

// Re-export the most-used types at the crate root so callers can write
// `mirror_core::ControlMessage` instead of the full module path.
pub use domain::bitrate::{BitRateManager, BitRateState};
pub use domain::geometry::{Point, Size};
pub use protocol::codec::{decode_control_message, encode_control_message, ProtocolError};
pub use protocol::messages::ControlMessage;
pub use protocol::video::VideoPacketHeader;

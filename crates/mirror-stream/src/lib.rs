//! mirror-stream library entry point.
//!
//! Re-exports all public modules so that integration tests in `tests/`
//! and the binary entry point in `main.rs` share the same module tree.
//!
//! # What does mirror-stream do? (for beginners)
//!
//! A device *agent* captures its screen, encodes it, and streams it to a
//! *viewer*.  The viewer shows the video and sends input back.  Two TCP
//! connections carry one session:
//!
//! 1. The **video channel** (agent → viewer): a codec name, then a stream of
//!    packets, each a fixed 40-byte header plus encoded payload.
//! 2. The **control channel** (both ways): varint-encoded commands from the
//!    viewer (touch, keys, resolution cap, rotation, clipboard) and
//!    notifications from the agent.
//!
//! A `Connection` on the agent side supervises both channels.  If either
//! side fails, the whole session ends; reconnecting means starting a fresh
//! `Connection`, which numbers its frames from 1 again.

/// Application layer: session logic.
pub mod application;

/// Error types shared by every layer.
pub mod error;

/// Infrastructure layer: channels, encoders and storage.
pub mod infrastructure;

pub use application::supervisor::{Connection, ConnectionConfig, ConnectionState};
pub use application::viewer::{ViewerEndpoint, ViewerSession};
pub use error::{EncoderError, StreamError};

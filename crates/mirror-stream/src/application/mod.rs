//! Application layer: the mirroring session, independent of any real codec.
//!
//! # What lives here?
//!
//! - **`video_transport`** – The encoder seam (`VideoEncoder`), the agent's
//!   render/encode/send loop and the viewer's packet reader.
//!
//! - **`control_channel`** – The control-message read loop, concurrent sends
//!   and the observable command history.
//!
//! - **`agent_commands`** – How the agent reacts to each viewer command.
//!
//! - **`supervisor`** – The `Connection` state machine that runs both
//!   channels for one session and tears them down together.
//!
//! - **`viewer`** – The listening side: accepts and classifies the two
//!   channels and exposes a session handle.

pub mod agent_commands;
pub mod control_channel;
pub mod supervisor;
pub mod video_transport;
pub mod viewer;

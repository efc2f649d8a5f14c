//! Infrastructure layer: sockets, codecs and files.
//!
//! # Sub-modules
//!
//! - **`channel`** – `AsyncChannel`, the cancellable byte channel both
//!   session channels are built on.
//!
//! - **`encoder`** – `VideoEncoder` implementations.  Only the synthetic
//!   encoder ships here; real codecs are plugged in by the embedding
//!   application.
//!
//! - **`storage`** – TOML persistence for `mirror.toml` and the learned
//!   per-device bit-rate caps.

pub mod channel;
pub mod encoder;
pub mod storage;

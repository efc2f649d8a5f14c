//! Domain logic for device mirroring.
//!
//! This module contains pure rules with no infrastructure dependencies: no
//! sockets, no clocks, no files.  Everything here can be unit-tested in
//! isolation and shared by the agent and viewer sides alike.

/// Per-device bit-rate hysteresis.
pub mod bitrate;

/// Video-size fitting and view-to-device coordinate mapping.
pub mod geometry;

//! Storage infrastructure: configuration and bit-rate persistence.
//!
//! - **`config`** – Reads and writes `mirror.toml` (agent, viewer and logging
//!   settings) from the platform-appropriate directory, with defaults for a
//!   first run.
//! - **`bit_rates`** – Saves the per-device bit-rate hysteresis state between
//!   runs so a flaky device starts its next session at the learned cap.
//!
//! Both files live in the same directory, resolved by
//! [`config::config_dir`].

pub mod bit_rates;
pub mod config;

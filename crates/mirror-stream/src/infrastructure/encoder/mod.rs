//! Video encoder implementations.
//!
//! Real codecs are external collaborators plugged in through the
//! [`VideoEncoder`](crate::application::video_transport::VideoEncoder) trait.
//! This crate ships only the synthetic encoder used by the demo binary and
//! the tests.

pub mod synthetic;

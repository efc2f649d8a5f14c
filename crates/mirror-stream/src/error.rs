//! Error taxonomy for the mirroring transport.
//!
//! Callers mostly care about one question: did the session end in an orderly
//! way, or is there something to report to the user?  [`StreamError::is_benign`]
//! answers it.  `ChannelClosed` (the peer went away) and `Cancelled` (we shut
//! down) are expected endings; everything else means "lost connection".

use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use mirror_core::ProtocolError;
use thiserror::Error;

/// Errors raised by an encoder implementation.
#[derive(Debug, Error)]
pub enum EncoderError {
    /// The encoder could not be set up for the requested size or bit rate.
    #[error("encoder configuration rejected: {0}")]
    Configure(String),
    /// Encoding a frame failed.
    #[error("encoding failed: {0}")]
    Encode(String),
}

/// Errors that can end a channel operation or a whole connection.
#[derive(Debug, Error)]
pub enum StreamError {
    /// The two channels were not established within the handshake timeout.
    #[error("handshake did not complete within {0:?}")]
    HandshakeTimeout(Duration),

    /// The peer sent something other than the expected handshake bytes, or
    /// went away during the handshake.
    #[error("handshake failed: {0}")]
    Handshake(String),

    /// The TCP connection could not be opened.
    #[error("failed to connect to {addr}: {source}")]
    ConnectFailed {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    /// The peer closed the channel.
    #[error("channel closed by peer")]
    ChannelClosed,

    /// An I/O error other than the peer going away.
    #[error("I/O error: {0}")]
    Io(#[source] io::Error),

    /// Bytes on a channel could not be decoded.
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// The channel was closed locally while the operation was pending.
    #[error("operation cancelled")]
    Cancelled,

    /// The video encoder failed.
    #[error("encoder failure: {0}")]
    Encoder(#[from] EncoderError),
}

impl StreamError {
    /// Returns `true` for orderly endings that are not reported as failures.
    pub fn is_benign(&self) -> bool {
        matches!(self, StreamError::ChannelClosed | StreamError::Cancelled)
    }
}

impl From<io::Error> for StreamError {
    /// Folds the error kinds that mean "the peer is gone" into
    /// [`StreamError::ChannelClosed`].
    fn from(e: io::Error) -> Self {
        match e.kind() {
            io::ErrorKind::UnexpectedEof
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::NotConnected => StreamError::ChannelClosed,
            _ => StreamError::Io(e),
        }
    }
}

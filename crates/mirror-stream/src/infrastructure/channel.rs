//! Cancellable byte channel over a reliable stream.
//!
//! An [`AsyncChannel`] wraps one bidirectional byte stream (a `TcpStream` in
//! production, an in-memory duplex pipe in tests) and adds two guarantees the
//! raw stream lacks:
//!
//! - **Every pending call can be interrupted.**  Each channel owns a child of
//!   its connection's [`CancellationToken`].  Closing the channel, or
//!   cancelling the connection scope, makes every in-flight `read` or `write`
//!   return [`StreamError::Cancelled`] right away instead of waiting for the
//!   peer.
//! - **Writes never interleave.**  The write half sits behind one async
//!   mutex, so a [`write_fully`](AsyncChannel::write_fully) from one task is
//!   never split by bytes from another.
//!
//! The read half has its own mutex, so one task can read while another writes.

use std::future::Future;
use std::net::SocketAddr;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::error::StreamError;

/// Upper bound on how long [`AsyncChannel::shutdown`] waits for the peer.
const SHUTDOWN_GRACE: Duration = Duration::from_millis(500);

/// Result of a single [`AsyncChannel::read`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadOutcome {
    /// This many bytes were placed at the start of the buffer.
    Data(usize),
    /// The peer finished writing; no more bytes will arrive.
    EndOfStream,
}

/// A cancellable, concurrently usable byte channel.
pub struct AsyncChannel<S = TcpStream> {
    name: &'static str,
    reader: Mutex<ReadHalf<S>>,
    writer: Mutex<WriteHalf<S>>,
    closed: CancellationToken,
}

impl AsyncChannel<TcpStream> {
    /// Opens a TCP connection to `addr`.
    ///
    /// The returned channel closes when `scope` is cancelled.
    ///
    /// # Errors
    ///
    /// - [`StreamError::Cancelled`] if `scope` is cancelled first.
    /// - [`StreamError::ConnectFailed`] if the connection is refused.
    pub async fn connect(
        addr: SocketAddr,
        name: &'static str,
        scope: &CancellationToken,
    ) -> Result<Self, StreamError> {
        let stream = tokio::select! {
            biased;
            _ = scope.cancelled() => return Err(StreamError::Cancelled),
            result = TcpStream::connect(addr) => {
                result.map_err(|source| StreamError::ConnectFailed { addr, source })?
            }
        };
        stream.set_nodelay(true)?;
        debug!(channel = name, %addr, "channel connected");
        Ok(Self::new(stream, name, scope))
    }
}

impl<S> AsyncChannel<S>
where
    S: AsyncRead + AsyncWrite,
{
    /// Wraps an already-open stream.
    pub fn new(stream: S, name: &'static str, scope: &CancellationToken) -> Self {
        let (reader, writer) = tokio::io::split(stream);
        Self {
            name,
            reader: Mutex::new(reader),
            writer: Mutex::new(writer),
            closed: scope.child_token(),
        }
    }

    /// Label used in log output (`"video"`, `"control"`).
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Returns `true` once the channel has been closed locally.
    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// Completes once the channel is closed locally or its scope is cancelled.
    pub async fn closed(&self) {
        self.closed.cancelled().await;
    }

    /// Reads whatever bytes are available, suspending until at least one is.
    ///
    /// # Errors
    ///
    /// [`StreamError::Cancelled`] if the channel is closed while waiting;
    /// [`StreamError::ChannelClosed`] or [`StreamError::Io`] from the stream.
    pub async fn read(&self, buf: &mut [u8]) -> Result<ReadOutcome, StreamError> {
        self.guarded(async {
            let mut reader = self.reader.lock().await;
            let n = reader.read(buf).await?;
            if n == 0 && !buf.is_empty() {
                Ok(ReadOutcome::EndOfStream)
            } else {
                Ok(ReadOutcome::Data(n))
            }
        })
        .await
    }

    /// Fills `buf` completely.
    ///
    /// # Errors
    ///
    /// [`StreamError::ChannelClosed`] if the stream ends before `buf` is full;
    /// otherwise as for [`read`](Self::read).
    pub async fn read_fully(&self, buf: &mut [u8]) -> Result<(), StreamError> {
        self.guarded(async {
            let mut reader = self.reader.lock().await;
            reader.read_exact(buf).await?;
            trace!(channel = self.name, len = buf.len(), "read");
            Ok(())
        })
        .await
    }

    /// Writes some prefix of `buf`, returning its length.
    ///
    /// # Errors
    ///
    /// As for [`write_fully`](Self::write_fully).
    pub async fn write(&self, buf: &[u8]) -> Result<usize, StreamError> {
        self.guarded(async {
            let mut writer = self.writer.lock().await;
            let n = writer.write(buf).await?;
            writer.flush().await?;
            Ok(n)
        })
        .await
    }

    /// Writes all of `buf` while holding the write lock, then flushes.
    ///
    /// # Errors
    ///
    /// [`StreamError::Cancelled`] if the channel is closed while waiting;
    /// [`StreamError::ChannelClosed`] if the peer has gone away;
    /// [`StreamError::Io`] for any other failure.
    pub async fn write_fully(&self, buf: &[u8]) -> Result<(), StreamError> {
        self.guarded(async {
            let mut writer = self.writer.lock().await;
            writer.write_all(buf).await?;
            writer.flush().await?;
            trace!(channel = self.name, len = buf.len(), "wrote");
            Ok(())
        })
        .await
    }

    /// Closes the channel.  Idempotent and callable from any thread.
    ///
    /// Pending and future calls fail with [`StreamError::Cancelled`].  The
    /// underlying stream is released when the channel is dropped; use
    /// [`shutdown`](Self::shutdown) to also signal end-of-stream to the peer.
    pub fn close(&self) {
        if !self.closed.is_cancelled() {
            debug!(channel = self.name, "channel closed");
        }
        self.closed.cancel();
    }

    /// Closes the channel and makes a bounded attempt to send end-of-stream.
    pub async fn shutdown(&self) {
        self.close();
        if let Ok(mut writer) = tokio::time::timeout(SHUTDOWN_GRACE, self.writer.lock()).await {
            let _ = tokio::time::timeout(SHUTDOWN_GRACE, writer.shutdown()).await;
        }
    }

    async fn guarded<T, F>(&self, op: F) -> Result<T, StreamError>
    where
        F: Future<Output = Result<T, StreamError>>,
    {
        tokio::select! {
            biased;
            _ = self.closed.cancelled() => Err(StreamError::Cancelled),
            result = op => result,
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

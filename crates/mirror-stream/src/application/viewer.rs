//! Viewer side of a mirroring session.
//!
//! The viewer listens; the agent connects twice.  Connections may arrive in
//! either order, so each one is classified by its first byte:
//!
//! - `'V'` followed by the 20-byte codec name: the video channel.
//! - `'C'`: the control channel.
//!
//! Once the first connection arrives, the rest of the handshake must complete
//! within the handshake timeout.  A duplicate or unknown role byte, or a peer
//! that disconnects before sending one, fails the handshake.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use mirror_core::protocol::video::{
    decode_codec_name, CODEC_NAME_LENGTH, CONTROL_CHANNEL_MARKER, VIDEO_CHANNEL_MARKER,
};
use mirror_core::{BitRateManager, ControlMessage};
use tokio::io::AsyncReadExt;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::control_channel::{CommandHandler, ControlChannel};
use super::supervisor::ConnectionId;
use super::video_transport::{VideoFrame, VideoReceiver};
use crate::error::StreamError;
use crate::infrastructure::channel::AsyncChannel;

/// Listening endpoint that agents connect to.
pub struct ViewerEndpoint {
    listener: TcpListener,
    handshake_timeout: Duration,
}

impl ViewerEndpoint {
    /// Binds the listener.  Use port 0 to let the OS pick one.
    ///
    /// # Errors
    ///
    /// [`StreamError::Io`] if the address cannot be bound.
    pub async fn bind(addr: SocketAddr, handshake_timeout: Duration) -> Result<Self, StreamError> {
        let listener = TcpListener::bind(addr).await.map_err(StreamError::Io)?;
        Ok(Self {
            listener,
            handshake_timeout,
        })
    }

    /// The address agents should connect to.
    ///
    /// # Errors
    ///
    /// [`StreamError::Io`] if the socket has no local address.
    pub fn local_addr(&self) -> Result<SocketAddr, StreamError> {
        self.listener.local_addr().map_err(StreamError::Io)
    }

    /// Waits for an agent and completes the handshake.
    ///
    /// Waiting for the first connection is unbounded; everything after it is
    /// bounded by the handshake timeout.  The session's channels close when
    /// `scope` is cancelled.
    ///
    /// # Errors
    ///
    /// [`StreamError::HandshakeTimeout`], [`StreamError::Handshake`],
    /// [`StreamError::Cancelled`].
    pub async fn accept(&self, scope: &CancellationToken) -> Result<ViewerSession, StreamError> {
        let first = tokio::select! {
            biased;
            _ = scope.cancelled() => return Err(StreamError::Cancelled),
            accepted = self.listener.accept() => accepted?,
        };

        let timeout = self.handshake_timeout;
        let handshake = async {
            let mut roles = Roles::default();
            roles.classify(first.0, first.1).await?;
            let (stream, peer) = self.listener.accept().await?;
            roles.classify(stream, peer).await?;
            roles.complete()
        };
        let (video, codec, control) = tokio::select! {
            biased;
            _ = scope.cancelled() => return Err(StreamError::Cancelled),
            result = tokio::time::timeout(timeout, handshake) => {
                result.unwrap_or(Err(StreamError::HandshakeTimeout(timeout)))?
            }
        };

        let session_scope = scope.child_token();
        let id = Uuid::new_v4();
        info!(session_id = %id, codec = %codec, "viewer session established");
        let video = Arc::new(AsyncChannel::new(video, "video", &session_scope));
        let control = Arc::new(AsyncChannel::new(control, "control", &session_scope));
        Ok(ViewerSession {
            id,
            codec,
            scope: session_scope,
            video: VideoReceiver::new(Arc::clone(&video)),
            video_channel: video,
            control: ControlChannel::new(control),
        })
    }
}

#[derive(Default)]
struct Roles {
    video: Option<(TcpStream, String)>,
    control: Option<TcpStream>,
}

impl Roles {
    async fn classify(&mut self, mut stream: TcpStream, peer: SocketAddr) -> Result<(), StreamError> {
        stream.set_nodelay(true)?;
        let mut role = [0u8; 1];
        read_handshake(&mut stream, &mut role).await?;
        match role[0] {
            VIDEO_CHANNEL_MARKER if self.video.is_none() => {
                let mut name = [0u8; CODEC_NAME_LENGTH];
                read_handshake(&mut stream, &mut name).await?;
                let codec = decode_codec_name(&name)?;
                debug!(%peer, %codec, "video channel accepted");
                self.video = Some((stream, codec));
            }
            CONTROL_CHANNEL_MARKER if self.control.is_none() => {
                debug!(%peer, "control channel accepted");
                self.control = Some(stream);
            }
            VIDEO_CHANNEL_MARKER | CONTROL_CHANNEL_MARKER => {
                return Err(StreamError::Handshake(format!(
                    "duplicate channel role {:?}",
                    role[0] as char
                )));
            }
            other => {
                return Err(StreamError::Handshake(format!(
                    "unknown channel role byte {other:#04x}"
                )));
            }
        }
        Ok(())
    }

    fn complete(self) -> Result<(TcpStream, String, TcpStream), StreamError> {
        match (self.video, self.control) {
            (Some((video, codec)), Some(control)) => Ok((video, codec, control)),
            _ => Err(StreamError::Handshake("missing channel".to_string())),
        }
    }
}

async fn read_handshake(stream: &mut TcpStream, buf: &mut [u8]) -> Result<(), StreamError> {
    stream
        .read_exact(buf)
        .await
        .map(|_| ())
        .map_err(|e| match StreamError::from(e) {
            StreamError::ChannelClosed => {
                StreamError::Handshake("agent terminated during startup".to_string())
            }
            other => other,
        })
}

/// One established session, seen from the viewer.
pub struct ViewerSession {
    id: ConnectionId,
    codec: String,
    scope: CancellationToken,
    video: VideoReceiver,
    video_channel: Arc<AsyncChannel>,
    control: ControlChannel,
}

impl ViewerSession {
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Codec name announced by the agent.
    pub fn codec_name(&self) -> &str {
        &self.codec
    }

    /// Reports received bit rates to `manager` under `device_id`.
    pub fn with_bit_rate_feedback(
        mut self,
        manager: Arc<BitRateManager>,
        device_id: impl Into<String>,
    ) -> Self {
        self.video = self.video.with_bit_rate_feedback(manager, device_id);
        self
    }

    /// Reads the next video packet; `None` when the agent ends the stream.
    ///
    /// # Errors
    ///
    /// As for [`VideoReceiver::next_frame`].
    pub async fn next_frame(&mut self) -> Result<Option<VideoFrame>, StreamError> {
        self.video.next_frame().await
    }

    /// Sends a command to the agent.
    ///
    /// # Errors
    ///
    /// As for [`ControlChannel::send`].
    pub async fn send(&self, message: &ControlMessage) -> Result<(), StreamError> {
        self.control.send(message).await
    }

    /// A handle to the control channel, for running its read loop on another
    /// task.
    pub fn control(&self) -> ControlChannel {
        self.control.clone()
    }

    /// Closes both channels.  Pending reads fail with `Cancelled`.
    pub async fn close(&self) {
        self.scope.cancel();
        tokio::join!(self.video_channel.shutdown(), self.control.channel().shutdown());
    }
}

/// Viewer-side [`CommandHandler`]: logs agent notifications and keeps the
/// latest clipboard text and device state.
#[derive(Debug, Default)]
pub struct ViewerNotifications {
    clipboard: Mutex<Option<String>>,
    device_state_id: Mutex<Option<i32>>,
}

impl ViewerNotifications {
    pub fn new() -> Self {
        Self::default()
    }

    /// Last clipboard text reported by the device.
    pub fn clipboard(&self) -> Option<String> {
        self.clipboard
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Last device state reported by the device.
    pub fn device_state_id(&self) -> Option<i32> {
        *self
            .device_state_id
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

impl CommandHandler for ViewerNotifications {
    fn handle(&self, message: &ControlMessage) -> Option<ControlMessage> {
        match message {
            ControlMessage::ClipboardChanged { text } => {
                info!(len = text.chars().count(), "device clipboard changed");
                *self.clipboard.lock().unwrap_or_else(PoisonError::into_inner) = Some(text.clone());
            }
            ControlMessage::DeviceStateNotification { device_state_id } => {
                info!(device_state_id, "device state changed");
                *self
                    .device_state_id
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner) = Some(*device_state_id);
            }
            ControlMessage::ErrorResponse {
                request_id,
                message,
            } => {
                warn!(request_id, %message, "agent reported an error");
            }
            other => {
                warn!(kind = ?other.message_type(), "agent sent a command; ignored");
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;

    async fn endpoint(timeout: Duration) -> (ViewerEndpoint, SocketAddr) {
        let endpoint = ViewerEndpoint::bind(SocketAddr::from(([127, 0, 0, 1], 0)), timeout)
            .await
            .unwrap();
        let addr = endpoint.local_addr().unwrap();
        (endpoint, addr)
    }

    fn video_header(codec: &str) -> Vec<u8> {
        mirror_core::protocol::video::encode_video_channel_header(codec)
            .unwrap()
            .to_vec()
    }

    #[tokio::test]
    async fn test_channels_are_accepted_in_either_order() {
        // Arrange
        let (endpoint, addr) = endpoint(Duration::from_secs(2)).await;
        let agent = tokio::spawn(async move {
            let mut control = TcpStream::connect(addr).await.unwrap();
            control.write_all(&[CONTROL_CHANNEL_MARKER]).await.unwrap();
            let mut video = TcpStream::connect(addr).await.unwrap();
            video.write_all(&video_header("h264")).await.unwrap();
            (control, video)
        });

        // Act
        let session = endpoint.accept(&CancellationToken::new()).await;
        let _streams = agent.await.unwrap();

        // Assert
        assert_eq!(session.expect("handshake").codec_name(), "h264");
    }

    #[tokio::test]
    async fn test_duplicate_role_fails_handshake() {
        let (endpoint, addr) = endpoint(Duration::from_secs(2)).await;
        let agent = tokio::spawn(async move {
            let mut a = TcpStream::connect(addr).await.unwrap();
            a.write_all(&[CONTROL_CHANNEL_MARKER]).await.unwrap();
            let mut b = TcpStream::connect(addr).await.unwrap();
            b.write_all(&[CONTROL_CHANNEL_MARKER]).await.unwrap();
            (a, b)
        });

        let result = endpoint.accept(&CancellationToken::new()).await;
        let _streams = agent.await.unwrap();

        assert!(matches!(result, Err(StreamError::Handshake(_))));
    }

    #[tokio::test]
    async fn test_unknown_role_fails_handshake() {
        let (endpoint, addr) = endpoint(Duration::from_secs(2)).await;
        let agent = tokio::spawn(async move {
            let mut a = TcpStream::connect(addr).await.unwrap();
            a.write_all(b"X").await.unwrap();
            a
        });

        let result = endpoint.accept(&CancellationToken::new()).await;
        let _stream = agent.await.unwrap();

        assert!(matches!(result, Err(StreamError::Handshake(_))));
    }

    #[tokio::test]
    async fn test_missing_second_channel_times_out() {
        // Arrange: only the video channel ever arrives.
        let (endpoint, addr) = endpoint(Duration::from_millis(100)).await;
        let agent = tokio::spawn(async move {
            let mut video = TcpStream::connect(addr).await.unwrap();
            video.write_all(&video_header("h264")).await.unwrap();
            video
        });

        // Act
        let result = endpoint.accept(&CancellationToken::new()).await;
        let _stream = agent.await.unwrap();

        // Assert
        assert!(matches!(result, Err(StreamError::HandshakeTimeout(_))));
    }

    #[tokio::test]
    async fn test_cancelled_accept_returns_promptly() {
        let (endpoint, _addr) = endpoint(Duration::from_secs(2)).await;
        let scope = CancellationToken::new();
        scope.cancel();

        let result = endpoint.accept(&scope).await;

        assert!(matches!(result, Err(StreamError::Cancelled)));
    }

    #[test]
    fn test_notifications_are_kept() {
        let handler = ViewerNotifications::new();
        handler.handle(&ControlMessage::ClipboardChanged {
            text: "copied".to_string(),
        });
        handler.handle(&ControlMessage::DeviceStateNotification { device_state_id: 1 });
        assert_eq!(handler.clipboard().as_deref(), Some("copied"));
        assert_eq!(handler.device_state_id(), Some(1));
    }
}

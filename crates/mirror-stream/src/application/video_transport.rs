//! VideoTransport: encoder output to framed packets and back.
//!
//! # Sending
//!
//! [`VideoSender::run`] pulls rendered frames from the capture pipeline, hands
//! each one to the [`VideoEncoder`], and writes every packet the encoder
//! produces as one `header + payload` buffer with a single
//! [`AsyncChannel::write_fully`].  Because the channel serializes whole
//! writes, a reader never sees two packets interleaved.
//!
//! Render settings (resolution cap, orientation, paused/streaming) are read
//! once per render pass, so a command that arrives while a frame is being
//! encoded takes effect on the *next* frame.  Every header carries the size of
//! its own image, so the viewer copes with mid-stream changes.
//!
//! # Receiving
//!
//! [`VideoReceiver::next_frame`] reads one header and its payload.  The
//! header's `BIT_RATE_REDUCED` flag optionally feeds a [`BitRateManager`], so
//! the viewer learns which devices struggle.

use std::sync::Arc;

use mirror_core::domain::geometry::{compute_video_size, Size};
use mirror_core::protocol::video::{flags, MAX_PAYLOAD_SIZE, VIDEO_HEADER_SIZE};
use mirror_core::protocol::{FrameCounter, PtsNormalizer};
use mirror_core::{BitRateManager, ProtocolError, VideoPacketHeader};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::error::{EncoderError, StreamError};
use crate::infrastructure::channel::{AsyncChannel, ReadOutcome};

// ── Encoder seam ──────────────────────────────────────────────────────────────

/// One rendered display image handed to the encoder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawFrame {
    /// Natural (unrotated) size of the display the frame was captured from.
    pub display_size: Size,
    pub data: Vec<u8>,
    /// Wall-clock capture time in microseconds since the Unix epoch.
    pub captured_at_us: u64,
}

/// One chunk of encoder output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodedPacket {
    pub data: Vec<u8>,
    /// Encoder presentation timestamp in microseconds, if it assigned one.
    pub pts_us: Option<i64>,
    /// Capture time of the frame this packet was produced from.
    pub origination_timestamp_us: u64,
}

/// Parameters the encoder is (re)configured with at a render pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EncoderConfig {
    pub size: Size,
    /// Requested bit rate in bits per second.
    pub bit_rate: u32,
}

/// The video codec, treated as an opaque collaborator.
///
/// Implementations may hold native resources; [`release`](Self::release) is
/// called exactly once by [`EncoderSession`] when the owning connection ends.
pub trait VideoEncoder: Send {
    /// Name announced on the video channel, at most 20 ASCII bytes.
    fn codec_name(&self) -> &str;

    /// Prepares the encoder for frames of `config.size`.  Called before the
    /// first frame and again whenever the output size changes.
    fn configure(&mut self, config: EncoderConfig) -> Result<(), EncoderError>;

    /// Encodes one frame.  May return zero, one or several packets; packets
    /// held back by the codec are returned by later calls or by
    /// [`flush`](Self::flush).
    fn encode(&mut self, frame: &RawFrame) -> Result<Vec<EncodedPacket>, EncoderError>;

    /// Returns every packet still held back by the codec.
    fn flush(&mut self) -> Result<Vec<EncodedPacket>, EncoderError>;

    /// The bit rate the encoder is currently producing, in bits per second.
    fn bit_rate(&self) -> u32;

    /// Frees codec resources.
    fn release(&mut self);
}

/// Owns an encoder and releases it exactly once, on every exit path.
pub struct EncoderSession {
    encoder: Box<dyn VideoEncoder>,
    released: bool,
}

impl EncoderSession {
    pub fn new(encoder: Box<dyn VideoEncoder>) -> Self {
        Self {
            encoder,
            released: false,
        }
    }

    pub fn encoder(&mut self) -> &mut dyn VideoEncoder {
        self.encoder.as_mut()
    }

    pub fn codec_name(&self) -> &str {
        self.encoder.codec_name()
    }

    /// Releases the encoder now; later calls and the drop are no-ops.
    pub fn release(&mut self) {
        if !self.released {
            self.released = true;
            self.encoder.release();
            debug!("encoder released");
        }
    }
}

impl Drop for EncoderSession {
    fn drop(&mut self) {
        self.release();
    }
}

// ── Render settings ───────────────────────────────────────────────────────────

/// Settings sampled by the video loop at each render pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RenderState {
    /// Resolution cap requested by the viewer; 0 means no cap on that axis.
    pub max_resolution: Size,
    /// Display orientation quadrant, 0-3 clockwise.
    pub orientation: u8,
    /// `false` while the viewer has paused the stream.
    pub streaming: bool,
}

/// Shared, observable [`RenderState`].
///
/// Written by the control channel's command handler, read by the video loop.
#[derive(Debug)]
pub struct RenderSettings {
    state: watch::Sender<RenderState>,
}

impl RenderSettings {
    pub fn new(max_resolution: Size) -> Self {
        Self {
            state: watch::Sender::new(RenderState {
                max_resolution,
                orientation: 0,
                streaming: true,
            }),
        }
    }

    pub fn current(&self) -> RenderState {
        *self.state.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<RenderState> {
        self.state.subscribe()
    }

    pub fn set_max_resolution(&self, max_resolution: Size) {
        self.state.send_if_modified(|s| replace(&mut s.max_resolution, max_resolution));
    }

    pub fn set_orientation(&self, orientation: u8) {
        self.state.send_if_modified(|s| replace(&mut s.orientation, orientation % 4));
    }

    pub fn set_streaming(&self, streaming: bool) {
        self.state.send_if_modified(|s| replace(&mut s.streaming, streaming));
    }
}

fn replace<T: PartialEq>(slot: &mut T, value: T) -> bool {
    if *slot == value {
        false
    } else {
        *slot = value;
        true
    }
}

// ── Sender ────────────────────────────────────────────────────────────────────

/// How the video loop ended without an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VideoExit {
    /// The frame source was closed; delayed packets were flushed.
    SourceExhausted,
    /// The viewer closed the video channel.
    PeerClosed,
    /// A stop was requested; delayed packets were flushed.
    Stopped,
}

/// What the encoder is currently producing packets for.  Delayed packets
/// flushed later still describe the frames they were encoded from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct ActiveEncoding {
    config: EncoderConfig,
    orientation: u8,
}

/// Agent-side video loop for one connection.
pub struct VideoSender<S = TcpStream> {
    channel: Arc<AsyncChannel<S>>,
    settings: watch::Receiver<RenderState>,
    session: EncoderSession,
    frames: Arc<FrameCounter>,
    pts: PtsNormalizer,
    bit_rate: u32,
    last_bit_rate: Option<u32>,
    display_round: bool,
    configured: Option<ActiveEncoding>,
    render: RenderState,
}

impl<S> VideoSender<S>
where
    S: AsyncRead + AsyncWrite + Send,
{
    /// Creates a sender that encodes at `bit_rate` and numbers packets with
    /// `frames`.
    pub fn new(
        channel: Arc<AsyncChannel<S>>,
        settings: &RenderSettings,
        session: EncoderSession,
        frames: Arc<FrameCounter>,
        bit_rate: u32,
    ) -> Self {
        let mut settings = settings.subscribe();
        let render = *settings.borrow_and_update();
        Self {
            channel,
            settings,
            session,
            frames,
            pts: PtsNormalizer::new(),
            bit_rate,
            last_bit_rate: None,
            display_round: false,
            configured: None,
            render,
        }
    }

    /// Marks every header with `DISPLAY_ROUND`.
    pub fn with_round_display(mut self, round: bool) -> Self {
        self.display_round = round;
        self
    }

    /// Runs the render/encode/send loop until the source ends, `stop` fires,
    /// or the viewer goes away.
    ///
    /// The encoder is released when this returns, whatever the outcome.
    ///
    /// # Errors
    ///
    /// [`StreamError::Encoder`] if the codec fails, [`StreamError::Io`] for
    /// write failures other than the peer closing, [`StreamError::Cancelled`]
    /// if the channel was closed under it.
    pub async fn run(
        mut self,
        mut source: mpsc::Receiver<RawFrame>,
        stop: CancellationToken,
    ) -> Result<VideoExit, StreamError> {
        let exit = loop {
            let frame = tokio::select! {
                biased;
                _ = stop.cancelled() => break VideoExit::Stopped,
                _ = self.channel.closed() => None,
                frame = source.recv() => match frame {
                    Some(frame) => Some(frame),
                    None => break VideoExit::SourceExhausted,
                },
            };
            let Some(frame) = frame else {
                debug!(channel = self.channel.name(), "channel closed while idle");
                self.session.release();
                return Ok(VideoExit::PeerClosed);
            };
            match self.render_pass(&frame).await {
                Ok(()) => {}
                Err(StreamError::ChannelClosed) => {
                    info!(channel = self.channel.name(), "viewer closed the video channel");
                    return Ok(VideoExit::PeerClosed);
                }
                Err(e) => return Err(e),
            }
        };

        match self.drain().await {
            Ok(()) | Err(StreamError::ChannelClosed) => {}
            Err(e) => return Err(e),
        }
        self.session.release();
        debug!(?exit, last_frame = self.frames.current(), "video loop finished");
        Ok(exit)
    }

    async fn render_pass(&mut self, frame: &RawFrame) -> Result<(), StreamError> {
        if self.settings.has_changed().unwrap_or(false) {
            self.render = *self.settings.borrow_and_update();
            if !self.render.streaming && self.configured.is_some() {
                info!("video stream paused");
                self.drain().await?;
                self.configured = None;
            }
        }
        if !self.render.streaming {
            return Ok(());
        }

        let wanted = ActiveEncoding {
            config: EncoderConfig {
                size: compute_video_size(
                    frame.display_size,
                    self.render.orientation,
                    self.render.max_resolution,
                ),
                bit_rate: self.bit_rate,
            },
            orientation: self.render.orientation,
        };
        if self.configured != Some(wanted) {
            // Packets still held back belong to the previous settings.
            self.drain().await?;
            let config = wanted.config;
            if self.configured.map(|active| active.config) != Some(config) {
                debug!(width = config.size.width, height = config.size.height, "configuring encoder");
                self.session.encoder().configure(config)?;
            }
            self.configured = Some(wanted);
        }

        let packets = self.session.encoder().encode(frame)?;
        self.send_packets(packets).await
    }

    /// Sends whatever the encoder is still holding back.
    async fn drain(&mut self) -> Result<(), StreamError> {
        if self.configured.is_none() {
            return Ok(());
        }
        let packets = self.session.encoder().flush()?;
        if !packets.is_empty() {
            debug!(count = packets.len(), "flushing delayed packets");
        }
        self.send_packets(packets).await
    }

    async fn send_packets(&mut self, packets: Vec<EncodedPacket>) -> Result<(), StreamError> {
        let Some(active) = self.configured else {
            return Ok(());
        };
        for packet in packets {
            let header = self.next_header(active, &packet)?;
            let mut buf = Vec::with_capacity(VIDEO_HEADER_SIZE + packet.data.len());
            buf.extend_from_slice(&header.encode());
            buf.extend_from_slice(&packet.data);
            self.channel.write_fully(&buf).await?;
            trace!(frame_number = header.frame_number, size = packet.data.len(), "sent packet");
        }
        Ok(())
    }

    fn next_header(
        &mut self,
        active: ActiveEncoding,
        packet: &EncodedPacket,
    ) -> Result<VideoPacketHeader, StreamError> {
        if packet.data.len() > MAX_PAYLOAD_SIZE {
            return Err(ProtocolError::PayloadTooLarge {
                declared: packet.data.len(),
                max: MAX_PAYLOAD_SIZE,
            }
            .into());
        }
        let bit_rate = self.session.encoder().bit_rate();
        let reduced = self.last_bit_rate.is_some_and(|last| bit_rate < last);
        self.last_bit_rate = Some(bit_rate);
        if reduced {
            info!(bit_rate, "encoder reduced its bit rate");
        }

        let mut header_flags = 0;
        if self.display_round {
            header_flags |= flags::DISPLAY_ROUND;
        }
        if reduced {
            header_flags |= flags::BIT_RATE_REDUCED;
        }

        Ok(VideoPacketHeader {
            width: active.config.size.width,
            height: active.config.size.height,
            orientation: active.orientation,
            orientation_correction: 0,
            flags: header_flags,
            bit_rate,
            frame_number: self.frames.next(),
            origination_timestamp_us: packet.origination_timestamp_us,
            presentation_timestamp_us: self.pts.normalize(packet.pts_us),
            payload_size: packet.data.len() as u32,
        })
    }
}

// ── Receiver ──────────────────────────────────────────────────────────────────

/// One received video packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VideoFrame {
    pub header: VideoPacketHeader,
    pub payload: Vec<u8>,
}

/// Viewer-side reader of the video channel.
pub struct VideoReceiver<S = TcpStream> {
    channel: Arc<AsyncChannel<S>>,
    last_frame_number: u32,
    feedback: Option<(Arc<BitRateManager>, String)>,
}

impl<S> VideoReceiver<S>
where
    S: AsyncRead + AsyncWrite,
{
    pub fn new(channel: Arc<AsyncChannel<S>>) -> Self {
        Self {
            channel,
            last_frame_number: 0,
            feedback: None,
        }
    }

    /// Reports every received header's bit rate to `manager` under `device_id`.
    pub fn with_bit_rate_feedback(
        mut self,
        manager: Arc<BitRateManager>,
        device_id: impl Into<String>,
    ) -> Self {
        self.feedback = Some((manager, device_id.into()));
        self
    }

    /// Frame number of the last packet returned, or 0.
    pub fn last_frame_number(&self) -> u32 {
        self.last_frame_number
    }

    /// Reads the next packet.
    ///
    /// Returns `Ok(None)` when the agent ends the stream cleanly between
    /// packets.
    ///
    /// # Errors
    ///
    /// [`StreamError::ChannelClosed`] if the stream ends inside a packet,
    /// [`StreamError::Protocol`] for a malformed header.
    pub async fn next_frame(&mut self) -> Result<Option<VideoFrame>, StreamError> {
        let mut raw = [0u8; VIDEO_HEADER_SIZE];
        if self.channel.read(&mut raw[..1]).await? == ReadOutcome::EndOfStream {
            return Ok(None);
        }
        self.channel.read_fully(&mut raw[1..]).await?;
        let header = VideoPacketHeader::decode(&raw)?;

        let mut payload = vec![0u8; header.payload_size as usize];
        self.channel.read_fully(&mut payload).await?;

        if header.frame_number != self.last_frame_number.wrapping_add(1) {
            warn!(
                expected = self.last_frame_number.wrapping_add(1),
                frame_number = header.frame_number,
                "frame number gap"
            );
        }
        self.last_frame_number = header.frame_number;

        if let Some((manager, device)) = &self.feedback {
            if header.bit_rate > 0 {
                if header.is_bit_rate_reduced() {
                    manager.bit_rate_reduced(header.bit_rate, device);
                } else {
                    manager.bit_rate_stable(header.bit_rate, device);
                }
            }
        }

        Ok(Some(VideoFrame { header, payload }))
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

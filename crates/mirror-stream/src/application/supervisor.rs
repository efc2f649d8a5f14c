//! ConnectionSupervisor: the lifecycle of one mirroring session.
//!
//! # States
//!
//! ```text
//! Handshaking ──► Running ──► Stopped   (stop requested)
//!      │             │
//!      └─────────────┴──────► Crashed   (anything else)
//! ```
//!
//! - **Handshaking** – the agent opens the video channel and the control
//!   channel and writes each one's role byte (`'V'` + codec name, `'C'`),
//!   all within the handshake timeout.  A failure here goes straight to
//!   `Crashed`; `Running` is never published.
//! - **Running** – the video loop and the control loop run as two tasks under
//!   one cancellation scope.  When either ends (other than the frame source
//!   running dry), the scope is cancelled, which closes both channels and
//!   unblocks the other loop.
//! - **Stopped / Crashed** – terminal.  Both channels are shut down and the
//!   encoder is released exactly once.  A reconnect is a new [`Connection`]
//!   with a new id, a new frame counter and a new PTS origin.
//!
//! [`Connection::stop`] is a plain synchronous call that can be made from any
//! thread; the supervisor observes it within one I/O timeout.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex, OnceLock, PoisonError};
use std::time::Duration;

use mirror_core::protocol::video::{encode_video_channel_header, CONTROL_CHANNEL_MARKER};
use mirror_core::protocol::FrameCounter;
use mirror_core::{BitRateManager, ControlMessage, Size};
use tokio::sync::{mpsc, watch};
use tokio::task::{JoinError, JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn, Instrument};
use uuid::Uuid;

use super::agent_commands::AgentCommandHandler;
use super::control_channel::{CommandHistory, ControlChannel};
use super::video_transport::{
    EncoderSession, RawFrame, RenderSettings, VideoEncoder, VideoExit, VideoSender,
};
use crate::error::StreamError;
use crate::infrastructure::channel::AsyncChannel;

/// Identifies one Connection (and one viewer session) in logs.
pub type ConnectionId = Uuid;

/// Lifecycle state of a [`Connection`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    Handshaking,
    Running,
    Crashed,
    Stopped,
}

impl ConnectionState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, ConnectionState::Crashed | ConnectionState::Stopped)
    }
}

/// Parameters of one agent-side connection.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Where the viewer listens.
    pub viewer_addr: SocketAddr,
    /// Identity used to look up the learned bit-rate cap.
    pub device_id: String,
    /// Bit rate used when no cap has been learned for this device.
    pub default_bit_rate: u32,
    /// Initial resolution cap; 0 on an axis means no cap.
    pub max_resolution: Size,
    pub display_round: bool,
    /// Bound on opening both channels and writing their role bytes.
    pub handshake_timeout: Duration,
    /// Bound on each teardown step.
    pub io_timeout: Duration,
    /// Simulates an agent that dies right after opening its sockets.
    pub crash_on_start: bool,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            viewer_addr: SocketAddr::from(([127, 0, 0, 1], 27183)),
            device_id: "local-device".to_string(),
            default_bit_rate: 8_000_000,
            max_resolution: Size::default(),
            display_round: false,
            handshake_timeout: Duration::from_secs(5),
            io_timeout: Duration::from_secs(1),
            crash_on_start: false,
        }
    }
}

/// State shared between the [`Connection`] handle and its supervisor task.
struct Shared {
    id: ConnectionId,
    state: watch::Sender<ConnectionState>,
    transitions: Mutex<Vec<ConnectionState>>,
    frames: Arc<FrameCounter>,
    history: Arc<CommandHistory>,
    commands: Arc<AgentCommandHandler>,
    control: OnceLock<ControlChannel>,
}

impl Shared {
    fn set_state(&self, next: ConnectionState) {
        self.transitions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(next);
        self.state.send_replace(next);
        debug!(connection_id = %self.id, state = ?next, "connection state changed");
    }
}

/// Agent-side handle to one mirroring session.
pub struct Connection {
    shared: Arc<Shared>,
    stop: CancellationToken,
    task: Option<JoinHandle<Result<(), StreamError>>>,
}

impl Connection {
    /// Starts a connection to the viewer at `config.viewer_addr`.
    ///
    /// Returns immediately in the `Handshaking` state; the session runs on a
    /// spawned task.  The encoder is owned by the connection from here on and
    /// is released exactly once, whatever happens.
    pub fn start(
        config: ConnectionConfig,
        encoder: Box<dyn VideoEncoder>,
        frames: mpsc::Receiver<RawFrame>,
        bit_rates: Arc<BitRateManager>,
    ) -> Self {
        let id = Uuid::new_v4();
        let settings = Arc::new(RenderSettings::new(config.max_resolution));
        let shared = Arc::new(Shared {
            id,
            state: watch::Sender::new(ConnectionState::Handshaking),
            transitions: Mutex::new(vec![ConnectionState::Handshaking]),
            frames: Arc::new(FrameCounter::new()),
            history: Arc::new(CommandHistory::new()),
            commands: Arc::new(AgentCommandHandler::new(settings)),
            control: OnceLock::new(),
        });
        let stop = CancellationToken::new();

        let supervisor = Supervisor {
            config,
            shared: Arc::clone(&shared),
            stop: stop.clone(),
            bit_rates,
        };
        let span = tracing::info_span!("connection", connection_id = %id);
        let task = tokio::spawn(supervisor.run(encoder, frames).instrument(span));

        Self {
            shared,
            stop,
            task: Some(task),
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.shared.id
    }

    pub fn state(&self) -> ConnectionState {
        *self.shared.state.borrow()
    }

    /// Every state this connection has been in, in order.
    pub fn transitions(&self) -> Vec<ConnectionState> {
        self.shared
            .transitions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Waits until the state satisfies `predicate` and returns it.
    pub async fn wait_for_state<F>(&self, mut predicate: F) -> ConnectionState
    where
        F: FnMut(&ConnectionState) -> bool,
    {
        let mut rx = self.shared.state.subscribe();
        let result = rx.wait_for(|s| predicate(s)).await.map(|s| *s);
        result.unwrap_or_else(|_| *rx.borrow())
    }

    /// Waits until the connection reaches `Stopped` or `Crashed`.
    pub async fn terminated(&self) -> ConnectionState {
        self.wait_for_state(ConnectionState::is_terminal).await
    }

    /// Requests an orderly stop.  Idempotent and callable from any thread.
    pub fn stop(&self) {
        if !self.stop.is_cancelled() {
            info!(connection_id = %self.shared.id, "stop requested");
        }
        self.stop.cancel();
    }

    /// Waits for the supervisor to finish.
    ///
    /// # Errors
    ///
    /// The failure that crashed the connection; `Ok` after a requested stop.
    pub async fn join(mut self) -> Result<(), StreamError> {
        let Some(task) = self.task.take() else {
            return Ok(());
        };
        match task.await {
            Ok(result) => result,
            Err(e) => Err(join_failure(e)),
        }
    }

    /// Frame number of the last packet sent, or 0.
    pub fn last_frame_number(&self) -> u32 {
        self.shared.frames.current()
    }

    /// Commands received from the viewer.
    pub fn command_history(&self) -> &Arc<CommandHistory> {
        &self.shared.history
    }

    /// The command handler, for inspecting agent state.
    pub fn commands(&self) -> &Arc<AgentCommandHandler> {
        &self.shared.commands
    }

    /// Sends a notification to the viewer.
    ///
    /// # Errors
    ///
    /// [`StreamError::ChannelClosed`] before `Running`; channel errors after.
    pub async fn send_notification(&self, message: &ControlMessage) -> Result<(), StreamError> {
        let control = self.shared.control.get().ok_or(StreamError::ChannelClosed)?;
        control.send(message).await
    }

    /// Reports a change of the device clipboard; notifies the viewer if
    /// clipboard sync is enabled.
    ///
    /// # Errors
    ///
    /// As for [`send_notification`](Self::send_notification).
    pub async fn device_clipboard_changed(&self, text: &str) -> Result<(), StreamError> {
        match self.shared.commands.clipboard_changed(text) {
            Some(message) => self.send_notification(&message).await,
            None => Ok(()),
        }
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.stop.cancel();
    }
}

fn join_failure(e: JoinError) -> StreamError {
    if e.is_panic() {
        std::panic::resume_unwind(e.into_panic());
    }
    StreamError::Cancelled
}

// ── Supervisor task ───────────────────────────────────────────────────────────

/// Which loop ended, and how.
#[derive(Debug)]
enum LoopEnd {
    Video(VideoExit),
    Control,
}

struct Supervisor {
    config: ConnectionConfig,
    shared: Arc<Shared>,
    stop: CancellationToken,
    bit_rates: Arc<BitRateManager>,
}

impl Supervisor {
    async fn run(
        self,
        encoder: Box<dyn VideoEncoder>,
        frames: mpsc::Receiver<RawFrame>,
    ) -> Result<(), StreamError> {
        let session = EncoderSession::new(encoder);
        let codec_name = session.codec_name().to_string();
        let scope = CancellationToken::new();

        let (video, control) = match self.handshake(&codec_name, &scope).await {
            Ok(channels) => channels,
            Err(e) => {
                scope.cancel();
                drop(session);
                return self.finish(Some(e));
            }
        };
        self.shared.set_state(ConnectionState::Running);

        let bit_rate = self.initial_bit_rate();
        info!(bit_rate, device = %self.config.device_id, "connection running");

        let control_channel =
            ControlChannel::with_history(Arc::clone(&control), Arc::clone(&self.shared.history));
        // Set exactly once per Connection, after the handshake.
        let _ = self.shared.control.set(control_channel.clone());

        let mut tasks: JoinSet<Result<LoopEnd, StreamError>> = JoinSet::new();
        let sender = VideoSender::new(
            Arc::clone(&video),
            self.shared.commands.settings(),
            session,
            Arc::clone(&self.shared.frames),
            bit_rate,
        )
        .with_round_display(self.config.display_round);
        let stop = self.stop.clone();
        tasks.spawn(
            async move { sender.run(frames, stop).await.map(LoopEnd::Video) }.in_current_span(),
        );
        let handler = Arc::clone(&self.shared.commands);
        tasks.spawn(
            async move { control_channel.run(handler.as_ref()).await.map(|()| LoopEnd::Control) }
                .in_current_span(),
        );

        let mut failure = self.supervise(&mut tasks).await;

        if self.stop.is_cancelled() {
            // Give the video loop a chance to flush delayed packets before
            // the channels close under it.
            let flushed = tokio::time::timeout(self.config.io_timeout, async {
                while let Some(joined) = tasks.join_next().await {
                    let video_done = matches!(joined, Ok(Ok(LoopEnd::Video(_))));
                    record(&mut failure, settle(joined));
                    if video_done {
                        break;
                    }
                }
            })
            .await;
            if flushed.is_err() {
                warn!("video loop did not finish flushing in time");
            }
        }

        scope.cancel();
        let drained = tokio::time::timeout(self.config.io_timeout, async {
            while let Some(joined) = tasks.join_next().await {
                record(&mut failure, settle(joined));
            }
        })
        .await;
        if drained.is_err() {
            warn!("loops did not observe cancellation in time; aborting");
            tasks.abort_all();
            while tasks.join_next().await.is_some() {}
        }

        tokio::join!(video.shutdown(), control.shutdown());
        self.finish(failure)
    }

    /// Opens both channels and writes their role bytes within the timeout.
    async fn handshake(
        &self,
        codec_name: &str,
        scope: &CancellationToken,
    ) -> Result<(Arc<AsyncChannel>, Arc<AsyncChannel>), StreamError> {
        let video_header = encode_video_channel_header(codec_name)?;
        let timeout = self.config.handshake_timeout;
        let addr = self.config.viewer_addr;

        let open = async {
            let video = AsyncChannel::connect(addr, "video", scope).await?;
            let control = AsyncChannel::connect(addr, "control", scope).await?;
            if self.config.crash_on_start {
                drop((video, control));
                return Err(StreamError::Handshake(
                    "agent terminated during startup".to_string(),
                ));
            }
            video.write_fully(&video_header).await?;
            control.write_fully(&[CONTROL_CHANNEL_MARKER]).await?;
            Ok((Arc::new(video), Arc::new(control)))
        };

        tokio::select! {
            biased;
            _ = self.stop.cancelled() => Err(StreamError::Cancelled),
            result = tokio::time::timeout(timeout, open) => {
                result.unwrap_or(Err(StreamError::HandshakeTimeout(timeout)))
            }
        }
    }

    /// Waits until a stop is requested or a loop ends the session, returning
    /// the first failure seen.
    async fn supervise(
        &self,
        tasks: &mut JoinSet<Result<LoopEnd, StreamError>>,
    ) -> Option<StreamError> {
        let mut failure = None;
        loop {
            tokio::select! {
                biased;
                _ = self.stop.cancelled() => return failure,
                joined = tasks.join_next() => match joined {
                    None => return failure,
                    Some(Ok(Ok(LoopEnd::Video(VideoExit::SourceExhausted)))) => {
                        debug!("frame source exhausted; control channel stays open");
                    }
                    Some(joined) => {
                        record(&mut failure, settle(joined));
                        return failure;
                    }
                }
            }
        }
    }

    fn initial_bit_rate(&self) -> u32 {
        let cap = self.bit_rates.get_bit_rate(&self.config.device_id);
        if cap > 0 {
            cap.min(self.config.default_bit_rate)
        } else {
            self.config.default_bit_rate
        }
    }

    /// Publishes the terminal state and chooses the result.
    fn finish(&self, failure: Option<StreamError>) -> Result<(), StreamError> {
        let (state, result) = outcome(self.stop.is_cancelled(), failure);
        self.shared.set_state(state);
        match &result {
            Ok(()) => info!(last_frame = self.shared.frames.current(), "connection stopped"),
            Err(e) if e.is_benign() => info!(reason = %e, "connection ended by peer"),
            Err(e) => error!(error = %e, "connection lost"),
        }
        result
    }
}

/// Terminal state for a session that ended with `failure`.
///
/// A requested stop ends `Stopped` unless a fatal failure was already
/// recorded; everything else is `Crashed`.
fn outcome(
    stop_requested: bool,
    failure: Option<StreamError>,
) -> (ConnectionState, Result<(), StreamError>) {
    match failure {
        Some(e) if !e.is_benign() => (ConnectionState::Crashed, Err(e)),
        _ if stop_requested => (ConnectionState::Stopped, Ok(())),
        failure => (
            ConnectionState::Crashed,
            Err(failure.unwrap_or(StreamError::ChannelClosed)),
        ),
    }
}

/// Logs how a loop ended and extracts a failure worth reporting.
fn settle(joined: Result<Result<LoopEnd, StreamError>, JoinError>) -> Option<StreamError> {
    match joined {
        Ok(Ok(end)) => {
            debug!(?end, "loop finished");
            None
        }
        Ok(Err(e)) if e.is_benign() => {
            debug!(reason = %e, "loop ended");
            Some(e)
        }
        Ok(Err(e)) => {
            warn!(error = %e, "loop failed");
            Some(e)
        }
        Err(e) if e.is_cancelled() => None,
        Err(e) => std::panic::resume_unwind(e.into_panic()),
    }
}

/// Keeps the most telling failure: any fatal error beats a benign one.
fn record(slot: &mut Option<StreamError>, next: Option<StreamError>) {
    let Some(next) = next else { return };
    match slot {
        None => *slot = Some(next),
        Some(current) if current.is_benign() && !next.is_benign() => *slot = Some(next),
        Some(_) => {}
    }
}

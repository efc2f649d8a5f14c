//! mirror-stream binary entry point.
//!
//! ```text
//! mirror-stream [--config PATH] viewer   listen for one agent, log its frames
//! mirror-stream [--config PATH] agent    stream a synthetic test pattern
//! mirror-stream [--config PATH] demo     both, in one process, over loopback
//! ```
//!
//! Settings come from `mirror.toml` (see `infrastructure::storage::config`).
//! The learned per-device bit-rate caps are loaded from `bit_rates.toml`
//! next to it at startup and saved back on exit.
//!
//! Ctrl+C stops the session in an orderly way: the agent flushes delayed
//! packets and both channels are shut down before the process exits.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use mirror_core::protocol::messages::StartClipboardSyncMessage;
use mirror_core::{BitRateManager, ControlMessage, Size};
use mirror_stream::application::viewer::ViewerNotifications;
use mirror_stream::infrastructure::encoder::synthetic::{spawn_test_pattern, SyntheticEncoder};
use mirror_stream::infrastructure::storage::bit_rates::{
    load_bit_rates, save_bit_rates, BIT_RATES_FILE_NAME,
};
use mirror_stream::infrastructure::storage::config::{
    config_file_path, load_config_from, MirrorConfig,
};
use mirror_stream::{Connection, ConnectionConfig, ViewerEndpoint, ViewerSession};

/// Interval between synthetic frames (about 60 fps).
const FRAME_INTERVAL: Duration = Duration::from_millis(16);

// ── CLI argument definitions ──────────────────────────────────────────────────

/// Device mirroring transport: streams video from an agent to a viewer and
/// carries control messages back.
#[derive(Debug, Parser)]
#[command(name = "mirror-stream", version)]
struct Cli {
    /// Path to `mirror.toml`.  Defaults to the platform config directory.
    #[arg(long, global = true, env = "MIRROR_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Listen for one agent and log the frames it sends.
    Viewer {
        /// Identity of the device expected to connect, for bit-rate feedback.
        #[arg(long)]
        device_id: Option<String>,
    },
    /// Connect to a viewer and stream a synthetic test pattern.
    Agent {
        /// Viewer address; defaults to the configured bind address and port.
        #[arg(long)]
        viewer: Option<SocketAddr>,
        /// Stop the test pattern after this many frames.
        #[arg(long)]
        frames: Option<u64>,
    },
    /// Run a viewer and an agent in this process over loopback.
    Demo {
        #[arg(long, default_value_t = 120)]
        frames: u64,
    },
}

// ── Entry point ───────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config_path = match cli.config {
        Some(path) => Some(path),
        None => config_file_path().ok(),
    };
    let config = match &config_path {
        Some(path) => load_config_from(path)
            .with_context(|| format!("failed to load {}", path.display()))?,
        None => MirrorConfig::default(),
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(&config.logging.level)),
        )
        .init();

    if config_path.is_none() {
        warn!("no platform config directory; using defaults and not persisting bit rates");
    }
    let bit_rates_path = config_path
        .as_ref()
        .map(|path| path.with_file_name(BIT_RATES_FILE_NAME));
    let bit_rates = Arc::new(match &bit_rates_path {
        Some(path) => load_bit_rates(path)?,
        None => BitRateManager::new(),
    });

    let shutdown = CancellationToken::new();
    let on_signal = shutdown.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("received Ctrl+C; shutting down");
                on_signal.cancel();
            }
            Err(e) => tracing::error!("failed to listen for Ctrl+C signal: {e}"),
        }
    });

    let result = match cli.command {
        Command::Viewer { device_id } => {
            let device_id = device_id.unwrap_or_else(|| config.agent.device_id.clone());
            run_viewer(&config, Arc::clone(&bit_rates), &device_id, &shutdown).await
        }
        Command::Agent { viewer, frames } => {
            let viewer = match viewer {
                Some(addr) => addr,
                None => viewer_addr(&config)?,
            };
            run_agent(&config, Arc::clone(&bit_rates), viewer, frames, &shutdown).await
        }
        Command::Demo { frames } => run_demo(&config, Arc::clone(&bit_rates), frames, &shutdown).await,
    };

    if let Some(path) = &bit_rates_path {
        if let Err(e) = save_bit_rates(path, &bit_rates) {
            warn!("failed to save bit rates: {e}");
        }
    }
    result
}

// ── Roles ─────────────────────────────────────────────────────────────────────

async fn run_viewer(
    config: &MirrorConfig,
    bit_rates: Arc<BitRateManager>,
    device_id: &str,
    shutdown: &CancellationToken,
) -> anyhow::Result<()> {
    let endpoint = ViewerEndpoint::bind(viewer_addr(config)?, handshake_timeout(config)).await?;
    info!("viewer listening on {}", endpoint.local_addr()?);

    let mut session = endpoint
        .accept(shutdown)
        .await?
        .with_bit_rate_feedback(bit_rates, device_id);
    let max = Size::new(config.viewer.max_width, config.viewer.max_height);
    if !max.is_empty() {
        session
            .send(&ControlMessage::SetMaxVideoResolution {
                width: max.width,
                height: max.height,
            })
            .await?;
    }
    let notifications = spawn_notification_reader(&session);

    let received = receive_frames(&mut session, None, shutdown).await?;
    session.close().await;
    notifications.abort();
    info!(frames = received, "viewer finished");
    Ok(())
}

async fn run_agent(
    config: &MirrorConfig,
    bit_rates: Arc<BitRateManager>,
    viewer: SocketAddr,
    frames: Option<u64>,
    shutdown: &CancellationToken,
) -> anyhow::Result<()> {
    let display = Size::new(config.agent.display_width, config.agent.display_height);
    let connection = Connection::start(
        connection_config(config, viewer),
        Box::new(SyntheticEncoder::new().with_codec_name(&config.agent.codec)),
        spawn_test_pattern(display, frames, FRAME_INTERVAL),
        bit_rates,
    );
    info!(connection_id = %connection.id(), "agent connecting to {viewer}");

    tokio::select! {
        _ = shutdown.cancelled() => connection.stop(),
        _ = connection.terminated() => {}
    }
    finish_connection(connection).await
}

async fn run_demo(
    config: &MirrorConfig,
    bit_rates: Arc<BitRateManager>,
    frames: u64,
    shutdown: &CancellationToken,
) -> anyhow::Result<()> {
    let endpoint = ViewerEndpoint::bind(
        SocketAddr::from(([127, 0, 0, 1], 0)),
        handshake_timeout(config),
    )
    .await?;
    let display = Size::new(config.agent.display_width, config.agent.display_height);
    let connection = Connection::start(
        connection_config(config, endpoint.local_addr()?),
        Box::new(SyntheticEncoder::new().with_codec_name(&config.agent.codec)),
        spawn_test_pattern(display, None, FRAME_INTERVAL),
        Arc::clone(&bit_rates),
    );

    let mut session = endpoint
        .accept(shutdown)
        .await?
        .with_bit_rate_feedback(bit_rates, config.agent.device_id.clone());
    let notifications = spawn_notification_reader(&session);
    session
        .send(&ControlMessage::SetMaxVideoResolution {
            width: 720,
            height: 1280,
        })
        .await?;
    session
        .send(&ControlMessage::StartClipboardSync(StartClipboardSyncMessage {
            max_synced_length: 1024,
            text: String::new(),
        }))
        .await?;

    let received = receive_frames(&mut session, Some(frames), shutdown).await?;
    connection.device_clipboard_changed("copied on the device").await?;
    connection.stop();
    let result = finish_connection(connection).await;
    let trailing = receive_frames(&mut session, None, shutdown).await?;
    session.close().await;
    notifications.abort();
    info!(frames = received + trailing, "demo finished");
    result
}

// ── Helpers ───────────────────────────────────────────────────────────────────

/// Reads frames until `limit` is reached, the agent ends the stream, or
/// `shutdown` fires.  Returns the number of frames read.
async fn receive_frames(
    session: &mut ViewerSession,
    limit: Option<u64>,
    shutdown: &CancellationToken,
) -> anyhow::Result<u64> {
    let mut received = 0;
    while limit.map_or(true, |l| received < l) {
        let next = tokio::select! {
            _ = shutdown.cancelled() => break,
            next = session.next_frame() => next,
        };
        match next {
            Ok(Some(frame)) => {
                received += 1;
                if frame.header.frame_number % 60 == 1 {
                    info!(
                        frame_number = frame.header.frame_number,
                        width = frame.header.width,
                        height = frame.header.height,
                        bit_rate = frame.header.bit_rate,
                        "frame received"
                    );
                }
            }
            Ok(None) => break,
            Err(e) if e.is_benign() => {
                info!("video stream ended: {e}");
                break;
            }
            Err(e) => return Err(e).context("video stream failed"),
        }
    }
    Ok(received)
}

fn spawn_notification_reader(session: &ViewerSession) -> tokio::task::JoinHandle<()> {
    let control = session.control();
    let notifications = ViewerNotifications::new();
    tokio::spawn(async move {
        if let Err(e) = control.run(&notifications).await {
            if !e.is_benign() {
                warn!("control channel failed: {e}");
            }
        }
    })
}

async fn finish_connection(connection: Connection) -> anyhow::Result<()> {
    let id = connection.id();
    match connection.join().await {
        Ok(()) => {
            info!(connection_id = %id, "connection stopped");
            Ok(())
        }
        Err(e) if e.is_benign() => {
            info!(connection_id = %id, "viewer went away");
            Ok(())
        }
        Err(e) => Err(e).context("lost connection"),
    }
}

fn connection_config(config: &MirrorConfig, viewer_addr: SocketAddr) -> ConnectionConfig {
    ConnectionConfig {
        viewer_addr,
        device_id: config.agent.device_id.clone(),
        default_bit_rate: config.agent.bit_rate,
        max_resolution: Size::new(config.agent.max_width, config.agent.max_height),
        handshake_timeout: handshake_timeout(config),
        io_timeout: Duration::from_millis(config.agent.io_timeout_ms),
        ..Default::default()
    }
}

fn handshake_timeout(config: &MirrorConfig) -> Duration {
    Duration::from_millis(config.agent.handshake_timeout_ms)
}

fn viewer_addr(config: &MirrorConfig) -> anyhow::Result<SocketAddr> {
    format!("{}:{}", config.viewer.bind_address, config.viewer.port)
        .parse()
        .with_context(|| {
            format!(
                "invalid viewer address: '{}:{}'",
                config.viewer.bind_address, config.viewer.port
            )
        })
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_demo_defaults_to_120_frames() {
        let cli = Cli::parse_from(["mirror-stream", "demo"]);
        assert!(matches!(cli.command, Command::Demo { frames: 120 }));
        assert!(cli.config.is_none());
    }

    #[test]
    fn test_config_flag_is_global() {
        let cli = Cli::parse_from(["mirror-stream", "agent", "--config", "/tmp/m.toml"]);
        assert_eq!(cli.config, Some(PathBuf::from("/tmp/m.toml")));
    }

    #[test]
    fn test_viewer_addr_from_default_config() {
        let addr = viewer_addr(&MirrorConfig::default()).unwrap();
        assert_eq!(addr, SocketAddr::from(([127, 0, 0, 1], 27183)));
    }

    #[test]
    fn test_invalid_bind_address_is_reported() {
        let mut config = MirrorConfig::default();
        config.viewer.bind_address = "not-an-ip".to_string();
        assert!(viewer_addr(&config).is_err());
    }
}

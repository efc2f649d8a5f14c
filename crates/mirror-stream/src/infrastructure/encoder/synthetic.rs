//! Synthetic encoder and test-pattern frame source.
//!
//! `SyntheticEncoder` implements [`VideoEncoder`] without any codec: each
//! "encoded" packet is a short tag (`frame index`, output size) followed by
//! the raw frame bytes.  It can imitate the codec behaviours the transport
//! must cope with:
//!
//! - **Delayed output** (`with_frame_delay`) – every packet is emitted one
//!   frame late, so the last one only appears on `flush()`.
//! - **Bit-rate drops** (`with_bit_rate_drop`) – the reported bit rate falls
//!   at a chosen frame, as a hardware encoder does under thermal pressure.
//! - **Arbitrary PTS base** (`with_pts_base`) – timestamps start wherever a
//!   real encoder's clock happens to be.
//!
//! Every configuration and release is recorded behind shared handles, so a
//! test can keep observing the encoder after moving it into a connection.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use mirror_core::Size;
use tokio::sync::mpsc;
use tracing::debug;

use crate::application::video_transport::{EncodedPacket, EncoderConfig, RawFrame, VideoEncoder};
use crate::error::EncoderError;

/// Codec name the synthetic encoder announces by default.
pub const SYNTHETIC_CODEC_NAME: &str = "synthetic";

/// Spacing between synthetic presentation timestamps (about 60 fps).
const FRAME_INTERVAL_US: i64 = 16_667;

/// An in-memory stand-in for a hardware video encoder.
#[derive(Debug)]
pub struct SyntheticEncoder {
    codec_name: String,
    config: Option<EncoderConfig>,
    bit_rate: u32,
    frames_encoded: u64,
    pts_base_us: i64,
    delay_one_frame: bool,
    held_back: Option<EncodedPacket>,
    bit_rate_drop: Option<(u64, u32)>,
    /// Number of `release()` calls.
    releases: Arc<AtomicUsize>,
    /// Every configuration applied, in order.
    configurations: Arc<Mutex<Vec<EncoderConfig>>>,
}

impl Default for SyntheticEncoder {
    fn default() -> Self {
        Self {
            codec_name: SYNTHETIC_CODEC_NAME.to_string(),
            config: None,
            bit_rate: 0,
            frames_encoded: 0,
            pts_base_us: 0,
            delay_one_frame: false,
            held_back: None,
            bit_rate_drop: None,
            releases: Arc::new(AtomicUsize::new(0)),
            configurations: Arc::new(Mutex::new(Vec::new())),
        }
    }
}

impl SyntheticEncoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Announces `name` on the video channel instead of
    /// [`SYNTHETIC_CODEC_NAME`].
    pub fn with_codec_name(mut self, name: impl Into<String>) -> Self {
        self.codec_name = name.into();
        self
    }

    /// Emits every packet one frame late.
    pub fn with_frame_delay(mut self) -> Self {
        self.delay_one_frame = true;
        self
    }

    /// Starts presentation timestamps at `pts_base_us`.
    pub fn with_pts_base(mut self, pts_base_us: i64) -> Self {
        self.pts_base_us = pts_base_us;
        self
    }

    /// Lowers the reported bit rate to `rate` when encoding the frame with
    /// zero-based index `at_frame`.
    pub fn with_bit_rate_drop(mut self, at_frame: u64, rate: u32) -> Self {
        self.bit_rate_drop = Some((at_frame, rate));
        self
    }

    /// Handle counting `release()` calls.
    pub fn release_counter(&self) -> Arc<AtomicUsize> {
        Arc::clone(&self.releases)
    }

    /// Handle to the list of applied configurations.
    pub fn configurations(&self) -> Arc<Mutex<Vec<EncoderConfig>>> {
        Arc::clone(&self.configurations)
    }
}

impl VideoEncoder for SyntheticEncoder {
    fn codec_name(&self) -> &str {
        &self.codec_name
    }

    fn configure(&mut self, config: EncoderConfig) -> Result<(), EncoderError> {
        if config.size.is_empty() {
            return Err(EncoderError::Configure(format!(
                "cannot encode {}x{} frames",
                config.size.width, config.size.height
            )));
        }
        self.config = Some(config);
        self.bit_rate = config.bit_rate;
        self.configurations
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(config);
        Ok(())
    }

    fn encode(&mut self, frame: &RawFrame) -> Result<Vec<EncodedPacket>, EncoderError> {
        let Some(config) = self.config else {
            return Err(EncoderError::Encode("encoder is not configured".to_string()));
        };
        if let Some((at_frame, rate)) = self.bit_rate_drop {
            if self.frames_encoded == at_frame {
                self.bit_rate = rate.min(self.bit_rate);
            }
        }

        let index = self.frames_encoded;
        self.frames_encoded += 1;
        let mut data = Vec::with_capacity(16 + frame.data.len());
        data.extend_from_slice(&index.to_le_bytes());
        data.extend_from_slice(&config.size.width.to_le_bytes());
        data.extend_from_slice(&config.size.height.to_le_bytes());
        data.extend_from_slice(&frame.data);
        let packet = EncodedPacket {
            data,
            pts_us: Some(self.pts_base_us + index as i64 * FRAME_INTERVAL_US),
            origination_timestamp_us: frame.captured_at_us,
        };

        if self.delay_one_frame {
            Ok(self.held_back.replace(packet).into_iter().collect())
        } else {
            Ok(vec![packet])
        }
    }

    fn flush(&mut self) -> Result<Vec<EncodedPacket>, EncoderError> {
        Ok(self.held_back.take().into_iter().collect())
    }

    fn bit_rate(&self) -> u32 {
        self.bit_rate
    }

    fn release(&mut self) {
        self.config = None;
        self.held_back = None;
        self.releases.fetch_add(1, Ordering::SeqCst);
    }
}

/// Spawns a task that renders `count` test-pattern frames of `display` size
/// (or frames forever if `count` is `None`), one every `interval`.
///
/// The task stops early when the receiver is dropped.
pub fn spawn_test_pattern(
    display: Size,
    count: Option<u64>,
    interval: Duration,
) -> mpsc::Receiver<RawFrame> {
    let (tx, rx) = mpsc::channel(4);
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        let mut n: u64 = 0;
        while count.map_or(true, |c| n < c) {
            ticker.tick().await;
            let frame = RawFrame {
                display_size: display,
                data: vec![(n % 251) as u8; 64],
                captured_at_us: now_us(),
            };
            if tx.send(frame).await.is_err() {
                break;
            }
            n += 1;
        }
        debug!(frames = n, "test pattern finished");
    });
    rx
}

fn now_us() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.as_micros() as u64)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame() -> RawFrame {
        RawFrame {
            display_size: Size::new(1080, 2400),
            data: vec![7; 4],
            captured_at_us: 42,
        }
    }

    fn configured(encoder: SyntheticEncoder) -> SyntheticEncoder {
        let mut encoder = encoder;
        encoder
            .configure(EncoderConfig {
                size: Size::new(540, 1200),
                bit_rate: 4_000_000,
            })
            .unwrap();
        encoder
    }

    #[test]
    fn test_encode_before_configure_fails() {
        let mut encoder = SyntheticEncoder::new();
        assert!(matches!(encoder.encode(&frame()), Err(EncoderError::Encode(_))));
    }

    #[test]
    fn test_codec_name_defaults_and_overrides() {
        assert_eq!(SyntheticEncoder::new().codec_name(), SYNTHETIC_CODEC_NAME);
        assert_eq!(
            SyntheticEncoder::new().with_codec_name("h264").codec_name(),
            "h264"
        );
    }

    #[test]
    fn test_empty_size_is_rejected() {
        let mut encoder = SyntheticEncoder::new();
        let result = encoder.configure(EncoderConfig {
            size: Size::new(0, 10),
            bit_rate: 1,
        });
        assert!(matches!(result, Err(EncoderError::Configure(_))));
    }

    #[test]
    fn test_pts_advances_from_base() {
        // Arrange
        let mut encoder = configured(SyntheticEncoder::new().with_pts_base(5_000));

        // Act
        let first = encoder.encode(&frame()).unwrap();
        let second = encoder.encode(&frame()).unwrap();

        // Assert
        assert_eq!(first[0].pts_us, Some(5_000));
        assert_eq!(second[0].pts_us, Some(5_000 + FRAME_INTERVAL_US));
        assert_eq!(first[0].origination_timestamp_us, 42);
    }

    #[test]
    fn test_frame_delay_holds_back_until_flush() {
        let mut encoder = configured(SyntheticEncoder::new().with_frame_delay());

        assert!(encoder.encode(&frame()).unwrap().is_empty());
        assert_eq!(encoder.encode(&frame()).unwrap().len(), 1);
        assert_eq!(encoder.flush().unwrap().len(), 1);
        assert!(encoder.flush().unwrap().is_empty());
    }

    #[test]
    fn test_bit_rate_drop_applies_at_chosen_frame() {
        let mut encoder = configured(SyntheticEncoder::new().with_bit_rate_drop(1, 1_000_000));

        encoder.encode(&frame()).unwrap();
        assert_eq!(encoder.bit_rate(), 4_000_000);
        encoder.encode(&frame()).unwrap();
        assert_eq!(encoder.bit_rate(), 1_000_000);
    }

    #[test]
    fn test_configurations_and_releases_are_recorded() {
        let mut encoder = configured(SyntheticEncoder::new());
        let configs = encoder.configurations();
        let releases = encoder.release_counter();

        encoder.release();

        assert_eq!(configs.lock().unwrap().len(), 1);
        assert_eq!(releases.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_test_pattern_produces_requested_frame_count() {
        let mut rx = spawn_test_pattern(Size::new(100, 200), Some(3), Duration::from_millis(1));
        let mut received = 0;
        while let Some(frame) = rx.recv().await {
            assert_eq!(frame.display_size, Size::new(100, 200));
            received += 1;
        }
        assert_eq!(received, 3);
    }
}

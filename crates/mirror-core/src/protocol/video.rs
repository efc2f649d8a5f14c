//! Video channel framing.
//!
//! The video channel starts with a channel header naming the codec, followed
//! by a stream of packets.  Each packet is a fixed 40-byte header and the
//! encoder payload it describes:
//!
//! ```text
//! channel header:  ['V'][codec name, space-padded to 20 bytes]
//!
//! packet header (little-endian):
//!   0  width                     u32
//!   4  height                    u32
//!   8  orientation               u8   quadrant 0-3, clockwise
//!   9  orientation_correction    u8
//!  10  flags                     u16  DISPLAY_ROUND | BIT_RATE_REDUCED
//!  12  bit_rate                  u32  bits per second, 0 if unknown
//!  16  frame_number              u32  starts at 1 for every connection
//!  20  origination_timestamp_us  u64  wall-clock capture time
//!  28  presentation_timestamp_us u64  normalized encoder PTS
//!  36  payload_size              u32
//! ```

use serde::{Deserialize, Serialize};

use crate::domain::geometry::Size;
use crate::protocol::codec::ProtocolError;

/// Size of an encoded [`VideoPacketHeader`].
pub const VIDEO_HEADER_SIZE: usize = 40;

/// Largest payload a receiver accepts; checked before allocating.
pub const MAX_PAYLOAD_SIZE: usize = 16 * 1024 * 1024;

/// Width of the space-padded codec name that follows the video role byte.
pub const CODEC_NAME_LENGTH: usize = 20;

/// First byte written on the video channel.
pub const VIDEO_CHANNEL_MARKER: u8 = b'V';

/// First (and only handshake) byte written on the control channel.
pub const CONTROL_CHANNEL_MARKER: u8 = b'C';

/// Bits of [`VideoPacketHeader::flags`].
pub mod flags {
    /// The device display is round.
    pub const DISPLAY_ROUND: u16 = 0x01;
    /// The encoder lowered its bit rate before producing this packet.
    pub const BIT_RATE_REDUCED: u16 = 0x02;
}

/// Metadata preceding every encoded video payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct VideoPacketHeader {
    /// Size of the encoded image in device pixels.
    pub width: u32,
    pub height: u32,
    /// Display orientation quadrant at the time the frame was rendered.
    pub orientation: u8,
    /// Rotation the viewer must apply to compensate for a sideways encoder.
    pub orientation_correction: u8,
    pub flags: u16,
    pub bit_rate: u32,
    pub frame_number: u32,
    pub origination_timestamp_us: u64,
    pub presentation_timestamp_us: u64,
    pub payload_size: u32,
}

impl VideoPacketHeader {
    /// Returns the encoded image size.
    pub fn display_size(&self) -> Size {
        Size::new(self.width, self.height)
    }

    /// Returns `true` if the encoder reduced its bit rate for this packet.
    pub fn is_bit_rate_reduced(&self) -> bool {
        self.flags & flags::BIT_RATE_REDUCED != 0
    }

    /// Serializes the header into its fixed wire layout.
    pub fn encode(&self) -> [u8; VIDEO_HEADER_SIZE] {
        let mut buf = [0u8; VIDEO_HEADER_SIZE];
        buf[0..4].copy_from_slice(&self.width.to_le_bytes());
        buf[4..8].copy_from_slice(&self.height.to_le_bytes());
        buf[8] = self.orientation;
        buf[9] = self.orientation_correction;
        buf[10..12].copy_from_slice(&self.flags.to_le_bytes());
        buf[12..16].copy_from_slice(&self.bit_rate.to_le_bytes());
        buf[16..20].copy_from_slice(&self.frame_number.to_le_bytes());
        buf[20..28].copy_from_slice(&self.origination_timestamp_us.to_le_bytes());
        buf[28..36].copy_from_slice(&self.presentation_timestamp_us.to_le_bytes());
        buf[36..40].copy_from_slice(&self.payload_size.to_le_bytes());
        buf
    }

    /// Parses a header from the first [`VIDEO_HEADER_SIZE`] bytes of `bytes`.
    ///
    /// # Errors
    ///
    /// - [`ProtocolError::InsufficientData`] if `bytes` is too short.
    /// - [`ProtocolError::MalformedPayload`] if the orientation is not 0-3.
    /// - [`ProtocolError::PayloadTooLarge`] if `payload_size` exceeds
    ///   [`MAX_PAYLOAD_SIZE`].
    ///
    /// # Examples
    ///
    /// ```rust
    /// use mirror_core::protocol::video::VideoPacketHeader;
    ///
    /// let header = VideoPacketHeader { width: 1080, height: 2400, frame_number: 1, ..Default::default() };
    /// assert_eq!(VideoPacketHeader::decode(&header.encode()).unwrap(), header);
    /// ```
    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        if bytes.len() < VIDEO_HEADER_SIZE {
            return Err(ProtocolError::InsufficientData {
                needed: VIDEO_HEADER_SIZE,
                available: bytes.len(),
            });
        }
        let orientation = bytes[8];
        if orientation > 3 {
            return Err(ProtocolError::MalformedPayload(format!(
                "orientation {orientation} is not 0-3"
            )));
        }
        let header = Self {
            width: read_u32(bytes, 0),
            height: read_u32(bytes, 4),
            orientation,
            orientation_correction: bytes[9],
            flags: u16::from_le_bytes([bytes[10], bytes[11]]),
            bit_rate: read_u32(bytes, 12),
            frame_number: read_u32(bytes, 16),
            origination_timestamp_us: read_u64(bytes, 20),
            presentation_timestamp_us: read_u64(bytes, 28),
            payload_size: read_u32(bytes, 36),
        };
        if header.payload_size as usize > MAX_PAYLOAD_SIZE {
            return Err(ProtocolError::PayloadTooLarge {
                declared: header.payload_size as usize,
                max: MAX_PAYLOAD_SIZE,
            });
        }
        Ok(header)
    }
}

/// Builds the bytes that open a video channel: the role byte followed by the
/// codec name padded with spaces.
///
/// # Errors
///
/// Returns [`ProtocolError::MalformedPayload`] if the codec name is empty,
/// not ASCII, or longer than [`CODEC_NAME_LENGTH`].
pub fn encode_video_channel_header(
    codec_name: &str,
) -> Result<[u8; CODEC_NAME_LENGTH + 1], ProtocolError> {
    if codec_name.is_empty() || !codec_name.is_ascii() || codec_name.len() > CODEC_NAME_LENGTH {
        return Err(ProtocolError::MalformedPayload(format!(
            "invalid codec name {codec_name:?}"
        )));
    }
    let mut buf = [b' '; CODEC_NAME_LENGTH + 1];
    buf[0] = VIDEO_CHANNEL_MARKER;
    buf[1..=codec_name.len()].copy_from_slice(codec_name.as_bytes());
    Ok(buf)
}

/// Parses the space-padded codec name that follows the video role byte.
///
/// # Errors
///
/// Returns [`ProtocolError::MalformedPayload`] if the name is blank or not ASCII.
pub fn decode_codec_name(bytes: &[u8; CODEC_NAME_LENGTH]) -> Result<String, ProtocolError> {
    if !bytes.is_ascii() {
        return Err(ProtocolError::MalformedPayload(
            "codec name is not ASCII".to_string(),
        ));
    }
    let name = String::from_utf8_lossy(bytes).trim_end().to_string();
    if name.is_empty() {
        return Err(ProtocolError::MalformedPayload("codec name is blank".to_string()));
    }
    Ok(name)
}

fn read_u32(buf: &[u8], offset: usize) -> u32 {
    u32::from_le_bytes([buf[offset], buf[offset + 1], buf[offset + 2], buf[offset + 3]])
}

fn read_u64(buf: &[u8], offset: usize) -> u64 {
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&buf[offset..offset + 8]);
    u64::from_le_bytes(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_header() -> VideoPacketHeader {
        VideoPacketHeader {
            width: 1080,
            height: 2400,
            orientation: 1,
            orientation_correction: 0,
            flags: flags::BIT_RATE_REDUCED,
            bit_rate: 4_000_000,
            frame_number: 17,
            origination_timestamp_us: 1_700_000_000_000_000,
            presentation_timestamp_us: 33_334,
            payload_size: 1234,
        }
    }

    #[test]
    fn test_header_round_trip() {
        let header = sample_header();
        assert_eq!(VideoPacketHeader::decode(&header.encode()).unwrap(), header);
    }

    #[test]
    fn test_header_layout_is_little_endian() {
        // Arrange
        let header = sample_header();

        // Act
        let bytes = header.encode();

        // Assert
        assert_eq!(&bytes[0..4], &[0x38, 0x04, 0, 0], "1080 = 0x0438");
        assert_eq!(bytes[8], 1);
        assert_eq!(&bytes[10..12], &[0x02, 0x00]);
        assert_eq!(&bytes[16..20], &[17, 0, 0, 0]);
        assert_eq!(&bytes[36..40], &1234u32.to_le_bytes());
    }

    #[test]
    fn test_short_header_is_insufficient_data() {
        let err = VideoPacketHeader::decode(&[0u8; 39]).unwrap_err();
        assert_eq!(
            err,
            ProtocolError::InsufficientData {
                needed: 40,
                available: 39
            }
        );
    }

    #[test]
    fn test_oversized_payload_rejected() {
        let header = VideoPacketHeader {
            payload_size: MAX_PAYLOAD_SIZE as u32 + 1,
            ..sample_header()
        };
        let err = VideoPacketHeader::decode(&header.encode()).unwrap_err();
        assert!(matches!(err, ProtocolError::PayloadTooLarge { .. }));
    }

    #[test]
    fn test_invalid_orientation_rejected() {
        let mut bytes = sample_header().encode();
        bytes[8] = 4;
        let err = VideoPacketHeader::decode(&bytes).unwrap_err();
        assert!(matches!(err, ProtocolError::MalformedPayload(_)));
    }

    #[test]
    fn test_bit_rate_reduced_flag() {
        assert!(sample_header().is_bit_rate_reduced());
        assert!(!VideoPacketHeader::default().is_bit_rate_reduced());
    }

    #[test]
    fn test_channel_header_pads_codec_name() {
        // Act
        let bytes = encode_video_channel_header("avc").unwrap();

        // Assert
        assert_eq!(bytes[0], b'V');
        assert_eq!(&bytes[1..4], b"avc");
        assert!(bytes[4..].iter().all(|b| *b == b' '));
        let mut name = [0u8; CODEC_NAME_LENGTH];
        name.copy_from_slice(&bytes[1..]);
        assert_eq!(decode_codec_name(&name).unwrap(), "avc");
    }

    #[test]
    fn test_channel_header_rejects_long_codec_name() {
        assert!(encode_video_channel_header("a-codec-name-over-twenty").is_err());
        assert!(encode_video_channel_header("").is_err());
    }

    #[test]
    fn test_blank_codec_name_rejected() {
        assert!(decode_codec_name(&[b' '; CODEC_NAME_LENGTH]).is_err());
    }
}

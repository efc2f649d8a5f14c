//! Binary codec for control-channel messages.
//!
//! Wire format:
//! ```text
//! [type:varint][field...]
//! ```
//! Integers are base-128 varints, strings are varint-length-prefixed UTF-8,
//! floats are 4 little-endian bytes.  There is no length prefix around a
//! whole message: each variant has exactly one encoding, so the decoder always
//! knows where a message ends.  That is also why an unknown type tag is fatal;
//! the decoder cannot tell how many bytes to skip.

use thiserror::Error;

use crate::protocol::messages::{
    ControlMessage, KeyAction, KeyEventMessage, MessageType, MotionEventMessage, Pointer,
    StartClipboardSyncMessage,
};
use crate::protocol::varint::{write_f32, write_i32, write_str, write_u32, WireReader};

/// Most pointers a single motion event may carry.
pub const MAX_POINTERS: usize = 32;

/// Most axis values a single pointer may carry.
pub const MAX_AXIS_VALUES: usize = 64;

/// Errors that can occur during message encoding or decoding.
#[derive(Debug, Error, PartialEq)]
pub enum ProtocolError {
    /// The byte slice ended before a complete message or field.
    #[error("insufficient data: need at least {needed} bytes, got {available}")]
    InsufficientData { needed: usize, available: usize },

    /// The message type tag is not a recognized value.
    #[error("unknown message type: {0}")]
    UnknownMessageType(u32),

    /// A field could not be parsed (value out of range, UTF-8 error, etc.).
    #[error("malformed payload: {0}")]
    MalformedPayload(String),

    /// A declared payload size exceeds what the decoder is willing to allocate.
    #[error("payload too large: declared {declared} bytes, limit is {max}")]
    PayloadTooLarge { declared: usize, max: usize },

    /// A varint had more than 32 significant bits.
    #[error("varint does not fit in 32 bits")]
    VarintOverflow,
}

impl ProtocolError {
    /// Returns `true` when more input could turn this failure into a success.
    ///
    /// Stream readers use this to tell "wait for more bytes" apart from a
    /// corrupt stream.
    pub fn is_incomplete(&self) -> bool {
        matches!(self, ProtocolError::InsufficientData { .. })
    }
}

// ── Public API ────────────────────────────────────────────────────────────────

/// Encodes a [`ControlMessage`] into a new byte vector.
///
/// # Examples
///
/// ```rust
/// use mirror_core::protocol::{decode_control_message, encode_control_message};
/// use mirror_core::protocol::messages::ControlMessage;
///
/// let msg = ControlMessage::SetMaxVideoResolution { width: 200, height: 180 };
/// let bytes = encode_control_message(&msg).unwrap();
/// let (decoded, consumed) = decode_control_message(&bytes).unwrap();
/// assert_eq!(decoded, msg);
/// assert_eq!(consumed, bytes.len());
/// ```
///
/// # Errors
///
/// Fails for messages the decoder would refuse: strings longer than
/// [`MAX_COLLECTION_LEN`](crate::protocol::varint::MAX_COLLECTION_LEN) bytes ([`ProtocolError::PayloadTooLarge`]) or more
/// than [`MAX_POINTERS`] pointers or [`MAX_AXIS_VALUES`] axis values
/// ([`ProtocolError::MalformedPayload`]).
pub fn encode_control_message(msg: &ControlMessage) -> Result<Vec<u8>, ProtocolError> {
    let mut buf = Vec::with_capacity(16);
    encode_control_message_into(&mut buf, msg)?;
    Ok(buf)
}

/// Appends the encoding of `msg` to `buf`.
///
/// # Errors
///
/// Same as [`encode_control_message`].  On error `buf` is left as it was.
pub fn encode_control_message_into(
    buf: &mut Vec<u8>,
    msg: &ControlMessage,
) -> Result<(), ProtocolError> {
    let start = buf.len();
    let result = encode_fields(buf, msg);
    if result.is_err() {
        buf.truncate(start);
    }
    result
}

fn encode_fields(buf: &mut Vec<u8>, msg: &ControlMessage) -> Result<(), ProtocolError> {
    write_u32(buf, msg.message_type() as u32);
    match msg {
        ControlMessage::MotionEvent(m) => encode_motion_event(buf, m)?,
        ControlMessage::KeyEvent(m) => encode_key_event(buf, m),
        ControlMessage::TextInput { text } => write_str(buf, text)?,
        ControlMessage::SetDeviceOrientation { orientation } => {
            write_u32(buf, u32::from(*orientation));
        }
        ControlMessage::SetMaxVideoResolution { width, height } => {
            write_u32(buf, *width);
            write_u32(buf, *height);
        }
        ControlMessage::StartVideoStream {
            max_width,
            max_height,
        } => {
            write_u32(buf, *max_width);
            write_u32(buf, *max_height);
        }
        ControlMessage::StopVideoStream | ControlMessage::StopClipboardSync => {}
        ControlMessage::StartClipboardSync(m) => {
            write_u32(buf, m.max_synced_length);
            write_str(buf, &m.text)?;
        }
        // Shifted by one so the physical-state id -1 encodes as a single byte.
        ControlMessage::RequestDeviceState { device_state_id }
        | ControlMessage::DeviceStateNotification { device_state_id } => {
            write_i32(buf, device_state_id.wrapping_add(1));
        }
        ControlMessage::ErrorResponse {
            request_id,
            message,
        } => {
            write_i32(buf, *request_id);
            write_str(buf, message)?;
        }
        ControlMessage::ClipboardChanged { text } => write_str(buf, text)?,
    }
    Ok(())
}

/// Decodes one [`ControlMessage`] from the beginning of `bytes`.
///
/// Returns the decoded message and the number of bytes consumed, so the
/// caller can advance their read cursor.
///
/// # Errors
///
/// - [`ProtocolError::InsufficientData`] if `bytes` holds only part of a
///   message; see [`ProtocolError::is_incomplete`].
/// - [`ProtocolError::UnknownMessageType`] for an unrecognized tag.
/// - [`ProtocolError::MalformedPayload`] or [`ProtocolError::VarintOverflow`]
///   for corrupt fields.
pub fn decode_control_message(bytes: &[u8]) -> Result<(ControlMessage, usize), ProtocolError> {
    let mut r = WireReader::new(bytes);
    let tag = r.read_u32()?;
    let msg_type = MessageType::try_from(tag).map_err(|_| ProtocolError::UnknownMessageType(tag))?;
    let msg = decode_payload(msg_type, &mut r)?;
    Ok((msg, r.position()))
}

// ── Payload decoding ──────────────────────────────────────────────────────────

fn decode_payload(
    msg_type: MessageType,
    r: &mut WireReader<'_>,
) -> Result<ControlMessage, ProtocolError> {
    match msg_type {
        MessageType::MotionEvent => decode_motion_event(r).map(ControlMessage::MotionEvent),
        MessageType::KeyEvent => decode_key_event(r).map(ControlMessage::KeyEvent),
        MessageType::TextInput => Ok(ControlMessage::TextInput {
            text: r.read_string()?,
        }),
        MessageType::SetDeviceOrientation => {
            let value = r.read_u32()?;
            let orientation = u8::try_from(value)
                .ok()
                .filter(|q| *q < 4)
                .ok_or_else(|| {
                    ProtocolError::MalformedPayload(format!("orientation {value} is not 0-3"))
                })?;
            Ok(ControlMessage::SetDeviceOrientation { orientation })
        }
        MessageType::SetMaxVideoResolution => Ok(ControlMessage::SetMaxVideoResolution {
            width: r.read_u32()?,
            height: r.read_u32()?,
        }),
        MessageType::StartVideoStream => Ok(ControlMessage::StartVideoStream {
            max_width: r.read_u32()?,
            max_height: r.read_u32()?,
        }),
        MessageType::StopVideoStream => Ok(ControlMessage::StopVideoStream),
        MessageType::StartClipboardSync => {
            let max_synced_length = r.read_u32()?;
            let text = r.read_string()?;
            Ok(ControlMessage::StartClipboardSync(StartClipboardSyncMessage {
                max_synced_length,
                text,
            }))
        }
        MessageType::StopClipboardSync => Ok(ControlMessage::StopClipboardSync),
        MessageType::RequestDeviceState => Ok(ControlMessage::RequestDeviceState {
            device_state_id: r.read_i32()?.wrapping_sub(1),
        }),
        MessageType::ErrorResponse => {
            let request_id = r.read_i32()?;
            let message = r.read_string()?;
            Ok(ControlMessage::ErrorResponse {
                request_id,
                message,
            })
        }
        MessageType::ClipboardChanged => Ok(ControlMessage::ClipboardChanged {
            text: r.read_string()?,
        }),
        MessageType::DeviceStateNotification => Ok(ControlMessage::DeviceStateNotification {
            device_state_id: r.read_i32()?.wrapping_sub(1),
        }),
    }
}

// ── Per-message helpers ───────────────────────────────────────────────────────

fn encode_motion_event(buf: &mut Vec<u8>, m: &MotionEventMessage) -> Result<(), ProtocolError> {
    write_u32(buf, check_count(m.pointers.len(), MAX_POINTERS, "pointer")?);
    for p in &m.pointers {
        write_i32(buf, p.x);
        write_i32(buf, p.y);
        write_i32(buf, p.pointer_id);
        write_u32(buf, check_count(p.axis_values.len(), MAX_AXIS_VALUES, "axis value")?);
        for (axis, value) in &p.axis_values {
            write_i32(buf, *axis);
            write_f32(buf, *value);
        }
    }
    write_i32(buf, m.action);
    write_i32(buf, m.button_state);
    write_i32(buf, m.action_button);
    write_i32(buf, m.display_id);
    Ok(())
}

fn decode_motion_event(r: &mut WireReader<'_>) -> Result<MotionEventMessage, ProtocolError> {
    let count = bounded_count(r, MAX_POINTERS, "pointer")?;
    let mut pointers = Vec::with_capacity(count);
    for _ in 0..count {
        let x = r.read_i32()?;
        let y = r.read_i32()?;
        let pointer_id = r.read_i32()?;
        let axis_count = bounded_count(r, MAX_AXIS_VALUES, "axis value")?;
        let mut axis_values = Vec::with_capacity(axis_count);
        for _ in 0..axis_count {
            axis_values.push((r.read_i32()?, r.read_f32()?));
        }
        pointers.push(Pointer {
            x,
            y,
            pointer_id,
            axis_values,
        });
    }
    Ok(MotionEventMessage {
        pointers,
        action: r.read_i32()?,
        button_state: r.read_i32()?,
        action_button: r.read_i32()?,
        display_id: r.read_i32()?,
    })
}

fn encode_key_event(buf: &mut Vec<u8>, m: &KeyEventMessage) {
    write_u32(buf, m.action as u32);
    write_i32(buf, m.key_code);
    write_i32(buf, m.meta_state);
}

fn decode_key_event(r: &mut WireReader<'_>) -> Result<KeyEventMessage, ProtocolError> {
    let raw_action = r.read_u32()?;
    let action = KeyAction::try_from(raw_action)
        .map_err(|_| ProtocolError::MalformedPayload(format!("unknown key action: {raw_action}")))?;
    Ok(KeyEventMessage {
        action,
        key_code: r.read_i32()?,
        meta_state: r.read_i32()?,
    })
}

fn check_count(count: usize, max: usize, what: &str) -> Result<u32, ProtocolError> {
    if count > max {
        return Err(ProtocolError::MalformedPayload(format!(
            "{count} {what}s exceeds limit {max}"
        )));
    }
    Ok(count as u32)
}

fn bounded_count(r: &mut WireReader<'_>, max: usize, what: &str) -> Result<usize, ProtocolError> {
    let count = r.read_u32()? as usize;
    if count > max {
        return Err(ProtocolError::MalformedPayload(format!(
            "{count} {what}s exceeds limit {max}"
        )));
    }
    Ok(count)
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::messages::{motion_action, motion_axis};
    use crate::protocol::varint::MAX_COLLECTION_LEN;

    fn round_trip(msg: &ControlMessage) -> ControlMessage {
        let encoded = encode_control_message(msg).expect("encode failed");
        let (decoded, consumed) = decode_control_message(&encoded).expect("decode failed");
        assert_eq!(consumed, encoded.len(), "consumed bytes should equal total encoded size");
        decoded
    }

    fn sample_motion_event() -> ControlMessage {
        ControlMessage::MotionEvent(MotionEventMessage {
            pointers: vec![
                Pointer::at(100, 200, 0),
                Pointer {
                    x: 5,
                    y: -3,
                    pointer_id: 1,
                    axis_values: vec![(motion_axis::VSCROLL, -1.0), (motion_axis::HSCROLL, 0.5)],
                },
            ],
            action: motion_action::with_pointer_index(motion_action::POINTER_DOWN, 1),
            button_state: 0,
            action_button: 0,
            display_id: 0,
        })
    }

    // ── Round trips ──────────────────────────────────────────────────────────

    #[test]
    fn test_motion_event_round_trip() {
        let msg = sample_motion_event();
        assert_eq!(round_trip(&msg), msg);
    }

    #[test]
    fn test_motion_event_without_pointers_round_trip() {
        let msg = ControlMessage::MotionEvent(MotionEventMessage {
            pointers: Vec::new(),
            action: motion_action::CANCEL,
            button_state: 1,
            action_button: 1,
            display_id: 2,
        });
        assert_eq!(round_trip(&msg), msg);
    }

    #[test]
    fn test_key_event_round_trip() {
        let msg = ControlMessage::KeyEvent(KeyEventMessage {
            action: KeyAction::DownAndUp,
            key_code: 66,
            meta_state: 0x1000,
        });
        assert_eq!(round_trip(&msg), msg);
    }

    #[test]
    fn test_text_input_round_trip() {
        let msg = ControlMessage::TextInput {
            text: "Привет, 世界".to_string(),
        };
        assert_eq!(round_trip(&msg), msg);
    }

    #[test]
    fn test_set_device_orientation_round_trip() {
        for orientation in 0..4 {
            let msg = ControlMessage::SetDeviceOrientation { orientation };
            assert_eq!(round_trip(&msg), msg);
        }
    }

    #[test]
    fn test_set_max_video_resolution_round_trip() {
        let msg = ControlMessage::SetMaxVideoResolution {
            width: 200,
            height: 180,
        };
        assert_eq!(round_trip(&msg), msg);
    }

    #[test]
    fn test_clipboard_sync_round_trip() {
        let msg = ControlMessage::StartClipboardSync(StartClipboardSyncMessage {
            max_synced_length: 5000,
            text: "copied".to_string(),
        });
        assert_eq!(round_trip(&msg), msg);
        assert_eq!(round_trip(&ControlMessage::StopClipboardSync), ControlMessage::StopClipboardSync);
    }

    #[test]
    fn test_clipboard_changed_round_trip() {
        let msg = ControlMessage::ClipboardChanged {
            text: "from device".to_string(),
        };
        assert_eq!(round_trip(&msg), msg);
    }

    #[test]
    fn test_device_state_physical_id_encodes_in_two_bytes() {
        // Arrange
        let msg = ControlMessage::RequestDeviceState { device_state_id: -1 };

        // Act
        let bytes = encode_control_message(&msg).unwrap();

        // Assert: one byte of tag plus one byte for the shifted id.
        assert_eq!(bytes, [12, 0]);
        assert_eq!(round_trip(&msg), msg);
    }

    #[test]
    fn test_error_response_round_trip() {
        let msg = ControlMessage::ErrorResponse {
            request_id: 7,
            message: "display not found".to_string(),
        };
        assert_eq!(round_trip(&msg), msg);
    }

    #[test]
    fn test_back_to_back_messages_decode_in_order() {
        // Arrange
        let first = ControlMessage::StopVideoStream;
        let second = ControlMessage::SetDeviceOrientation { orientation: 3 };
        let mut bytes = encode_control_message(&first).unwrap();
        encode_control_message_into(&mut bytes, &second).unwrap();

        // Act
        let (a, n) = decode_control_message(&bytes).unwrap();
        let (b, m) = decode_control_message(&bytes[n..]).unwrap();

        // Assert
        assert_eq!(a, first);
        assert_eq!(b, second);
        assert_eq!(n + m, bytes.len());
    }

    // ── Error conditions ─────────────────────────────────────────────────────

    #[test]
    fn test_every_strict_prefix_is_incomplete() {
        let bytes = encode_control_message(&sample_motion_event()).unwrap();
        for len in 0..bytes.len() {
            let err = decode_control_message(&bytes[..len]).unwrap_err();
            assert!(err.is_incomplete(), "prefix of {len} bytes gave {err:?}");
        }
    }

    #[test]
    fn test_unknown_tag_is_hard_error() {
        let err = decode_control_message(&[9, 0, 0]).unwrap_err();
        assert_eq!(err, ProtocolError::UnknownMessageType(9));
        assert!(!err.is_incomplete());
    }

    #[test]
    fn test_orientation_out_of_range_is_malformed() {
        let err = decode_control_message(&[4, 4]).unwrap_err();
        assert!(matches!(err, ProtocolError::MalformedPayload(_)));
    }

    #[test]
    fn test_unknown_key_action_is_malformed() {
        let err = decode_control_message(&[2, 3, 66, 0]).unwrap_err();
        assert!(matches!(err, ProtocolError::MalformedPayload(_)));
    }

    #[test]
    fn test_too_many_pointers_is_malformed() {
        let mut bytes = Vec::new();
        write_u32(&mut bytes, MessageType::MotionEvent as u32);
        write_u32(&mut bytes, (MAX_POINTERS + 1) as u32);
        let err = decode_control_message(&bytes).unwrap_err();
        assert!(matches!(err, ProtocolError::MalformedPayload(_)));
    }

    // ── Encoder limits ───────────────────────────────────────────────────────

    #[test]
    fn test_clipboard_text_at_length_limit_round_trips() {
        let msg = ControlMessage::ClipboardChanged {
            text: "a".repeat(MAX_COLLECTION_LEN),
        };
        assert_eq!(round_trip(&msg), msg);
    }

    #[test]
    fn test_text_over_length_limit_is_rejected_by_encoder() {
        // Arrange
        let oversized = "a".repeat(MAX_COLLECTION_LEN + 1);
        let messages = [
            ControlMessage::ClipboardChanged {
                text: oversized.clone(),
            },
            ControlMessage::TextInput {
                text: oversized.clone(),
            },
            ControlMessage::StartClipboardSync(StartClipboardSyncMessage {
                max_synced_length: 0,
                text: oversized.clone(),
            }),
            ControlMessage::ErrorResponse {
                request_id: 1,
                message: oversized,
            },
        ];

        for msg in &messages {
            // Act
            let err = encode_control_message(msg).unwrap_err();

            // Assert
            assert_eq!(
                err,
                ProtocolError::PayloadTooLarge {
                    declared: MAX_COLLECTION_LEN + 1,
                    max: MAX_COLLECTION_LEN,
                }
            );
        }
    }

    #[test]
    fn test_failed_encode_leaves_buffer_unchanged() {
        let mut buf = encode_control_message(&ControlMessage::StopVideoStream).unwrap();
        let too_many = ControlMessage::MotionEvent(MotionEventMessage {
            pointers: vec![Pointer::at(0, 0, 0); MAX_POINTERS + 1],
            action: motion_action::MOVE,
            button_state: 0,
            action_button: 0,
            display_id: 0,
        });

        let result = encode_control_message_into(&mut buf, &too_many);

        assert!(matches!(result, Err(ProtocolError::MalformedPayload(_))));
        assert_eq!(buf, [MessageType::StopVideoStream as u8]);
    }
}

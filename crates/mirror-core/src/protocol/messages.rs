//! Control-channel message types.
//!
//! Commands flow from the viewer to the device agent; notifications flow the
//! other way.  Every message starts with a varint type tag, so the tag values
//! below are part of the wire format and must never be renumbered.

use serde::{Deserialize, Serialize};

// ── Message type codes ────────────────────────────────────────────────────────

/// Type tag written at the start of every control message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u32)]
pub enum MessageType {
    // Commands (viewer → agent)
    MotionEvent = 1,
    KeyEvent = 2,
    TextInput = 3,
    SetDeviceOrientation = 4,
    SetMaxVideoResolution = 5,
    StartVideoStream = 6,
    StopVideoStream = 7,
    StartClipboardSync = 10,
    StopClipboardSync = 11,
    RequestDeviceState = 12,
    // Responses and notifications (agent → viewer)
    ErrorResponse = 14,
    ClipboardChanged = 16,
    DeviceStateNotification = 18,
}

impl TryFrom<u32> for MessageType {
    type Error = ();

    fn try_from(value: u32) -> Result<Self, ()> {
        match value {
            1 => Ok(MessageType::MotionEvent),
            2 => Ok(MessageType::KeyEvent),
            3 => Ok(MessageType::TextInput),
            4 => Ok(MessageType::SetDeviceOrientation),
            5 => Ok(MessageType::SetMaxVideoResolution),
            6 => Ok(MessageType::StartVideoStream),
            7 => Ok(MessageType::StopVideoStream),
            10 => Ok(MessageType::StartClipboardSync),
            11 => Ok(MessageType::StopClipboardSync),
            12 => Ok(MessageType::RequestDeviceState),
            14 => Ok(MessageType::ErrorResponse),
            16 => Ok(MessageType::ClipboardChanged),
            18 => Ok(MessageType::DeviceStateNotification),
            _ => Err(()),
        }
    }
}

// ── Motion events ─────────────────────────────────────────────────────────────

/// Android `MotionEvent` action codes carried in [`MotionEventMessage::action`].
pub mod motion_action {
    pub const DOWN: i32 = 0;
    pub const UP: i32 = 1;
    pub const MOVE: i32 = 2;
    pub const CANCEL: i32 = 3;
    pub const POINTER_DOWN: i32 = 5;
    pub const POINTER_UP: i32 = 6;
    pub const HOVER_MOVE: i32 = 7;
    pub const SCROLL: i32 = 8;
    /// Bits to shift a pointer index into the action word for
    /// `POINTER_DOWN`/`POINTER_UP`.
    pub const POINTER_INDEX_SHIFT: u32 = 8;

    /// Combines a multi-touch action with the index of the pointer it applies to.
    pub fn with_pointer_index(action: i32, pointer_index: u32) -> i32 {
        action | ((pointer_index as i32) << POINTER_INDEX_SHIFT)
    }
}

/// Axis identifiers used as keys in [`Pointer::axis_values`].
pub mod motion_axis {
    pub const VSCROLL: i32 = 9;
    pub const HSCROLL: i32 = 10;
}

/// One touch point or cursor position, in device pixels.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Pointer {
    pub x: i32,
    pub y: i32,
    pub pointer_id: i32,
    /// Extra axis readings (scroll deltas and similar), keyed by axis id.
    pub axis_values: Vec<(i32, f32)>,
}

impl Pointer {
    /// A pointer with no extra axis values.
    pub fn at(x: i32, y: i32, pointer_id: i32) -> Self {
        Self {
            x,
            y,
            pointer_id,
            axis_values: Vec::new(),
        }
    }
}

/// Touch or mouse input injected on the device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MotionEventMessage {
    pub pointers: Vec<Pointer>,
    /// One of the [`motion_action`] codes, possibly with a pointer index.
    pub action: i32,
    pub button_state: i32,
    pub action_button: i32,
    pub display_id: i32,
}

// ── Key events ────────────────────────────────────────────────────────────────

/// Action of a [`KeyEventMessage`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u32)]
pub enum KeyAction {
    Down = 0,
    Up = 1,
    /// A press immediately followed by a release.
    DownAndUp = 8,
}

impl TryFrom<u32> for KeyAction {
    type Error = ();

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(KeyAction::Down),
            1 => Ok(KeyAction::Up),
            8 => Ok(KeyAction::DownAndUp),
            _ => Err(()),
        }
    }
}

/// A key press or release, using Android key codes and meta-state bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyEventMessage {
    pub action: KeyAction,
    pub key_code: i32,
    pub meta_state: i32,
}

// ── Clipboard ─────────────────────────────────────────────────────────────────

/// Enables clipboard synchronisation and seeds the device clipboard.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StartClipboardSyncMessage {
    /// Longest clipboard text, in characters, the device reports back.
    pub max_synced_length: u32,
    /// Current viewer-side clipboard contents.
    pub text: String,
}

// ── Top-level message enum ────────────────────────────────────────────────────

/// All messages that travel on the control channel.
///
/// Handlers match on this enum exhaustively, so adding a variant forces every
/// dispatch site to decide what to do with it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ControlMessage {
    MotionEvent(MotionEventMessage),
    KeyEvent(KeyEventMessage),
    TextInput { text: String },
    /// Rotates the device display to the given quadrant (0–3, clockwise).
    SetDeviceOrientation { orientation: u8 },
    /// Caps the video resolution; takes effect at the next render pass.
    SetMaxVideoResolution { width: u32, height: u32 },
    StartVideoStream { max_width: u32, max_height: u32 },
    StopVideoStream,
    StartClipboardSync(StartClipboardSyncMessage),
    StopClipboardSync,
    /// Requests a fold state; `-1` returns to the physical state.
    RequestDeviceState { device_state_id: i32 },
    ErrorResponse { request_id: i32, message: String },
    ClipboardChanged { text: String },
    DeviceStateNotification { device_state_id: i32 },
}

impl ControlMessage {
    /// Returns the wire type tag of this message.
    pub fn message_type(&self) -> MessageType {
        match self {
            ControlMessage::MotionEvent(_) => MessageType::MotionEvent,
            ControlMessage::KeyEvent(_) => MessageType::KeyEvent,
            ControlMessage::TextInput { .. } => MessageType::TextInput,
            ControlMessage::SetDeviceOrientation { .. } => MessageType::SetDeviceOrientation,
            ControlMessage::SetMaxVideoResolution { .. } => MessageType::SetMaxVideoResolution,
            ControlMessage::StartVideoStream { .. } => MessageType::StartVideoStream,
            ControlMessage::StopVideoStream => MessageType::StopVideoStream,
            ControlMessage::StartClipboardSync(_) => MessageType::StartClipboardSync,
            ControlMessage::StopClipboardSync => MessageType::StopClipboardSync,
            ControlMessage::RequestDeviceState { .. } => MessageType::RequestDeviceState,
            ControlMessage::ErrorResponse { .. } => MessageType::ErrorResponse,
            ControlMessage::ClipboardChanged { .. } => MessageType::ClipboardChanged,
            ControlMessage::DeviceStateNotification { .. } => {
                MessageType::DeviceStateNotification
            }
        }
    }

    /// Returns `true` for messages the agent sends to the viewer.
    pub fn is_notification(&self) -> bool {
        matches!(
            self,
            ControlMessage::ErrorResponse { .. }
                | ControlMessage::ClipboardChanged { .. }
                | ControlMessage::DeviceStateNotification { .. }
        )
    }
}

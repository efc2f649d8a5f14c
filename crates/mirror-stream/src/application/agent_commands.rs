//! Agent-side handling of viewer commands.
//!
//! [`AgentCommandHandler`] is the [`CommandHandler`] installed on the agent's
//! control channel.  It owns no I/O: render commands update the shared
//! [`RenderSettings`] that the video loop samples on its next pass, clipboard
//! commands update the sync state, and device-state requests are answered
//! with a reply message the control channel sends back.
//!
//! Input events (motion, key, text) are where a real agent would inject input
//! into the device.  Here they are traced only.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use mirror_core::protocol::varint::MAX_COLLECTION_LEN;
use mirror_core::{ControlMessage, Size};
use tracing::{debug, info, trace, warn};

use super::control_channel::CommandHandler;
use super::video_transport::RenderSettings;

#[derive(Debug, Default)]
struct ClipboardState {
    /// Character limit while sync is enabled; `None` when disabled.
    max_synced_length: Option<usize>,
    /// Last text known to both sides, to suppress echoes.
    last_synced: String,
}

#[derive(Debug, Default)]
struct AgentState {
    clipboard: ClipboardState,
    device_state_id: i32,
}

/// Applies viewer commands to the agent's state.
#[derive(Debug)]
pub struct AgentCommandHandler {
    settings: Arc<RenderSettings>,
    state: Mutex<AgentState>,
}

impl AgentCommandHandler {
    pub fn new(settings: Arc<RenderSettings>) -> Self {
        Self {
            settings,
            state: Mutex::new(AgentState {
                clipboard: ClipboardState::default(),
                device_state_id: -1,
            }),
        }
    }

    pub fn settings(&self) -> &Arc<RenderSettings> {
        &self.settings
    }

    /// Current device state id; -1 is the physical state.
    pub fn device_state_id(&self) -> i32 {
        self.lock().device_state_id
    }

    /// Returns `true` while clipboard sync is enabled.
    pub fn is_clipboard_sync_enabled(&self) -> bool {
        self.lock().clipboard.max_synced_length.is_some()
    }

    /// Records a change of the device clipboard.
    ///
    /// Returns the `ClipboardChanged` notification to send, or `None` if sync
    /// is disabled or the viewer already has this text.  The text is cut to
    /// the synced length in characters and to what one control message can
    /// carry in bytes.
    pub fn clipboard_changed(&self, text: &str) -> Option<ControlMessage> {
        let mut state = self.lock();
        let limit = state.clipboard.max_synced_length?;
        let text = truncate_bytes(truncate_chars(text, limit), MAX_COLLECTION_LEN);
        if text == state.clipboard.last_synced {
            return None;
        }
        state.clipboard.last_synced = text.to_string();
        Some(ControlMessage::ClipboardChanged {
            text: text.to_string(),
        })
    }

    fn lock(&self) -> MutexGuard<'_, AgentState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl CommandHandler for AgentCommandHandler {
    fn handle(&self, message: &ControlMessage) -> Option<ControlMessage> {
        match message {
            ControlMessage::MotionEvent(event) => {
                trace!(action = event.action, pointers = event.pointers.len(), "motion event");
                None
            }
            ControlMessage::KeyEvent(event) => {
                trace!(action = ?event.action, key_code = event.key_code, "key event");
                None
            }
            ControlMessage::TextInput { text } => {
                trace!(len = text.chars().count(), "text input");
                None
            }
            ControlMessage::SetDeviceOrientation { orientation } => {
                debug!(orientation, "orientation requested");
                self.settings.set_orientation(*orientation);
                None
            }
            ControlMessage::SetMaxVideoResolution { width, height } => {
                debug!(width, height, "max video resolution requested");
                self.settings.set_max_resolution(Size::new(*width, *height));
                None
            }
            ControlMessage::StartVideoStream {
                max_width,
                max_height,
            } => {
                info!("video stream started");
                if *max_width != 0 || *max_height != 0 {
                    self.settings
                        .set_max_resolution(Size::new(*max_width, *max_height));
                }
                self.settings.set_streaming(true);
                None
            }
            ControlMessage::StopVideoStream => {
                info!("video stream stopped");
                self.settings.set_streaming(false);
                None
            }
            ControlMessage::StartClipboardSync(sync) => {
                let mut state = self.lock();
                let limit = sync.max_synced_length as usize;
                state.clipboard.max_synced_length = Some(limit);
                state.clipboard.last_synced = truncate_chars(&sync.text, limit).to_string();
                debug!(max_synced_length = limit, "clipboard sync enabled");
                None
            }
            ControlMessage::StopClipboardSync => {
                self.lock().clipboard = ClipboardState::default();
                debug!("clipboard sync disabled");
                None
            }
            ControlMessage::RequestDeviceState { device_state_id } => {
                self.lock().device_state_id = *device_state_id;
                debug!(device_state_id, "device state requested");
                Some(ControlMessage::DeviceStateNotification {
                    device_state_id: *device_state_id,
                })
            }
            ControlMessage::ErrorResponse { .. }
            | ControlMessage::ClipboardChanged { .. }
            | ControlMessage::DeviceStateNotification { .. } => {
                warn!(kind = ?message.message_type(), "viewer sent a notification; ignored");
                None
            }
        }
    }
}

/// Returns the longest prefix of `text` that fits in `max_bytes` without
/// splitting a character.
fn truncate_bytes(text: &str, max_bytes: usize) -> &str {
    if text.len() <= max_bytes {
        return text;
    }
    let mut end = max_bytes;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    &text[..end]
}

/// Returns the first `max_chars` characters of `text`.
fn truncate_chars(text: &str, max_chars: usize) -> &str {
    match text.char_indices().nth(max_chars) {
        Some((end, _)) => &text[..end],
        None => text,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mirror_core::protocol::messages::StartClipboardSyncMessage;

    fn handler() -> AgentCommandHandler {
        AgentCommandHandler::new(Arc::new(RenderSettings::new(Size::default())))
    }

    fn start_sync(max: u32, text: &str) -> ControlMessage {
        ControlMessage::StartClipboardSync(StartClipboardSyncMessage {
            max_synced_length: max,
            text: text.to_string(),
        })
    }

    #[test]
    fn test_render_commands_update_settings() {
        // Arrange
        let handler = handler();

        // Act
        handler.handle(&ControlMessage::SetMaxVideoResolution {
            width: 200,
            height: 180,
        });
        handler.handle(&ControlMessage::SetDeviceOrientation { orientation: 3 });
        handler.handle(&ControlMessage::StopVideoStream);

        // Assert
        let state = handler.settings().current();
        assert_eq!(state.max_resolution, Size::new(200, 180));
        assert_eq!(state.orientation, 3);
        assert!(!state.streaming);
    }

    #[test]
    fn test_start_video_stream_resumes_and_applies_cap() {
        let handler = handler();
        handler.handle(&ControlMessage::StopVideoStream);

        handler.handle(&ControlMessage::StartVideoStream {
            max_width: 720,
            max_height: 1280,
        });

        let state = handler.settings().current();
        assert!(state.streaming);
        assert_eq!(state.max_resolution, Size::new(720, 1280));
    }

    #[test]
    fn test_device_state_request_is_answered() {
        let handler = handler();
        let reply = handler.handle(&ControlMessage::RequestDeviceState { device_state_id: 2 });
        assert_eq!(
            reply,
            Some(ControlMessage::DeviceStateNotification { device_state_id: 2 })
        );
        assert_eq!(handler.device_state_id(), 2);
    }

    #[test]
    fn test_clipboard_change_ignored_until_sync_starts() {
        let handler = handler();
        assert_eq!(handler.clipboard_changed("hello"), None);
    }

    #[test]
    fn test_clipboard_change_is_truncated_in_characters() {
        // Arrange
        let handler = handler();
        handler.handle(&start_sync(3, ""));

        // Act
        let message = handler.clipboard_changed("héllo");

        // Assert
        assert_eq!(
            message,
            Some(ControlMessage::ClipboardChanged {
                text: "hél".to_string()
            })
        );
    }

    #[test]
    fn test_clipboard_change_fits_in_one_control_message() {
        // Arrange: a character limit far above the byte limit.
        let handler = handler();
        handler.handle(&start_sync(u32::MAX, ""));
        let at_limit = "a".repeat(MAX_COLLECTION_LEN);
        let over_limit = format!("{}é", "b".repeat(MAX_COLLECTION_LEN - 1));

        // Act
        let kept = handler.clipboard_changed(&at_limit);
        let cut = handler.clipboard_changed(&over_limit);

        // Assert
        assert_eq!(kept, Some(ControlMessage::ClipboardChanged { text: at_limit }));
        let Some(ControlMessage::ClipboardChanged { text }) = cut else {
            panic!("expected a clipboard notification, got {cut:?}");
        };
        assert_eq!(text, "b".repeat(MAX_COLLECTION_LEN - 1));
        assert!(mirror_core::encode_control_message(&ControlMessage::ClipboardChanged { text })
            .is_ok());
    }

    #[test]
    fn test_truncate_bytes_never_splits_a_character() {
        assert_eq!(truncate_bytes("héllo", 2), "h");
        assert_eq!(truncate_bytes("héllo", 3), "hé");
        assert_eq!(truncate_bytes("abc", 10), "abc");
    }

    #[test]
    fn test_clipboard_text_from_viewer_is_not_echoed() {
        let handler = handler();
        handler.handle(&start_sync(100, "shared"));
        assert_eq!(handler.clipboard_changed("shared"), None);
        assert!(handler.clipboard_changed("new").is_some());
        assert_eq!(handler.clipboard_changed("new"), None);
    }

    #[test]
    fn test_stop_clipboard_sync_disables_notifications() {
        let handler = handler();
        handler.handle(&start_sync(100, ""));
        handler.handle(&ControlMessage::StopClipboardSync);
        assert!(!handler.is_clipboard_sync_enabled());
        assert_eq!(handler.clipboard_changed("x"), None);
    }

    #[test]
    fn test_notification_from_viewer_has_no_reply() {
        let handler = handler();
        let reply = handler.handle(&ControlMessage::ClipboardChanged {
            text: "x".to_string(),
        });
        assert_eq!(reply, None);
    }
}

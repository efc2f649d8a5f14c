//! Protocol module containing control messages, the video framing, and the
//! codecs for both channels.

pub mod codec;
pub mod messages;
pub mod sequence;
pub mod varint;
pub mod video;

pub use codec::{
    decode_control_message, encode_control_message, encode_control_message_into, ProtocolError,
};
pub use messages::*;
pub use sequence::{FrameCounter, PtsNormalizer};
pub use video::{VideoPacketHeader, VIDEO_HEADER_SIZE};

// Message domain types and the framed wire codec

pub mod codec;
pub mod types;

pub use codec::{
    decode_frame, encode_frame, AckStatus, Frame, ProtocolError, ReactionOp, ReceiptEntry,
    ReceiptStatus, WireMessage, MAX_FRAME_SIZE, PROTOCOL_VERSION,
};
pub use types::{
    derive_session_id, new_message_id, now_ms, ContentType, Message, MessageStatus, Priority,
    Session,
};

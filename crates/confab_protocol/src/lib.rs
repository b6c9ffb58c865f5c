#![forbid(unsafe_code)]

pub mod framing;
pub mod wire;

pub use framing::{
	DEFAULT_MAX_FRAME_SIZE, FramingError, decode_frame, encode_frame, encode_frame_default, encode_frame_into,
	frame_len_from_payload_len, try_decode_frame_from_buffer,
};
pub use wire::{
	ClaimIdentity, ConversationReady, Envelope, ErrorReply, Hello, Msg, PROTOCOL_VERSION, Ping, Pong, PresenceUpdate,
	SelectConversation, SendMessage, Welcome, code,
};

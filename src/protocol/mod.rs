//! Protocol definitions for the coordinator serial link.
//!
//! This module contains the low-level protocol types:
//! - Frame encoding and the incremental decoder
//! - Message type constants

pub mod frame;
pub mod message_type;

pub use frame::{
    DecodeState, Decoded, END, ESC, FrameDecoder, MAX_PAYLOAD_SIZE, START, checksum,
    encode as encode_frame, encode_into,
};
pub use message_type::{LOG, MessageType, STATUS};

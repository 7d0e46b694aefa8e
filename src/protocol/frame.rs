//! Frame encoding and decoding for the coordinator serial protocol.
//!
//! The wire format is:
//! ```text
//! ┌───────┬───────────┬─────────────┬──────────┬────────────────┬───────┐
//! │ 0x01  │ type (BE) │ length (BE) │ checksum │    payload     │ 0x03  │
//! │ START │  2 bytes  │   2 bytes   │  1 byte  │ length bytes   │  END  │
//! └───────┴───────────┴─────────────┴──────────┴────────────────┴───────┘
//! ```
//!
//! Everything between `START` and `END` is escaped: a byte below `0x10` is
//! sent as `ESC` followed by the byte XOR `0x10`. The checksum is the XOR of
//! the type, length and payload bytes before escaping.

use bytes::{BufMut, Bytes, BytesMut};

use crate::error::FrameError;
use crate::types::Message;

/// Start-of-frame byte.
pub const START: u8 = 0x01;

/// Escape byte.
pub const ESC: u8 = 0x02;

/// End-of-frame byte.
pub const END: u8 = 0x03;

/// Data bytes below this value are escaped.
pub const ESCAPE_THRESHOLD: u8 = 0x10;

/// Value XOR-ed into an escaped byte.
pub const ESCAPE_MASK: u8 = 0x10;

/// Maximum payload size shared by encoder and decoder.
pub const MAX_PAYLOAD_SIZE: usize = 256;

/// Computes the frame checksum over type, length and payload.
#[must_use]
pub fn checksum(msg_type: u16, payload: &[u8]) -> u8 {
    let length = payload.len() as u16;
    let header = msg_type.to_be_bytes().into_iter().chain(length.to_be_bytes());
    header.chain(payload.iter().copied()).fold(0, |crc, b| crc ^ b)
}

fn put_escaped(buf: &mut BytesMut, byte: u8) {
    if byte < ESCAPE_THRESHOLD {
        buf.put_u8(ESC);
        buf.put_u8(byte ^ ESCAPE_MASK);
    } else {
        buf.put_u8(byte);
    }
}

/// Appends an encoded frame to `buf`.
///
/// # Errors
///
/// Returns [`FrameError::PayloadTooLarge`] if the payload exceeds
/// [`MAX_PAYLOAD_SIZE`]. Nothing is written in that case.
pub fn encode_into(buf: &mut BytesMut, msg_type: u16, payload: &[u8]) -> Result<(), FrameError> {
    if payload.len() > MAX_PAYLOAD_SIZE {
        return Err(FrameError::PayloadTooLarge {
            size: payload.len(),
            max: MAX_PAYLOAD_SIZE,
        });
    }

    // Worst case every byte is escaped
    buf.reserve(2 + 2 * (5 + payload.len()));
    buf.put_u8(START);

    let length = payload.len() as u16;
    for byte in msg_type.to_be_bytes().into_iter().chain(length.to_be_bytes()) {
        put_escaped(buf, byte);
    }
    put_escaped(buf, checksum(msg_type, payload));
    for &byte in payload {
        put_escaped(buf, byte);
    }

    buf.put_u8(END);
    Ok(())
}

/// Encodes a message into a complete frame.
///
/// # Errors
///
/// Returns [`FrameError::PayloadTooLarge`] if the payload exceeds
/// [`MAX_PAYLOAD_SIZE`].
pub fn encode(msg_type: u16, payload: &[u8]) -> Result<Bytes, FrameError> {
    let mut buf = BytesMut::new();
    encode_into(&mut buf, msg_type, payload)?;
    Ok(buf.freeze())
}

/// Receive state of the frame decoder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DecodeState {
    /// Scanning for `START`.
    #[default]
    WaitStart,
    /// Expecting the high byte of the type.
    WaitTypeHi,
    /// Expecting the low byte of the type.
    WaitTypeLo,
    /// Expecting the high byte of the length.
    WaitLenHi,
    /// Expecting the low byte of the length.
    WaitLenLo,
    /// Expecting the checksum.
    WaitChecksum,
    /// Collecting payload bytes until `END`.
    WaitPayload,
}

/// Outcome of feeding one byte to the decoder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decoded {
    /// No complete frame yet.
    Pending,
    /// A frame completed and its checksum matched.
    Message(Message),
    /// A frame was dropped. The decoder is already back in `WaitStart`.
    Rejected(FrameError),
}

/// Incremental, byte-at-a-time frame decoder.
///
/// One decoder belongs to one link. It keeps its state across calls, so
/// bytes may be fed in chunks of any size, including empty ones.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    state: DecodeState,
    in_escape: bool,
    msg_type: u16,
    length: u16,
    checksum: u8,
    payload: Vec<u8>,
}

impl FrameDecoder {
    /// Creates a new frame decoder.
    #[must_use]
    pub fn new() -> Self {
        Self {
            payload: Vec::with_capacity(MAX_PAYLOAD_SIZE),
            ..Self::default()
        }
    }

    /// Returns the current receive state.
    #[must_use]
    pub const fn state(&self) -> DecodeState {
        self.state
    }

    /// Number of payload bytes collected for the frame in progress.
    #[must_use]
    pub fn buffered(&self) -> usize {
        self.payload.len()
    }

    /// Drops any partial frame.
    pub fn reset(&mut self) {
        self.state = DecodeState::WaitStart;
        self.in_escape = false;
        self.msg_type = 0;
        self.length = 0;
        self.checksum = 0;
        self.payload.clear();
    }

    /// Feeds a chunk of raw bytes, returning every completed or rejected frame.
    pub fn feed(&mut self, data: &[u8]) -> Vec<Decoded> {
        data.iter()
            .map(|&byte| self.push(byte))
            .filter(|outcome| !matches!(outcome, Decoded::Pending))
            .collect()
    }

    /// Feeds a single raw byte.
    pub fn push(&mut self, byte: u8) -> Decoded {
        match byte {
            START => {
                // A new frame always wins over a partial one
                self.reset();
                self.state = DecodeState::WaitTypeHi;
                Decoded::Pending
            }
            ESC => {
                self.in_escape = true;
                Decoded::Pending
            }
            END => self.finish(),
            _ => {
                let data = if self.in_escape {
                    self.in_escape = false;
                    byte ^ ESCAPE_MASK
                } else {
                    byte
                };
                self.accept(data)
            }
        }
    }

    fn accept(&mut self, data: u8) -> Decoded {
        match self.state {
            DecodeState::WaitStart => {}
            DecodeState::WaitTypeHi => {
                self.msg_type = u16::from(data) << 8;
                self.state = DecodeState::WaitTypeLo;
            }
            DecodeState::WaitTypeLo => {
                self.msg_type |= u16::from(data);
                self.state = DecodeState::WaitLenHi;
            }
            DecodeState::WaitLenHi => {
                self.length = u16::from(data) << 8;
                self.state = DecodeState::WaitLenLo;
            }
            DecodeState::WaitLenLo => {
                self.length |= u16::from(data);
                if usize::from(self.length) > MAX_PAYLOAD_SIZE {
                    let length = self.length;
                    self.reset();
                    return Decoded::Rejected(FrameError::LengthExceeded {
                        length,
                        max: MAX_PAYLOAD_SIZE,
                    });
                }
                self.state = DecodeState::WaitChecksum;
            }
            DecodeState::WaitChecksum => {
                self.checksum = data;
                self.state = DecodeState::WaitPayload;
            }
            DecodeState::WaitPayload => {
                if self.payload.len() < usize::from(self.length) {
                    self.payload.push(data);
                }
            }
        }
        Decoded::Pending
    }

    fn finish(&mut self) -> Decoded {
        let state = self.state;
        self.state = DecodeState::WaitStart;
        self.in_escape = false;

        let outcome = match state {
            // Stray END outside a frame
            DecodeState::WaitStart => Decoded::Pending,
            DecodeState::WaitPayload if usize::from(self.length) > MAX_PAYLOAD_SIZE => {
                Decoded::Rejected(FrameError::LengthExceeded {
                    length: self.length,
                    max: MAX_PAYLOAD_SIZE,
                })
            }
            DecodeState::WaitPayload if self.payload.len() == usize::from(self.length) => {
                let actual = checksum(self.msg_type, &self.payload);
                if actual == self.checksum {
                    Decoded::Message(Message::new(
                        self.msg_type,
                        Bytes::copy_from_slice(&self.payload),
                    ))
                } else {
                    Decoded::Rejected(FrameError::ChecksumMismatch {
                        expected: self.checksum,
                        actual,
                    })
                }
            }
            _ => Decoded::Rejected(FrameError::Truncated {
                expected: usize::from(self.length),
                got: self.payload.len(),
            }),
        };

        self.payload.clear();
        outcome
    }
}

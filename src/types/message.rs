//! Decoded messages and the payloads the link layer understands.

use bytes::{BufMut, Bytes, BytesMut};

use crate::error::{Error, Result};
use crate::protocol::MessageType;

/// A decoded `(type, payload)` unit.
///
/// Cloning is cheap: the payload is reference counted, so a message handed
/// to both a waiter and a callback is shared rather than re-read from the
/// frame buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    /// Message type.
    pub msg_type: u16,
    /// Unescaped payload.
    pub payload: Bytes,
}

impl Message {
    /// Creates a message.
    #[must_use]
    pub fn new(msg_type: u16, payload: impl Into<Bytes>) -> Self {
        Self {
            msg_type,
            payload: payload.into(),
        }
    }

    /// Returns the well-known type, if this is one.
    #[must_use]
    pub const fn known_type(&self) -> Option<MessageType> {
        MessageType::from_u16(self.msg_type)
    }

    /// Returns true if this is an acknowledgement.
    #[must_use]
    pub const fn is_status(&self) -> bool {
        self.msg_type == MessageType::Status.as_u16()
    }
}

/// Minimum status payload: status, sequence number, original type.
const STATUS_HEADER_LEN: usize = 4;

/// Acknowledgement sent by the coordinator for every host command.
///
/// Format:
/// ```text
/// [status:1] [sequence:1] [original_type:2BE] [detail:...]
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Acknowledgment {
    /// Result code, 0 on success.
    pub status: u8,
    /// Sequence number assigned to the command by the coordinator.
    pub sequence: u8,
    /// Type of the command this acknowledges.
    pub original_type: u16,
    /// Optional error text from the coordinator.
    pub detail: Option<String>,
}

impl Acknowledgment {
    /// Status code for success.
    pub const SUCCESS: u8 = 0;

    /// Reads only the acknowledged type, without allocating.
    #[must_use]
    pub fn peek_original_type(payload: &[u8]) -> Option<u16> {
        match payload {
            [_, _, hi, lo, ..] => Some(u16::from_be_bytes([*hi, *lo])),
            _ => None,
        }
    }

    /// Parses an acknowledgement payload.
    pub fn parse(payload: &[u8]) -> Result<Self> {
        let [status, sequence, hi, lo, detail @ ..] = payload else {
            return Err(Error::Protocol {
                message: format!(
                    "status payload too short: {} bytes, need {STATUS_HEADER_LEN}",
                    payload.len()
                ),
            });
        };

        let text = parse_text(detail);
        Ok(Self {
            status: *status,
            sequence: *sequence,
            original_type: u16::from_be_bytes([*hi, *lo]),
            detail: (!text.is_empty()).then_some(text),
        })
    }

    /// Serializes to the wire payload layout.
    #[must_use]
    pub fn to_payload(&self) -> Bytes {
        let detail = self.detail.as_deref().unwrap_or_default();
        let mut buf = BytesMut::with_capacity(STATUS_HEADER_LEN + detail.len());
        buf.put_u8(self.status);
        buf.put_u8(self.sequence);
        buf.put_u16(self.original_type);
        buf.put_slice(detail.as_bytes());
        buf.freeze()
    }

    /// Returns true if the command was accepted.
    #[must_use]
    pub const fn is_success(&self) -> bool {
        self.status == Self::SUCCESS
    }

    /// Converts a failure status into [`Error::Status`].
    pub fn into_result(self) -> Result<Self> {
        if self.is_success() {
            Ok(self)
        } else {
            Err(Error::Status {
                msg_type: self.original_type,
                status: self.status,
                message: self.detail,
            })
        }
    }
}

/// Log line emitted by the coordinator firmware.
///
/// Format: `[level:1] [text:...]`, level using syslog numbering.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogRecord {
    /// Syslog level, 0 (emergency) to 7 (debug).
    pub level: u8,
    /// Log text.
    pub text: String,
}

impl LogRecord {
    /// Parses a log payload.
    pub fn parse(payload: &[u8]) -> Result<Self> {
        let Some((&level, text)) = payload.split_first() else {
            return Err(Error::Protocol {
                message: "empty log payload".into(),
            });
        };
        Ok(Self {
            level,
            text: parse_text(text),
        })
    }
}

/// Reads text up to the first NUL, replacing invalid UTF-8.
fn parse_text(data: &[u8]) -> String {
    let len = data.iter().position(|&b| b == 0).unwrap_or(data.len());
    String::from_utf8_lossy(&data[..len]).into_owned()
}

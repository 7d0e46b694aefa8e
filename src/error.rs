//! Error types for the zcb-link library.

use thiserror::Error;

/// The main error type for serial link operations.
#[derive(Debug, Error)]
pub enum Error {
    /// Serial port error.
    #[error("serial port error: {0}")]
    Serial(#[from] tokio_serial::Error),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Frame encoding error.
    #[error("frame error: {0}")]
    Frame(#[from] FrameError),

    /// The coordinator acknowledged a command with a failure status.
    #[error("message 0x{msg_type:04x} rejected with status {status}")]
    Status {
        msg_type: u16,
        status: u8,
        message: Option<String>,
    },

    /// Timed out waiting for a message or for the transport.
    #[error("timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    /// Every wait slot is in use.
    #[error("all {capacity} wait slots are busy")]
    Overloaded { capacity: usize },

    /// A handler is already registered for this message type.
    #[error("handler already registered for message 0x{msg_type:04x}")]
    HandlerExists { msg_type: u16 },

    /// No such handler is registered for this message type.
    #[error("no matching handler registered for message 0x{msg_type:04x}")]
    HandlerNotFound { msg_type: u16 },

    /// Baud rate is not one the serial driver can configure.
    #[error("unsupported baud rate: {0}")]
    UnsupportedBaudRate(u32),

    /// Malformed payload of a reserved message type.
    #[error("protocol error: {message}")]
    Protocol { message: String },

    /// Link is not running.
    #[error("not connected")]
    NotConnected,

    /// The reader shut down while a wait was pending.
    #[error("link closed")]
    LinkClosed,
}

impl Error {
    /// Builds a [`Error::Timeout`] for `timeout`.
    #[must_use]
    pub fn timeout(timeout: std::time::Duration) -> Self {
        Self::Timeout {
            timeout_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
        }
    }
}

/// Frame-specific errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum FrameError {
    /// Payload exceeds the protocol maximum.
    #[error("payload too large: {size} bytes exceeds maximum {max}")]
    PayloadTooLarge { size: usize, max: usize },

    /// Declared frame length exceeds the protocol maximum.
    #[error("declared length {length} exceeds maximum {max}")]
    LengthExceeded { length: u16, max: usize },

    /// Frame ended before its declared payload was complete.
    #[error("truncated frame: expected {expected} payload bytes, got {got}")]
    Truncated { expected: usize, got: usize },

    /// Checksum carried in the frame does not match its contents.
    #[error("checksum mismatch: frame carried 0x{expected:02x}, computed 0x{actual:02x}")]
    ChecksumMismatch { expected: u8, actual: u8 },
}

/// Result type alias for serial link operations.
pub type Result<T> = std::result::Result<T, Error>;

//! Data types shared across the link.
//!
//! - Decoded messages and the reserved payloads (acknowledgements, log lines)
//! - Link statistics

pub mod message;
pub mod stats;

pub use message::{Acknowledgment, LogRecord, Message};
pub use stats::{LinkStats, LinkStatsSnapshot};

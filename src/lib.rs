//! # zcb-link
//!
//! Serial transport engine for a Zigbee control bridge coordinator.
//!
//! This library frames messages onto the coordinator's UART, decodes the
//! byte stream coming back, and routes each decoded message to whoever is
//! waiting for it.
//!
//! ## Features
//!
//! - Async/await based API using Tokio
//! - Byte-stuffed framing with checksum and resynchronisation
//! - Commands correlated with their acknowledgements
//! - Per-type callbacks for unsolicited messages, run off the reader task
//!
//! ## Quick Start
//!
//! ```no_run
//! use std::time::Duration;
//!
//! use zcb_link::{Link, LinkConfig, Message, MessageType, SerialConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), zcb_link::Error> {
//!     let link = Link::serial(SerialConfig::new("/dev/ttyUSB0"), LinkConfig::default()).await?;
//!
//!     link.register(MessageType::DeviceAnnounce.as_u16(), |message: &Message| {
//!         println!("device announced: {:02x?}", message.payload);
//!     })?;
//!
//!     let version = link
//!         .request(
//!             MessageType::GetVersion.as_u16(),
//!             &[],
//!             MessageType::VersionList.as_u16(),
//!             Duration::from_secs(1),
//!         )
//!         .await?;
//!     println!("version: {:02x?}", version.payload);
//!
//!     link.stop().await;
//!     Ok(())
//! }
//! ```
//!
//! ## Architecture
//!
//! - [`protocol`] - Frame codec and message types
//! - [`types`] - Messages, acknowledgements and link statistics
//! - [`correlation`] - Wait slots matching replies to waiting callers
//! - [`event`] - Callback registry and dispatch worker
//! - [`transport`] - Transport implementations (currently serial)
//! - [`link`] - The [`Link`] facade tying it together

pub mod correlation;
pub mod error;
pub mod event;
pub mod link;
pub mod protocol;
pub mod transport;
pub mod types;

// Re-exports for convenience
pub use correlation::{PendingWait, WaitTarget};
pub use error::{Error, FrameError, Result};
pub use event::{Handler, HandlerId};
pub use link::{Link, LinkConfig, LinkState};
pub use protocol::{FrameDecoder, MessageType, encode_frame};
pub use transport::{SerialConfig, SerialTransport, Transport, list_ports};
pub use types::{Acknowledgment, LinkStatsSnapshot, LogRecord, Message};

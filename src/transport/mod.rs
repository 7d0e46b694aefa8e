//! Transport layer for the coordinator link.
//!
//! A transport opens a duplex byte stream. The link splits it into a read
//! half owned by the reader task and a write half shared by senders; reads
//! are raced against the link's stop signal, so any tokio stream can be
//! stopped without platform signals.

pub mod serial;

use futures::future::BoxFuture;
use tokio::io::{AsyncRead, AsyncWrite};

use crate::error::Result;

/// Trait for transport implementations.
pub trait Transport: Send {
    /// Stream produced by [`open`](Self::open).
    type Stream: AsyncRead + AsyncWrite + Send + Unpin + 'static;

    /// Opens the device.
    fn open(&mut self) -> BoxFuture<'_, Result<Self::Stream>>;

    /// Human-readable name of the device, used in logs.
    fn name(&self) -> &str;
}

pub use serial::{SerialConfig, SerialTransport, list_ports};

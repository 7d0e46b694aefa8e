//! Serial transport implementation.
//!
//! This module opens the coordinator's UART (usually a USB serial adapter)
//! in raw 8N1 mode.

use std::time::Duration;

use futures::future::BoxFuture;
use tokio::io::AsyncReadExt;
use tokio_serial::{DataBits, FlowControl, Parity, SerialPortBuilderExt, SerialStream, StopBits};

use crate::error::{Error, Result};
use crate::transport::Transport;

/// Default baud rate for the coordinator firmware.
pub const DEFAULT_BAUD_RATE: u32 = 1_000_000;

/// Default connection delay.
pub const DEFAULT_CONNECTION_DELAY: Duration = Duration::from_millis(100);

/// Baud rates the termios layer can configure.
pub const SUPPORTED_BAUD_RATES: &[u32] = &[
    50, 75, 110, 134, 150, 200, 300, 600, 1_200, 1_800, 2_400, 4_800, 9_600, 19_200, 38_400,
    57_600, 115_200, 230_400, 460_800, 500_000, 576_000, 921_600, 1_000_000, 1_152_000, 1_500_000,
    2_000_000, 2_500_000, 3_000_000, 3_500_000, 4_000_000,
];

/// How long to keep draining stale bytes after opening.
const DRAIN_WINDOW: Duration = Duration::from_millis(200);

/// Configuration for serial transport.
#[derive(Debug, Clone)]
pub struct SerialConfig {
    /// Serial port path (e.g., "/dev/ttyUSB0" or "COM3").
    pub port: String,
    /// Baud rate.
    pub baud_rate: u32,
    /// Delay after opening before the link starts.
    pub connection_delay: Duration,
}

impl SerialConfig {
    /// Creates a new serial configuration with default settings.
    #[must_use]
    pub fn new(port: impl Into<String>) -> Self {
        Self {
            port: port.into(),
            baud_rate: DEFAULT_BAUD_RATE,
            connection_delay: DEFAULT_CONNECTION_DELAY,
        }
    }

    /// Sets the baud rate.
    #[must_use]
    pub const fn baud_rate(mut self, rate: u32) -> Self {
        self.baud_rate = rate;
        self
    }

    /// Sets the connection delay.
    #[must_use]
    pub const fn connection_delay(mut self, delay: Duration) -> Self {
        self.connection_delay = delay;
        self
    }

    /// Checks the baud rate against [`SUPPORTED_BAUD_RATES`].
    pub fn validate(&self) -> Result<()> {
        if SUPPORTED_BAUD_RATES.contains(&self.baud_rate) {
            Ok(())
        } else {
            Err(Error::UnsupportedBaudRate(self.baud_rate))
        }
    }
}

/// Serial transport for the coordinator.
#[derive(Debug, Clone)]
pub struct SerialTransport {
    config: SerialConfig,
}

impl SerialTransport {
    /// Creates a new serial transport with the given configuration.
    #[must_use]
    pub const fn new(config: SerialConfig) -> Self {
        Self { config }
    }

    /// Creates a new serial transport for the given port with default settings.
    #[must_use]
    pub fn with_port(port: impl Into<String>) -> Self {
        Self::new(SerialConfig::new(port))
    }

    /// Returns the configuration.
    #[must_use]
    pub const fn config(&self) -> &SerialConfig {
        &self.config
    }

    async fn open_stream(&self) -> Result<SerialStream> {
        self.config.validate()?;

        tracing::info!(
            "opening serial device {} at {}bps",
            self.config.port,
            self.config.baud_rate
        );

        let mut stream = tokio_serial::new(&self.config.port, self.config.baud_rate)
            .data_bits(DataBits::Eight)
            .parity(Parity::None)
            .stop_bits(StopBits::One)
            .flow_control(FlowControl::None)
            .open_native_async()
            .map_err(Error::Serial)?;

        if let Err(e) = tokio_serial::SerialPort::write_request_to_send(&mut stream, false) {
            tracing::warn!("failed to clear RTS: {}", e);
        }

        tokio::time::sleep(self.config.connection_delay).await;

        // Discard whatever the coordinator sent before we were listening
        let mut buf = [0u8; 256];
        let mut drained = 0usize;
        let deadline = tokio::time::Instant::now() + DRAIN_WINDOW;
        while tokio::time::Instant::now() < deadline {
            match tokio::time::timeout(Duration::from_millis(20), stream.read(&mut buf)).await {
                Ok(Ok(n)) if n > 0 => drained += n,
                _ => tokio::time::sleep(Duration::from_millis(10)).await,
            }
        }
        if drained > 0 {
            tracing::debug!("drained {} stale bytes", drained);
        }

        tracing::info!("serial device {} open", self.config.port);
        Ok(stream)
    }
}

impl Transport for SerialTransport {
    type Stream = SerialStream;

    fn open(&mut self) -> BoxFuture<'_, Result<SerialStream>> {
        Box::pin(self.open_stream())
    }

    fn name(&self) -> &str {
        &self.config.port
    }
}

/// Lists available serial ports.
///
/// # Errors
///
/// Returns an error if the port list cannot be retrieved.
pub fn list_ports() -> Result<Vec<String>> {
    let ports = tokio_serial::available_ports().map_err(Error::Serial)?;
    Ok(ports.into_iter().map(|p| p.port_name).collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_serial_config_defaults() {
        let config = SerialConfig::new("/dev/ttyUSB0");
        assert_eq!(config.port, "/dev/ttyUSB0");
        assert_eq!(config.baud_rate, DEFAULT_BAUD_RATE);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_serial_config_builder() {
        let config = SerialConfig::new("/dev/ttyAMA0")
            .baud_rate(115_200)
            .connection_delay(Duration::from_secs(1));
        assert_eq!(config.baud_rate, 115_200);
        assert_eq!(config.connection_delay, Duration::from_secs(1));

        let transport = SerialTransport::new(config);
        assert_eq!(transport.name(), "/dev/ttyAMA0");
    }

    #[test]
    fn test_unsupported_baud_rate() {
        let config = SerialConfig::new("/dev/ttyUSB0").baud_rate(12_345);
        assert!(matches!(
            config.validate(),
            Err(Error::UnsupportedBaudRate(12_345))
        ));
    }

    #[tokio::test]
    async fn test_open_rejects_bad_baud_before_touching_device() {
        let mut transport =
            SerialTransport::new(SerialConfig::new("/dev/does-not-exist").baud_rate(7));
        assert!(matches!(
            transport.open().await,
            Err(Error::UnsupportedBaudRate(7))
        ));
    }

    #[test]
    #[ignore = "Requires /sys/class/tty - not available in sandboxed builds"]
    fn test_list_ports() {
        // Just verify it doesn't panic
        let _ = list_ports();
    }
}

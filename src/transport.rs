//! Register transport capability consumed by [`crate::session::DeviceSession`].
//!
//! The byte framing, function codes and parity handling live behind these
//! traits. The `tokio-modbus` RTU implementation is in [`crate::tokio_common`].

/// Failure of a single transport operation.
#[derive(thiserror::Error, Debug)]
pub enum TransportError {
    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("Device exception: {0}")]
    Exception(String),

    #[error("Protocol error: {0}")]
    Protocol(String),
}

/// A connected link able to read and write single holding registers.
///
/// Dropping the value closes the underlying port handle.
pub trait RegisterTransport {
    fn read_holding_register(&mut self, address: u16) -> Result<u16, TransportError>;

    fn write_holding_register(&mut self, address: u16, value: u16) -> Result<(), TransportError>;
}

/// Opens transports on named serial ports.
pub trait PortConnector {
    type Transport: RegisterTransport;

    /// Names of all locally visible candidate ports, in probing order.
    fn available_ports(&self) -> Result<Vec<String>, TransportError>;

    /// Opens `port` with the fixed link parameters of the device.
    fn open(&mut self, port: &str) -> Result<Self::Transport, TransportError>;
}

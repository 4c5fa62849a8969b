//! `tokio-modbus` RTU implementation of the register transport.
//!
//! Defines the fixed serial link parameters of the F4 and a [`RtuConnector`]
//! that opens synchronous Modbus RTU contexts on named serial ports.
use crate::protocol as proto;
use crate::transport::{PortConnector, RegisterTransport, TransportError};
use std::time::Duration;
use tokio_modbus::prelude::{SyncReader, SyncWriter};

/// The parity used for serial communication.
pub const PARITY: &tokio_serial::Parity = &tokio_serial::Parity::None;
/// The number of stop bits used for serial communication.
pub const STOP_BITS: &tokio_serial::StopBits = &tokio_serial::StopBits::One;
/// The number of data bits used for serial communication.
pub const DATA_BITS: &tokio_serial::DataBits = &tokio_serial::DataBits::Eight;

/// Creates a `tokio_serial::SerialPortBuilder` with the fixed F4 link settings.
///
/// # Arguments
///
/// * `device` - The path to the serial port device (e.g., `/dev/ttyUSB0`).
pub fn serial_port_builder(device: &str) -> tokio_serial::SerialPortBuilder {
    tokio_serial::new(device, proto::BAUD_RATE)
        .parity(*PARITY)
        .stop_bits(*STOP_BITS)
        .data_bits(*DATA_BITS)
        .flow_control(tokio_serial::FlowControl::None)
}

impl From<tokio_modbus::Error> for TransportError {
    fn from(err: tokio_modbus::Error) -> Self {
        match err {
            tokio_modbus::Error::Transport(err) => TransportError::Io(err),
            err => TransportError::Protocol(err.to_string()),
        }
    }
}

impl From<tokio_modbus::ExceptionCode> for TransportError {
    fn from(code: tokio_modbus::ExceptionCode) -> Self {
        TransportError::Exception(code.to_string())
    }
}

/// Helper function to map tokio result to our result.
fn map_tokio_result<T>(result: tokio_modbus::Result<T>) -> Result<T, TransportError> {
    match result {
        Ok(Ok(result)) => Ok(result),
        Ok(Err(err)) => Err(err.into()), // Modbus exception
        Err(err) => Err(err.into()),     // IO error
    }
}

impl RegisterTransport for tokio_modbus::client::sync::Context {
    fn read_holding_register(&mut self, address: u16) -> Result<u16, TransportError> {
        let words = map_tokio_result(self.read_holding_registers(address, 1))?;
        words.first().copied().ok_or_else(|| {
            TransportError::Protocol(format!("empty response reading register {address}"))
        })
    }

    fn write_holding_register(&mut self, address: u16, value: u16) -> Result<(), TransportError> {
        map_tokio_result(self.write_multiple_registers(address, &[value]))
    }
}

/// Opens Modbus RTU contexts at 9600-8N1 with a bounded per-call timeout.
#[derive(Debug, Clone)]
pub struct RtuConnector {
    slave: u8,
    timeout: Duration,
}

impl RtuConnector {
    pub fn new(slave: u8, timeout: Duration) -> Self {
        Self { slave, timeout }
    }
}

impl Default for RtuConnector {
    fn default() -> Self {
        Self::new(proto::DEFAULT_SLAVE_ADDRESS, proto::DEFAULT_TIMEOUT)
    }
}

impl PortConnector for RtuConnector {
    type Transport = tokio_modbus::client::sync::Context;

    fn available_ports(&self) -> Result<Vec<String>, TransportError> {
        let ports = tokio_serial::available_ports()
            .map_err(|err| TransportError::Io(std::io::Error::other(err.to_string())))?;
        Ok(ports.into_iter().map(|port| port.port_name).collect())
    }

    fn open(&mut self, port: &str) -> Result<Self::Transport, TransportError> {
        let mut ctx = tokio_modbus::client::sync::rtu::connect_slave(
            &serial_port_builder(port),
            tokio_modbus::Slave(self.slave),
        )?;
        ctx.set_timeout(self.timeout);
        Ok(ctx)
    }
}

//! Connection state machine and register contract of the F4 controller.
//!
//! A [`DeviceSession`] owns exactly one open port. It probes candidate ports
//! until one answers the input-1 status register, then offers typed register
//! reads and writes. Any transport failure drops the port and moves the
//! session to [`SessionState::Disconnected`]; retrying is left to the caller.
//!
//! ## Example
//!
//! ```no_run
//! use watlow_f4_lib::{session::DeviceSession, tokio_common::RtuConnector};
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     // Probe every local serial port for a controller at slave address 1
//!     let mut session = DeviceSession::connect(RtuConnector::default(), None)?;
//!     println!("Input 1: {}", session.read_temperature()?);
//!     Ok(())
//! }
//! ```

use crate::error::{Error, Operation, Result};
use crate::protocol::{self as proto, Register};
use crate::transport::{PortConnector, RegisterTransport};
use log::*;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Disconnected,
    Probing,
    Connected,
}

/// Exclusive handle on one controller link.
///
/// Not designed for concurrent callers: use one session per physical link.
pub struct DeviceSession<C: PortConnector> {
    connector: C,
    requested_port: Option<String>,
    port: Option<String>,
    transport: Option<C::Transport>,
    state: SessionState,
    uncommitted_writes: usize,
}

impl<C: PortConnector> DeviceSession<C> {
    /// Connects to `port`, or probes every available port when `None`.
    ///
    /// An explicit port is attempted exactly once.
    pub fn connect(connector: C, port: Option<&str>) -> Result<Self> {
        let mut session = Self {
            connector,
            requested_port: port.map(str::to_string),
            port: None,
            transport: None,
            state: SessionState::Disconnected,
            uncommitted_writes: 0,
        };
        session.reconnect()?;
        Ok(session)
    }

    /// Re-runs port discovery with the original port choice.
    pub fn reconnect(&mut self) -> Result<()> {
        self.invalidate();
        self.state = SessionState::Probing;

        let candidates = match &self.requested_port {
            Some(port) => vec![port.clone()],
            None => match self.connector.available_ports() {
                Ok(ports) => ports,
                Err(err) => {
                    self.state = SessionState::Disconnected;
                    return Err(Error::Connection(format!(
                        "Cannot enumerate serial ports: {err}"
                    )));
                }
            },
        };
        if candidates.is_empty() {
            self.state = SessionState::Disconnected;
            error!("No serial ports found on this system");
            return Err(Error::Connection("No serial ports found".to_string()));
        }

        for port in &candidates {
            if let Some(transport) = self.try_port(port) {
                self.transport = Some(transport);
                self.port = Some(port.clone());
                self.state = SessionState::Connected;
                return Ok(());
            }
        }

        self.state = SessionState::Disconnected;
        error!("Controller not found on any of {candidates:?}");
        Err(Error::Connection(format!(
            "Controller not found on {}",
            candidates.join(", ")
        )))
    }

    /// Opens `port` and confirms a controller answers on it. A port that
    /// does not answer is closed before returning.
    fn try_port(&mut self, port: &str) -> Option<C::Transport> {
        debug!("Trying port: {port}");
        let mut transport = match self.connector.open(port) {
            Ok(transport) => transport,
            Err(err) => {
                warn!("Cannot open port {port}: {err}");
                return None;
            }
        };
        match transport.read_holding_register(proto::INPUT_1_VALUE.address) {
            Ok(raw) => {
                let input = proto::decode_value(
                    raw,
                    proto::INPUT_1_VALUE.decimals,
                    proto::INPUT_1_VALUE.signed,
                );
                info!("Connected to controller on port {port}, input 1: {input}");
                Some(transport)
            }
            Err(err) => {
                warn!("No response from controller on port {port}: {err}");
                None
            }
        }
    }

    fn invalidate(&mut self) {
        if self.transport.take().is_some() && self.uncommitted_writes > 0 {
            warn!(
                "Dropping connection with {} uncommitted register writes",
                self.uncommitted_writes
            );
        }
        self.uncommitted_writes = 0;
        self.port = None;
        self.state = SessionState::Disconnected;
    }

    /// Closes the port. Uncommitted writes stay volatile on the device.
    pub fn disconnect(&mut self) {
        if let Some(port) = &self.port {
            info!("Disconnecting from port {port}");
        }
        self.invalidate();
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn is_connected(&self) -> bool {
        self.state == SessionState::Connected
    }

    /// The port the session is bound to while connected.
    pub fn port(&self) -> Option<&str> {
        self.port.as_deref()
    }

    /// Writes issued since the last [`commit`](Self::commit).
    pub fn uncommitted_writes(&self) -> usize {
        self.uncommitted_writes
    }

    fn transport(&mut self) -> Result<&mut C::Transport> {
        self.transport.as_mut().ok_or_else(|| {
            error!("Not connected to controller");
            Error::Connection("Not connected, reconnect required".to_string())
        })
    }

    /// Reads one register and scales it by `10^-decimals`.
    pub fn read_register(&mut self, address: u16, decimals: u8, signed: bool) -> Result<f64> {
        let result = self.transport()?.read_holding_register(address);
        match result {
            Ok(raw) => {
                let value = proto::decode_value(raw, decimals, signed);
                debug!("Read register {address}: {value} (raw {raw})");
                Ok(value)
            }
            Err(source) => {
                error!("Error reading register {address}: {source}");
                self.invalidate();
                Err(Error::DeviceIo {
                    address,
                    operation: Operation::Read,
                    source,
                })
            }
        }
    }

    /// Scales `value` by `10^decimals` and writes it to one register.
    ///
    /// Values that do not fit a register of the given signedness are rejected
    /// before any I/O.
    pub fn write_register(
        &mut self,
        address: u16,
        value: f64,
        decimals: u8,
        signed: bool,
    ) -> Result<()> {
        let raw = proto::encode_value(value, decimals, signed)?;
        let result = self.transport()?.write_holding_register(address, raw);
        match result {
            Ok(()) => {
                debug!("Wrote register {address}: {value} (raw {raw}, decimals {decimals})");
                self.uncommitted_writes += 1;
                Ok(())
            }
            Err(source) => {
                error!("Error writing register {address} with value {value}: {source}");
                self.invalidate();
                Err(Error::DeviceIo {
                    address,
                    operation: Operation::Write,
                    source,
                })
            }
        }
    }

    pub fn read(&mut self, register: &Register) -> Result<f64> {
        trace!("Reading {register}");
        self.read_register(register.address, register.decimals, register.signed)
    }

    pub fn write(&mut self, register: &Register, value: f64) -> Result<()> {
        trace!("Writing {register} = {value}");
        self.write_register(register.address, value, register.decimals, register.signed)
    }

    /// Writes an unscaled code or count.
    pub fn write_code(&mut self, register: &Register, code: u16) -> Result<()> {
        self.write(register, f64::from(code))
    }

    /// Persists all pending changes to EEPROM.
    pub fn commit(&mut self) -> Result<()> {
        self.write_code(&proto::SAVE_CHANGES, 0)?;
        info!("Save changes to EEPROM command sent");
        self.uncommitted_writes = 0;
        Ok(())
    }

    /// Reads the process value of input 1.
    pub fn read_temperature(&mut self) -> Result<f64> {
        let temperature = self.read(&proto::INPUT_1_VALUE)?;
        info!("Read temperature (input 1): {temperature}");
        Ok(temperature)
    }

    /// Writes the static set point 1 and commits it.
    pub fn set_temperature_setpoint(&mut self, temperature: f64) -> Result<()> {
        self.write(&proto::SET_POINT_1, temperature)?;
        info!("Set static temperature setpoint (SP1) to {temperature}");
        self.commit()
    }
}

impl<C: PortConnector> std::fmt::Debug for DeviceSession<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceSession")
            .field("port", &self.port)
            .field("state", &self.state)
            .field("uncommitted_writes", &self.uncommitted_writes)
            .finish()
    }
}


#[cfg(test)]
mod tests {
    use super::mock::*;
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn probes_candidates_until_one_answers() {
        let connector = MockConnector::new(&["COM1", "COM2", "COM3"], &["COM3"]);
        let device = connector.device.clone();

        let session = DeviceSession::connect(connector, None).unwrap();

        assert_eq!(session.state(), SessionState::Connected);
        assert_eq!(session.port(), Some("COM3"));
        let device = device.borrow();
        assert_eq!(device.opened, vec!["COM1", "COM2", "COM3"]);
        assert_eq!(device.closed, vec!["COM1", "COM2"]);
    }

    #[test]
    fn explicit_port_is_attempted_once() {
        let connector = MockConnector::new(&["COM1", "COM2"], &["COM1"]);
        let device = connector.device.clone();

        let result = DeviceSession::connect(connector, Some("COM2"));

        assert_matches!(result, Err(Error::Connection(_)));
        assert_eq!(device.borrow().opened, vec!["COM2"]);
        assert_eq!(device.borrow().closed, vec!["COM2"]);
    }

    #[test]
    fn no_ports_is_a_connection_error() {
        let connector = MockConnector::new(&[], &[]);
        assert_matches!(
            DeviceSession::connect(connector, None),
            Err(Error::Connection(_))
        );
    }

    #[test]
    fn register_values_are_scaled() {
        let (mut session, device) = connected();
        device
            .borrow_mut()
            .registers
            .insert(proto::INPUT_1_VALUE.address, 65424);

        assert_eq!(session.read_temperature().unwrap(), -11.2);
        session.write_register(600, 1.25, 2, false).unwrap();
        assert_eq!(device.borrow().written_to(600), vec![125]);
        assert_eq!(session.uncommitted_writes(), 1);
    }

    #[test]
    fn out_of_range_value_fails_before_io() {
        let (mut session, device) = connected();
        assert_matches!(
            session.write_register(600, 9000.0, 1, false),
            Err(Error::Addressing(proto::Error::ValueOutOfRange { .. }))
        );
        assert!(device.borrow().log.is_empty());
        assert!(session.is_connected());
    }

    #[test]
    fn transport_failure_invalidates_session() {
        let (mut session, device) = connected();
        device.borrow_mut().fail_write_at = Some(1);

        session.write_register(600, 1.0, 0, false).unwrap();
        let err = session.write_register(601, 1.0, 0, false).unwrap_err();
        assert_matches!(
            err,
            Error::DeviceIo {
                address: 601,
                operation: Operation::Write,
                ..
            }
        );
        assert!(err.requires_reconnect());
        assert_eq!(session.state(), SessionState::Disconnected);
        assert_eq!(session.port(), None);
        assert_eq!(device.borrow().closed, vec!["MOCK"]);

        assert_matches!(session.read_temperature(), Err(Error::Connection(_)));

        session.reconnect().unwrap();
        assert!(session.is_connected());
        session.write_register(602, 1.0, 0, false).unwrap();
    }

    #[test]
    fn setpoint_is_committed() {
        let (mut session, device) = connected();
        session.set_temperature_setpoint(150.5).unwrap();
        assert_eq!(
            device.borrow().writes(),
            vec![
                (proto::SET_POINT_1.address, 1505),
                (proto::SAVE_CHANGES.address, 0)
            ]
        );
        assert_eq!(session.uncommitted_writes(), 0);
    }

    #[test]
    fn signed_setpoint_never_wraps() {
        let (mut session, device) = connected();
        assert_matches!(
            session.write(&proto::SET_POINT_1, 4000.0),
            Err(Error::Addressing(proto::Error::ValueOutOfRange { .. }))
        );
        assert!(device.borrow().log.is_empty());

        session.write(&proto::SET_POINT_1, -40.5).unwrap();
        session.write(&proto::SET_POINT_1, 3276.7).unwrap();
        assert_eq!(session.read(&proto::SET_POINT_1).unwrap(), 3276.7);
        assert_eq!(
            device.borrow().written_to(proto::SET_POINT_1.address),
            vec![65131, 32767]
        );
    }
}

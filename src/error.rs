use crate::{program::ValidationError, protocol, transport::TransportError};

/// Which side of the register contract failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Read,
    Write,
}

impl std::fmt::Display for Operation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Operation::Read => write!(f, "read"),
            Operation::Write => write!(f, "write"),
        }
    }
}

/// Errors raised by the device session and the components built on it.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// Invalid indices or values, detected before any I/O.
    #[error(transparent)]
    Addressing(#[from] protocol::Error),

    /// No candidate port answered, or the session is no longer connected.
    #[error("Connection error: {0}")]
    Connection(String),

    /// A single register operation failed. The session is now disconnected.
    #[error("Failed to {operation} register {address}: {source}")]
    DeviceIo {
        address: u16,
        operation: Operation,
        #[source]
        source: TransportError,
    },

    #[error("PID parameters use {given} terms but the device is in {device} mode")]
    UnitModeMismatch {
        given: crate::pid::UnitMode,
        device: crate::pid::UnitMode,
    },

    #[error(transparent)]
    InvalidProgram(#[from] ValidationError),
}

impl Error {
    /// Whether the session must be re-established before the next operation.
    pub fn requires_reconnect(&self) -> bool {
        matches!(self, Error::Connection(_) | Error::DeviceIo { .. })
    }
}

pub type Result<T> = std::result::Result<T, Error>;

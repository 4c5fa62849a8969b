//! A library for programming and tuning the Watlow F4 temperature controller via Modbus.
//!
//! The crate is layered bottom-up:
//!
//! 1.  **Register map** ([`protocol`]): pure addressing rules, engineering
//!     limits and the 16-bit value codec. Invalid indices are rejected here,
//!     before any I/O.
//! 2.  **Device session** ([`session::DeviceSession`]): port discovery, the
//!     read/write register contract and EEPROM commits over any
//!     [`transport::PortConnector`].
//! 3.  **Components** built on a session:
//!     - [`programmer::ProfileProgrammer`] writes a [`program::Program`] into
//!       a device profile.
//!     - [`pid`] reads and writes PID sets with clamping.
//!     - [`tuner::StepResponseTuner`] runs step tests and derives PID sets
//!       with Ziegler-Nichols rules.
//!
//! ## Features
//!
//! - **Strongly-Typed Programs**: Steps are a tagged union, so every encoder
//!   handles every step type.
//! - **Failure Context**: Programming errors report the step and field being
//!   written and can be resumed from that step.
//! - **Deterministic Testing**: Sessions are generic over the transport and
//!   the tuner over a [`clock::Clock`].
//! - **`serde` Support**: Programs and tuning targets can be (de)serialized
//!   with the `serde` feature.
//!
//! ## Quick Start
//!
//! ```no_run
//! use watlow_f4_lib::{
//!     program::{End, EndAction, Program, StepDetail},
//!     programmer::ProfileProgrammer,
//!     session::DeviceSession,
//!     tokio_common::RtuConnector,
//! };
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     // Probe every serial port for the controller
//!     let mut session = DeviceSession::connect(RtuConnector::default(), None)?;
//!     println!("Input 1: {}", session.read_temperature()?);
//!
//!     let program = Program::new(
//!         "Idle",
//!         vec![StepDetail::End(End {
//!             action: EndAction::Idle,
//!             ch1_idle_setpoint: 25.0,
//!             ch2_idle_setpoint: 25.0,
//!         })],
//!     );
//!     ProfileProgrammer::new().configure(&mut session, &program, 1)?;
//!     Ok(())
//! }
//! ```

pub mod clock;
pub mod error;
pub mod pid;
pub mod program;
pub mod programmer;
pub mod protocol;
pub mod session;
pub mod transport;
pub mod tuner;

#[cfg_attr(docsrs, doc(cfg(feature = "tokio-rtu-sync")))]
#[cfg(feature = "tokio-rtu-sync")]
pub mod tokio_common;

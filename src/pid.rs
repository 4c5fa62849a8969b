//! Reading and writing PID parameter sets.
//!
//! Every value is clamped to its engineering limits before it reaches the
//! device. Clamps are reported as [`ClampEvent`]s and logged; they never abort
//! a write.

use crate::error::{Error, Result};
use crate::protocol::{self as proto, OutputSide, ParamSpec};
use crate::session::DeviceSession;
use crate::transport::PortConnector;
use log::*;
use std::fmt;

/// Global PID unit setting of the controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnitMode {
    /// Integral (minutes per repeat) and derivative (minutes).
    Si,
    /// Reset (repeats per minute) and rate (minutes).
    Us,
}

impl UnitMode {
    pub fn decode(value: u16) -> Self {
        if value == 1 {
            UnitMode::Si
        } else {
            UnitMode::Us
        }
    }
}

impl fmt::Display for UnitMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UnitMode::Si => write!(f, "SI"),
            UnitMode::Us => write!(f, "US"),
        }
    }
}

/// The unit-mode dependent pair of a PID set. Only one pair is meaningful
/// at a time.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum PidTerms {
    IntegralDerivative { integral: f64, derivative: f64 },
    ResetRate { reset: f64, rate: f64 },
}

impl PidTerms {
    pub fn unit_mode(&self) -> UnitMode {
        match self {
            PidTerms::IntegralDerivative { .. } => UnitMode::Si,
            PidTerms::ResetRate { .. } => UnitMode::Us,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PidParameters {
    pub proportional_band: f64,
    pub terms: PidTerms,
    pub dead_band: f64,
    pub hysteresis: f64,
}

/// A value corrected to stay within its engineering limits.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ClampEvent {
    pub parameter: &'static str,
    pub original: f64,
    pub clamped: f64,
}

/// Clamps `value` to `spec`, recording an event when it fell outside the
/// limits.
pub(crate) fn clamp_field(spec: &ParamSpec, value: f64, events: &mut Vec<ClampEvent>) -> f64 {
    let clamped = spec.clamp(value);
    if !spec.contains(value) {
        warn!(
            "{} {value} outside [{}, {}], clamped to {clamped}",
            spec.name, spec.min, spec.max
        );
        events.push(ClampEvent {
            parameter: spec.name,
            original: value,
            clamped,
        });
    }
    clamped
}

impl PidParameters {
    pub fn integral(&self) -> Option<f64> {
        match self.terms {
            PidTerms::IntegralDerivative { integral, .. } => Some(integral),
            PidTerms::ResetRate { .. } => None,
        }
    }

    pub fn derivative(&self) -> Option<f64> {
        match self.terms {
            PidTerms::IntegralDerivative { derivative, .. } => Some(derivative),
            PidTerms::ResetRate { .. } => None,
        }
    }

    pub fn reset(&self) -> Option<f64> {
        match self.terms {
            PidTerms::ResetRate { reset, .. } => Some(reset),
            PidTerms::IntegralDerivative { .. } => None,
        }
    }

    pub fn rate(&self) -> Option<f64> {
        match self.terms {
            PidTerms::ResetRate { rate, .. } => Some(rate),
            PidTerms::IntegralDerivative { .. } => None,
        }
    }

    /// Returns a copy with every field within its engineering limits.
    pub fn clamped(&self) -> (PidParameters, Vec<ClampEvent>) {
        let mut events = Vec::new();
        let proportional_band =
            clamp_field(&proto::PROPORTIONAL_BAND, self.proportional_band, &mut events);
        let terms = match self.terms {
            PidTerms::IntegralDerivative {
                integral,
                derivative,
            } => PidTerms::IntegralDerivative {
                integral: clamp_field(&proto::INTEGRAL_SI, integral, &mut events),
                derivative: clamp_field(&proto::DERIVATIVE_SI, derivative, &mut events),
            },
            PidTerms::ResetRate { reset, rate } => PidTerms::ResetRate {
                reset: clamp_field(&proto::RESET_US, reset, &mut events),
                rate: clamp_field(&proto::RATE_US, rate, &mut events),
            },
        };
        let dead_band = clamp_field(&proto::DEAD_BAND, self.dead_band, &mut events);
        let hysteresis = clamp_field(&proto::HYSTERESIS, self.hysteresis, &mut events);
        (
            PidParameters {
                proportional_band,
                terms,
                dead_band,
                hysteresis,
            },
            events,
        )
    }

    /// On/off control: the device ignores the PID terms and uses hysteresis.
    pub fn is_on_off(&self) -> bool {
        self.proportional_band == 0.0
    }
}

impl fmt::Display for PidParameters {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PB={}", self.proportional_band)?;
        match self.terms {
            PidTerms::IntegralDerivative {
                integral,
                derivative,
            } => write!(f, ", integral={integral}, derivative={derivative}")?,
            PidTerms::ResetRate { reset, rate } => write!(f, ", reset={reset}, rate={rate}")?,
        }
        write!(f, ", DB={}, hysteresis={}", self.dead_band, self.hysteresis)
    }
}

/// Outcome of [`DeviceSession::write_pid_parameters`].
#[derive(Debug, Clone, PartialEq, Default)]
pub struct WriteReport {
    pub clamps: Vec<ClampEvent>,
    pub hysteresis_written: bool,
}

impl<C: PortConnector> DeviceSession<C> {
    pub fn read_unit_mode(&mut self) -> Result<UnitMode> {
        let raw = self.read(&proto::PID_UNITS)?;
        let mode = UnitMode::decode(raw as u16);
        info!("PID units mode: {mode}");
        Ok(mode)
    }

    /// Reads one PID set. The term pair read depends on the device unit mode.
    pub fn read_pid_parameters(
        &mut self,
        pid_set: u8,
        channel: u8,
        side: OutputSide,
    ) -> Result<PidParameters> {
        let regs = proto::pid_registers(pid_set, channel, side)?;
        info!("Reading PID parameters for set {pid_set}, channel {channel}, side {side}");

        let proportional_band = self.read(&regs.proportional_band)?;
        let dead_band = self.read(&regs.dead_band)?;
        let hysteresis = self.read(&regs.hysteresis)?;
        let terms = match self.read_unit_mode()? {
            UnitMode::Si => PidTerms::IntegralDerivative {
                integral: self.read(&regs.integral)?,
                derivative: self.read(&regs.derivative)?,
            },
            UnitMode::Us => PidTerms::ResetRate {
                reset: self.read(&regs.reset)?,
                rate: self.read(&regs.rate)?,
            },
        };

        let params = PidParameters {
            proportional_band,
            terms,
            dead_band,
            hysteresis,
        };
        info!("Read PID parameters: {params}");
        Ok(params)
    }

    /// Clamps and writes one PID set, then commits it.
    ///
    /// Writes the proportional band, the unit-mode term pair and the dead
    /// band. Hysteresis is only written when the clamped proportional band is
    /// exactly 0 (on/off control). A failure part way through leaves the set
    /// partially written and uncommitted.
    pub fn write_pid_parameters(
        &mut self,
        params: &PidParameters,
        pid_set: u8,
        channel: u8,
        side: OutputSide,
    ) -> Result<WriteReport> {
        let regs = proto::pid_registers(pid_set, channel, side)?;
        info!("Writing PID for set {pid_set}, channel {channel}, side {side}: {params}");

        let device = self.read_unit_mode()?;
        let given = params.terms.unit_mode();
        if given != device {
            error!("PID parameters are in {given} units but the device uses {device}");
            return Err(Error::UnitModeMismatch { given, device });
        }

        let (clamped, clamps) = params.clamped();
        self.write(&regs.proportional_band, clamped.proportional_band)?;
        match clamped.terms {
            PidTerms::IntegralDerivative {
                integral,
                derivative,
            } => {
                self.write(&regs.integral, integral)?;
                self.write(&regs.derivative, derivative)?;
            }
            PidTerms::ResetRate { reset, rate } => {
                self.write(&regs.reset, reset)?;
                self.write(&regs.rate, rate)?;
            }
        }
        self.write(&regs.dead_band, clamped.dead_band)?;

        let hysteresis_written = clamped.is_on_off();
        if hysteresis_written {
            self.write(&regs.hysteresis, clamped.hysteresis)?;
        } else {
            info!(
                "Hysteresis ({}) not written as proportional band is not 0",
                params.hysteresis
            );
        }

        self.commit()?;
        info!("PID parameters written and saved for set {pid_set}, channel {channel}, side {side}");
        Ok(WriteReport {
            clamps,
            hysteresis_written,
        })
    }
}

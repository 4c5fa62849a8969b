//! Step-response tuning of the controller's PID sets.
//!
//! A step test moves set point 1 from an initial to a final value and records
//! the temperature on a fixed schedule. A first-order-plus-dead-time model is
//! fitted to the trace with the tangent method, and Ziegler-Nichols open-loop
//! rules turn it into PID parameters in the device's own units.
//!
//! ## Example
//!
//! ```no_run
//! use watlow_f4_lib::{
//!     clock::SystemClock,
//!     protocol::OutputSide,
//!     session::DeviceSession,
//!     tokio_common::RtuConnector,
//!     tuner::{DeviceInput, StepResponseTuner, TuningSettings, TuningTarget},
//! };
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let mut session = DeviceSession::connect(RtuConnector::default(), Some("/dev/ttyUSB0"))?;
//!     let tuner = StepResponseTuner::new(SystemClock, TuningSettings::default());
//!     let targets = [TuningTarget::new(50.0, 1, 1, OutputSide::A)];
//!     let report = tuner.tune_targets(&mut session, &mut DeviceInput, &targets);
//!     println!("{} of {} targets tuned", report.tuned().count(), targets.len());
//!     Ok(())
//! }
//! ```

use crate::clock::Clock;
use crate::error::{Error, Result};
use crate::pid::{ClampEvent, PidParameters, PidTerms, UnitMode, WriteReport};
use crate::protocol::{self as proto, OutputSide};
use crate::session::DeviceSession;
use crate::transport::PortConnector;
use log::*;
use std::fmt;
use std::time::Duration;

/// The reaction curve is read as the response to a full 100 % output step.
/// Set point steps are closed loop, so the process gain is an approximation.
pub const ASSUMED_OUTPUT_STEP_PERCENT: f64 = 100.0;
/// Fraction of the total rise that defines the time constant.
const TIME_CONSTANT_FRACTION: f64 = 0.632;
const FALLBACK_PROCESS_GAIN: f64 = 0.1;
const FALLBACK_DEAD_TIME_INTERVALS: f64 = 2.0;
const FALLBACK_TIME_CONSTANT_INTERVALS: f64 = 5.0;
/// Share of the maximum proportional band used while a test is running.
const SAFE_PROPORTIONAL_BAND_FACTOR: f64 = 0.8;

/// Where the tuner reads the process temperature from.
pub trait TemperatureSource<C: PortConnector> {
    fn sample(&mut self, session: &mut DeviceSession<C>) -> Result<f64>;
}

/// An external reference probe read through a closure.
impl<C: PortConnector, F: FnMut() -> f64> TemperatureSource<C> for F {
    fn sample(&mut self, _session: &mut DeviceSession<C>) -> Result<f64> {
        Ok(self())
    }
}

/// The controller's own input 1.
#[derive(Debug, Clone, Copy, Default)]
pub struct DeviceInput;

impl<C: PortConnector> TemperatureSource<C> for DeviceInput {
    fn sample(&mut self, session: &mut DeviceSession<C>) -> Result<f64> {
        session.read_temperature()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum ControllerType {
    P,
    PI,
    #[default]
    PID,
}

impl fmt::Display for ControllerType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ControllerType::P => write!(f, "P"),
            ControllerType::PI => write!(f, "PI"),
            ControllerType::PID => write!(f, "PID"),
        }
    }
}

impl std::str::FromStr for ControllerType {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "P" => Ok(ControllerType::P),
            "PI" => Ok(ControllerType::PI),
            "PID" => Ok(ControllerType::PID),
            other => Err(format!(
                "Unknown controller type '{other}', expected P, PI or PID"
            )),
        }
    }
}

/// Recorded response of one step test. Sample 0 is taken just before the
/// step; the remaining times are relative to the step command.
#[derive(Debug, Clone, PartialEq)]
pub struct StepResponseData {
    time_points: Vec<f64>,
    temperatures: Vec<f64>,
    initial_setpoint: f64,
    final_setpoint: f64,
    duration: Duration,
}

impl StepResponseData {
    /// Builds a trace from `(seconds since step, temperature)` samples.
    pub fn new(
        samples: impl IntoIterator<Item = (f64, f64)>,
        initial_setpoint: f64,
        final_setpoint: f64,
        duration: Duration,
    ) -> Self {
        let (time_points, temperatures) = samples.into_iter().unzip();
        Self {
            time_points,
            temperatures,
            initial_setpoint,
            final_setpoint,
            duration,
        }
    }

    pub fn time_points(&self) -> &[f64] {
        &self.time_points
    }

    pub fn temperatures(&self) -> &[f64] {
        &self.temperatures
    }

    pub fn initial_setpoint(&self) -> f64 {
        self.initial_setpoint
    }

    pub fn final_setpoint(&self) -> f64 {
        self.final_setpoint
    }

    /// Time from the step command to the last sample.
    pub fn duration(&self) -> Duration {
        self.duration
    }

    pub fn len(&self) -> usize {
        self.time_points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.time_points.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum FitQuality {
    Good,
    /// A fallback estimate was used.
    Degraded(String),
}

/// First-order-plus-dead-time model of a step response.
#[derive(Debug, Clone, PartialEq)]
pub struct ReactionCurve {
    pub process_gain: f64,
    /// Seconds.
    pub dead_time: f64,
    /// Seconds.
    pub time_constant: f64,
    /// Degrees per second.
    pub max_slope: f64,
    pub quality: FitQuality,
}

impl ReactionCurve {
    pub fn is_degraded(&self) -> bool {
        matches!(self.quality, FitQuality::Degraded(_))
    }
}

/// Estimates the process gain, dead time and time constant of `data`.
///
/// Never fails: unusable traces produce fallback estimates marked
/// [`FitQuality::Degraded`].
pub fn fit_reaction_curve(data: &StepResponseData, interval: Duration) -> ReactionCurve {
    let interval = interval.as_secs_f64();
    let fallback = |process_gain, max_slope, reason: &str| {
        warn!("Reaction curve fallback: {reason}");
        ReactionCurve {
            process_gain,
            dead_time: interval * FALLBACK_DEAD_TIME_INTERVALS,
            time_constant: interval * FALLBACK_TIME_CONSTANT_INTERVALS,
            max_slope,
            quality: FitQuality::Degraded(reason.to_string()),
        }
    };

    let times = data.time_points();
    let temps = data.temperatures();
    if data.len() < 3 {
        return fallback(
            FALLBACK_PROCESS_GAIN,
            0.0,
            "fewer than 3 samples recorded",
        );
    }

    let initial = temps[0];
    let last = temps[temps.len() - 1];
    let total_rise = last - initial;
    let mut process_gain = total_rise / ASSUMED_OUTPUT_STEP_PERCENT;
    let mut quality = FitQuality::Good;
    if process_gain.abs() < 1e-9 {
        warn!("Process gain {process_gain:.2e} is negligible, using {FALLBACK_PROCESS_GAIN}");
        process_gain = if total_rise < 0.0 {
            -FALLBACK_PROCESS_GAIN
        } else {
            FALLBACK_PROCESS_GAIN
        };
        quality = FitQuality::Degraded("negligible process gain".to_string());
    }

    // Steepest segment between consecutive samples
    let mut max_slope = 0.0f64;
    let mut slope_time = 0.0;
    let mut slope_temp = initial;
    for i in 0..times.len() - 1 {
        let dt = times[i + 1] - times[i];
        if dt < 1e-6 {
            continue;
        }
        let slope = (temps[i + 1] - temps[i]) / dt;
        if slope.abs() > max_slope.abs() {
            max_slope = slope;
            slope_time = times[i];
            slope_temp = temps[i];
        }
    }
    if max_slope.abs() < 1e-6 {
        return fallback(process_gain, max_slope, "maximum slope is near zero");
    }

    let dead_time = (slope_time - (slope_temp - initial) / max_slope).max(0.0);
    // Tangent line value at the end of the dead time.
    let start = slope_temp + max_slope * (dead_time - slope_time);
    let threshold = start + TIME_CONSTANT_FRACTION * (last - start);
    let reached = |temp: f64| {
        if total_rise >= 0.0 {
            temp >= threshold
        } else {
            temp <= threshold
        }
    };

    let time_constant = match times
        .iter()
        .zip(temps)
        .find(|&(&t, &temp)| t >= dead_time && reached(temp))
    {
        Some((&t, _)) => t - dead_time,
        None => {
            debug!("63.2 % point not reached, extrapolating from the maximum slope");
            (last - start) / max_slope
        }
    }
    .max(interval);

    info!(
        "Reaction curve: Kp={process_gain:.4}, L={dead_time:.2}s, T={time_constant:.2}s (max slope {max_slope:.3})"
    );
    ReactionCurve {
        process_gain,
        dead_time,
        time_constant,
        max_slope,
        quality,
    }
}

/// Controller settings before conversion to device units.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ZieglerNichols {
    pub gain: f64,
    pub proportional_band: f64,
    /// Seconds. `None` means no integral action.
    pub integral_time: Option<f64>,
    /// Seconds.
    pub derivative_time: f64,
}

/// Ziegler-Nichols open-loop rules. `None` when `process_gain * dead_time`
/// is too small to divide by.
pub fn ziegler_nichols(
    process_gain: f64,
    dead_time: f64,
    time_constant: f64,
    controller: ControllerType,
) -> Option<ZieglerNichols> {
    let kl = process_gain * dead_time;
    if kl.abs() < 1e-9 {
        return None;
    }
    let (gain, integral_time, derivative_time) = match controller {
        ControllerType::P => (time_constant / kl, None, 0.0),
        ControllerType::PI => (0.9 * time_constant / kl, Some(dead_time / 0.3), 0.0),
        ControllerType::PID => (
            1.2 * time_constant / kl,
            Some(2.0 * dead_time),
            0.5 * dead_time,
        ),
    };
    let proportional_band = if gain == 0.0 {
        proto::PROPORTIONAL_BAND.max
    } else {
        100.0 / gain.abs()
    };
    Some(ZieglerNichols {
        gain,
        proportional_band,
        integral_time,
        derivative_time,
    })
}

/// Converts a fitted curve into clamped PID parameters for `unit_mode`,
/// together with the limits the computed values hit.
pub fn calculate_pids(
    curve: &ReactionCurve,
    unit_mode: UnitMode,
    interval: Duration,
    controller: ControllerType,
) -> (PidParameters, Vec<ClampEvent>) {
    let interval = interval.as_secs_f64();
    let dead_time = curve.dead_time.max(interval / 10.0);
    let time_constant = curve.time_constant.max(interval);

    let (proportional_band, integral_time, derivative_time) =
        match ziegler_nichols(curve.process_gain, dead_time, time_constant, controller) {
            Some(zn) => {
                info!(
                    "Ziegler-Nichols {controller}: gain={:.4}, Ti={:?}, Td={:.2}",
                    zn.gain, zn.integral_time, zn.derivative_time
                );
                (zn.proportional_band, zn.integral_time, zn.derivative_time)
            }
            None => {
                warn!("Kp*L is near zero, using maximum proportional band and minimal I/D action");
                (proto::PROPORTIONAL_BAND.max, None, 0.0)
            }
        };
    let integral_time = integral_time.filter(|ti| *ti > 0.0 && ti.is_finite());

    let terms = match unit_mode {
        UnitMode::Si => PidTerms::IntegralDerivative {
            integral: integral_time.map_or(proto::INTEGRAL_SI.max, |ti| ti / 60.0),
            derivative: if derivative_time > 0.0 {
                derivative_time / 60.0
            } else {
                proto::DERIVATIVE_SI.min
            },
        },
        UnitMode::Us => PidTerms::ResetRate {
            reset: integral_time.map_or(proto::RESET_US.min, |ti| 60.0 / ti),
            rate: if derivative_time > 0.0 {
                derivative_time / 60.0
            } else {
                proto::RATE_US.min
            },
        },
    };

    let (params, clamps) = PidParameters {
        proportional_band,
        terms,
        dead_band: proto::DEAD_BAND.min,
        hysteresis: proto::HYSTERESIS.min,
    }
    .clamped();
    info!("Calculated PIDs (Z-N {controller}): {params}");
    (params, clamps)
}

/// Conservative parameters written before a step test.
pub fn safe_initial_parameters(unit_mode: UnitMode) -> PidParameters {
    let terms = match unit_mode {
        UnitMode::Si => PidTerms::IntegralDerivative {
            integral: proto::INTEGRAL_SI.max,
            derivative: proto::DERIVATIVE_SI.min,
        },
        UnitMode::Us => PidTerms::ResetRate {
            reset: proto::RESET_US.min,
            rate: proto::RATE_US.min,
        },
    };
    PidParameters {
        proportional_band: proto::PROPORTIONAL_BAND.max * SAFE_PROPORTIONAL_BAND_FACTOR,
        terms,
        dead_band: proto::DEAD_BAND.min,
        hysteresis: proto::HYSTERESIS.min,
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TuningSettings {
    /// Degrees below the target the step test starts from.
    pub step_offset: f64,
    pub step_duration: Duration,
    pub sample_interval: Duration,
    pub settle_time: Duration,
    /// Observation time after applying the new parameters; zero disables it.
    pub verification_duration: Duration,
    pub controller: ControllerType,
    /// Written before each step test instead of [`safe_initial_parameters`].
    pub initial_guess: Option<PidParameters>,
}

impl Default for TuningSettings {
    fn default() -> Self {
        Self {
            step_offset: 20.0,
            step_duration: Duration::from_secs(300),
            sample_interval: Duration::from_secs(1),
            settle_time: Duration::from_secs(60),
            verification_duration: Duration::from_secs(120),
            controller: ControllerType::PID,
            initial_guess: None,
        }
    }
}

/// A set point to tune for and the PID set that receives the result.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct TuningTarget {
    pub setpoint: f64,
    pub pid_set: u8,
    pub channel: u8,
    #[cfg_attr(feature = "serde", serde(default))]
    pub side: OutputSide,
}

impl TuningTarget {
    pub fn new(setpoint: f64, pid_set: u8, channel: u8, side: OutputSide) -> Self {
        Self {
            setpoint,
            pid_set,
            channel,
            side,
        }
    }
}

impl fmt::Display for TuningTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}° (PID set {}, channel {}{})",
            self.setpoint, self.pid_set, self.channel, self.side
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TuningStage {
    Connect,
    InitialParameters,
    StepTest,
    Apply,
    Verify,
}

impl fmt::Display for TuningStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let stage = match self {
            TuningStage::Connect => "connect",
            TuningStage::InitialParameters => "initial parameters",
            TuningStage::StepTest => "step test",
            TuningStage::Apply => "apply",
            TuningStage::Verify => "verification",
        };
        write!(f, "{stage}")
    }
}

#[derive(thiserror::Error, Debug)]
#[error("Tuning stage '{stage}' failed: {source}")]
pub struct TargetFailure {
    pub stage: TuningStage,
    #[source]
    pub source: Error,
}

/// Live error at the target while observing the new parameters.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Verification {
    pub samples: usize,
    pub mean_abs_error: f64,
    pub max_abs_error: f64,
}

#[derive(Debug, Clone)]
pub struct TunedTarget {
    pub parameters: PidParameters,
    /// Computed values that fell outside the engineering limits.
    pub clamps: Vec<ClampEvent>,
    pub write: WriteReport,
    pub curve: ReactionCurve,
    pub response: StepResponseData,
    pub verification: Option<Verification>,
}

#[derive(Debug)]
pub struct TargetOutcome {
    pub target: TuningTarget,
    pub result: std::result::Result<TunedTarget, TargetFailure>,
}

#[derive(Debug, Default)]
pub struct TuningReport {
    pub outcomes: Vec<TargetOutcome>,
}

impl TuningReport {
    pub fn tuned(&self) -> impl Iterator<Item = (&TuningTarget, &TunedTarget)> {
        self.outcomes
            .iter()
            .filter_map(|o| o.result.as_ref().ok().map(|t| (&o.target, t)))
    }

    pub fn failures(&self) -> impl Iterator<Item = (&TuningTarget, &TargetFailure)> {
        self.outcomes
            .iter()
            .filter_map(|o| o.result.as_ref().err().map(|e| (&o.target, e)))
    }
}

/// Runs step tests and applies the resulting PID parameters.
#[derive(Debug, Clone)]
pub struct StepResponseTuner<K: Clock> {
    clock: K,
    settings: TuningSettings,
}

impl<K: Clock> StepResponseTuner<K> {
    pub fn new(clock: K, settings: TuningSettings) -> Self {
        Self { clock, settings }
    }

    pub fn settings(&self) -> &TuningSettings {
        &self.settings
    }

    /// Number of samples taken in `duration` at the configured interval.
    fn sample_count(&self, duration: Duration) -> u32 {
        if self.settings.sample_interval.is_zero() {
            warn!("Sample interval is zero, no samples will be taken");
            return 0;
        }
        (duration.as_secs_f64() / self.settings.sample_interval.as_secs_f64()) as u32
    }

    /// Sleeps until `epoch + offset`. Late samples are taken immediately so
    /// lateness never accumulates.
    fn wait_until(&self, epoch: std::time::Instant, offset: Duration) {
        self.clock
            .sleep(offset.saturating_sub(self.clock.since(epoch)));
    }

    /// Settles at `initial_setpoint`, steps to `final_setpoint` and samples
    /// the response on a schedule anchored to the step command.
    pub fn run_step_test<C: PortConnector, S: TemperatureSource<C>>(
        &self,
        session: &mut DeviceSession<C>,
        source: &mut S,
        initial_setpoint: f64,
        final_setpoint: f64,
    ) -> Result<StepResponseData> {
        let settings = &self.settings;
        info!(
            "Preparing step test: SP {initial_setpoint} -> {final_setpoint}, duration {:?}, settle {:?}",
            settings.step_duration, settings.settle_time
        );
        session.set_temperature_setpoint(initial_setpoint)?;
        self.clock.sleep(settings.settle_time);

        let count = self.sample_count(settings.step_duration);
        let mut samples = Vec::with_capacity(count as usize + 1);
        let pre_step = source.sample(session)?;
        info!("Pre-step temperature at SP {initial_setpoint} is {pre_step:.2}");
        samples.push((0.0, pre_step));

        let issued = self.clock.now();
        session.set_temperature_setpoint(final_setpoint)?;
        info!("Set point stepped from {initial_setpoint} to {final_setpoint}");

        for i in 1..=count {
            self.wait_until(issued, settings.sample_interval * i);
            let t = self.clock.since(issued).as_secs_f64();
            let temperature = source.sample(session)?;
            debug!("Step test data: t={t:.2}s, temperature={temperature:.2}");
            samples.push((t, temperature));
        }

        let duration = self.clock.since(issued);
        info!(
            "Step test finished: {} points over {:.2}s",
            samples.len(),
            duration.as_secs_f64()
        );
        Ok(StepResponseData::new(
            samples,
            initial_setpoint,
            final_setpoint,
            duration,
        ))
    }

    /// Observes the live error at `setpoint` for the verification duration.
    pub fn verify<C: PortConnector, S: TemperatureSource<C>>(
        &self,
        session: &mut DeviceSession<C>,
        source: &mut S,
        setpoint: f64,
    ) -> Result<Option<Verification>> {
        let count = self.sample_count(self.settings.verification_duration);
        if count == 0 {
            return Ok(None);
        }
        info!(
            "Verifying response at {setpoint} for {:?}",
            self.settings.verification_duration
        );
        session.set_temperature_setpoint(setpoint)?;

        let start = self.clock.now();
        let mut sum = 0.0;
        let mut max = 0.0f64;
        for i in 1..=count {
            let temperature = source.sample(session)?;
            let error = setpoint - temperature;
            info!(
                "Verification (SP {setpoint:.1}): t={:.0}s, temperature={temperature:.2}, error={error:.2}",
                self.clock.since(start).as_secs_f64()
            );
            sum += error.abs();
            max = max.max(error.abs());
            self.wait_until(start, self.settings.sample_interval * i);
        }
        Ok(Some(Verification {
            samples: count as usize,
            mean_abs_error: sum / f64::from(count),
            max_abs_error: max,
        }))
    }

    /// Tunes every target in turn. A failing target is logged and recorded
    /// in the report; the batch always continues with the next target.
    pub fn tune_targets<C: PortConnector, S: TemperatureSource<C>>(
        &self,
        session: &mut DeviceSession<C>,
        source: &mut S,
        targets: &[TuningTarget],
    ) -> TuningReport {
        let mut report = TuningReport::default();
        for target in targets {
            info!("Starting tuning for target {target}");
            let result = self.tune_target(session, source, target);
            match &result {
                Ok(tuned) => info!("Tuning for target {target} complete: {}", tuned.parameters),
                Err(err) => error!("Tuning for target {target} failed: {err}"),
            }
            report.outcomes.push(TargetOutcome {
                target: *target,
                result,
            });
        }

        info!(
            "Tuning session complete: {} tuned, {} failed",
            report.tuned().count(),
            report.failures().count()
        );
        report
    }

    fn tune_target<C: PortConnector, S: TemperatureSource<C>>(
        &self,
        session: &mut DeviceSession<C>,
        source: &mut S,
        target: &TuningTarget,
    ) -> std::result::Result<TunedTarget, TargetFailure> {
        let at = |stage| move |source| TargetFailure { stage, source };
        let settings = &self.settings;

        if !session.is_connected() {
            session.reconnect().map_err(at(TuningStage::Connect))?;
        }

        let unit_mode = session
            .read_unit_mode()
            .map_err(at(TuningStage::InitialParameters))?;
        let initial = settings
            .initial_guess
            .unwrap_or_else(|| safe_initial_parameters(unit_mode));
        info!("Setting initial PIDs for set {}: {initial}", target.pid_set);
        session
            .write_pid_parameters(&initial, target.pid_set, target.channel, target.side)
            .map_err(at(TuningStage::InitialParameters))?;

        let mut initial_setpoint = target.setpoint - settings.step_offset;
        if initial_setpoint < 0.0 && target.setpoint > 0.0 {
            initial_setpoint = target.setpoint / 2.0;
        }
        let response = self
            .run_step_test(session, source, initial_setpoint, target.setpoint)
            .map_err(at(TuningStage::StepTest))?;

        let curve = fit_reaction_curve(&response, settings.sample_interval);
        let (parameters, clamps) = calculate_pids(
            &curve,
            unit_mode,
            settings.sample_interval,
            settings.controller,
        );

        let write = session
            .write_pid_parameters(&parameters, target.pid_set, target.channel, target.side)
            .map_err(at(TuningStage::Apply))?;

        let verification = self
            .verify(session, source, target.setpoint)
            .map_err(at(TuningStage::Verify))?;

        Ok(TunedTarget {
            parameters,
            clamps,
            write,
            curve,
            response,
            verification,
        })
    }
}

//! Register map, addressing rules and value codec of the Watlow F4 controller.
//!
//! Everything in this module is pure: it maps profile, step, PID-set, channel
//! and output-side indices onto concrete Modbus holding registers and converts
//! engineering values to and from the 16-bit words stored in them. Invalid
//! index combinations are rejected here, before any I/O is attempted.

use std::fmt;
use std::time::Duration;

/// Errors raised while mapping indices or values onto registers.
#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum Error {
    #[error("PID set {0} is out of range (1..=10)")]
    PidSetOutOfRange(u8),
    #[error("Channel {0} is out of range (1..=2)")]
    ChannelOutOfRange(u8),
    #[error("PID set {set} does not belong to channel {channel}")]
    PidSetNotOnChannel { set: u8, channel: u8 },
    #[error("Invalid output side '{0}', expected 'A' or 'B'")]
    InvalidOutputSide(String),
    #[error("Profile {0} is out of range (1..=40)")]
    ProfileOutOfRange(u16),
    #[error("Step index {0} is out of range (0..=255)")]
    StepOutOfRange(usize),
    #[error("Event output {0} is out of range (1..=8)")]
    EventOutputOutOfRange(u8),
    #[error("Profile name character {0} exceeds the 10 character budget")]
    NameIndexOutOfRange(usize),
    #[error("Value {value} with {decimals} decimals does not fit in a 16-bit register")]
    ValueOutOfRange { value: f64, decimals: u8 },
}

/// Serial link parameters. The F4 only talks 9600-8N1 in this setup.
pub const BAUD_RATE: u32 = 9600;
pub const DEFAULT_SLAVE_ADDRESS: u8 = 0x01;
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(1);

pub const NUMBER_OF_PROFILES: u16 = 40;
pub const NUMBER_OF_STEPS: usize = 256;
pub const NUMBER_OF_EVENT_OUTPUTS: u8 = 8;
pub const NUMBER_OF_CHANNELS: u8 = 2;
pub const PID_SETS_PER_CHANNEL: u8 = 5;
pub const PROFILE_NAME_LEN: usize = 10;

/// A single holding register together with its scaling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Register {
    pub name: &'static str,
    pub address: u16,
    pub decimals: u8,
    pub signed: bool,
}

impl Register {
    pub const fn new(name: &'static str, address: u16) -> Self {
        Self {
            name,
            address,
            decimals: 0,
            signed: false,
        }
    }

    pub const fn scaled(name: &'static str, address: u16, decimals: u8, signed: bool) -> Self {
        Self {
            name,
            address,
            decimals,
            signed,
        }
    }

    /// Encodes `value` with this register's scaling and signedness.
    pub fn encode(&self, value: f64) -> Result<u16, Error> {
        encode_value(value, self.decimals, self.signed)
    }

    const fn offset(self, by: u16) -> Self {
        Self {
            address: self.address + by,
            ..self
        }
    }
}

impl fmt::Display for Register {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.name, self.address)
    }
}

// Status and live control registers.
pub const INPUT_1_VALUE: Register = Register::scaled("input 1 value", 100, 1, true);
pub const SET_POINT_1: Register = Register::scaled("set point 1", 300, 1, true);
pub const PID_UNITS: Register = Register::new("PID units", 901);
pub const SAVE_CHANGES: Register = Register::new("save changes to EEPROM", 25);

// Profile editing registers.
pub const PROFILE_NUMBER: Register = Register::new("profile number", 4000);
pub const PROFILE_STEP_NUMBER: Register = Register::new("step number", 4001);
pub const PROFILE_EDIT_ACTION: Register = Register::new("edit action", 4002);
pub const PROFILE_STEP_TYPE: Register = Register::new("step type", 4003);
pub const PROFILE_WAIT_FOR: Register = Register::new("wait for event", 4004);
const PROFILE_EVENT_OUTPUT_1: Register = Register::new("event output", 4005);
pub const PROFILE_RAMP_TIME_HOURS: Register = Register::new("ramp time hours", 4013);
pub const PROFILE_RAMP_TIME_MINUTES: Register = Register::new("ramp time minutes", 4014);
pub const PROFILE_RAMP_TIME_SECONDS: Register = Register::new("ramp time seconds", 4015);
pub const PROFILE_RAMP_RATE: Register = Register::scaled("ramp rate", 4016, 1, false);
pub const PROFILE_SETPOINT_CHANNEL_1: Register =
    Register::scaled("channel 1 setpoint", 4017, 1, true);
pub const PROFILE_SETPOINT_CHANNEL_2: Register =
    Register::scaled("channel 2 setpoint", 4018, 1, true);
pub const PROFILE_PID_SET_CHANNEL_1: Register = Register::new("channel 1 PID set", 4019);
pub const PROFILE_PID_SET_CHANNEL_2: Register = Register::new("channel 2 PID set", 4020);
pub const PROFILE_GUARANTEED_SOAK_CHANNEL_1: Register =
    Register::new("channel 1 guaranteed soak", 4021);
pub const PROFILE_GUARANTEED_SOAK_CHANNEL_2: Register =
    Register::new("channel 2 guaranteed soak", 4022);
pub const PROFILE_SOAK_TIME_HOURS: Register = Register::new("soak time hours", 4023);
pub const PROFILE_SOAK_TIME_MINUTES: Register = Register::new("soak time minutes", 4024);
pub const PROFILE_SOAK_TIME_SECONDS: Register = Register::new("soak time seconds", 4025);
pub const PROFILE_JUMP_TO_PROFILE: Register = Register::new("jump to profile", 4026);
pub const PROFILE_JUMP_TO_STEP: Register = Register::new("jump to step", 4027);
pub const PROFILE_JUMP_REPEATS: Register = Register::new("jump repeats", 4028);
pub const PROFILE_END_ACTION: Register = Register::new("end action", 4029);
pub const PROFILE_END_IDLE_SETPOINT_CHANNEL_1: Register =
    Register::scaled("channel 1 idle setpoint", 4030, 1, true);
pub const PROFILE_END_IDLE_SETPOINT_CHANNEL_2: Register =
    Register::scaled("channel 2 idle setpoint", 4031, 1, true);
pub const PROFILE_AUTOSTART_DATE_OR_DAY: Register = Register::new("autostart date or day", 4032);
pub const PROFILE_AUTOSTART_MONTH: Register = Register::new("autostart month", 4033);
pub const PROFILE_AUTOSTART_DAY: Register = Register::new("autostart day", 4034);
pub const PROFILE_AUTOSTART_YEAR: Register = Register::new("autostart year", 4035);
pub const PROFILE_AUTOSTART_DAY_OF_WEEK: Register =
    Register::new("autostart day of week", 4036);
pub const PROFILE_AUTOSTART_HOURS: Register = Register::new("autostart hours", 4037);
pub const PROFILE_AUTOSTART_MINUTES: Register = Register::new("autostart minutes", 4038);
pub const PROFILE_AUTOSTART_SECONDS: Register = Register::new("autostart seconds", 4039);

const PROFILE_NAME_BASE: u16 = 4100;
const PID_BASE: u16 = 500;
const PID_BLOCK_LEN: u16 = 10;

/// Codes accepted by [`PROFILE_EDIT_ACTION`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum EditAction {
    EditStep = 2,
    DeleteProfile = 3,
    RunProfile = 5,
}

impl EditAction {
    pub fn encode(self) -> u16 {
        self as u16
    }
}

/// Register of event output `number` (1-based).
pub fn event_output_register(number: u8) -> Result<Register, Error> {
    if (1..=NUMBER_OF_EVENT_OUTPUTS).contains(&number) {
        Ok(PROFILE_EVENT_OUTPUT_1.offset(u16::from(number - 1)))
    } else {
        Err(Error::EventOutputOutOfRange(number))
    }
}

pub fn check_profile(profile: u16) -> Result<(), Error> {
    if (1..=NUMBER_OF_PROFILES).contains(&profile) {
        Ok(())
    } else {
        Err(Error::ProfileOutOfRange(profile))
    }
}

pub fn check_step(index: usize) -> Result<u16, Error> {
    if index < NUMBER_OF_STEPS {
        Ok(index as u16)
    } else {
        Err(Error::StepOutOfRange(index))
    }
}

/// Register holding character `index` of the name of `profile`.
///
/// Each profile owns [`PROFILE_NAME_LEN`] consecutive character registers.
pub fn profile_name_register(profile: u16, index: usize) -> Result<Register, Error> {
    check_profile(profile)?;
    if index >= PROFILE_NAME_LEN {
        return Err(Error::NameIndexOutOfRange(index));
    }
    let address = PROFILE_NAME_BASE + (profile - 1) * PROFILE_NAME_LEN as u16 + index as u16;
    Ok(Register::new("profile name", address))
}

/// Heat (A) or cool (B) output of a control channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum OutputSide {
    #[default]
    A,
    B,
}

impl OutputSide {
    fn index(self) -> u16 {
        match self {
            OutputSide::A => 0,
            OutputSide::B => 1,
        }
    }
}

impl fmt::Display for OutputSide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OutputSide::A => write!(f, "A"),
            OutputSide::B => write!(f, "B"),
        }
    }
}

impl std::str::FromStr for OutputSide {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "A" | "a" => Ok(OutputSide::A),
            "B" | "b" => Ok(OutputSide::B),
            other => Err(Error::InvalidOutputSide(other.to_string())),
        }
    }
}

/// The seven registers making up one PID set on one output side.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PidRegisters {
    pub proportional_band: Register,
    pub integral: Register,
    pub reset: Register,
    pub derivative: Register,
    pub rate: Register,
    pub dead_band: Register,
    pub hysteresis: Register,
}

/// Resolves the registers of `pid_set` on `channel`/`side`.
///
/// PID sets 1..=5 belong to channel 1 and 6..=10 to channel 2; any other
/// combination has no registers on the device.
pub fn pid_registers(pid_set: u8, channel: u8, side: OutputSide) -> Result<PidRegisters, Error> {
    if !(1..=NUMBER_OF_CHANNELS).contains(&channel) {
        return Err(Error::ChannelOutOfRange(channel));
    }
    if !(1..=NUMBER_OF_CHANNELS * PID_SETS_PER_CHANNEL).contains(&pid_set) {
        return Err(Error::PidSetOutOfRange(pid_set));
    }
    if (pid_set - 1) / PID_SETS_PER_CHANNEL + 1 != channel {
        return Err(Error::PidSetNotOnChannel {
            set: pid_set,
            channel,
        });
    }

    let base = PID_BASE + ((u16::from(pid_set) - 1) * 2 + side.index()) * PID_BLOCK_LEN;
    let scaled = |name, offset, spec: &ParamSpec| {
        Register::scaled(name, base + offset, spec.decimals, false)
    };
    Ok(PidRegisters {
        proportional_band: scaled("proportional band", 0, &PROPORTIONAL_BAND),
        integral: scaled("integral", 1, &INTEGRAL_SI),
        reset: scaled("reset", 2, &RESET_US),
        derivative: scaled("derivative", 3, &DERIVATIVE_SI),
        rate: scaled("rate", 4, &RATE_US),
        dead_band: scaled("dead band", 5, &DEAD_BAND),
        hysteresis: scaled("hysteresis", 6, &HYSTERESIS),
    })
}

/// Engineering limits of one tunable field.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ParamSpec {
    pub name: &'static str,
    pub min: f64,
    pub max: f64,
    pub decimals: u8,
}

impl ParamSpec {
    pub const fn new(name: &'static str, min: f64, max: f64, decimals: u8) -> Self {
        Self {
            name,
            min,
            max,
            decimals,
        }
    }

    /// Rounds `value` to the precision the device stores.
    pub fn quantize(&self, value: f64) -> f64 {
        let factor = 10f64.powi(i32::from(self.decimals));
        (value * factor).round() / factor
    }

    /// Quantizes and bounds `value`. NaN maps to `min`.
    pub fn clamp(&self, value: f64) -> f64 {
        if value.is_nan() {
            return self.min;
        }
        self.quantize(value).clamp(self.min, self.max)
    }

    pub fn contains(&self, value: f64) -> bool {
        (self.min..=self.max).contains(&value)
    }
}

pub const PROPORTIONAL_BAND: ParamSpec = ParamSpec::new("proportional band", 0.0, 30000.0, 0);
/// Minutes per repeat.
pub const INTEGRAL_SI: ParamSpec = ParamSpec::new("integral", 0.0, 300.0, 2);
/// Minutes.
pub const DERIVATIVE_SI: ParamSpec = ParamSpec::new("derivative", 0.0, 9.99, 2);
/// Repeats per minute.
pub const RESET_US: ParamSpec = ParamSpec::new("reset", 0.0, 99.99, 2);
/// Minutes.
pub const RATE_US: ParamSpec = ParamSpec::new("rate", 0.0, 9.99, 2);
pub const DEAD_BAND: ParamSpec = ParamSpec::new("dead band", 0.0, 30000.0, 0);
pub const HYSTERESIS: ParamSpec = ParamSpec::new("hysteresis", 1.0, 30000.0, 0);

/// Scales `value` by `10^decimals` into a 16-bit word.
///
/// Signed registers take `i16::MIN..=i16::MAX` and store negative values in
/// two's complement. Unsigned registers take `0..=u16::MAX`.
pub fn encode_value(value: f64, decimals: u8, signed: bool) -> Result<u16, Error> {
    let scaled = (value * 10f64.powi(i32::from(decimals))).round();
    let range = if signed {
        f64::from(i16::MIN)..=f64::from(i16::MAX)
    } else {
        0.0..=f64::from(u16::MAX)
    };
    if !range.contains(&scaled) {
        return Err(Error::ValueOutOfRange { value, decimals });
    }
    if signed {
        Ok(scaled as i16 as u16)
    } else {
        Ok(scaled as u16)
    }
}

pub fn decode_value(raw: u16, decimals: u8, signed: bool) -> f64 {
    let value = if signed {
        f64::from(raw as i16)
    } else {
        f64::from(raw)
    };
    value / 10f64.powi(i32::from(decimals))
}

/// A step duration in the hours/minutes/seconds layout of the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Hms {
    pub hours: u16,
    pub minutes: u16,
    pub seconds: u16,
}

impl Hms {
    pub const MAX_HOURS: u16 = 99;

    /// Carries seconds into minutes and minutes into hours, then caps the
    /// hours at [`Hms::MAX_HOURS`].
    pub fn normalize(hours: u64, minutes: u64, seconds: u64) -> Self {
        let minutes = minutes + seconds / 60;
        let hours = hours + minutes / 60;
        Self {
            hours: hours.min(u64::from(Self::MAX_HOURS)) as u16,
            minutes: (minutes % 60) as u16,
            seconds: (seconds % 60) as u16,
        }
    }
}

impl fmt::Display for Hms {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:02}:{:02}:{:02}",
            self.hours, self.minutes, self.seconds
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use proptest::prelude::*;

    #[test]
    fn pid_registers_layout() {
        let regs = pid_registers(1, 1, OutputSide::A).unwrap();
        assert_eq!(regs.proportional_band.address, 500);
        assert_eq!(regs.hysteresis.address, 506);
        assert_eq!(regs.integral.decimals, 2);

        let regs = pid_registers(1, 1, OutputSide::B).unwrap();
        assert_eq!(regs.proportional_band.address, 510);

        let regs = pid_registers(10, 2, OutputSide::B).unwrap();
        assert_eq!(regs.proportional_band.address, 690);
        assert_eq!(regs.hysteresis.address, 696);
    }

    #[test]
    fn pid_registers_rejects_invalid_combinations() {
        assert_matches!(
            pid_registers(0, 1, OutputSide::A),
            Err(Error::PidSetOutOfRange(0))
        );
        assert_matches!(
            pid_registers(11, 2, OutputSide::A),
            Err(Error::PidSetOutOfRange(11))
        );
        assert_matches!(
            pid_registers(1, 3, OutputSide::A),
            Err(Error::ChannelOutOfRange(3))
        );
        assert_matches!(
            pid_registers(6, 1, OutputSide::A),
            Err(Error::PidSetNotOnChannel { set: 6, channel: 1 })
        );
        assert_matches!(
            pid_registers(5, 2, OutputSide::B),
            Err(Error::PidSetNotOnChannel { set: 5, channel: 2 })
        );
    }

    #[test]
    fn event_outputs_are_contiguous() {
        assert_eq!(event_output_register(1).unwrap().address, 4005);
        assert_eq!(event_output_register(8).unwrap().address, 4012);
        assert_matches!(
            event_output_register(0),
            Err(Error::EventOutputOutOfRange(0))
        );
        assert_matches!(
            event_output_register(9),
            Err(Error::EventOutputOutOfRange(9))
        );
    }

    #[test]
    fn profile_name_addresses() {
        assert_eq!(profile_name_register(1, 0).unwrap().address, 4100);
        assert_eq!(profile_name_register(1, 9).unwrap().address, 4109);
        assert_eq!(profile_name_register(2, 0).unwrap().address, 4110);
        assert_eq!(profile_name_register(40, 9).unwrap().address, 4499);
        assert_matches!(
            profile_name_register(41, 0),
            Err(Error::ProfileOutOfRange(41))
        );
        assert_matches!(
            profile_name_register(1, 10),
            Err(Error::NameIndexOutOfRange(10))
        );
    }

    #[test]
    fn output_side_parse() {
        assert_eq!("A".parse::<OutputSide>(), Ok(OutputSide::A));
        assert_eq!("b".parse::<OutputSide>(), Ok(OutputSide::B));
        assert_matches!("C".parse::<OutputSide>(), Err(Error::InvalidOutputSide(_)));
    }

    #[test]
    fn value_codec() {
        assert_eq!(encode_value(21.9, 1, true), Ok(219));
        assert_eq!(encode_value(-11.2, 1, true), Ok(65424));
        assert_eq!(encode_value(0.5, 2, false), Ok(50));
        assert_eq!(encode_value(30000.0, 0, false), Ok(30000));
        assert_eq!(encode_value(60000.0, 0, false), Ok(60000));
        assert_matches!(
            encode_value(7000.0, 1, false),
            Err(Error::ValueOutOfRange { .. })
        );
        assert_matches!(
            encode_value(-1.0, 0, false),
            Err(Error::ValueOutOfRange { .. })
        );
        assert_matches!(
            encode_value(f64::NAN, 0, true),
            Err(Error::ValueOutOfRange { .. })
        );

        assert_eq!(decode_value(219, 1, true), 21.9);
        assert_eq!(decode_value(65424, 1, true), -11.2);
        assert_eq!(decode_value(65424, 0, false), 65424.0);
        assert_eq!(decode_value(999, 2, false), 9.99);
    }

    #[test]
    fn signed_registers_stop_at_i16_bounds() {
        assert_eq!(SET_POINT_1.encode(3276.7), Ok(32767));
        assert_eq!(SET_POINT_1.encode(-3276.8), Ok(32768));
        assert_matches!(
            SET_POINT_1.encode(3276.8),
            Err(Error::ValueOutOfRange { value, decimals: 1 }) if value == 3276.8
        );
        assert_matches!(
            SET_POINT_1.encode(4000.0),
            Err(Error::ValueOutOfRange { .. })
        );
        assert_matches!(
            PROFILE_END_IDLE_SETPOINT_CHANNEL_1.encode(-3276.9),
            Err(Error::ValueOutOfRange { .. })
        );
        // the same word is fine for an unsigned register
        assert_eq!(PROFILE_RAMP_RATE.encode(3276.8), Ok(32768));
    }

    #[test]
    fn hms_normalization() {
        assert_eq!(
            Hms::normalize(0, 125, 61),
            Hms {
                hours: 2,
                minutes: 6,
                seconds: 1
            }
        );
        assert_eq!(
            Hms::normalize(150, 0, 0),
            Hms {
                hours: 99,
                minutes: 0,
                seconds: 0
            }
        );
        assert_eq!(
            Hms::normalize(0, 0, 29 * 3600 + 30 * 60 + 15).to_string(),
            "29:30:15"
        );
    }

    #[test]
    fn clamp_bounds_and_quantizes() {
        assert_eq!(PROPORTIONAL_BAND.clamp(16.67), 17.0);
        assert_eq!(PROPORTIONAL_BAND.clamp(-5.0), 0.0);
        assert_eq!(PROPORTIONAL_BAND.clamp(31000.0), 30000.0);
        assert_eq!(DERIVATIVE_SI.clamp(12.0), 9.99);
        assert_eq!(HYSTERESIS.clamp(0.0), 1.0);
        assert_eq!(INTEGRAL_SI.clamp(f64::NAN), 0.0);
        assert_eq!(RESET_US.clamp(f64::INFINITY), 99.99);
    }

    const SPECS: [ParamSpec; 7] = [
        PROPORTIONAL_BAND,
        INTEGRAL_SI,
        DERIVATIVE_SI,
        RESET_US,
        RATE_US,
        DEAD_BAND,
        HYSTERESIS,
    ];

    proptest! {
        #[test]
        fn clamp_is_idempotent_and_bounded(value in -1.0e6f64..1.0e6, idx in 0usize..7) {
            let spec = SPECS[idx];
            let once = spec.clamp(value);
            prop_assert!(spec.contains(once));
            prop_assert_eq!(spec.clamp(once), once);
        }

        #[test]
        fn normalized_durations_stay_in_layout(h in 0u64..500, m in 0u64..10_000, s in 0u64..100_000) {
            let hms = Hms::normalize(h, m, s);
            prop_assert!(hms.hours <= Hms::MAX_HOURS);
            prop_assert!(hms.minutes < 60);
            prop_assert!(hms.seconds < 60);
        }
    }
}

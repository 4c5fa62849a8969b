//! In-memory profile program consumed by [`crate::programmer::ProfileProgrammer`].
//!
//! A [`Program`] is an ordered list of [`StepDetail`] values. Each variant
//! carries exactly the fields its step type uses on the device, so encoders
//! match on it exhaustively instead of inspecting runtime types.

use crate::protocol::{self as proto, Hms};
use chrono::{Datelike, NaiveDate};
use std::fmt;

#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum ValidationError {
    #[error("Program '{0}' has no steps")]
    Empty(String),
    #[error("Program '{0}' must end with an End step")]
    MissingEnd(String),
    #[error("Step {step}: {field} {reason}")]
    Field {
        step: usize,
        field: &'static str,
        reason: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum StepTypeName {
    RampByTime,
    RampByRate,
    Soak,
    Jump,
    End,
    Autostart,
}

impl StepTypeName {
    /// Value written to the step type register.
    pub fn code(self) -> u16 {
        match self {
            StepTypeName::Autostart => 0,
            StepTypeName::RampByTime => 1,
            StepTypeName::RampByRate => 2,
            StepTypeName::Soak => 3,
            StepTypeName::Jump => 4,
            StepTypeName::End => 5,
        }
    }
}

impl fmt::Display for StepTypeName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            StepTypeName::RampByTime => "Ramp by Time",
            StepTypeName::RampByRate => "Ramp by Rate",
            StepTypeName::Soak => "Soak",
            StepTypeName::Jump => "Jump",
            StepTypeName::End => "End",
            StepTypeName::Autostart => "Autostart",
        };
        write!(f, "{name}")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum EndAction {
    #[default]
    Hold,
    ControlOff,
    AllOff,
    Idle,
}

impl EndAction {
    pub fn code(self) -> u16 {
        match self {
            EndAction::Hold => 0,
            EndAction::ControlOff => 1,
            EndAction::AllOff => 2,
            EndAction::Idle => 3,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum DayOfWeek {
    EveryDay,
    Monday,
    Tuesday,
    Wednesday,
    Thursday,
    Friday,
    Saturday,
    Sunday,
}

impl DayOfWeek {
    pub fn code(self) -> u16 {
        match self {
            DayOfWeek::EveryDay => 0,
            DayOfWeek::Monday => 1,
            DayOfWeek::Tuesday => 2,
            DayOfWeek::Wednesday => 3,
            DayOfWeek::Thursday => 4,
            DayOfWeek::Friday => 5,
            DayOfWeek::Saturday => 6,
            DayOfWeek::Sunday => 7,
        }
    }
}

/// Wait-for-event flag plus the eight event output states of a ramp or soak.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct EventSettings {
    pub wait_for_event: bool,
    pub event_outputs: [bool; proto::NUMBER_OF_EVENT_OUTPUTS as usize],
}

#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct RampTime {
    pub events: EventSettings,
    #[cfg_attr(feature = "serde", serde(with = "hms_format"))]
    pub duration: Hms,
    pub ch1_setpoint: f64,
    pub ch2_setpoint: f64,
    /// 1..=5
    pub ch1_pid_set: u8,
    /// 6..=10
    pub ch2_pid_set: u8,
    pub guaranteed_soak_1: bool,
    pub guaranteed_soak_2: bool,
}

#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct RampRate {
    pub events: EventSettings,
    /// Degrees per minute, 0.1..=3000.
    pub rate: f64,
    pub ch1_setpoint: f64,
    pub ch1_pid_set: u8,
    pub guaranteed_soak_1: bool,
}

/// Holds at the target of the previous ramp.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Soak {
    pub events: EventSettings,
    #[cfg_attr(feature = "serde", serde(with = "hms_format"))]
    pub duration: Hms,
    pub ch1_pid_set: u8,
    pub ch2_pid_set: u8,
    pub guaranteed_soak_1: bool,
    pub guaranteed_soak_2: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Jump {
    pub profile: u16,
    pub step: u16,
    pub repeats: u16,
}

#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct End {
    pub action: EndAction,
    pub ch1_idle_setpoint: f64,
    pub ch2_idle_setpoint: f64,
}

/// When an autostart fires: a calendar date or a day of the week, never both.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum AutostartSchedule {
    Date(NaiveDate),
    Day(DayOfWeek),
}

impl AutostartSchedule {
    /// Value of the date-or-day mode register (0 = date, 1 = day).
    pub fn mode_code(&self) -> u16 {
        match self {
            AutostartSchedule::Date(_) => 0,
            AutostartSchedule::Day(_) => 1,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Autostart {
    #[cfg_attr(feature = "serde", serde(with = "hms_format"))]
    pub start_time: Hms,
    pub schedule: AutostartSchedule,
}

/// One step of a profile, tagged by its step type.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(
    feature = "serde",
    derive(serde::Serialize, serde::Deserialize),
    serde(tag = "type_name", content = "details")
)]
pub enum StepDetail {
    RampByTime(RampTime),
    RampByRate(RampRate),
    Soak(Soak),
    Jump(Jump),
    End(End),
    Autostart(Autostart),
}

impl StepDetail {
    pub fn type_name(&self) -> StepTypeName {
        match self {
            StepDetail::RampByTime(_) => StepTypeName::RampByTime,
            StepDetail::RampByRate(_) => StepTypeName::RampByRate,
            StepDetail::Soak(_) => StepTypeName::Soak,
            StepDetail::Jump(_) => StepTypeName::Jump,
            StepDetail::End(_) => StepTypeName::End,
            StepDetail::Autostart(_) => StepTypeName::Autostart,
        }
    }

    fn validate(&self, step: usize) -> Result<(), ValidationError> {
        let field = |field, reason: String| ValidationError::Field {
            step,
            field,
            reason,
        };
        let ch1_pid = |set: u8| {
            if (1..=5).contains(&set) {
                Ok(())
            } else {
                Err(field("channel 1 PID set", format!("{set} not in 1..=5")))
            }
        };
        let ch2_pid = |set: u8| {
            if (6..=10).contains(&set) {
                Ok(())
            } else {
                Err(field("channel 2 PID set", format!("{set} not in 6..=10")))
            }
        };
        // Every scaled value must encode into its register before any write starts.
        let fits = |register: &proto::Register, value: f64| {
            register
                .encode(value)
                .map(|_| ())
                .map_err(|e| field(register.name, e.to_string()))
        };
        let duration = |name, hms: &Hms| {
            if hms.hours <= Hms::MAX_HOURS && hms.minutes < 60 && hms.seconds < 60 {
                Ok(())
            } else {
                Err(field(name, format!("{hms} is not a normalized duration")))
            }
        };

        match self {
            StepDetail::RampByTime(ramp) => {
                duration("duration", &ramp.duration)?;
                fits(&proto::PROFILE_SETPOINT_CHANNEL_1, ramp.ch1_setpoint)?;
                fits(&proto::PROFILE_SETPOINT_CHANNEL_2, ramp.ch2_setpoint)?;
                ch1_pid(ramp.ch1_pid_set)?;
                ch2_pid(ramp.ch2_pid_set)
            }
            StepDetail::RampByRate(ramp) => {
                if !(0.1..=3000.0).contains(&ramp.rate) {
                    return Err(field("ramp rate", format!("{} not in 0.1..=3000", ramp.rate)));
                }
                fits(&proto::PROFILE_RAMP_RATE, ramp.rate)?;
                fits(&proto::PROFILE_SETPOINT_CHANNEL_1, ramp.ch1_setpoint)?;
                ch1_pid(ramp.ch1_pid_set)
            }
            StepDetail::Soak(soak) => {
                duration("duration", &soak.duration)?;
                ch1_pid(soak.ch1_pid_set)?;
                ch2_pid(soak.ch2_pid_set)
            }
            StepDetail::Jump(jump) => {
                if !(1..=proto::NUMBER_OF_PROFILES).contains(&jump.profile) {
                    return Err(field("jump profile", format!("{} not in 1..=40", jump.profile)));
                }
                proto::check_step(usize::from(jump.step))
                    .map_err(|e| field("jump step", e.to_string()))?;
                if !(1..=999).contains(&jump.repeats) {
                    return Err(field("jump repeats", format!("{} not in 1..=999", jump.repeats)));
                }
                Ok(())
            }
            StepDetail::End(end) => {
                fits(&proto::PROFILE_END_IDLE_SETPOINT_CHANNEL_1, end.ch1_idle_setpoint)?;
                fits(&proto::PROFILE_END_IDLE_SETPOINT_CHANNEL_2, end.ch2_idle_setpoint)
            }
            StepDetail::Autostart(autostart) => {
                duration("start time", &autostart.start_time)?;
                if autostart.start_time.hours > 23 {
                    return Err(field(
                        "start time",
                        format!("{} is not a time of day", autostart.start_time),
                    ));
                }
                if let AutostartSchedule::Date(date) = autostart.schedule {
                    if u16::try_from(date.year()).is_err() {
                        return Err(field("start date", format!("{date} has no device year")));
                    }
                }
                Ok(())
            }
        }
    }
}

/// A named profile program.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Program {
    pub name: String,
    pub steps: Vec<StepDetail>,
}

impl Program {
    pub fn new(name: impl Into<String>, steps: Vec<StepDetail>) -> Self {
        Self {
            name: name.into(),
            steps,
        }
    }

    /// Checks the structural invariants the device relies on: at least one
    /// step, a terminal End step and every field within its device range.
    pub fn validate(&self) -> Result<(), ValidationError> {
        match self.steps.last() {
            None => return Err(ValidationError::Empty(self.name.clone())),
            Some(StepDetail::End(_)) => {}
            Some(_) => return Err(ValidationError::MissingEnd(self.name.clone())),
        }
        if self.steps.len() > proto::NUMBER_OF_STEPS {
            return Err(ValidationError::Field {
                step: proto::NUMBER_OF_STEPS,
                field: "step count",
                reason: format!("{} exceeds {}", self.steps.len(), proto::NUMBER_OF_STEPS),
            });
        }
        self.steps
            .iter()
            .enumerate()
            .try_for_each(|(idx, step)| step.validate(idx))
    }

    /// The part of the name that fits the device's profile name registers.
    pub fn device_name(&self) -> String {
        self.name.chars().take(proto::PROFILE_NAME_LEN).collect()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, StepDetail> {
        self.steps.iter()
    }
}

impl<'a> IntoIterator for &'a Program {
    type Item = &'a StepDetail;
    type IntoIter = std::slice::Iter<'a, StepDetail>;

    fn into_iter(self) -> Self::IntoIter {
        self.steps.iter()
    }
}

/// `HH:MM:SS` text form of [`Hms`] fields.
#[cfg(feature = "serde")]
mod hms_format {
    use crate::protocol::Hms;
    use serde::{de, Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(hms: &Hms, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(hms)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Hms, D::Error> {
        let text = String::deserialize(deserializer)?;
        let parts = text
            .split(':')
            .map(|part| part.trim().parse::<u64>())
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| de::Error::custom(format!("invalid duration '{text}': {e}")))?;
        match parts.as_slice() {
            [h, m, s] => Ok(Hms::normalize(*h, *m, *s)),
            _ => Err(de::Error::custom(format!(
                "invalid duration '{text}', expected HH:MM:SS"
            ))),
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use assert_matches::assert_matches;

    fn events() -> EventSettings {
        EventSettings {
            wait_for_event: true,
            event_outputs: [true, false, false, true, false, false, false, true],
        }
    }

    pub(crate) fn sample_program() -> Program {
        Program::new(
            "Bake-out cycle",
            vec![
                StepDetail::Autostart(Autostart {
                    start_time: Hms::normalize(6, 30, 0),
                    schedule: AutostartSchedule::Date(NaiveDate::from_ymd_opt(2025, 3, 14).unwrap()),
                }),
                StepDetail::RampByTime(RampTime {
                    events: events(),
                    duration: Hms::normalize(1, 0, 0),
                    ch1_setpoint: 100.0,
                    ch2_setpoint: 200.0,
                    ch1_pid_set: 1,
                    ch2_pid_set: 6,
                    guaranteed_soak_1: true,
                    guaranteed_soak_2: false,
                }),
                StepDetail::RampByRate(RampRate {
                    events: EventSettings::default(),
                    rate: 5.5,
                    ch1_setpoint: 150.0,
                    ch1_pid_set: 2,
                    guaranteed_soak_1: true,
                }),
                StepDetail::Soak(Soak {
                    events: events(),
                    duration: Hms::normalize(29, 30, 15),
                    ch1_pid_set: 3,
                    ch2_pid_set: 7,
                    guaranteed_soak_1: false,
                    guaranteed_soak_2: true,
                }),
                StepDetail::Jump(Jump {
                    profile: 10,
                    step: 5,
                    repeats: 3,
                }),
                StepDetail::Autostart(Autostart {
                    start_time: Hms::normalize(22, 0, 5),
                    schedule: AutostartSchedule::Day(DayOfWeek::Friday),
                }),
                StepDetail::End(End {
                    action: EndAction::Idle,
                    ch1_idle_setpoint: 20.0,
                    ch2_idle_setpoint: -12.5,
                }),
            ],
        )
    }

    #[test]
    fn sample_program_is_valid() {
        assert_eq!(sample_program().validate(), Ok(()));
    }

    #[test]
    fn program_must_end_with_end_step() {
        let mut program = sample_program();
        program.steps.pop();
        assert_matches!(program.validate(), Err(ValidationError::MissingEnd(_)));

        program.steps.clear();
        assert_matches!(program.validate(), Err(ValidationError::Empty(_)));
    }

    #[test]
    fn field_ranges_are_checked() {
        let mut program = sample_program();
        if let StepDetail::RampByTime(ramp) = &mut program.steps[1] {
            ramp.ch2_pid_set = 3;
        }
        assert_matches!(
            program.validate(),
            Err(ValidationError::Field {
                step: 1,
                field: "channel 2 PID set",
                ..
            })
        );

        let mut program = sample_program();
        if let StepDetail::RampByRate(ramp) = &mut program.steps[2] {
            ramp.rate = 0.05;
        }
        assert_matches!(
            program.validate(),
            Err(ValidationError::Field { step: 2, .. })
        );

        let mut program = sample_program();
        program.steps[4] = StepDetail::Jump(Jump {
            profile: 41,
            step: 1,
            repeats: 1,
        });
        assert_matches!(
            program.validate(),
            Err(ValidationError::Field {
                field: "jump profile",
                ..
            })
        );
    }

    #[test]
    fn jump_steps_use_device_numbering() {
        let mut program = sample_program();
        for (step, valid) in [(0, true), (255, true), (256, false)] {
            program.steps[4] = StepDetail::Jump(Jump {
                profile: 1,
                step,
                repeats: 1,
            });
            assert_eq!(program.validate().is_ok(), valid, "jump to step {step}");
        }
    }

    #[test]
    fn setpoints_must_fit_their_registers() {
        let mut program = sample_program();
        if let StepDetail::End(end) = &mut program.steps[6] {
            end.ch1_idle_setpoint = 7000.0;
        }
        assert_matches!(
            program.validate(),
            Err(ValidationError::Field {
                step: 6,
                field: "channel 1 idle setpoint",
                ..
            })
        );

        // fits 16 bits unsigned, but would read back negative
        let mut program = sample_program();
        if let StepDetail::RampByTime(ramp) = &mut program.steps[1] {
            ramp.ch2_setpoint = 4000.0;
        }
        assert_matches!(
            program.validate(),
            Err(ValidationError::Field {
                step: 1,
                field: "channel 2 setpoint",
                ..
            })
        );

        let mut program = sample_program();
        if let StepDetail::RampByRate(ramp) = &mut program.steps[2] {
            ramp.ch1_setpoint = f64::NAN;
        }
        assert_matches!(
            program.validate(),
            Err(ValidationError::Field { step: 2, .. })
        );
    }

    #[test]
    fn device_name_is_truncated() {
        assert_eq!(sample_program().device_name(), "Bake-out c");
        assert_eq!(Program::new("Short", vec![]).device_name(), "Short");
    }

    #[test]
    fn step_type_codes() {
        let codes: Vec<u16> = sample_program()
            .iter()
            .map(|step| step.type_name().code())
            .collect();
        assert_eq!(codes, vec![0, 1, 2, 3, 4, 0, 5]);
    }

    #[cfg(feature = "serde")]
    #[test]
    fn yaml_round_trip_preserves_every_variant() {
        let program = sample_program();
        let text = serde_yaml::to_string(&program).unwrap();
        assert!(text.contains("type_name: Soak"));
        assert!(text.contains("29:30:15"));
        let decoded: Program = serde_yaml::from_str(&text).unwrap();
        assert_eq!(decoded, program);
    }

    #[cfg(feature = "serde")]
    #[test]
    fn yaml_durations_are_normalized_on_decode() {
        let text = r#"
name: Short soak
steps:
  - type_name: Soak
    details:
      events:
        wait_for_event: false
        event_outputs: [false, false, false, false, false, false, false, false]
      duration: "0:125:61"
      ch1_pid_set: 1
      ch2_pid_set: 6
      guaranteed_soak_1: false
      guaranteed_soak_2: false
  - type_name: End
    details:
      action: Hold
      ch1_idle_setpoint: 0.0
      ch2_idle_setpoint: 0.0
"#;
        let program: Program = serde_yaml::from_str(text).unwrap();
        assert_matches!(&program.steps[0], StepDetail::Soak(soak) if soak.duration == Hms::normalize(2, 6, 1));

        let negative = text.replace("0:125:61", "-1:00:00");
        assert!(serde_yaml::from_str::<Program>(&negative).is_err());
    }
}

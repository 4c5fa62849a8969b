//! Drives the profile-edit protocol of the controller.
//!
//! [`ProfileProgrammer::configure`] selects a profile, writes its name, then
//! for every step selects it, switches it to edit mode and writes the fields
//! of that step's variant. A single EEPROM commit closes the sequence.
//!
//! Programming is not atomic. When a register write fails the returned
//! [`ProgrammingError`] names the step and field, and
//! [`ProfileProgrammer::configure_from`] continues from that step.

use crate::clock::{Clock, SystemClock};
use crate::error::Error;
use crate::program::{AutostartSchedule, EventSettings, Program, StepDetail};
use crate::protocol::{self as proto, EditAction, Hms, Register};
use crate::session::DeviceSession;
use crate::transport::PortConnector;
use chrono::{Datelike, NaiveDate};
use log::*;
use std::fmt;

/// Which date an Autostart step in date mode is programmed with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AutostartDateSource {
    /// The date stored in the step.
    #[default]
    StepDate,
    /// Today's date at configuration time.
    WallClock,
}

/// Where in the edit sequence a failure happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Validate,
    SelectProfile,
    Name,
    Step { index: usize, field: &'static str },
    Commit,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Stage::Validate => write!(f, "validation"),
            Stage::SelectProfile => write!(f, "profile selection"),
            Stage::Name => write!(f, "profile name"),
            Stage::Step { index, field } => write!(f, "step {index} ({field})"),
            Stage::Commit => write!(f, "commit"),
        }
    }
}

#[derive(thiserror::Error, Debug)]
#[error("Programming profile {profile} failed at {stage}: {source}")]
pub struct ProgrammingError {
    pub profile: u16,
    pub stage: Stage,
    #[source]
    pub source: Error,
}

impl ProgrammingError {
    /// Step index to pass to [`ProfileProgrammer::configure_from`] after a
    /// reconnect. `None` when the whole profile has to be written again.
    pub fn resume_step(&self) -> Option<usize> {
        match self.stage {
            Stage::Step { index, .. } => Some(index),
            _ => None,
        }
    }
}

/// Records the field currently being written so failures carry context.
struct StepWriter<'s, C: PortConnector> {
    session: &'s mut DeviceSession<C>,
    field: &'static str,
}

impl<C: PortConnector> StepWriter<'_, C> {
    fn value(&mut self, register: &Register, value: f64) -> Result<(), Error> {
        self.field = register.name;
        self.session.write(register, value)
    }

    fn code(&mut self, register: &Register, code: u16) -> Result<(), Error> {
        self.field = register.name;
        self.session.write_code(register, code)
    }

    fn flag(&mut self, register: &Register, flag: bool) -> Result<(), Error> {
        self.code(register, u16::from(flag))
    }

    fn hms(&mut self, registers: [&Register; 3], hms: &Hms) -> Result<(), Error> {
        self.code(registers[0], hms.hours)?;
        self.code(registers[1], hms.minutes)?;
        self.code(registers[2], hms.seconds)
    }

    fn events(&mut self, events: &EventSettings) -> Result<(), Error> {
        self.flag(&proto::PROFILE_WAIT_FOR, events.wait_for_event)?;
        for (number, state) in (1..).zip(events.event_outputs) {
            self.flag(&proto::event_output_register(number)?, state)?;
        }
        Ok(())
    }

    fn date(&mut self, date: NaiveDate) -> Result<(), Error> {
        let year = u16::try_from(date.year()).map_err(|_| proto::Error::ValueOutOfRange {
            value: f64::from(date.year()),
            decimals: 0,
        })?;
        self.code(&proto::PROFILE_AUTOSTART_MONTH, date.month() as u16)?;
        self.code(&proto::PROFILE_AUTOSTART_DAY, date.day() as u16)?;
        self.code(&proto::PROFILE_AUTOSTART_YEAR, year)
    }
}

/// Encodes [`Program`]s into device profiles.
#[derive(Debug, Clone, Default)]
pub struct ProfileProgrammer<K: Clock = SystemClock> {
    date_source: AutostartDateSource,
    clock: K,
}

impl ProfileProgrammer<SystemClock> {
    pub fn new() -> Self {
        Self::default()
    }
}

impl<K: Clock> ProfileProgrammer<K> {
    pub fn with_clock(clock: K) -> Self {
        Self {
            date_source: AutostartDateSource::default(),
            clock,
        }
    }

    pub fn date_source(mut self, date_source: AutostartDateSource) -> Self {
        self.date_source = date_source;
        self
    }

    /// Writes `program` into device profile `profile` and commits it.
    ///
    /// The program is validated first; an invalid program performs no I/O.
    pub fn configure<C: PortConnector>(
        &self,
        session: &mut DeviceSession<C>,
        program: &Program,
        profile: u16,
    ) -> Result<(), ProgrammingError> {
        self.program(session, program, profile, 0)
    }

    /// Writes steps `first_step..` of `program` into an already named
    /// profile and commits. Used to continue after a failed [`configure`].
    ///
    /// [`configure`]: Self::configure
    pub fn configure_from<C: PortConnector>(
        &self,
        session: &mut DeviceSession<C>,
        program: &Program,
        profile: u16,
        first_step: usize,
    ) -> Result<(), ProgrammingError> {
        self.program(session, program, profile, first_step)
    }

    fn program<C: PortConnector>(
        &self,
        session: &mut DeviceSession<C>,
        program: &Program,
        profile: u16,
        first_step: usize,
    ) -> Result<(), ProgrammingError> {
        let fail = |stage, source| {
            let err = ProgrammingError {
                profile,
                stage,
                source,
            };
            error!("{err}");
            err
        };

        proto::check_profile(profile).map_err(|e| fail(Stage::Validate, e.into()))?;
        program
            .validate()
            .map_err(|e| fail(Stage::Validate, e.into()))?;
        if first_step >= program.steps.len() {
            return Err(fail(
                Stage::Validate,
                proto::Error::StepOutOfRange(first_step).into(),
            ));
        }

        info!(
            "Configuring profile {profile} with '{}' ({} steps, starting at step {first_step})",
            program.name,
            program.steps.len()
        );
        select_profile(session, profile).map_err(|e| fail(Stage::SelectProfile, e))?;
        if first_step == 0 {
            write_name(session, profile, &program.name).map_err(|e| fail(Stage::Name, e))?;
        }

        for (index, step) in program.iter().enumerate().skip(first_step) {
            let mut writer = StepWriter {
                session: &mut *session,
                field: proto::PROFILE_STEP_NUMBER.name,
            };
            if let Err(err) = self.write_step(&mut writer, index, step) {
                let field = writer.field;
                return Err(fail(Stage::Step { index, field }, err));
            }
        }

        session.commit().map_err(|e| fail(Stage::Commit, e))?;
        info!("Profile {profile} configured and saved");
        Ok(())
    }

    fn write_step<C: PortConnector>(
        &self,
        w: &mut StepWriter<'_, C>,
        index: usize,
        step: &StepDetail,
    ) -> Result<(), Error> {
        debug!("Writing step {index}: {}", step.type_name());
        w.code(&proto::PROFILE_STEP_NUMBER, proto::check_step(index)?)?;
        w.code(&proto::PROFILE_EDIT_ACTION, EditAction::EditStep.encode())?;
        w.code(&proto::PROFILE_STEP_TYPE, step.type_name().code())?;

        match step {
            StepDetail::RampByTime(ramp) => {
                w.events(&ramp.events)?;
                w.hms(
                    [
                        &proto::PROFILE_RAMP_TIME_HOURS,
                        &proto::PROFILE_RAMP_TIME_MINUTES,
                        &proto::PROFILE_RAMP_TIME_SECONDS,
                    ],
                    &ramp.duration,
                )?;
                w.value(&proto::PROFILE_SETPOINT_CHANNEL_1, ramp.ch1_setpoint)?;
                w.value(&proto::PROFILE_SETPOINT_CHANNEL_2, ramp.ch2_setpoint)?;
                w.code(&proto::PROFILE_PID_SET_CHANNEL_1, ramp.ch1_pid_set.into())?;
                w.code(&proto::PROFILE_PID_SET_CHANNEL_2, ramp.ch2_pid_set.into())?;
                w.flag(&proto::PROFILE_GUARANTEED_SOAK_CHANNEL_1, ramp.guaranteed_soak_1)?;
                w.flag(&proto::PROFILE_GUARANTEED_SOAK_CHANNEL_2, ramp.guaranteed_soak_2)
            }
            StepDetail::RampByRate(ramp) => {
                w.events(&ramp.events)?;
                w.value(&proto::PROFILE_RAMP_RATE, ramp.rate)?;
                w.value(&proto::PROFILE_SETPOINT_CHANNEL_1, ramp.ch1_setpoint)?;
                w.code(&proto::PROFILE_PID_SET_CHANNEL_1, ramp.ch1_pid_set.into())?;
                w.flag(&proto::PROFILE_GUARANTEED_SOAK_CHANNEL_1, ramp.guaranteed_soak_1)
            }
            StepDetail::Soak(soak) => {
                w.events(&soak.events)?;
                w.hms(
                    [
                        &proto::PROFILE_SOAK_TIME_HOURS,
                        &proto::PROFILE_SOAK_TIME_MINUTES,
                        &proto::PROFILE_SOAK_TIME_SECONDS,
                    ],
                    &soak.duration,
                )?;
                w.code(&proto::PROFILE_PID_SET_CHANNEL_1, soak.ch1_pid_set.into())?;
                w.code(&proto::PROFILE_PID_SET_CHANNEL_2, soak.ch2_pid_set.into())?;
                w.flag(&proto::PROFILE_GUARANTEED_SOAK_CHANNEL_1, soak.guaranteed_soak_1)?;
                w.flag(&proto::PROFILE_GUARANTEED_SOAK_CHANNEL_2, soak.guaranteed_soak_2)
            }
            StepDetail::Jump(jump) => {
                w.code(&proto::PROFILE_JUMP_TO_PROFILE, jump.profile)?;
                w.code(&proto::PROFILE_JUMP_TO_STEP, jump.step)?;
                w.code(&proto::PROFILE_JUMP_REPEATS, jump.repeats)
            }
            StepDetail::End(end) => {
                w.code(&proto::PROFILE_END_ACTION, end.action.code())?;
                w.value(&proto::PROFILE_END_IDLE_SETPOINT_CHANNEL_1, end.ch1_idle_setpoint)?;
                w.value(&proto::PROFILE_END_IDLE_SETPOINT_CHANNEL_2, end.ch2_idle_setpoint)
            }
            StepDetail::Autostart(autostart) => {
                w.code(
                    &proto::PROFILE_AUTOSTART_DATE_OR_DAY,
                    autostart.schedule.mode_code(),
                )?;
                match autostart.schedule {
                    AutostartSchedule::Date(date) => {
                        let date = match self.date_source {
                            AutostartDateSource::StepDate => date,
                            AutostartDateSource::WallClock => {
                                let today = self.clock.today();
                                if today != date {
                                    warn!("Step {index}: programming autostart for today ({today}) instead of {date}");
                                }
                                today
                            }
                        };
                        w.date(date)?;
                    }
                    AutostartSchedule::Day(day) => {
                        w.code(&proto::PROFILE_AUTOSTART_DAY_OF_WEEK, day.code())?;
                    }
                }
                w.hms(
                    [
                        &proto::PROFILE_AUTOSTART_HOURS,
                        &proto::PROFILE_AUTOSTART_MINUTES,
                        &proto::PROFILE_AUTOSTART_SECONDS,
                    ],
                    &autostart.start_time,
                )
            }
        }
    }
}

fn select_profile<C: PortConnector>(
    session: &mut DeviceSession<C>,
    profile: u16,
) -> Result<(), Error> {
    proto::check_profile(profile)?;
    session.write_code(&proto::PROFILE_NUMBER, profile)?;
    info!("Selected profile {profile}");
    Ok(())
}

/// One ASCII character per name register; the rest keep their device value.
fn write_name<C: PortConnector>(
    session: &mut DeviceSession<C>,
    profile: u16,
    name: &str,
) -> Result<(), Error> {
    for (index, ch) in name.chars().take(proto::PROFILE_NAME_LEN).enumerate() {
        let ch = if ch.is_ascii() {
            ch
        } else {
            warn!("Profile name character '{ch}' is not ASCII, writing '?'");
            '?'
        };
        session.write_code(&proto::profile_name_register(profile, index)?, ch as u16)?;
    }
    if name.chars().count() > proto::PROFILE_NAME_LEN {
        warn!("Profile name '{name}' truncated to {} characters", proto::PROFILE_NAME_LEN);
    }
    Ok(())
}

/// Deletes every step of `profile` and commits.
pub fn clear_profile<C: PortConnector>(
    session: &mut DeviceSession<C>,
    profile: u16,
) -> Result<(), Error> {
    select_profile(session, profile)?;
    session.write_code(&proto::PROFILE_EDIT_ACTION, EditAction::DeleteProfile.encode())?;
    info!("Profile deleted: {profile}");
    session.commit()
}

/// Starts `profile` at its first step.
pub fn run_profile<C: PortConnector>(
    session: &mut DeviceSession<C>,
    profile: u16,
) -> Result<(), Error> {
    select_profile(session, profile)?;
    session.write_code(&proto::PROFILE_STEP_NUMBER, 0)?;
    session.write_code(&proto::PROFILE_EDIT_ACTION, EditAction::RunProfile.encode())?;
    info!("Profile started: {profile}");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::program::tests::sample_program;
    use crate::session::mock::*;
    use assert_matches::assert_matches;

    /// Splits the write log into the writes made for each selected step,
    /// stopping at the commit.
    fn writes_per_step(writes: &[(u16, u16)]) -> Vec<Vec<(u16, u16)>> {
        let mut steps: Vec<Vec<(u16, u16)>> = Vec::new();
        for &(address, value) in writes {
            if address == proto::SAVE_CHANGES.address {
                break;
            }
            if address == proto::PROFILE_STEP_NUMBER.address {
                steps.push(Vec::new());
            }
            if let Some(step) = steps.last_mut() {
                step.push((address, value));
            }
        }
        steps
    }

    fn value_at(step: &[(u16, u16)], register: &Register) -> Option<u16> {
        step.iter()
            .find(|(address, _)| *address == register.address)
            .map(|(_, value)| *value)
    }

    #[test]
    fn steps_are_written_in_order_with_one_commit() {
        let (mut session, device) = connected();
        let program = sample_program();

        ProfileProgrammer::new()
            .configure(&mut session, &program, 5)
            .unwrap();

        let writes = device.borrow().writes();
        assert_eq!(writes[0], (proto::PROFILE_NUMBER.address, 5));
        let name: Vec<(u16, u16)> = "Bake-out c"
            .bytes()
            .enumerate()
            .map(|(i, b)| (4140 + i as u16, u16::from(b)))
            .collect();
        assert_eq!(&writes[1..11], name.as_slice());
        assert_eq!(writes.last(), Some(&(proto::SAVE_CHANGES.address, 0)));
        assert_eq!(device.borrow().written_to(proto::SAVE_CHANGES.address).len(), 1);

        let steps = writes_per_step(&writes);
        assert_eq!(steps.len(), program.steps.len());
        for (i, step) in steps.iter().enumerate() {
            assert_eq!(step[0], (proto::PROFILE_STEP_NUMBER.address, i as u16));
            assert_eq!(step[1], (proto::PROFILE_EDIT_ACTION.address, 2));
            assert_eq!(
                step[2],
                (
                    proto::PROFILE_STEP_TYPE.address,
                    program.steps[i].type_name().code()
                )
            );
        }
        assert_eq!(session.uncommitted_writes(), 0);
    }

    #[test]
    fn variant_fields_are_encoded() {
        let (mut session, device) = connected();
        ProfileProgrammer::new()
            .configure(&mut session, &sample_program(), 1)
            .unwrap();
        let steps = writes_per_step(&device.borrow().writes());

        // ramp by time
        let ramp = &steps[1];
        assert_eq!(value_at(ramp, &proto::PROFILE_WAIT_FOR), Some(1));
        let outputs: Vec<u16> = (4005..=4012)
            .map(|a| value_at(ramp, &Register::new("event", a)).unwrap())
            .collect();
        assert_eq!(outputs, vec![1, 0, 0, 1, 0, 0, 0, 1]);
        assert_eq!(value_at(ramp, &proto::PROFILE_RAMP_TIME_HOURS), Some(1));
        assert_eq!(value_at(ramp, &proto::PROFILE_SETPOINT_CHANNEL_2), Some(2000));
        assert_eq!(value_at(ramp, &proto::PROFILE_PID_SET_CHANNEL_2), Some(6));
        assert_eq!(value_at(ramp, &proto::PROFILE_GUARANTEED_SOAK_CHANNEL_1), Some(1));

        // ramp by rate
        let rate = &steps[2];
        assert_eq!(value_at(rate, &proto::PROFILE_RAMP_RATE), Some(55));
        assert_eq!(value_at(rate, &proto::PROFILE_SETPOINT_CHANNEL_2), None);

        // soak
        let soak = &steps[3];
        assert_eq!(value_at(soak, &proto::PROFILE_SOAK_TIME_HOURS), Some(29));
        assert_eq!(value_at(soak, &proto::PROFILE_SOAK_TIME_MINUTES), Some(30));
        assert_eq!(value_at(soak, &proto::PROFILE_SOAK_TIME_SECONDS), Some(15));
        assert_eq!(value_at(soak, &proto::PROFILE_SETPOINT_CHANNEL_1), None);

        // jump
        assert_eq!(
            steps[4][3..],
            [(4026, 10), (4027, 5), (4028, 3)]
        );

        // end
        assert_eq!(
            steps[6][3..],
            [(4029, 3), (4030, 200), (4031, (-125i16) as u16)]
        );
    }

    #[test]
    fn autostart_uses_step_date_or_day() {
        let (mut session, device) = connected();
        ProfileProgrammer::new()
            .configure(&mut session, &sample_program(), 1)
            .unwrap();
        let steps = writes_per_step(&device.borrow().writes());

        assert_eq!(
            steps[0][3..],
            [
                (4032, 0),
                (4033, 3),
                (4034, 14),
                (4035, 2025),
                (4037, 6),
                (4038, 30),
                (4039, 0)
            ]
        );
        assert_eq!(
            steps[5][3..],
            [(4032, 1), (4036, 5), (4037, 22), (4038, 0), (4039, 5)]
        );
    }

    #[test]
    fn autostart_wall_clock_date() {
        let (mut session, device) = connected();
        let clock = ManualClock::new(NaiveDate::from_ymd_opt(2026, 10, 19).unwrap());
        ProfileProgrammer::with_clock(clock)
            .date_source(AutostartDateSource::WallClock)
            .configure(&mut session, &sample_program(), 1)
            .unwrap();
        let steps = writes_per_step(&device.borrow().writes());

        assert_eq!(value_at(&steps[0], &proto::PROFILE_AUTOSTART_MONTH), Some(10));
        assert_eq!(value_at(&steps[0], &proto::PROFILE_AUTOSTART_DAY), Some(19));
        assert_eq!(value_at(&steps[0], &proto::PROFILE_AUTOSTART_YEAR), Some(2026));
    }

    #[test]
    fn failure_reports_step_and_resumes() {
        let (mut session, device) = connected();
        let program = sample_program();
        // 1 profile + 10 name + 10 autostart writes, then select/edit/type of step 1
        device.borrow_mut().fail_write_at = Some(24);

        let err = ProfileProgrammer::new()
            .configure(&mut session, &program, 3)
            .unwrap_err();

        assert_eq!(
            err.stage,
            Stage::Step {
                index: 1,
                field: proto::PROFILE_WAIT_FOR.name
            }
        );
        assert_eq!(err.resume_step(), Some(1));
        assert_matches!(err.source, Error::DeviceIo { address: 4004, .. });
        assert!(device.borrow().written_to(proto::SAVE_CHANGES.address).is_empty());

        session.reconnect().unwrap();
        device.borrow_mut().log.clear();
        ProfileProgrammer::new()
            .configure_from(&mut session, &program, 3, 1)
            .unwrap();

        let writes = device.borrow().writes();
        assert_eq!(writes[0], (proto::PROFILE_NUMBER.address, 3));
        assert_eq!(writes[1], (proto::PROFILE_STEP_NUMBER.address, 1));
        assert_eq!(writes_per_step(&writes).len(), program.steps.len() - 1);
        assert_eq!(writes.last(), Some(&(proto::SAVE_CHANGES.address, 0)));
    }

    #[test]
    fn invalid_program_performs_no_io() {
        let (mut session, device) = connected();
        let mut program = sample_program();
        program.steps.pop();

        let err = ProfileProgrammer::new()
            .configure(&mut session, &program, 1)
            .unwrap_err();
        assert_eq!(err.stage, Stage::Validate);
        assert_matches!(err.source, Error::InvalidProgram(_));
        assert_eq!(err.resume_step(), None);

        let err = ProfileProgrammer::new()
            .configure(&mut session, &sample_program(), 41)
            .unwrap_err();
        assert_matches!(
            err.source,
            Error::Addressing(proto::Error::ProfileOutOfRange(41))
        );
        assert!(device.borrow().log.is_empty());
    }

    #[test]
    fn out_of_range_setpoint_is_rejected_before_any_write() {
        let (mut session, device) = connected();
        let mut program = sample_program();
        if let StepDetail::End(end) = &mut program.steps[6] {
            end.ch1_idle_setpoint = 7000.0;
        }

        let err = ProfileProgrammer::new()
            .configure(&mut session, &program, 2)
            .unwrap_err();
        assert_eq!(err.stage, Stage::Validate);
        assert_matches!(err.source, Error::InvalidProgram(_));

        // resuming past the step does not skip the check either
        let err = ProfileProgrammer::new()
            .configure_from(&mut session, &program, 2, 3)
            .unwrap_err();
        assert_eq!(err.stage, Stage::Validate);
        assert!(device.borrow().log.is_empty());
        assert!(session.is_connected());
    }

    #[test]
    fn non_ascii_name_characters_are_replaced() {
        let (mut session, device) = connected();
        write_name(&mut session, 1, "Café").unwrap();
        assert_eq!(
            device.borrow().writes(),
            vec![(4100, 67), (4101, 97), (4102, 102), (4103, 63)]
        );
    }

    #[test]
    fn clear_and_run_profile() {
        let (mut session, device) = connected();
        clear_profile(&mut session, 7).unwrap();
        run_profile(&mut session, 7).unwrap();
        assert_eq!(
            device.borrow().writes(),
            vec![
                (4000, 7),
                (4002, 3),
                (proto::SAVE_CHANGES.address, 0),
                (4000, 7),
                (4001, 0),
                (4002, 5)
            ]
        );
    }
}

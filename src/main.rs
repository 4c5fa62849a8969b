//! Watlow F4 CLI
//!
//! A command-line interface (CLI) application for programming and tuning
//! Watlow F4 temperature controllers over Modbus RTU (serial).
//!
//! This tool allows users to:
//! - Scan the serial ports of the system for a controller.
//! - Read the process temperature and set the static set point.
//! - Read and write PID parameter sets, with engineering-limit clamping.
//! - Write a program file into a device profile, clear or start a profile.
//! - Run step-response tuning for a list of targets from a tuning plan.
//!
//! The CLI leverages the `watlow_f4_lib` crate for protocol definitions and device operations.

use anyhow::{bail, Context, Result};
use clap::Parser;
use dialoguer::Confirm;
use flexi_logger::{Logger, LoggerHandle};
use log::*;
use std::io::{stdout, Write};
use std::{fs::File, panic, path::Path};
use watlow_f4_lib::{
    clock::SystemClock,
    pid::{PidParameters, PidTerms},
    program::Program,
    programmer::{self, AutostartDateSource, ProfileProgrammer},
    session::DeviceSession,
    tokio_common::RtuConnector,
    transport::PortConnector,
    tuner::{DeviceInput, StepResponseTuner},
};

mod commandline;
mod config;

fn logging_init(loglevel: LevelFilter) -> LoggerHandle {
    let log_handle = Logger::try_with_env_or_str(loglevel.as_str())
        .expect("Cannot init logging")
        .start()
        .expect("Cannot start logging");

    panic::set_hook(Box::new(|panic_info| {
        let (filename, line, column) = panic_info
            .location()
            .map(|loc| (loc.file(), loc.line(), loc.column()))
            .unwrap_or(("<unknown_file>", 0, 0));

        let cause_str = if let Some(s) = panic_info.payload().downcast_ref::<&str>() {
            *s
        } else if let Some(s) = panic_info.payload().downcast_ref::<String>() {
            s.as_str()
        } else {
            "<unknown_panic_cause>"
        };

        error!(
            target: "panic",
            "Thread '{}' panicked at '{}': {}:{} - Cause: {}",
            std::thread::current().name().unwrap_or("<unnamed>"),
            filename,
            line,
            column,
            cause_str
        );
    }));
    log_handle
}

/// Asks the user to confirm, unless `--yes` was given.
fn confirm(prompt: &str, assume_yes: bool) -> Result<bool> {
    if assume_yes {
        return Ok(true);
    }
    Confirm::new()
        .with_prompt(prompt)
        .default(false)
        .show_default(true)
        .interact()
        .context("Failed to get user confirmation.")
}

fn connect(args: &commandline::CliArgs) -> Result<DeviceSession<RtuConnector>> {
    let connector = RtuConnector::new(args.address, args.timeout);
    match &args.device {
        Some(device) => info!("Attempting to connect via RTU to device {device} (Address: {})...", args.address),
        None => info!("Probing all serial ports for a controller at address {}...", args.address),
    }
    DeviceSession::connect(connector, args.device.as_deref()).with_context(|| match &args.device {
        Some(device) => format!("Cannot connect to controller on {device}"),
        None => "Cannot find a controller on any serial port".to_string(),
    })
}

/// Probes every serial port separately and reports the result of each.
fn handle_scan(args: &commandline::CliArgs) -> Result<()> {
    let ports = RtuConnector::default()
        .available_ports()
        .context("Cannot list serial ports")?;
    if ports.is_empty() {
        bail!("No serial ports found on this system.");
    }

    let mut found = 0;
    for port in &ports {
        print!("Probing {port} ... ");
        stdout().flush().context("Failed to flush stdout")?;
        let connector = RtuConnector::new(args.address, args.timeout);
        match DeviceSession::connect(connector, Some(port.as_str())).and_then(|mut s| s.read_temperature())
        {
            Ok(temperature) => {
                found += 1;
                println!("SUCCESS! Input 1: {temperature}");
            }
            Err(error) => {
                println!("failed.");
                debug!("Probe error on {port}: {error:?}");
            }
        }
    }
    if found == 0 {
        bail!("No Watlow F4 found on {}.", ports.join(", "));
    }
    Ok(())
}

/// Builds the term pair from the command line options.
fn pid_terms(
    integral: Option<f64>,
    derivative: Option<f64>,
    reset: Option<f64>,
    rate: Option<f64>,
) -> Result<PidTerms> {
    match (integral, derivative, reset, rate) {
        (Some(integral), Some(derivative), None, None) => Ok(PidTerms::IntegralDerivative {
            integral,
            derivative,
        }),
        (None, None, Some(reset), Some(rate)) => Ok(PidTerms::ResetRate { reset, rate }),
        _ => bail!("Give either --integral and --derivative (SI) or --reset and --rate (US)"),
    }
}

fn load_program(path: &Path) -> Result<Program> {
    let file =
        File::open(path).with_context(|| format!("Cannot open program {}", path.display()))?;
    let program: Program = serde_yaml::from_reader(file)
        .with_context(|| format!("Cannot parse program {}", path.display()))?;
    program
        .validate()
        .with_context(|| format!("Invalid program {}", path.display()))?;
    Ok(program)
}

fn handle_program(
    session: &mut DeviceSession<RtuConnector>,
    file: &Path,
    profile: u16,
    wall_clock_date: bool,
    resume_from: Option<usize>,
    assume_yes: bool,
) -> Result<()> {
    let program = load_program(file)?;
    println!(
        "Program '{}' with {} steps will overwrite profile {profile}.",
        program.name,
        program.steps.len()
    );
    if !confirm("Do you want to continue?", assume_yes)? {
        info!("Programming aborted by user.");
        return Ok(());
    }

    let date_source = if wall_clock_date {
        AutostartDateSource::WallClock
    } else {
        AutostartDateSource::StepDate
    };
    let programmer = ProfileProgrammer::new().date_source(date_source);
    let result = match resume_from {
        Some(step) => programmer.configure_from(session, &program, profile, step),
        None => programmer.configure(session, &program, profile),
    };
    if let Err(error) = result {
        if let Some(step) = error.resume_step() {
            println!("Profile {profile} is only partially written.");
            println!("Rerun with --resume-from {step} to continue from the failed step.");
        }
        return Err(error.into());
    }
    println!(
        "Program '{}' written to profile {profile} and saved.",
        program.device_name()
    );
    Ok(())
}

fn handle_tune(session: &mut DeviceSession<RtuConnector>, plan: &str, assume_yes: bool) -> Result<()> {
    let plan = config::TuningPlan::load(Path::new(plan))?;
    if plan.targets.is_empty() {
        bail!("The tuning plan has no targets.");
    }
    println!("Tuning {} target(s):", plan.targets.len());
    for target in &plan.targets {
        println!("  {target}");
    }
    println!(
        "WARNING: The set point of the controller will be changed for roughly {:?} per target.",
        plan.settle_time + plan.step_duration + plan.verification_duration
    );
    if !confirm("Do you want to start tuning?", assume_yes)? {
        info!("Tuning aborted by user.");
        return Ok(());
    }

    let tuner = StepResponseTuner::new(SystemClock, plan.settings());
    let report = tuner.tune_targets(session, &mut DeviceInput, &plan.targets);

    println!("Summary of tuned PID parameters:");
    for (target, tuned) in report.tuned() {
        println!("  {target} -> {}", tuned.parameters);
        if tuned.curve.is_degraded() {
            println!("    degraded fit: {:?}", tuned.curve.quality);
        }
        for clamp in &tuned.clamps {
            println!(
                "    clamped {} from {} to {}",
                clamp.parameter, clamp.original, clamp.clamped
            );
        }
        if let Some(verification) = tuned.verification {
            println!(
                "    mean error {:.2}, max error {:.2}",
                verification.mean_abs_error, verification.max_abs_error
            );
        }
    }
    for (target, failure) in report.failures() {
        println!("  {target} FAILED: {failure}");
    }
    if report.tuned().next().is_none() {
        bail!("No PID parameters were successfully tuned.");
    }
    Ok(())
}

fn print_pid(params: &PidParameters) {
    println!("Proportional band: {}", params.proportional_band);
    match params.terms {
        PidTerms::IntegralDerivative {
            integral,
            derivative,
        } => {
            println!("Integral (min/repeat): {integral}");
            println!("Derivative (min): {derivative}");
        }
        PidTerms::ResetRate { reset, rate } => {
            println!("Reset (repeats/min): {reset}");
            println!("Rate (min): {rate}");
        }
    }
    println!("Dead band: {}", params.dead_band);
    println!("Hysteresis: {}", params.hysteresis);
}

fn main() -> Result<()> {
    let args = commandline::CliArgs::parse();

    // 1. Initialize logging as early as possible
    let _log_handle = logging_init(args.verbose.log_level_filter());
    info!(
        "Watlow F4 CLI started. Log level: {}",
        args.verbose.log_level_filter()
    );

    // 2. Scan has its own per-port workflow
    if args.command == commandline::CliCommands::Scan {
        return handle_scan(&args);
    }

    // 3. Every other command works on one session
    let mut session = connect(&args)?;
    if let Some(port) = session.port() {
        info!("Connected on {port}");
    }

    match &args.command {
        commandline::CliCommands::Scan => unreachable!("Scan should be handled earlier."),
        commandline::CliCommands::ReadTemperature => {
            info!("Executing: Read Temperature");
            let temperature = session
                .read_temperature()
                .with_context(|| "Cannot read temperature")?;
            println!("Input 1: {temperature}");
        }
        commandline::CliCommands::SetSetpoint { value } => {
            info!("Executing: Set Set Point 1 to {value}");
            session
                .set_temperature_setpoint(*value)
                .with_context(|| format!("Failed to set set point 1 to {value}"))?;
            println!("Set point 1 set to {value} and saved.");
        }
        commandline::CliCommands::ReadPid {
            pid_set,
            channel,
            side,
        } => {
            info!("Executing: Read PID set {pid_set}, channel {channel}, side {side}");
            let params = session
                .read_pid_parameters(*pid_set, *channel, *side)
                .with_context(|| format!("Cannot read PID set {pid_set}"))?;
            println!("PID set {pid_set}, channel {channel}{side} ({} units):", params.terms.unit_mode());
            print_pid(&params);
        }
        commandline::CliCommands::WritePid {
            pid_set,
            channel,
            side,
            proportional_band,
            integral,
            derivative,
            reset,
            rate,
            dead_band,
            hysteresis,
        } => {
            let params = PidParameters {
                proportional_band: *proportional_band,
                terms: pid_terms(*integral, *derivative, *reset, *rate)?,
                dead_band: *dead_band,
                hysteresis: *hysteresis,
            };
            info!("Executing: Write PID set {pid_set}, channel {channel}, side {side}: {params}");
            let report = session
                .write_pid_parameters(&params, *pid_set, *channel, *side)
                .with_context(|| format!("Failed to write PID set {pid_set}"))?;
            for clamp in &report.clamps {
                println!(
                    "Clamped {} from {} to {}",
                    clamp.parameter, clamp.original, clamp.clamped
                );
            }
            if !report.hysteresis_written {
                println!("Hysteresis not written: only used when the proportional band is 0.");
            }
            println!("PID set {pid_set} written and saved.");
        }
        commandline::CliCommands::Program {
            file,
            profile,
            wall_clock_date,
            resume_from,
        } => {
            info!("Executing: Program profile {profile} from {}", file.display());
            handle_program(
                &mut session,
                file,
                *profile,
                *wall_clock_date,
                *resume_from,
                args.yes,
            )?;
        }
        commandline::CliCommands::ClearProfile { profile } => {
            info!("Executing: Clear profile {profile}");
            if !confirm(
                &format!("Delete every step of profile {profile}?"),
                args.yes,
            )? {
                info!("Clear profile aborted by user.");
                return Ok(());
            }
            programmer::clear_profile(&mut session, *profile)
                .with_context(|| format!("Failed to clear profile {profile}"))?;
            println!("Profile {profile} cleared.");
        }
        commandline::CliCommands::RunProfile { profile } => {
            info!("Executing: Run profile {profile}");
            programmer::run_profile(&mut session, *profile)
                .with_context(|| format!("Failed to start profile {profile}"))?;
            println!("Profile {profile} started.");
        }
        commandline::CliCommands::Tune { plan } => {
            info!("Executing: Tune from plan {plan}");
            handle_tune(&mut session, plan, args.yes)?;
        }
    }

    Ok(())
}

use crate::config::TuningPlan;
use clap::{Parser, Subcommand};
use clap_verbosity_flag::{Verbosity, WarnLevel};
use std::{path::PathBuf, time::Duration};
use watlow_f4_lib::protocol as proto;

fn parse_address(s: &str) -> Result<u8, String> {
    let address =
        clap_num::maybe_hex::<u8>(s).map_err(|e| format!("Invalid address format: {e}"))?;
    if (1..=247).contains(&address) {
        Ok(address)
    } else {
        Err(format!("Address {address} is out of range (1..=247)"))
    }
}

fn parse_profile(s: &str) -> Result<u16, String> {
    let profile = s
        .parse::<u16>()
        .map_err(|e| format!("Invalid profile number format: {e}"))?;
    proto::check_profile(profile).map_err(|e| e.to_string())?;
    Ok(profile)
}

fn parse_side(s: &str) -> Result<proto::OutputSide, String> {
    s.parse::<proto::OutputSide>().map_err(|e| e.to_string())
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum CliCommands {
    /// List the serial ports of this system and probe each for a controller.
    Scan,

    /// Read and display the process value of input 1.
    ReadTemperature,

    /// Set the static set point 1 and save it to EEPROM.
    SetSetpoint {
        /// Set point in device units, e.g. "150.5" or "-20".
        #[arg(allow_negative_numbers = true)]
        value: f64,
    },

    /// Read and display one PID set.
    /// The integral/derivative or reset/rate pair is shown depending on the
    /// PID units mode of the device.
    #[clap(verbatim_doc_comment)]
    ReadPid {
        /// PID set number: 1 to 5 on channel 1, 6 to 10 on channel 2.
        pid_set: u8,
        /// Control channel (1 or 2).
        channel: u8,
        /// Output side: A (heat) or B (cool).
        #[arg(value_parser = parse_side, default_value = "A")]
        side: proto::OutputSide,
    },

    /// Write one PID set and save it to EEPROM.
    /// Values outside the engineering limits are clamped.
    /// Give --integral/--derivative for a device in SI mode,
    /// --reset/--rate for a device in US mode.
    /// Hysteresis is only written when the proportional band is 0.
    #[clap(verbatim_doc_comment)]
    WritePid {
        pid_set: u8,
        channel: u8,
        #[arg(value_parser = parse_side, default_value = "A")]
        side: proto::OutputSide,
        #[arg(long)]
        proportional_band: f64,
        /// Minutes per repeat (SI).
        #[arg(long, requires = "derivative", conflicts_with_all = ["reset", "rate"])]
        integral: Option<f64>,
        /// Minutes (SI).
        #[arg(long, requires = "integral")]
        derivative: Option<f64>,
        /// Repeats per minute (US).
        #[arg(long, requires = "rate")]
        reset: Option<f64>,
        /// Minutes (US).
        #[arg(long, requires = "reset")]
        rate: Option<f64>,
        #[arg(long, default_value_t = 0.0)]
        dead_band: f64,
        #[arg(long, default_value_t = 1.0)]
        hysteresis: f64,
    },

    /// Write a program file (YAML) into a device profile and save it.
    Program {
        /// Program file as written by the step editor.
        file: PathBuf,
        /// Device profile number (1 to 40).
        #[arg(value_parser = parse_profile)]
        profile: u16,
        /// Program Autostart dates with today's date instead of the step date.
        #[arg(long)]
        wall_clock_date: bool,
        /// Continue a failed programming run from this step index.
        #[arg(long)]
        resume_from: Option<usize>,
    },

    /// Delete all steps of a device profile.
    ClearProfile {
        #[arg(value_parser = parse_profile)]
        profile: u16,
    },

    /// Start a device profile at its first step.
    RunProfile {
        #[arg(value_parser = parse_profile)]
        profile: u16,
    },

    /// Run step-response tuning for every target of a tuning plan.
    /// The controller input 1 is used as temperature source.
    /// **Warning:** The set point of the controller is changed during the run.
    #[clap(verbatim_doc_comment)]
    Tune {
        /// The tuning plan file (YAML).
        #[arg(long, default_value_t = TuningPlan::DEFAULT_CONFIG_FILE.to_string())]
        plan: String,
    },
}

const fn about_text() -> &'static str {
    "Watlow F4 CLI - Program profiles and tune PID sets of Watlow F4 controllers via Modbus RTU."
}

#[derive(Parser, Debug)]
#[command(name="f4tool", author, version, about=about_text(), long_about = None, propagate_version = true)]
pub struct CliArgs {
    /// Configure verbosity of logging output.
    /// -v for info, -vv for debug, -vvv for trace. Default is off.
    #[command(flatten)]
    pub verbose: Verbosity<WarnLevel>,

    /// Serial port device name, e.g. "/dev/ttyUSB0" or "COM3".
    /// Omit to probe every serial port of the system.
    #[arg(global = true, short, long, verbatim_doc_comment)]
    pub device: Option<String>,

    /// The Modbus RTU device address (1 to 247).
    /// Can be specified in decimal or hexadecimal (e.g. "0x01").
    #[arg(global = true, short, long, default_value_t = proto::DEFAULT_SLAVE_ADDRESS, value_parser = parse_address, verbatim_doc_comment)]
    pub address: u8,

    /// Modbus I/O timeout for read/write operations.
    /// Examples: "1s", "500ms".
    #[arg(global = true, long, default_value = "1s", value_parser = humantime::parse_duration, verbatim_doc_comment)]
    pub timeout: Duration,

    /// Answer yes to every confirmation prompt.
    #[arg(global = true, short, long)]
    pub yes: bool,

    #[command(subcommand)]
    pub command: CliCommands,
}

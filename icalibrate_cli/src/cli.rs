//! CLI argument definitions and shared statics.

use clap::{ArgAction, Args, Parser, Subcommand};
use std::path::PathBuf;
use std::sync::OnceLock;

pub static FILE_GUARD: OnceLock<tracing_appender::non_blocking::WorkerGuard> = OnceLock::new();
/// Whether the user asked for JSON output (controls structured error output).
pub static JSON_MODE: OnceLock<bool> = OnceLock::new();

#[derive(Parser, Debug)]
#[command(
    name = "icalibrate",
    version,
    about = "Ion chamber dose-rate calibration"
)]
pub struct Cli {
    /// Path to config TOML
    #[arg(long, value_name = "FILE", default_value = "etc/icalibrate.toml")]
    pub config: PathBuf,

    /// Emit JSON lines (logs, events, results and errors)
    #[arg(long, action = ArgAction::SetTrue)]
    pub json: bool,

    /// Console log level (error|warn|info|debug|trace); RUST_LOG takes precedence
    #[arg(long = "log-level", value_name = "LEVEL")]
    pub log_level: Option<String>,

    /// Command to execute
    #[command(subcommand)]
    pub cmd: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Sweep the attenuator and record dose rate against beam current
    Run(RunArgs),
    /// Fit a saved dataset and print trip setpoints
    Fit(FitArgs),
    /// Fit a saved dataset and write the trip setpoints to the detectors
    Export(FitArgs),
    /// Validate the config and print the resolved PV sets
    SelfCheck,
}

#[derive(Args, Debug)]
pub struct RunArgs {
    /// Experimental hall (A, C or D)
    #[arg(long)]
    pub hall: String,
    /// Laser whose attenuator is driven (A..D)
    #[arg(long)]
    pub laser: String,
    #[arg(long, default_value = "")]
    pub target: String,
    #[arg(long, default_value = "")]
    pub pass: String,
    #[arg(long, default_value = "")]
    pub note: String,
    /// Minimum attenuator value (defaults to [run].min_attenuator)
    #[arg(long, allow_hyphen_values = true)]
    pub min: Option<i64>,
    /// Maximum attenuator value (defaults to [run].max_attenuator)
    #[arg(long, allow_hyphen_values = true)]
    pub max: Option<i64>,
    /// Number of attenuator steps
    #[arg(long, allow_hyphen_values = true)]
    pub steps: Option<i64>,
    /// Settle time per step, in seconds
    #[arg(long, allow_hyphen_values = true)]
    pub settle: Option<i64>,
    /// Samples averaged per step
    #[arg(long, allow_hyphen_values = true)]
    pub samples: Option<i64>,
    /// Directory for the dataset file
    #[arg(long, value_name = "DIR", default_value = ".")]
    pub out: PathBuf,
    /// Operator recorded in the dataset (defaults to $USER)
    #[arg(long)]
    pub operator: Option<String>,
    /// Length of one settle second in milliseconds
    #[arg(long, hide = true, default_value_t = 1000)]
    pub settle_unit_ms: u64,
    /// Simulated channels that never answer
    #[arg(long, hide = true, value_name = "PV")]
    pub sim_unreachable: Vec<String>,
    /// Trip the simulated interlock on the Nth read of PV
    #[arg(long, hide = true, value_name = "PV:N", value_parser = parse_trip)]
    pub sim_trip_on_read: Vec<(String, u64)>,
}

/// `PV:N`, split at the last colon since PV names contain colons.
fn parse_trip(s: &str) -> Result<(String, u64), String> {
    let (pv, n) = s
        .rsplit_once(':')
        .ok_or_else(|| format!("expected PV:N, got {s:?}"))?;
    let n: u64 = n.parse().map_err(|e| format!("read count {n:?}: {e}"))?;
    if pv.is_empty() || n == 0 {
        return Err(format!("expected PV:N with N >= 1, got {s:?}"));
    }
    Ok((pv.to_string(), n))
}

#[derive(Args, Debug)]
pub struct FitArgs {
    /// HCD dataset file
    #[arg(long, value_name = "FILE")]
    pub file: PathBuf,
    /// Beam current for the setpoint (defaults to the hall's max current)
    #[arg(long)]
    pub current: Option<f64>,
    /// Margin magnitude in percent
    #[arg(long, default_value_t = 0.0)]
    pub margin: f64,
    /// Apply the margin downwards regardless of target
    #[arg(long, action = ArgAction::SetTrue)]
    pub negative: bool,
    /// Use the log-linear fit instead of the linear one
    #[arg(long, action = ArgAction::SetTrue)]
    pub log: bool,
    /// First measurement index included in the fit
    #[arg(long)]
    pub min_index: Option<usize>,
    /// Last measurement index included in the fit
    #[arg(long)]
    pub max_index: Option<usize>,
    /// Also write the setpoints to this SNAP file
    #[arg(long, value_name = "FILE")]
    pub snap: Option<PathBuf>,
}

//! CLI argument parsing using clap
//!
//! `monitor` accepts its own options anywhere after the script as well, so
//! `powerpulse monitor train.py --epochs 3 -f 2` samples at 2 Hz and passes
//! `--epochs 3` to the script. Tokens after a literal `--` always belong to
//! the script.

use crate::output::ReportFormat;
use clap::{Args, Parser, Subcommand};
use std::ffi::{OsStr, OsString};
use std::path::PathBuf;

/// `monitor` options that take a value and may follow the script
const MONITOR_VALUE_OPTIONS: &[&str] = &[
    "-f",
    "--frequency",
    "--format",
    "-o",
    "--outdir",
    "--interpreter",
    "--backends",
    "--rank",
    "--size",
    "--coordinator",
    "--connect-timeout",
];

/// Global options that take a value
const GLOBAL_VALUE_OPTIONS: &[&str] = &["--config"];

/// PowerPulse - energy and power telemetry for running workloads
#[derive(Parser, Debug)]
#[command(name = "powerpulse")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Enable debug logging (RUST_LOG overrides)
    #[arg(long, global = true)]
    pub debug: bool,

    /// TOML configuration file (command-line options take precedence)
    #[arg(long, global = true, value_name = "FILE")]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

impl Cli {
    /// Parse `argv`, picking up `monitor` options placed after the script
    pub fn try_parse_monitor_aware<I, T>(argv: I) -> Result<Self, clap::Error>
    where
        I: IntoIterator<Item = T>,
        T: Into<OsString>,
    {
        let argv: Vec<OsString> = argv.into_iter().map(Into::into).collect();
        Self::try_parse_from(hoist_monitor_options(argv))
    }

    /// Like [`try_parse_monitor_aware`](Self::try_parse_monitor_aware) on the
    /// process arguments; exits with clap's message on error
    pub fn parse_monitor_aware() -> Self {
        Self::try_parse_monitor_aware(std::env::args_os()).unwrap_or_else(|e| e.exit())
    }
}

/// Move `monitor` options found among the script arguments in front of the script
fn hoist_monitor_options(mut argv: Vec<OsString>) -> Vec<OsString> {
    let Some(subcommand) = first_positional(&argv, 1, GLOBAL_VALUE_OPTIONS) else {
        return argv;
    };
    if argv[subcommand].to_str() != Some("monitor") {
        return argv;
    }
    let Some(script) = first_positional(&argv, subcommand + 1, MONITOR_VALUE_OPTIONS) else {
        return argv;
    };

    let mut trailing = argv.split_off(script + 1).into_iter();
    let mut hoisted = Vec::new();
    let mut script_args = Vec::new();

    while let Some(token) = trailing.next() {
        if token.to_str() == Some("--") {
            script_args.push(token);
            script_args.extend(trailing.by_ref());
            break;
        }
        match token.to_str().and_then(value_option) {
            Some(true) => hoisted.push(token),
            Some(false) => {
                hoisted.push(token);
                hoisted.extend(trailing.next());
            }
            None => script_args.push(token),
        }
    }

    let script_path = argv.split_off(script);
    argv.extend(hoisted);
    argv.extend(script_path);
    argv.extend(script_args);
    argv
}

/// Index of the first positional token at or after `start`
fn first_positional(argv: &[OsString], start: usize, value_options: &[&str]) -> Option<usize> {
    let mut i = start;
    while i < argv.len() {
        let token = argv[i].as_os_str();
        if token == OsStr::new("--") {
            return (i + 1 < argv.len()).then_some(i + 1);
        }
        match token.to_str() {
            Some(s) if value_options.contains(&s) || GLOBAL_VALUE_OPTIONS.contains(&s) => i += 2,
            Some(s) if s.starts_with('-') && s.len() > 1 => i += 1,
            _ => return Some(i),
        }
    }
    None
}

/// `Some(true)` for `--option=value`, `Some(false)` for an option whose
/// value is the next token, `None` for anything else
fn value_option(token: &str) -> Option<bool> {
    if MONITOR_VALUE_OPTIONS.contains(&token) {
        return Some(false);
    }
    match token.split_once('=') {
        Some((name, _)) if name.starts_with("--") && MONITOR_VALUE_OPTIONS.contains(&name) => {
            Some(true)
        }
        _ => None,
    }
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run a script while sampling the node's sensors
    Monitor(MonitorArgs),

    /// Render the report of a stored run
    Report(ReportArgs),

    /// Summarize the runs of an experiment in place
    Postprocess(PostprocessArgs),

    /// List the devices visible on this node
    Sensors(SensorsArgs),
}

#[derive(Args, Debug)]
pub struct MonitorArgs {
    /// Sampling frequency in Hz [default: 1]
    #[arg(short = 'f', long)]
    pub frequency: Option<f64>,

    /// Report format printed after the run [default: txt]
    #[arg(long, value_enum)]
    pub format: Option<ReportFormat>,

    /// Output directory for the experiment [default: ./]
    #[arg(short = 'o', long)]
    pub outdir: Option<PathBuf>,

    /// Interpreter used to run the script (e.g. python3)
    #[arg(long)]
    pub interpreter: Option<String>,

    /// Comma-separated sensor backends (rapl, proc, mock)
    #[arg(long, value_delimiter = ',')]
    pub backends: Option<Vec<String>>,

    /// Rank of this process
    #[arg(long, env = "POWERPULSE_RANK")]
    pub rank: Option<usize>,

    /// Number of cooperating processes
    #[arg(long, env = "POWERPULSE_SIZE")]
    pub size: Option<usize>,

    /// Rendezvous address of rank 0 (host:port)
    #[arg(long, env = "POWERPULSE_COORDINATOR")]
    pub coordinator: Option<String>,

    /// Seconds to wait for all ranks to connect
    #[arg(long)]
    pub connect_timeout: Option<u64>,

    /// Script to run
    pub script: PathBuf,

    /// Arguments passed to the script
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    pub args: Vec<String>,
}

#[derive(Args, Debug)]
pub struct ReportArgs {
    /// Experiment directory or its experiment.json
    pub file: PathBuf,

    /// Report format
    #[arg(short = 'f', long, value_enum, default_value_t = ReportFormat::Text)]
    pub format: ReportFormat,

    /// Run to report [default: latest]
    #[arg(long)]
    pub run: Option<usize>,
}

#[derive(Args, Debug)]
pub struct PostprocessArgs {
    /// Experiment directory or its experiment.json
    pub file: PathBuf,
}

#[derive(Args, Debug)]
pub struct SensorsArgs {
    /// Comma-separated sensor backends (rapl, proc, mock)
    #[arg(long, value_delimiter = ',')]
    pub backends: Option<Vec<String>>,
}

//! PowerPulse CLI entry point

use anyhow::{Context, Result};
use powerpulse::backend::BackendRegistry;
use powerpulse::comm::{self, LocalCommunicator};
use powerpulse::config::cli::{Cli, Command, MonitorArgs, PostprocessArgs, ReportArgs, SensorsArgs};
use powerpulse::config::{toml, validator, Config};
use powerpulse::orchestrator::{MonitorSettings, Orchestrator, ScriptWorkload};
use powerpulse::output::{render_report, ReportFormat};
use powerpulse::postprocess::postprocess;
use powerpulse::sampler::SamplingFrequency;
use powerpulse::storage::{ExperimentStorage, RunId};
use powerpulse::util::time::format_value;
use std::sync::Arc;
use tracing::error;
use tracing_subscriber::EnvFilter;

fn main() -> Result<()> {
    let cli = Cli::parse_monitor_aware();
    let config = toml::load_config(cli.config.as_deref())?;

    init_tracing(cli.debug || config.runtime.debug);

    match cli.command {
        Command::Monitor(args) => run_monitor(args, config),
        Command::Report(args) => run_report(args),
        Command::Postprocess(args) => run_postprocess(args),
        Command::Sensors(args) => run_sensors(args, config),
    }
}

/// Install the stderr log subscriber; `RUST_LOG` takes precedence
fn init_tracing(debug: bool) {
    let default_level = if debug { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

fn run_monitor(args: MonitorArgs, config: Config) -> Result<()> {
    let mut config = toml::merge_monitor_args(&args, config);
    config
        .cluster
        .fill_from_launcher(|name| std::env::var(name).ok());
    validator::validate_config(&config).context("Configuration validation failed")?;

    let frequency = SamplingFrequency::new(config.sampling.frequency)?;
    let registry = Arc::new(BackendRegistry::from_config(&config.backends)?);
    let experiment_dir = ExperimentStorage::experiment_dir(&config.output.outdir, &args.script);

    let comm = comm::connect(&config.cluster).context("Failed to join the rendezvous")?;
    if comm.is_root() && config.output.format == ReportFormat::Text {
        print_configuration(&config, &args, comm.size());
    }

    let settings = MonitorSettings {
        frequency,
        experiment_dir,
        format: config.output.format,
        report_rank: 0,
    };
    let mut workload = ScriptWorkload::new(args.script.clone(), args.args.clone())
        .with_interpreter(config.workload.interpreter.clone());

    let mut orchestrator = Orchestrator::new(comm, registry, settings);
    match orchestrator.run(&mut workload) {
        Ok(outcome) => {
            if let Some(report) = outcome.report {
                println!("{}", report);
            }
            Ok(())
        }
        Err(e) => {
            error!(kind = e.kind(), "{}", e);
            Err(e.into())
        }
    }
}

fn run_report(args: ReportArgs) -> Result<()> {
    let storage = ExperimentStorage::open_existing(&args.file, Arc::new(LocalCommunicator::new()))?;
    let report = render_report(&storage, args.run.map(RunId::new), args.format)?;
    println!("{}", report);
    Ok(())
}

fn run_postprocess(args: PostprocessArgs) -> Result<()> {
    let storage = ExperimentStorage::open_existing(&args.file, Arc::new(LocalCommunicator::new()))?;
    let summarized = postprocess(&storage)?;
    println!(
        "Summarized {} rank records in {} runs of '{}'",
        summarized,
        storage.completed_runs().count(),
        storage.name()
    );
    Ok(())
}

fn run_sensors(args: SensorsArgs, mut config: Config) -> Result<()> {
    if let Some(backends) = args.backends {
        config.backends.enabled = backends;
    }
    validator::validate_backends(&config.backends)?;

    let registry = BackendRegistry::from_config(&config.backends)?;
    let devices = registry.inventory()?;

    println!("═══════════════════════════════════════════════════════════");
    println!("                    SENSORS");
    println!("═══════════════════════════════════════════════════════════");
    if devices.is_empty() {
        println!("No devices found (backends: {})", config.backends.enabled.join(", "));
        return Ok(());
    }

    let mut sessions = Vec::new();
    for backend in registry.iter() {
        if let Ok(session) = backend.open() {
            sessions.push((backend.name().to_string(), session));
        }
    }

    for device in &devices {
        let current = sessions
            .iter_mut()
            .find(|(name, _)| name == device.id.backend())
            .and_then(|(_, session)| session.read(&device.id).ok())
            .map(|value| format_value(device.kind, value))
            .unwrap_or_else(|| "unreadable".to_string());

        println!(
            "  {:<28} {:<12} {:<24} {}",
            device.id.to_string(),
            device.kind.to_string(),
            device.description,
            current
        );
    }

    for (_, session) in sessions.iter_mut() {
        let _ = session.close();
    }
    Ok(())
}

fn print_configuration(config: &Config, args: &MonitorArgs, world_size: usize) {
    println!("PowerPulse v{}", env!("CARGO_PKG_VERSION"));
    println!("═══════════════════════════════════════════════════════════");
    println!("Script:     {}", args.script.display());
    if !args.args.is_empty() {
        println!("Arguments:  {}", args.args.join(" "));
    }
    println!("Frequency:  {} Hz", config.sampling.frequency);
    println!("Backends:   {}", config.backends.enabled.join(", "));
    println!("Ranks:      {}", world_size);
    println!("Output:     {}", config.output.outdir.display());
    println!("═══════════════════════════════════════════════════════════");
    println!();
}

//! TOML configuration file parsing

use super::*;
use crate::config::cli::MonitorArgs;
use crate::Result;
use anyhow::Context;
use std::fs;
use std::path::Path;

/// Parse TOML configuration file
pub fn parse_toml_file(path: &Path) -> Result<Config> {
    let contents = fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    parse_toml_string(&contents)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))
}

/// Parse TOML configuration from string
pub fn parse_toml_string(contents: &str) -> Result<Config> {
    let config: Config =
        ::toml::from_str(contents).context("Failed to parse TOML configuration")?;

    Ok(config)
}

/// Load the configuration file if one was given, defaults otherwise
pub fn load_config(path: Option<&Path>) -> Result<Config> {
    match path {
        Some(path) => parse_toml_file(path),
        None => Ok(Config::default()),
    }
}

/// Merge monitor arguments into a configuration (CLI takes precedence)
pub fn merge_monitor_args(args: &MonitorArgs, mut config: Config) -> Config {
    if let Some(frequency) = args.frequency {
        config.sampling.frequency = frequency;
    }
    if let Some(format) = args.format {
        config.output.format = format;
    }
    if let Some(outdir) = &args.outdir {
        config.output.outdir = outdir.clone();
    }
    if let Some(interpreter) = &args.interpreter {
        config.workload.interpreter = Some(interpreter.clone());
    }
    if let Some(backends) = &args.backends {
        config.backends.enabled = backends.clone();
    }
    if let Some(rank) = args.rank {
        config.cluster.rank = Some(rank);
    }
    if let Some(size) = args.size {
        config.cluster.size = Some(size);
    }
    if let Some(coordinator) = &args.coordinator {
        config.cluster.coordinator = Some(coordinator.clone());
    }
    if let Some(timeout) = args.connect_timeout {
        config.cluster.connect_timeout_secs = timeout;
    }

    config
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::cli::{Cli, Command};
    use clap::Parser;

    #[test]
    fn test_parse_full_file() {
        let config = parse_toml_string(
            r#"
            [sampling]
            frequency = 4.0

            [output]
            outdir = "/scratch/energy"
            format = "yml"

            [cluster]
            size = 4
            coordinator = "node01:7070"

            [backends]
            enabled = ["mock"]
            mock_devices = 3

            [workload]
            interpreter = "python3"
            "#,
        )
        .unwrap();

        assert_eq!(config.sampling.frequency, 4.0);
        assert_eq!(config.output.format, ReportFormat::Yaml);
        assert_eq!(config.cluster.size, Some(4));
        assert_eq!(config.cluster.connect_timeout_secs, 60);
        assert_eq!(config.backends.mock_devices, 3);
        assert_eq!(config.backends.rapl_root, PathBuf::from("/sys/class/powercap"));
        assert_eq!(config.workload.interpreter.as_deref(), Some("python3"));
    }

    #[test]
    fn test_empty_file_gives_defaults() {
        assert_eq!(parse_toml_string("").unwrap(), Config::default());
    }

    #[test]
    fn test_invalid_toml() {
        assert!(parse_toml_string("[sampling\nfrequency = ").is_err());
        assert!(parse_toml_string("[sampling]\nfrequency = \"fast\"").is_err());
    }

    #[test]
    fn test_load_config_from_file() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("pulse.toml");
        fs::write(&path, "[sampling]\nfrequency = 10.0\n").unwrap();

        assert_eq!(load_config(Some(&path)).unwrap().sampling.frequency, 10.0);
        assert_eq!(load_config(None).unwrap(), Config::default());
        assert!(load_config(Some(&tmp.path().join("missing.toml"))).is_err());
    }

    #[test]
    fn test_cli_overrides_file() {
        let file = parse_toml_string(
            "[sampling]\nfrequency = 4.0\n[output]\noutdir = \"/from/file\"\n",
        )
        .unwrap();
        let cli = Cli::try_parse_from(["powerpulse", "monitor", "-f", "8", "job.sh"]).unwrap();
        let Command::Monitor(args) = cli.command else {
            panic!("expected monitor");
        };

        let merged = merge_monitor_args(&args, file);
        assert_eq!(merged.sampling.frequency, 8.0);
        assert_eq!(merged.output.outdir, PathBuf::from("/from/file"));
    }
}

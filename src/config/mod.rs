//! Configuration module
//!
//! Handles CLI argument parsing, TOML configuration files, launcher
//! environment detection and validation.

pub mod cli;
pub mod toml;
pub mod validator;

use crate::output::ReportFormat;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Complete monitor configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub sampling: SamplingConfig,
    #[serde(default)]
    pub output: OutputConfig,
    #[serde(default)]
    pub cluster: ClusterConfig,
    #[serde(default)]
    pub backends: BackendsConfig,
    #[serde(default)]
    pub workload: WorkloadConfig,
    #[serde(default)]
    pub runtime: RuntimeConfig,
}

/// Sampling configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SamplingConfig {
    /// Sampling frequency in Hz
    #[serde(default = "default_frequency")]
    pub frequency: f64,
}

impl Default for SamplingConfig {
    fn default() -> Self {
        Self {
            frequency: default_frequency(),
        }
    }
}

fn default_frequency() -> f64 {
    1.0
}

/// Output configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutputConfig {
    /// Directory receiving `<script>.pulse` experiment directories
    #[serde(default = "default_outdir")]
    pub outdir: PathBuf,
    /// Format of the report printed after a run
    #[serde(default)]
    pub format: ReportFormat,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            outdir: default_outdir(),
            format: ReportFormat::default(),
        }
    }
}

fn default_outdir() -> PathBuf {
    PathBuf::from("./")
}

/// Position of this process in the job
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClusterConfig {
    /// Rank of this process (default 0)
    #[serde(default)]
    pub rank: Option<usize>,
    /// Number of processes (default 1)
    #[serde(default)]
    pub size: Option<usize>,
    /// `host:port` of the rank 0 rendezvous hub
    #[serde(default)]
    pub coordinator: Option<String>,
    /// How long ranks wait for each other to connect
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            rank: None,
            size: None,
            coordinator: None,
            connect_timeout_secs: default_connect_timeout(),
        }
    }
}

fn default_connect_timeout() -> u64 {
    60
}

/// Rank/size variables exported by common launchers, in lookup order
const LAUNCHER_VARS: &[(&str, &str)] = &[
    ("OMPI_COMM_WORLD_RANK", "OMPI_COMM_WORLD_SIZE"),
    ("PMI_RANK", "PMI_SIZE"),
    ("SLURM_PROCID", "SLURM_NTASKS"),
];

impl ClusterConfig {
    /// `(rank, size)` with defaults applied
    pub fn world(&self) -> (usize, usize) {
        (self.rank.unwrap_or(0), self.size.unwrap_or(1))
    }

    /// Fill rank and size from launcher variables when neither was given
    ///
    /// `lookup` is normally `std::env::var(..).ok()`.
    pub fn fill_from_launcher<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if self.rank.is_some() || self.size.is_some() {
            return;
        }

        for (rank_var, size_var) in LAUNCHER_VARS {
            let rank = lookup(rank_var).and_then(|v| v.trim().parse().ok());
            let size = lookup(size_var).and_then(|v| v.trim().parse().ok());
            if let (Some(rank), Some(size)) = (rank, size) {
                self.rank = Some(rank);
                self.size = Some(size);
                return;
            }
        }
    }
}

/// Sensor backends
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackendsConfig {
    /// Backends to query (`rapl`, `proc`, `mock`)
    #[serde(default = "default_backends")]
    pub enabled: Vec<String>,
    #[serde(default = "default_rapl_root")]
    pub rapl_root: PathBuf,
    #[serde(default = "default_proc_root")]
    pub proc_root: PathBuf,
    /// Devices exposed by the `mock` backend
    #[serde(default = "default_mock_devices")]
    pub mock_devices: usize,
}

impl Default for BackendsConfig {
    fn default() -> Self {
        Self {
            enabled: default_backends(),
            rapl_root: default_rapl_root(),
            proc_root: default_proc_root(),
            mock_devices: default_mock_devices(),
        }
    }
}

fn default_backends() -> Vec<String> {
    vec!["rapl".to_string(), "proc".to_string()]
}

fn default_rapl_root() -> PathBuf {
    PathBuf::from("/sys/class/powercap")
}

fn default_proc_root() -> PathBuf {
    PathBuf::from("/proc")
}

fn default_mock_devices() -> usize {
    1
}

/// How the target script is launched
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WorkloadConfig {
    /// Interpreter for the script; `None` executes it directly
    #[serde(default)]
    pub interpreter: Option<String>,
}

/// Runtime configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RuntimeConfig {
    /// Debug logging
    #[serde(default)]
    pub debug: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.sampling.frequency, 1.0);
        assert_eq!(config.output.outdir, PathBuf::from("./"));
        assert_eq!(config.output.format, ReportFormat::Text);
        assert_eq!(config.cluster.world(), (0, 1));
        assert_eq!(config.backends.enabled, vec!["rapl", "proc"]);
    }

    #[test]
    fn test_fill_from_launcher() {
        let env: HashMap<&str, &str> = [("PMI_RANK", "3"), ("PMI_SIZE", "8"), ("SLURM_PROCID", "1")]
            .into_iter()
            .collect();

        let mut cluster = ClusterConfig::default();
        cluster.fill_from_launcher(|k| env.get(k).map(|v| v.to_string()));
        assert_eq!(cluster.world(), (3, 8));
    }

    #[test]
    fn test_explicit_rank_wins_over_launcher() {
        let mut cluster = ClusterConfig {
            rank: Some(0),
            size: Some(2),
            ..Default::default()
        };
        cluster.fill_from_launcher(|_| Some("7".to_string()));
        assert_eq!(cluster.world(), (0, 2));
    }

    #[test]
    fn test_incomplete_launcher_vars_are_ignored() {
        let mut cluster = ClusterConfig::default();
        cluster.fill_from_launcher(|k| (k == "OMPI_COMM_WORLD_RANK").then(|| "1".to_string()));
        assert_eq!(cluster.world(), (0, 1));
    }
}

//! Run reports
//!
//! A report gathers one run of an experiment into a `RunReport` and renders
//! it as text, YAML or JSON. Ranks whose record has not been postprocessed
//! yet are summarized on the fly.

pub mod json;
pub mod text;
pub mod yaml;

use crate::postprocess::{summarize_buffer, RankSummary};
use crate::storage::{ExperimentStorage, RunId};
use crate::Result;
use anyhow::Context;
use chrono::{DateTime, Utc};
use clap::ValueEnum;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Report format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum ReportFormat {
    /// Human-readable text
    #[default]
    #[value(name = "txt", alias = "text")]
    #[serde(alias = "txt")]
    Text,
    #[value(alias = "yml")]
    #[serde(alias = "yml")]
    Yaml,
    Json,
}

impl fmt::Display for ReportFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReportFormat::Text => write!(f, "txt"),
            ReportFormat::Yaml => write!(f, "yaml"),
            ReportFormat::Json => write!(f, "json"),
        }
    }
}

/// One run, ready for rendering
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunReport {
    pub experiment: String,
    pub run_id: RunId,
    pub created_at: DateTime<Utc>,
    pub world_size: usize,
    pub ranks: Vec<RankReport>,
    pub totals: RunTotals,
}

/// One rank of a run; `data` is `None` for ranks that owned no devices
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RankReport {
    pub rank: usize,
    pub hostname: String,
    pub data: Option<RankSummary>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunTotals {
    pub devices: usize,
    pub energy_j: f64,
    /// Longest sampled interval among ranks
    pub duration_s: f64,
}

/// Collect `run` (or the latest run) of an experiment
pub fn build_report(storage: &ExperimentStorage, run: Option<RunId>) -> Result<RunReport> {
    let run_id = match run {
        Some(id) => id,
        None => storage
            .latest_run()
            .ok_or_else(|| anyhow::anyhow!("Experiment '{}' has no completed runs", storage.name()))?,
    };
    let entry = storage.run(run_id)?;
    if !entry.complete {
        anyhow::bail!("Run {} of '{}' did not complete", run_id, storage.name());
    }

    let mut ranks = Vec::with_capacity(entry.ranks.len());
    for rank_entry in &entry.ranks {
        let record = storage
            .load_rank_record(run_id, rank_entry.rank)
            .with_context(|| format!("Missing record of rank {} in run {}", rank_entry.rank, run_id))?;

        let data = match (record.summary, &record.data) {
            (Some(summary), _) => Some(summary),
            (None, Some(buffer)) => Some(summarize_buffer(buffer)),
            (None, None) => None,
        };

        ranks.push(RankReport {
            rank: record.rank,
            hostname: record.hostname,
            data,
        });
    }

    let summaries = ranks.iter().filter_map(|r| r.data.as_ref());
    let totals = RunTotals {
        devices: summaries.clone().map(|s| s.devices.len()).sum(),
        energy_j: summaries.clone().map(|s| s.total_energy_j).sum(),
        duration_s: summaries.map(|s| s.duration_s).fold(0.0, f64::max),
    };

    Ok(RunReport {
        experiment: storage.name().to_string(),
        run_id,
        created_at: entry.created_at,
        world_size: entry.world_size,
        ranks,
        totals,
    })
}

/// Render `run` (or the latest run) in the requested format
pub fn render_report(
    storage: &ExperimentStorage,
    run: Option<RunId>,
    format: ReportFormat,
) -> Result<String> {
    let report = build_report(storage, run)?;
    match format {
        ReportFormat::Text => Ok(text::render(&report)),
        ReportFormat::Yaml => yaml::render(&report),
        ReportFormat::Json => json::render(&report),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{DeviceId, DeviceInfo, MetricKind};
    use crate::comm::{Communicator, LocalCommunicator};
    use crate::sampler::{BufferMeta, Reading, SampleBuffer};
    use std::sync::Arc;
    use std::time::Duration;

    pub(crate) fn sample_storage(dir: &std::path::Path) -> ExperimentStorage {
        let comm: Arc<dyn Communicator> = Arc::new(LocalCommunicator::new());
        let mut storage = ExperimentStorage::open(&dir.join("bench.pulse"), comm).unwrap();

        let device = DeviceInfo::new(DeviceId::new("mock", "dev0"), MetricKind::Energy, "package");
        let meta = BufferMeta {
            rank: 0,
            hostname: "node-a".to_string(),
        };
        let mut buffer = SampleBuffer::new(meta, 2.0, &[device]);
        buffer.push(0, 0.0, Reading::Value(100.0));
        buffer.push(0, 0.5, Reading::Value(110.0));
        buffer.push(0, 1.0, Reading::Value(125.0));
        let buffer = buffer.finalize(Duration::from_millis(1000));

        let run = storage.add_run(Some(&buffer)).unwrap();
        storage.attach_device_data(run, &buffer).unwrap();
        storage.commit_run(run, true).unwrap();
        storage
    }

    #[test]
    fn test_report_summarizes_on_the_fly() {
        let tmp = tempfile::tempdir().unwrap();
        let storage = sample_storage(tmp.path());

        let report = build_report(&storage, None).unwrap();
        assert_eq!(report.experiment, "bench");
        assert_eq!(report.run_id, RunId::new(0));
        assert_eq!(report.totals.devices, 1);
        assert_eq!(report.totals.energy_j, 25.0);
        assert_eq!(report.ranks[0].data.as_ref().unwrap().devices[0].samples, 3);
    }

    #[test]
    fn test_unknown_run_is_an_error() {
        let tmp = tempfile::tempdir().unwrap();
        let storage = sample_storage(tmp.path());
        assert!(render_report(&storage, Some(RunId::new(5)), ReportFormat::Json).is_err());
    }

    #[test]
    fn test_incomplete_run_is_not_reported() {
        let tmp = tempfile::tempdir().unwrap();
        let mut storage = sample_storage(tmp.path());
        let pending = storage.add_run(None).unwrap();

        assert_eq!(build_report(&storage, None).unwrap().run_id, RunId::new(0));
        assert!(build_report(&storage, Some(pending)).is_err());
    }

    #[test]
    fn test_empty_experiment_has_nothing_to_report() {
        let tmp = tempfile::tempdir().unwrap();
        let comm: Arc<dyn Communicator> = Arc::new(LocalCommunicator::new());
        let storage = ExperimentStorage::open(&tmp.path().join("e.pulse"), comm).unwrap();
        assert!(build_report(&storage, None).is_err());
    }

    #[test]
    fn test_format_names() {
        assert_eq!(ReportFormat::from_str("txt", true).unwrap(), ReportFormat::Text);
        assert_eq!(ReportFormat::from_str("text", true).unwrap(), ReportFormat::Text);
        assert_eq!(ReportFormat::from_str("yml", true).unwrap(), ReportFormat::Yaml);
        assert_eq!(ReportFormat::from_str("json", true).unwrap(), ReportFormat::Json);
        assert!(ReportFormat::from_str("csv", true).is_err());
    }
}

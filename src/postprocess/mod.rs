//! Postprocessing of persisted runs
//!
//! Turns the raw series of each rank record into a `RankSummary` and writes
//! it back into the record. Work is split across ranks (`rank % size`) and,
//! within a process, across the rayon thread pool.

use crate::backend::{DeviceId, MetricKind};
use crate::sampler::{DeviceSeries, LocalResultBuffer};
use crate::storage::{ExperimentStorage, RunId};
use crate::Result;
use anyhow::Context;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

/// Statistics of one device over one run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceSummary {
    pub device: DeviceId,
    pub kind: MetricKind,
    pub unit: String,
    pub description: String,
    pub samples: usize,
    pub errors: usize,
    pub first_t: Option<f64>,
    pub last_t: Option<f64>,
    pub min: Option<f64>,
    pub max: Option<f64>,
    pub mean: Option<f64>,
    /// Energy consumed over the run (cumulative counters only)
    pub energy_j: Option<f64>,
    /// `energy_j` divided by the sampled interval
    pub avg_power_w: Option<f64>,
}

/// Statistics of one rank over one run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RankSummary {
    pub rank: usize,
    pub hostname: String,
    pub duration_s: f64,
    pub devices: Vec<DeviceSummary>,
    pub total_energy_j: f64,
}

/// Summarize a single device series
///
/// Counter wrap-around is undone with the device's `wrap_at`; a decrease on
/// a counter without a known range is treated as a reset and contributes
/// nothing.
pub fn summarize_series(series: &DeviceSeries) -> DeviceSummary {
    let values: Vec<(f64, f64)> = series
        .samples
        .iter()
        .filter_map(|s| s.reading.value().map(|v| (s.t, v)))
        .collect();
    let errors = series.samples.len() - values.len();

    let (min, max, mean) = if values.is_empty() {
        (None, None, None)
    } else {
        let min = values.iter().map(|(_, v)| *v).fold(f64::INFINITY, f64::min);
        let max = values.iter().map(|(_, v)| *v).fold(f64::NEG_INFINITY, f64::max);
        let mean = values.iter().map(|(_, v)| *v).sum::<f64>() / values.len() as f64;
        (Some(min), Some(max), Some(mean))
    };

    let first_t = values.first().map(|(t, _)| *t);
    let last_t = values.last().map(|(t, _)| *t);

    let (energy_j, avg_power_w) = if series.device.kind.is_cumulative() && values.len() >= 2 {
        let energy: f64 = values
            .windows(2)
            .map(|w| {
                let delta = w[1].1 - w[0].1;
                match (delta < 0.0, series.device.wrap_at) {
                    (false, _) => delta,
                    (true, Some(wrap)) => delta + wrap,
                    (true, None) => 0.0,
                }
            })
            .sum();
        let span = last_t.unwrap_or(0.0) - first_t.unwrap_or(0.0);
        let power = (span > 0.0).then(|| energy / span);
        (Some(energy), power)
    } else {
        (None, None)
    };

    DeviceSummary {
        device: series.device.id.clone(),
        kind: series.device.kind,
        unit: series.device.kind.unit().to_string(),
        description: series.device.description.clone(),
        samples: series.samples.len(),
        errors,
        first_t,
        last_t,
        min,
        max,
        mean,
        energy_j,
        avg_power_w,
    }
}

/// Summarize every device of a rank buffer
pub fn summarize_buffer(buffer: &LocalResultBuffer) -> RankSummary {
    let devices: Vec<DeviceSummary> = buffer.series().iter().map(summarize_series).collect();
    let total_energy_j = devices.iter().filter_map(|d| d.energy_j).sum();

    RankSummary {
        rank: buffer.rank(),
        hostname: buffer.hostname().to_string(),
        duration_s: buffer.duration_s(),
        devices,
        total_energy_j,
    }
}

/// Summarize the records of committed runs this process is responsible for, in place
///
/// Collective: ends with a barrier so that a report rendered afterwards sees
/// every rank's summaries. Returns the number of records summarized locally.
pub fn postprocess(storage: &ExperimentStorage) -> Result<usize> {
    let comm = storage.comm();
    let (rank, size) = (comm.rank(), comm.size());

    let work: Vec<(RunId, usize)> = storage
        .completed_runs()
        .flat_map(|run| run.ranks.iter().map(move |r| (run.id, r.rank)))
        .filter(|(_, record_rank)| record_rank % size == rank)
        .collect();
    debug!(records = work.len(), "Postprocessing");

    let outcome: Result<usize> = work
        .par_iter()
        .map(|&(run, record_rank)| summarize_record(storage, run, record_rank))
        .try_fold(|| 0usize, |acc, done| done.map(|d| acc + usize::from(d)))
        .try_reduce(|| 0, |a, b| Ok(a + b));

    comm.barrier().context("Failed to synchronize after postprocessing")?;

    let summarized = outcome?;
    info!(summarized, "Postprocessing complete");
    Ok(summarized)
}

/// Returns whether a summary was written
fn summarize_record(storage: &ExperimentStorage, run: RunId, rank: usize) -> Result<bool> {
    let mut record = storage
        .load_rank_record(run, rank)
        .with_context(|| format!("Failed to load record of rank {} in run {}", rank, run))?;

    let Some(data) = &record.data else {
        return Ok(false);
    };
    record.summary = Some(summarize_buffer(data));
    storage.store_rank_record(&record)?;
    Ok(true)
}

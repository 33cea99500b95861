//! Per-rank sample buffers
//!
//! The sampler thread appends to a `SampleBuffer` and finalizes it into an
//! immutable `LocalResultBuffer` when it stops.

use crate::backend::DeviceInfo;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Outcome of one device read
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Reading {
    Value(f64),
    /// The device could not be read; the message is kept for diagnosis
    Error(String),
}

impl Reading {
    pub fn value(&self) -> Option<f64> {
        match self {
            Reading::Value(v) => Some(*v),
            Reading::Error(_) => None,
        }
    }
}

/// One reading and its offset from the start of sampling
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sample {
    /// Seconds since sampling started
    pub t: f64,
    pub reading: Reading,
}

/// Time series of a single device
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceSeries {
    pub device: DeviceInfo,
    pub samples: Vec<Sample>,
}

/// Identity of the rank producing a buffer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BufferMeta {
    pub rank: usize,
    pub hostname: String,
}

/// Buffer under construction, owned by the sampler thread
#[derive(Debug)]
pub struct SampleBuffer {
    meta: BufferMeta,
    frequency_hz: f64,
    started_at: DateTime<Utc>,
    series: Vec<DeviceSeries>,
}

impl SampleBuffer {
    pub fn new(meta: BufferMeta, frequency_hz: f64, devices: &[DeviceInfo]) -> Self {
        Self {
            meta,
            frequency_hz,
            started_at: Utc::now(),
            series: devices
                .iter()
                .map(|device| DeviceSeries {
                    device: device.clone(),
                    samples: Vec::new(),
                })
                .collect(),
        }
    }

    /// Append a reading for the device at `index` (order given to `new`)
    pub fn push(&mut self, index: usize, t: f64, reading: Reading) {
        if let Some(series) = self.series.get_mut(index) {
            series.samples.push(Sample { t, reading });
        }
    }

    /// Freeze the buffer
    pub fn finalize(self, duration: Duration) -> LocalResultBuffer {
        LocalResultBuffer {
            rank: self.meta.rank,
            hostname: self.meta.hostname,
            frequency_hz: self.frequency_hz,
            started_at: self.started_at,
            duration_s: duration.as_secs_f64(),
            series: self.series,
        }
    }
}

/// Finalized samples of one rank for one run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocalResultBuffer {
    rank: usize,
    hostname: String,
    frequency_hz: f64,
    started_at: DateTime<Utc>,
    duration_s: f64,
    series: Vec<DeviceSeries>,
}

impl LocalResultBuffer {
    pub fn rank(&self) -> usize {
        self.rank
    }

    pub fn hostname(&self) -> &str {
        &self.hostname
    }

    pub fn frequency_hz(&self) -> f64 {
        self.frequency_hz
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    /// Wall time between the first sample and the stop
    pub fn duration_s(&self) -> f64 {
        self.duration_s
    }

    pub fn series(&self) -> &[DeviceSeries] {
        &self.series
    }

    pub fn device_count(&self) -> usize {
        self.series.len()
    }

    /// Number of sampling rounds (readings per device)
    pub fn sample_count(&self) -> usize {
        self.series
            .iter()
            .map(|s| s.samples.len())
            .max()
            .unwrap_or(0)
    }

    /// Readings recorded as errors, over all devices
    pub fn error_count(&self) -> usize {
        self.series
            .iter()
            .flat_map(|s| &s.samples)
            .filter(|s| matches!(s.reading, Reading::Error(_)))
            .count()
    }
}

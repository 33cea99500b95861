//! PowerPulse - energy and power telemetry for running workloads
//!
//! PowerPulse samples hardware sensors (RAPL energy counters, system memory and
//! load) while a target workload runs, optionally across many cooperating
//! processes of a distributed job, and persists the samples for later analysis.
//!
//! # Architecture
//!
//! - **Backends**: sensor inventories behind the `Backend` / `BackendSession` traits
//! - **Resolver**: decides which process owns which device (one owner per host)
//! - **Sampler**: an isolated thread polling owned devices at a fixed frequency
//! - **Comm**: collective rendezvous (barrier, all-gather) shared by all ranks
//! - **Storage**: experiment directory with one record per rank and run
//! - **Orchestrator**: drives the phase sequence of a monitored run

pub mod backend;
pub mod comm;
pub mod config;
pub mod error;
pub mod orchestrator;
pub mod output;
pub mod postprocess;
pub mod resolver;
pub mod sampler;
pub mod storage;
pub mod util;

// Re-export commonly used types
pub use backend::{Backend, BackendRegistry, BackendSession, DeviceId, DeviceInfo, MetricKind};
pub use comm::{Communicator, LocalCommunicator, TcpCommunicator};
pub use config::Config;
pub use error::MonitorError;
pub use orchestrator::{MonitorOutcome, MonitorSettings, Orchestrator, Phase};
pub use sampler::{LocalResultBuffer, SamplingFrequency};
pub use storage::{ExperimentStorage, RunId};

/// Result type used throughout PowerPulse
pub type Result<T> = anyhow::Result<T>;

//! Monitored run orchestration
//!
//! The orchestrator drives one monitored run through a fixed phase
//! sequence, identical on every rank:
//!
//! ```text
//! Init → DevicesResolved → [WorkerStarted] → WorkerReady
//!      → StartBarrier → WorkloadRunning → WorkloadDone → StopSignaled
//!      → ResultCollected → OutputBarrier → Persisted
//!      → PostprocessBarrier → Postprocessed → [Reported] → Closed
//! ```
//!
//! A rank without devices skips `WorkerStarted` but joins every barrier.
//! Only the report rank renders a report. A failing workload ends the run
//! in `Aborted`: stop is signaled, the sampler is joined and nothing is
//! persisted. A run is committed only after every rank stored its record.
//!
//! # Example
//!
//! ```no_run
//! use powerpulse::backend::BackendRegistry;
//! use powerpulse::comm::LocalCommunicator;
//! use powerpulse::orchestrator::{MonitorSettings, Orchestrator, workload::ScriptWorkload};
//! use powerpulse::output::ReportFormat;
//! use powerpulse::sampler::SamplingFrequency;
//! use std::sync::Arc;
//!
//! let settings = MonitorSettings {
//!     frequency: SamplingFrequency::new(2.0)?,
//!     experiment_dir: "out/bench.pulse".into(),
//!     format: ReportFormat::Text,
//!     report_rank: 0,
//! };
//! let mut orchestrator = Orchestrator::new(
//!     Arc::new(LocalCommunicator::new()),
//!     Arc::new(BackendRegistry::new()),
//!     settings,
//! );
//! let outcome = orchestrator.run(&mut ScriptWorkload::new("./bench.sh", vec![]))?;
//! println!("{}", outcome.report.unwrap_or_default());
//! # Ok::<(), anyhow::Error>(())
//! ```

pub mod workload;

use crate::backend::BackendRegistry;
use crate::comm::Communicator;
use crate::error::MonitorError;
use crate::output::{render_report, ReportFormat};
use crate::postprocess::postprocess;
use crate::resolver::{node_name, DeviceResolver};
use crate::sampler::{BufferMeta, LocalResultBuffer, SamplerHandle, SamplingFrequency};
use crate::storage::{ExperimentStorage, RunId};
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info, info_span, warn};

pub use workload::{FnWorkload, ScriptWorkload, Workload};

/// Phases of a monitored run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Init,
    DevicesResolved,
    WorkerStarted,
    WorkerReady,
    StartBarrier,
    WorkloadRunning,
    WorkloadDone,
    StopSignaled,
    ResultCollected,
    OutputBarrier,
    Persisted,
    PostprocessBarrier,
    Postprocessed,
    Reported,
    Closed,
    Aborted,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Phase::Init => "init",
            Phase::DevicesResolved => "devices resolved",
            Phase::WorkerStarted => "worker started",
            Phase::WorkerReady => "worker ready",
            Phase::StartBarrier => "start barrier",
            Phase::WorkloadRunning => "workload running",
            Phase::WorkloadDone => "workload done",
            Phase::StopSignaled => "stop signaled",
            Phase::ResultCollected => "result collected",
            Phase::OutputBarrier => "output barrier",
            Phase::Persisted => "persisted",
            Phase::PostprocessBarrier => "postprocess barrier",
            Phase::Postprocessed => "postprocessed",
            Phase::Reported => "reported",
            Phase::Closed => "closed",
            Phase::Aborted => "aborted",
        };
        f.write_str(name)
    }
}

/// Per-run settings
#[derive(Debug, Clone)]
pub struct MonitorSettings {
    pub frequency: SamplingFrequency,
    /// Experiment directory (`<outdir>/<script>.pulse`)
    pub experiment_dir: PathBuf,
    pub format: ReportFormat,
    /// Rank that renders the report
    pub report_rank: usize,
}

/// Result of a completed run, as seen by one rank
#[derive(Debug, Clone)]
pub struct MonitorOutcome {
    pub run_id: RunId,
    pub rank: usize,
    /// Devices sampled by this rank
    pub devices: usize,
    /// Samples per device taken by this rank
    pub samples: usize,
    /// Rendered report (report rank only)
    pub report: Option<String>,
    pub experiment_dir: PathBuf,
}

/// Drives a monitored run on one rank
pub struct Orchestrator {
    comm: Arc<dyn Communicator>,
    registry: Arc<BackendRegistry>,
    settings: MonitorSettings,
    phases: Vec<Phase>,
    stop_signals: usize,
    stop_sent: bool,
}

impl Orchestrator {
    pub fn new(
        comm: Arc<dyn Communicator>,
        registry: Arc<BackendRegistry>,
        settings: MonitorSettings,
    ) -> Self {
        Self {
            comm,
            registry,
            settings,
            phases: Vec::new(),
            stop_signals: 0,
            stop_sent: false,
        }
    }

    /// Phases walked by the last run, in order
    pub fn phases(&self) -> &[Phase] {
        &self.phases
    }

    /// Number of times stop actually took effect during the last run
    pub fn stop_signals(&self) -> usize {
        self.stop_signals
    }

    /// Run `workload` under monitoring
    ///
    /// Collective: every rank of the job must call it with the same settings.
    pub fn run(&mut self, workload: &mut dyn Workload) -> Result<MonitorOutcome, MonitorError> {
        let span = info_span!("monitor", rank = self.comm.rank());
        let _entered = span.enter();

        self.phases.clear();
        self.stop_signals = 0;
        self.stop_sent = false;
        self.enter(Phase::Init);

        let devices = DeviceResolver::new(self.comm.clone(), self.registry.clone())
            .resolve()
            .map_err(MonitorError::Setup)?;
        self.enter(Phase::DevicesResolved);

        let sampler = if devices.is_empty() {
            info!("No devices owned by this rank, not starting a sampler");
            None
        } else {
            let meta = BufferMeta {
                rank: self.comm.rank(),
                hostname: node_name(),
            };
            let handle = SamplerHandle::spawn(
                self.registry.clone(),
                devices.clone(),
                self.settings.frequency,
                meta,
            )
            .map_err(MonitorError::Setup)?;
            self.enter(Phase::WorkerStarted);

            handle.wait_ready().map_err(MonitorError::Setup)?;
            Some(handle)
        };
        self.enter(Phase::WorkerReady);

        self.barrier(Phase::StartBarrier)?;

        self.enter(Phase::WorkloadRunning);
        info!(workload = %workload.describe(), frequency = %self.settings.frequency, "Starting workload");
        if let Err(e) = workload.run() {
            warn!("Workload failed, aborting run: {:#}", e);
            self.signal_stop(sampler.as_ref());
            if let Some(handle) = sampler {
                if let Err(join_err) = handle.collect() {
                    warn!("Sampler did not shut down cleanly: {:#}", join_err);
                }
            }
            self.enter(Phase::Aborted);
            return Err(MonitorError::Workload(e));
        }
        self.enter(Phase::WorkloadDone);

        self.signal_stop(sampler.as_ref());
        self.enter(Phase::StopSignaled);

        let data: Option<LocalResultBuffer> = match sampler {
            Some(handle) => Some(handle.collect().map_err(MonitorError::WorkerCommunication)?),
            None => None,
        };
        self.enter(Phase::ResultCollected);

        self.barrier(Phase::OutputBarrier)?;

        let mut storage =
            ExperimentStorage::open(&self.settings.experiment_dir, self.comm.clone())
                .map_err(MonitorError::Persistence)?;
        let run_id = storage
            .add_run(data.as_ref())
            .map_err(MonitorError::Persistence)?;
        let attached = match &data {
            Some(buffer) => storage.attach_device_data(run_id, buffer),
            None => Ok(()),
        };
        if let Err(e) = &attached {
            warn!("Failed to persist samples: {:#}", e);
        }
        // Every rank commits, so a local failure cannot leave peers waiting
        let committed = storage.commit_run(run_id, attached.is_ok());
        attached.map_err(MonitorError::Persistence)?;
        committed.map_err(MonitorError::Persistence)?;
        self.enter(Phase::Persisted);

        self.barrier(Phase::PostprocessBarrier)?;

        postprocess(&storage).map_err(MonitorError::Postprocess)?;
        self.enter(Phase::Postprocessed);

        let report = if self.comm.rank() == self.settings.report_rank {
            let rendered = render_report(&storage, Some(run_id), self.settings.format)
                .map_err(MonitorError::Report)?;
            self.enter(Phase::Reported);
            Some(rendered)
        } else {
            None
        };

        storage.close().map_err(|cause| MonitorError::Coordination {
            phase: Phase::Closed,
            cause,
        })?;
        self.enter(Phase::Closed);

        info!(run = %run_id, "Run complete");
        Ok(MonitorOutcome {
            run_id,
            rank: self.comm.rank(),
            devices: devices.len(),
            samples: data.as_ref().map_or(0, LocalResultBuffer::sample_count),
            report,
            experiment_dir: self.settings.experiment_dir.clone(),
        })
    }

    fn enter(&mut self, phase: Phase) {
        debug!(%phase, "Entering phase");
        self.phases.push(phase);
    }

    fn barrier(&mut self, phase: Phase) -> Result<(), MonitorError> {
        self.enter(phase);
        self.comm
            .barrier()
            .map_err(|cause| MonitorError::Coordination { phase, cause })
    }

    /// Signal stop to the sampler, if any; idempotent
    fn signal_stop(&mut self, sampler: Option<&SamplerHandle>) {
        let took_effect = match sampler {
            Some(handle) => handle.signal_stop(),
            None => !self.stop_sent,
        };
        self.stop_sent = true;
        if took_effect {
            self.stop_signals += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::mock::MockBackend;
    use crate::comm::LocalCommunicator;
    use crate::storage::MANIFEST_FILE;
    use std::time::Duration;

    fn settings(dir: &std::path::Path, hz: f64, format: ReportFormat) -> MonitorSettings {
        MonitorSettings {
            frequency: SamplingFrequency::new(hz).unwrap(),
            experiment_dir: dir.join("job.pulse"),
            format,
            report_rank: 0,
        }
    }

    fn registry_with(backend: &MockBackend) -> Arc<BackendRegistry> {
        let mut registry = BackendRegistry::new();
        registry.register(Arc::new(backend.clone()));
        Arc::new(registry)
    }

    #[test]
    fn test_run_without_devices_skips_worker() {
        let tmp = tempfile::tempdir().unwrap();
        let mut orchestrator = Orchestrator::new(
            Arc::new(LocalCommunicator::new()),
            Arc::new(BackendRegistry::new()),
            settings(tmp.path(), 5.0, ReportFormat::Text),
        );

        let outcome = orchestrator
            .run(&mut FnWorkload::new("noop", || Ok(())))
            .unwrap();

        assert_eq!(outcome.devices, 0);
        assert_eq!(outcome.samples, 0);
        assert!(outcome.report.unwrap().contains("no devices"));
        assert_eq!(orchestrator.stop_signals(), 1);
        assert_eq!(
            orchestrator.phases(),
            &[
                Phase::Init,
                Phase::DevicesResolved,
                Phase::WorkerReady,
                Phase::StartBarrier,
                Phase::WorkloadRunning,
                Phase::WorkloadDone,
                Phase::StopSignaled,
                Phase::ResultCollected,
                Phase::OutputBarrier,
                Phase::Persisted,
                Phase::PostprocessBarrier,
                Phase::Postprocessed,
                Phase::Reported,
                Phase::Closed,
            ]
        );
    }

    #[test]
    fn test_run_with_device_persists_samples() {
        let tmp = tempfile::tempdir().unwrap();
        let backend = MockBackend::with_devices(1);
        let mut orchestrator = Orchestrator::new(
            Arc::new(LocalCommunicator::new()),
            registry_with(&backend),
            settings(tmp.path(), 20.0, ReportFormat::Json),
        );

        let outcome = orchestrator
            .run(&mut FnWorkload::new("sleep", || {
                std::thread::sleep(Duration::from_millis(200));
                Ok(())
            }))
            .unwrap();

        assert_eq!(outcome.devices, 1);
        assert!(outcome.samples >= 2);
        assert!(orchestrator.phases().contains(&Phase::WorkerStarted));
        assert_eq!(backend.open_count(), backend.close_count());

        let storage = ExperimentStorage::open_existing(
            &outcome.experiment_dir,
            Arc::new(LocalCommunicator::new()),
        )
        .unwrap();
        let record = storage.load_rank_record(outcome.run_id, 0).unwrap();
        assert!(record.data.is_some());
        assert!(record.summary.is_some());
    }

    #[test]
    fn test_workload_failure_aborts_without_persisting() {
        let tmp = tempfile::tempdir().unwrap();
        let backend = MockBackend::with_devices(2);
        let settings = settings(tmp.path(), 10.0, ReportFormat::Text);
        let experiment_dir = settings.experiment_dir.clone();
        let mut orchestrator =
            Orchestrator::new(Arc::new(LocalCommunicator::new()), registry_with(&backend), settings);

        let err = orchestrator
            .run(&mut FnWorkload::new("crash", || anyhow::bail!("segfault")))
            .unwrap_err();

        assert!(matches!(err, MonitorError::Workload(_)));
        assert_eq!(orchestrator.stop_signals(), 1);
        assert_eq!(orchestrator.phases().last(), Some(&Phase::Aborted));
        assert!(!orchestrator.phases().contains(&Phase::WorkloadDone));
        assert!(!experiment_dir.join(MANIFEST_FILE).exists());
        assert_eq!(backend.open_count(), backend.close_count());
    }

    #[test]
    fn test_sampler_open_failure_is_setup_error() {
        let tmp = tempfile::tempdir().unwrap();
        let backend = MockBackend::with_devices(1);
        // Inventory succeeds, the sampler's own open fails
        backend.set_open_budget(Some(1));

        let mut orchestrator = Orchestrator::new(
            Arc::new(LocalCommunicator::new()),
            registry_with(&backend),
            settings(tmp.path(), 10.0, ReportFormat::Text),
        );
        let mut ran = false;
        let err = orchestrator
            .run(&mut FnWorkload::new("never", || {
                ran = true;
                Ok(())
            }))
            .unwrap_err();

        assert!(matches!(err, MonitorError::Setup(_)));
        assert!(!orchestrator.phases().contains(&Phase::StartBarrier));
        assert!(!tmp.path().join("job.pulse").exists());
        drop(orchestrator);
        assert!(!ran);
    }

    #[test]
    fn test_runs_accumulate() {
        let tmp = tempfile::tempdir().unwrap();
        let mut orchestrator = Orchestrator::new(
            Arc::new(LocalCommunicator::new()),
            Arc::new(BackendRegistry::new()),
            settings(tmp.path(), 5.0, ReportFormat::Yaml),
        );

        let first = orchestrator.run(&mut FnWorkload::new("a", || Ok(()))).unwrap();
        let second = orchestrator.run(&mut FnWorkload::new("b", || Ok(()))).unwrap();
        assert_eq!(first.run_id, RunId::new(0));
        assert_eq!(second.run_id, RunId::new(1));
        assert!(second.report.unwrap().contains("run_id: 1"));
    }

    #[test]
    fn test_two_ranks_end_to_end() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = Arc::new(tmp.path().to_path_buf());

        let outcomes = crate::comm::tcp::tests::run_ranks(2, move |comm| {
            let rank = comm.rank();
            let mut registry = BackendRegistry::new();
            if rank == 0 {
                registry.register(Arc::new(MockBackend::with_devices(1)));
            }

            let mut orchestrator = Orchestrator::new(
                Arc::new(comm),
                Arc::new(registry),
                settings(&dir, 2.0, ReportFormat::Json),
            );
            orchestrator
                .run(&mut FnWorkload::new("sleep", || {
                    std::thread::sleep(Duration::from_secs(1));
                    Ok(())
                }))
                .unwrap()
        });

        let (rank0, rank1) = (&outcomes[0], &outcomes[1]);
        assert_eq!(rank0.run_id, rank1.run_id);
        assert_eq!(rank0.devices, 1);
        assert!((2..=4).contains(&rank0.samples), "samples {}", rank0.samples);
        assert_eq!(rank1.devices, 0);
        assert!(rank1.report.is_none());

        let storage = ExperimentStorage::open_existing(
            &tmp.path().join("job.pulse"),
            Arc::new(LocalCommunicator::new()),
        )
        .unwrap();
        assert_eq!(storage.runs().len(), 1);
        assert!(storage.runs()[0].complete);
        assert!(storage.load_rank_record(rank0.run_id, 1).unwrap().data.is_none());

        let report: serde_json::Value =
            serde_json::from_str(rank0.report.as_ref().unwrap()).unwrap();
        assert_eq!(report["run_id"], 0);
        assert_eq!(report["world_size"], 2);
        assert!(report["ranks"][0]["data"].is_object());
        assert!(report["ranks"][1]["data"].is_null());
    }
}

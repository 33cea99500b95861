//! Error types of a monitored run
//!
//! Library plumbing uses `anyhow`; the orchestrator classifies failures into
//! `MonitorError` so callers can tell a failed workload from a broken
//! rendezvous or an unwritable output directory.

use crate::orchestrator::Phase;
use thiserror::Error;

/// Failure of a monitored run
#[derive(Error, Debug)]
pub enum MonitorError {
    /// Device resolution, sampler spawn or readiness failed
    #[error("Setup failed: {0:#}")]
    Setup(anyhow::Error),

    /// A collective failed at the transport level
    #[error("Coordination failed during {phase}: {cause:#}")]
    Coordination {
        phase: Phase,
        cause: anyhow::Error,
    },

    /// The target workload failed; stop was signaled and no run was recorded
    #[error("Workload failed: {0:#}")]
    Workload(anyhow::Error),

    /// The sampler crashed or did not hand off its buffer
    #[error("Sampler communication failed: {0:#}")]
    WorkerCommunication(anyhow::Error),

    /// Storing the run failed
    #[error("Persistence failed: {0:#}")]
    Persistence(anyhow::Error),

    /// Summarizing the run failed
    #[error("Postprocessing failed: {0:#}")]
    Postprocess(anyhow::Error),

    /// Rendering the report failed
    #[error("Report failed: {0:#}")]
    Report(anyhow::Error),
}

impl MonitorError {
    /// Short category name, used in logs
    pub fn kind(&self) -> &'static str {
        match self {
            MonitorError::Setup(_) => "setup",
            MonitorError::Coordination { .. } => "coordination",
            MonitorError::Workload(_) => "workload",
            MonitorError::WorkerCommunication(_) => "worker_communication",
            MonitorError::Persistence(_) => "persistence",
            MonitorError::Postprocess(_) => "postprocess",
            MonitorError::Report(_) => "report",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_messages_include_cause_chain() {
        let err = MonitorError::Persistence(
            anyhow::anyhow!("disk full").context("Failed to write manifest"),
        );
        assert_eq!(err.to_string(), "Persistence failed: Failed to write manifest: disk full");
        assert_eq!(err.kind(), "persistence");
    }

    #[test]
    fn test_coordination_names_phase() {
        let err = MonitorError::Coordination {
            phase: Phase::StartBarrier,
            cause: anyhow::anyhow!("connection reset"),
        };
        assert!(err.to_string().contains("start barrier"));
    }
}

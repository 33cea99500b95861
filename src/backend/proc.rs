//! System gauges from procfs
//!
//! Two devices:
//! - `proc:memory`: used memory in bytes (`MemTotal - MemAvailable`)
//! - `proc:load`: 1-minute load average as a percentage of available CPUs

use super::{Backend, BackendSession, DeviceId, DeviceInfo, MetricKind};
use crate::Result;
use anyhow::Context;
use std::fs;
use std::path::PathBuf;

const BACKEND_NAME: &str = "proc";

/// procfs backend
pub struct ProcBackend {
    root: PathBuf,
}

impl ProcBackend {
    /// Create a backend rooted at a procfs mount (normally `/proc`)
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }
}

impl Backend for ProcBackend {
    fn name(&self) -> &str {
        BACKEND_NAME
    }

    fn open(&self) -> Result<Box<dyn BackendSession>> {
        if !self.root.join("meminfo").is_file() {
            anyhow::bail!("procfs not available at {}", self.root.display());
        }

        Ok(Box::new(ProcSession {
            root: self.root.clone(),
            cpus: num_cpus::get().max(1),
        }))
    }
}

struct ProcSession {
    root: PathBuf,
    cpus: usize,
}

impl ProcSession {
    fn memory_id() -> DeviceId {
        DeviceId::new(BACKEND_NAME, "memory")
    }

    fn load_id() -> DeviceId {
        DeviceId::new(BACKEND_NAME, "load")
    }
}

impl BackendSession for ProcSession {
    fn devices(&self) -> Result<Vec<DeviceInfo>> {
        Ok(vec![
            DeviceInfo::new(Self::memory_id(), MetricKind::Memory, "used system memory"),
            DeviceInfo::new(Self::load_id(), MetricKind::Utilization, "1-minute load per CPU"),
        ])
    }

    fn read(&mut self, device: &DeviceId) -> Result<f64> {
        match device.device() {
            "memory" => {
                let path = self.root.join("meminfo");
                let contents = fs::read_to_string(&path)
                    .with_context(|| format!("Failed to read {}", path.display()))?;
                parse_used_memory(&contents)
            }
            "load" => {
                let path = self.root.join("loadavg");
                let contents = fs::read_to_string(&path)
                    .with_context(|| format!("Failed to read {}", path.display()))?;
                Ok(parse_load_one(&contents)? / self.cpus as f64 * 100.0)
            }
            _ => anyhow::bail!("Unknown proc device {}", device),
        }
    }

    fn close(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Used memory in bytes from `/proc/meminfo` contents
pub fn parse_used_memory(meminfo: &str) -> Result<f64> {
    let field = |name: &str| -> Result<u64> {
        meminfo
            .lines()
            .find_map(|line| line.strip_prefix(name))
            .and_then(|rest| rest.trim_start_matches(':').split_whitespace().next())
            .ok_or_else(|| anyhow::anyhow!("meminfo has no {} field", name))?
            .parse::<u64>()
            .with_context(|| format!("Invalid {} value", name))
    };

    let total_kb = field("MemTotal")?;
    let available_kb = field("MemAvailable")?;
    Ok(total_kb.saturating_sub(available_kb) as f64 * 1024.0)
}

/// 1-minute load average from `/proc/loadavg` contents
pub fn parse_load_one(loadavg: &str) -> Result<f64> {
    loadavg
        .split_whitespace()
        .next()
        .ok_or_else(|| anyhow::anyhow!("Empty loadavg"))?
        .parse::<f64>()
        .context("Invalid load average")
}

#[cfg(test)]
mod tests {
    use super::*;

    const MEMINFO: &str = "MemTotal:       16384000 kB\n\
                           MemFree:         1000000 kB\n\
                           MemAvailable:    4096000 kB\n";

    #[test]
    fn test_parse_used_memory() {
        let used = parse_used_memory(MEMINFO).unwrap();
        assert_eq!(used, (16384000.0 - 4096000.0) * 1024.0);
    }

    #[test]
    fn test_parse_used_memory_missing_field() {
        assert!(parse_used_memory("MemTotal: 10 kB\n").is_err());
    }

    #[test]
    fn test_parse_load_one() {
        assert_eq!(parse_load_one("0.52 0.58 0.59 1/467 12345\n").unwrap(), 0.52);
        assert!(parse_load_one("").is_err());
    }

    #[test]
    fn test_session_reads_from_root() {
        let tmp = tempfile::tempdir().unwrap();
        fs::write(tmp.path().join("meminfo"), MEMINFO).unwrap();
        fs::write(tmp.path().join("loadavg"), "1.00 0.50 0.25 1/100 42\n").unwrap();

        let backend = ProcBackend::new(tmp.path().to_path_buf());
        let mut session = backend.open().unwrap();
        assert_eq!(session.devices().unwrap().len(), 2);

        let used = session.read(&DeviceId::new("proc", "memory")).unwrap();
        assert!(used > 0.0);

        let load = session.read(&DeviceId::new("proc", "load")).unwrap();
        assert!(load > 0.0 && load <= 100.0);
    }

    #[test]
    fn test_unavailable_without_meminfo() {
        let tmp = tempfile::tempdir().unwrap();
        assert!(ProcBackend::new(tmp.path().to_path_buf()).open().is_err());
    }
}

//! RAPL energy counters via the Linux powercap interface
//!
//! Every `intel-rapl:*` zone under the powercap root exposes a cumulative
//! `energy_uj` counter (microjoules) that wraps at `max_energy_range_uj`.
//! Each readable zone becomes one `Energy` device named after its directory,
//! with the zone's `name` file as description (`package-0`, `core`, `dram`).
//!
//! Reading `energy_uj` usually requires root; zones whose counter cannot be
//! read are left out of the inventory.

use super::{Backend, BackendSession, DeviceId, DeviceInfo, MetricKind};
use crate::Result;
use anyhow::Context;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;

const BACKEND_NAME: &str = "rapl";
const ZONE_PREFIX: &str = "intel-rapl:";

/// Powercap RAPL backend
pub struct RaplBackend {
    root: PathBuf,
}

impl RaplBackend {
    /// Create a backend rooted at a powercap directory (normally `/sys/class/powercap`)
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }
}

impl Backend for RaplBackend {
    fn name(&self) -> &str {
        BACKEND_NAME
    }

    fn open(&self) -> Result<Box<dyn BackendSession>> {
        if !self.root.is_dir() {
            anyhow::bail!("Powercap interface not found at {}", self.root.display());
        }

        let zones = discover_zones(&self.root)?;
        Ok(Box::new(RaplSession { zones }))
    }
}

/// One readable RAPL zone
struct Zone {
    info: DeviceInfo,
    energy_path: PathBuf,
}

struct RaplSession {
    /// Zones keyed by device id, in directory order
    zones: BTreeMap<DeviceId, Zone>,
}

impl BackendSession for RaplSession {
    fn devices(&self) -> Result<Vec<DeviceInfo>> {
        Ok(self.zones.values().map(|z| z.info.clone()).collect())
    }

    fn read(&mut self, device: &DeviceId) -> Result<f64> {
        let zone = self
            .zones
            .get(device)
            .ok_or_else(|| anyhow::anyhow!("Unknown RAPL zone {}", device))?;
        read_energy_joules(&zone.energy_path)
    }

    fn close(&mut self) -> Result<()> {
        self.zones.clear();
        Ok(())
    }
}

/// Find every readable zone below `root`, including nested subzones
fn discover_zones(root: &Path) -> Result<BTreeMap<DeviceId, Zone>> {
    let mut zones = BTreeMap::new();
    let mut pending = vec![root.to_path_buf()];

    while let Some(dir) = pending.pop() {
        let entries = fs::read_dir(&dir)
            .with_context(|| format!("Failed to list {}", dir.display()))?;

        for entry in entries {
            let entry = entry?;
            let file_name = entry.file_name();
            let Some(zone_name) = file_name.to_str() else {
                continue;
            };
            if !zone_name.starts_with(ZONE_PREFIX) {
                continue;
            }

            let zone_dir = entry.path();
            pending.push(zone_dir.clone());

            let id = DeviceId::new(BACKEND_NAME, zone_name);
            if zones.contains_key(&id) {
                continue;
            }

            let energy_path = zone_dir.join("energy_uj");
            if let Err(e) = read_energy_joules(&energy_path) {
                debug!(zone = zone_name, "Skipping unreadable zone: {:#}", e);
                continue;
            }

            let label = fs::read_to_string(zone_dir.join("name"))
                .map(|s| s.trim().to_string())
                .unwrap_or_else(|_| zone_name.to_string());

            let mut info = DeviceInfo::new(id.clone(), MetricKind::Energy, label);
            if let Ok(max) = read_microjoules(&zone_dir.join("max_energy_range_uj")) {
                info = info.with_wrap_at(max as f64 / 1_000_000.0);
            }

            zones.insert(id, Zone { info, energy_path });
        }
    }

    Ok(zones)
}

fn read_microjoules(path: &Path) -> Result<u64> {
    let raw = fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    raw.trim()
        .parse::<u64>()
        .with_context(|| format!("Invalid counter value in {}", path.display()))
}

fn read_energy_joules(path: &Path) -> Result<f64> {
    Ok(read_microjoules(path)? as f64 / 1_000_000.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_zone(root: &Path, rel: &str, name: &str, energy_uj: &str) {
        let dir = root.join(rel);
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join("name"), format!("{}\n", name)).unwrap();
        fs::write(dir.join("energy_uj"), format!("{}\n", energy_uj)).unwrap();
        fs::write(dir.join("max_energy_range_uj"), "262143328850\n").unwrap();
    }

    #[test]
    fn test_discovers_nested_zones() {
        let tmp = tempfile::tempdir().unwrap();
        write_zone(tmp.path(), "intel-rapl:0", "package-0", "1000000");
        write_zone(tmp.path(), "intel-rapl:0/intel-rapl:0:0", "core", "500000");
        fs::create_dir_all(tmp.path().join("intel-rapl")).unwrap();

        let backend = RaplBackend::new(tmp.path().to_path_buf());
        let mut session = backend.open().unwrap();
        let devices = session.devices().unwrap();

        assert_eq!(devices.len(), 2);
        assert_eq!(devices[0].id.to_string(), "rapl:intel-rapl:0");
        assert_eq!(devices[0].description, "package-0");
        assert_eq!(devices[0].kind, MetricKind::Energy);
        assert!((devices[0].wrap_at.unwrap() - 262143.32885).abs() < 1e-6);

        let joules = session.read(&DeviceId::new("rapl", "intel-rapl:0:0")).unwrap();
        assert!((joules - 0.5).abs() < 1e-9);
    }

    #[test]
    fn test_skips_unreadable_zone() {
        let tmp = tempfile::tempdir().unwrap();
        write_zone(tmp.path(), "intel-rapl:0", "package-0", "garbage");

        let backend = RaplBackend::new(tmp.path().to_path_buf());
        let session = backend.open().unwrap();
        assert!(session.devices().unwrap().is_empty());
    }

    #[test]
    fn test_missing_root_is_unavailable() {
        let backend = RaplBackend::new(PathBuf::from("/nonexistent/powercap"));
        assert!(backend.open().is_err());
    }
}

//! Mock sensor backend for testing
//!
//! This module provides a mock implementation of the `Backend` trait. It
//! simulates sensors without touching sysfs or procfs, which makes tests fast
//! and runnable on any machine.
//!
//! # Features
//!
//! - Configurable device list
//! - Per-device read failures (unreachable sensors)
//! - Open failures, or an open budget after which opens fail
//! - Shared open/close/read counters for verifying resource release
//!
//! # Example
//!
//! ```
//! use powerpulse::backend::{Backend, BackendSession, DeviceId, mock::MockBackend};
//!
//! let backend = MockBackend::with_devices(1);
//! let mut session = backend.open().unwrap();
//! let value = session.read(&DeviceId::new("mock", "dev0")).unwrap();
//! assert!(value > 0.0);
//! session.close().unwrap();
//! assert_eq!(backend.close_count(), 1);
//! ```

use super::{Backend, BackendSession, DeviceId, DeviceInfo, MetricKind};
use crate::util::lock;
use crate::Result;
use rand::Rng;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

/// Mock sensor backend
///
/// Clones share their counters and failure settings, so a test can keep one
/// clone for inspection while the registry owns another.
#[derive(Clone)]
pub struct MockBackend {
    /// Backend name (first half of every device id)
    name: String,

    /// Devices reported by `devices()`
    devices: Arc<Vec<DeviceInfo>>,

    /// Device names whose reads fail
    failing: Arc<Mutex<HashSet<String>>>,

    /// Whether `open()` fails unconditionally
    fail_open: Arc<AtomicBool>,

    /// Number of successful opens left before `open()` starts failing
    open_budget: Arc<Mutex<Option<usize>>>,

    opened: Arc<AtomicUsize>,
    closed: Arc<AtomicUsize>,
    reads: Arc<AtomicUsize>,
}

impl MockBackend {
    /// Create a backend named `mock` with `count` energy counters `dev0..devN`
    pub fn with_devices(count: usize) -> Self {
        Self::named("mock", count)
    }

    /// Create a backend with a custom name and `count` energy counters
    pub fn named(name: &str, count: usize) -> Self {
        let devices = (0..count)
            .map(|i| {
                DeviceInfo::new(
                    DeviceId::new(name, format!("dev{}", i)),
                    MetricKind::Energy,
                    format!("mock energy counter {}", i),
                )
            })
            .collect();
        Self::with_device_infos(name, devices)
    }

    /// Create a backend reporting exactly `devices`
    pub fn with_device_infos(name: &str, devices: Vec<DeviceInfo>) -> Self {
        Self {
            name: name.to_string(),
            devices: Arc::new(devices),
            failing: Arc::new(Mutex::new(HashSet::new())),
            fail_open: Arc::new(AtomicBool::new(false)),
            open_budget: Arc::new(Mutex::new(None)),
            opened: Arc::new(AtomicUsize::new(0)),
            closed: Arc::new(AtomicUsize::new(0)),
            reads: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Make reads of `device` fail (or succeed again)
    pub fn set_failing(&self, device: &str, failing: bool) {
        let mut set = lock(&self.failing);
        if failing {
            set.insert(device.to_string());
        } else {
            set.remove(device);
        }
    }

    /// Make every `open()` fail
    pub fn set_fail_open(&self, fail: bool) {
        self.fail_open.store(fail, Ordering::SeqCst);
    }

    /// Allow `budget` more successful opens, then fail
    pub fn set_open_budget(&self, budget: Option<usize>) {
        *lock(&self.open_budget) = budget;
    }

    pub fn open_count(&self) -> usize {
        self.opened.load(Ordering::SeqCst)
    }

    pub fn close_count(&self) -> usize {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn read_count(&self) -> usize {
        self.reads.load(Ordering::SeqCst)
    }
}

impl Backend for MockBackend {
    fn name(&self) -> &str {
        &self.name
    }

    fn open(&self) -> Result<Box<dyn BackendSession>> {
        if self.fail_open.load(Ordering::SeqCst) {
            anyhow::bail!("Mock backend '{}' unavailable", self.name);
        }

        {
            let mut budget = lock(&self.open_budget);
            match budget.as_mut() {
                Some(0) => anyhow::bail!("Mock backend '{}' open budget exhausted", self.name),
                Some(left) => *left -= 1,
                None => {}
            }
        }

        self.opened.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(MockSession {
            backend: self.clone(),
            counters: HashMap::new(),
            closed: false,
        }))
    }
}

/// Session handed out by `MockBackend`
struct MockSession {
    backend: MockBackend,
    /// Running value of each energy counter
    counters: HashMap<DeviceId, f64>,
    closed: bool,
}

impl BackendSession for MockSession {
    fn devices(&self) -> Result<Vec<DeviceInfo>> {
        Ok(self.backend.devices.as_ref().clone())
    }

    fn read(&mut self, device: &DeviceId) -> Result<f64> {
        if self.closed {
            anyhow::bail!("Mock session already closed");
        }

        let info = self
            .backend
            .devices
            .iter()
            .find(|d| &d.id == device)
            .ok_or_else(|| anyhow::anyhow!("Unknown mock device {}", device))?;

        if lock(&self.backend.failing).contains(device.device()) {
            anyhow::bail!("Mock device {} unreachable", device);
        }

        self.backend.reads.fetch_add(1, Ordering::SeqCst);

        let jitter: f64 = rand::thread_rng().gen_range(0.0..1.0);
        let value = match info.kind {
            MetricKind::Energy => {
                let counter = self.counters.entry(device.clone()).or_insert(0.0);
                *counter += 10.0 + jitter;
                *counter
            }
            MetricKind::Power => 50.0 + jitter,
            MetricKind::Memory => 1024.0 * 1024.0 * (512.0 + jitter),
            MetricKind::Utilization => 25.0 + jitter,
        };

        Ok(value)
    }

    fn close(&mut self) -> Result<()> {
        if !self.closed {
            self.closed = true;
            self.backend.closed.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_energy_counter_is_monotonic() {
        let backend = MockBackend::with_devices(1);
        let mut session = backend.open().unwrap();
        let id = DeviceId::new("mock", "dev0");

        let first = session.read(&id).unwrap();
        let second = session.read(&id).unwrap();
        assert!(second > first);
        assert_eq!(backend.read_count(), 2);
    }

    #[test]
    fn test_failing_device() {
        let backend = MockBackend::with_devices(2);
        backend.set_failing("dev1", true);

        let mut session = backend.open().unwrap();
        assert!(session.read(&DeviceId::new("mock", "dev0")).is_ok());
        assert!(session.read(&DeviceId::new("mock", "dev1")).is_err());

        backend.set_failing("dev1", false);
        assert!(session.read(&DeviceId::new("mock", "dev1")).is_ok());
    }

    #[test]
    fn test_open_budget() {
        let backend = MockBackend::with_devices(1);
        backend.set_open_budget(Some(1));

        assert!(backend.open().is_ok());
        assert!(backend.open().is_err());
        assert_eq!(backend.open_count(), 1);
    }

    #[test]
    fn test_close_is_counted_once() {
        let backend = MockBackend::with_devices(1);
        let mut session = backend.open().unwrap();
        session.close().unwrap();
        session.close().unwrap();
        assert_eq!(backend.close_count(), 1);
        assert!(session.read(&DeviceId::new("mock", "dev0")).is_err());
    }

    #[test]
    fn test_unknown_device() {
        let backend = MockBackend::with_devices(1);
        let mut session = backend.open().unwrap();
        assert!(session.read(&DeviceId::new("mock", "dev9")).is_err());
    }
}

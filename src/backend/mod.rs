//! Sensor backend abstraction
//!
//! A backend is a family of sensors (RAPL energy counters, procfs gauges, ...).
//! Backends hand out sessions: a session is the live handle used to enumerate
//! and read devices. Sessions are opened by the device resolver to build the
//! inventory and released right after, then opened again by the sampler thread
//! that actually polls the devices.
//!
//! # Backend Types
//!
//! - **rapl**: Linux powercap energy counters (`/sys/class/powercap`)
//! - **proc**: system memory and load from procfs
//! - **mock**: in-memory sensors for tests and hardware-less dry runs
//!
//! # Example
//!
//! ```
//! use powerpulse::backend::{BackendRegistry, mock::MockBackend};
//! use std::sync::Arc;
//!
//! let mut registry = BackendRegistry::new();
//! registry.register(Arc::new(MockBackend::with_devices(2)));
//!
//! let inventory = registry.inventory().unwrap();
//! assert_eq!(inventory.len(), 2);
//! ```

pub mod mock;
pub mod proc;
pub mod rapl;

use crate::config::BackendsConfig;
use crate::Result;
use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use tracing::{debug, warn};

/// Names accepted in `backends.enabled`
pub const KNOWN_BACKENDS: &[&str] = &["rapl", "proc", "mock"];

/// Opaque sensor identifier, rendered as `backend:device`
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DeviceId {
    backend: String,
    device: String,
}

impl DeviceId {
    pub fn new(backend: impl Into<String>, device: impl Into<String>) -> Self {
        Self {
            backend: backend.into(),
            device: device.into(),
        }
    }

    /// Name of the backend that owns this device
    pub fn backend(&self) -> &str {
        &self.backend
    }

    /// Backend-local device name
    pub fn device(&self) -> &str {
        &self.device
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.backend, self.device)
    }
}

impl FromStr for DeviceId {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.split_once(':') {
            Some((backend, device)) if !backend.is_empty() && !device.is_empty() => {
                Ok(Self::new(backend, device))
            }
            _ => anyhow::bail!("Invalid device id '{}' (expected backend:device)", s),
        }
    }
}

/// Quantity a device measures
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetricKind {
    /// Monotonic energy counter in joules
    Energy,
    /// Instantaneous power in watts
    Power,
    /// Memory in bytes
    Memory,
    /// Utilization in percent
    Utilization,
}

impl MetricKind {
    pub fn unit(&self) -> &'static str {
        match self {
            MetricKind::Energy => "J",
            MetricKind::Power => "W",
            MetricKind::Memory => "B",
            MetricKind::Utilization => "%",
        }
    }

    /// Cumulative kinds are summarized by their delta, not their mean
    pub fn is_cumulative(&self) -> bool {
        matches!(self, MetricKind::Energy)
    }
}

impl fmt::Display for MetricKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            MetricKind::Energy => "energy",
            MetricKind::Power => "power",
            MetricKind::Memory => "memory",
            MetricKind::Utilization => "utilization",
        };
        f.write_str(name)
    }
}

/// A device as reported by a backend inventory
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceInfo {
    pub id: DeviceId,
    pub kind: MetricKind,
    /// Human-readable description (zone name, sensor label)
    pub description: String,
    /// Value at which a cumulative counter wraps back to zero
    pub wrap_at: Option<f64>,
}

impl DeviceInfo {
    pub fn new(id: DeviceId, kind: MetricKind, description: impl Into<String>) -> Self {
        Self {
            id,
            kind,
            description: description.into(),
            wrap_at: None,
        }
    }

    pub fn with_wrap_at(mut self, wrap_at: f64) -> Self {
        self.wrap_at = Some(wrap_at);
        self
    }
}

/// Sensor backend
///
/// Backends are shared between the resolver and the sampler thread, so they
/// must be `Send + Sync`. All per-read state lives in the session.
pub trait Backend: Send + Sync {
    /// Backend name, used as the first half of every `DeviceId`
    fn name(&self) -> &str;

    /// Acquire a session (file handles, driver contexts)
    ///
    /// # Errors
    ///
    /// Returns an error if the backend is unavailable on this node.
    fn open(&self) -> Result<Box<dyn BackendSession>>;
}

/// Live handle onto a backend's devices
///
/// # Lifecycle
///
/// 1. `Backend::open()`
/// 2. `devices()` and/or any number of `read()` calls
/// 3. `close()`
pub trait BackendSession: Send {
    /// Enumerate the devices visible on this node
    fn devices(&self) -> Result<Vec<DeviceInfo>>;

    /// Read the current value of one device
    fn read(&mut self, device: &DeviceId) -> Result<f64>;

    /// Release the session's resources
    fn close(&mut self) -> Result<()>;
}

/// Explicit set of backends available to this process
#[derive(Clone, Default)]
pub struct BackendRegistry {
    backends: Vec<Arc<dyn Backend>>,
}

impl BackendRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Build the registry described by the `backends` config section
    pub fn from_config(config: &BackendsConfig) -> Result<Self> {
        let mut registry = Self::new();

        for name in &config.enabled {
            let backend: Arc<dyn Backend> = match name.as_str() {
                "rapl" => Arc::new(rapl::RaplBackend::new(config.rapl_root.clone())),
                "proc" => Arc::new(proc::ProcBackend::new(config.proc_root.clone())),
                "mock" => Arc::new(mock::MockBackend::with_devices(config.mock_devices)),
                other => anyhow::bail!(
                    "Unknown backend '{}' (known: {})",
                    other,
                    KNOWN_BACKENDS.join(", ")
                ),
            };
            registry.register(backend);
        }

        Ok(registry)
    }

    /// Add a backend
    pub fn register(&mut self, backend: Arc<dyn Backend>) {
        self.backends.push(backend);
    }

    /// Look up a backend by name
    pub fn get(&self, name: &str) -> Option<&Arc<dyn Backend>> {
        self.backends.iter().find(|b| b.name() == name)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<dyn Backend>> {
        self.backends.iter()
    }

    pub fn len(&self) -> usize {
        self.backends.len()
    }

    pub fn is_empty(&self) -> bool {
        self.backends.is_empty()
    }

    /// Enumerate every device of every available backend
    ///
    /// Each backend is opened, listed and closed again. Backends that cannot
    /// be opened on this node are skipped with a warning; a node without RAPL
    /// support is still a valid participant.
    pub fn inventory(&self) -> Result<Vec<DeviceInfo>> {
        let mut devices = Vec::new();

        for backend in &self.backends {
            let mut session = match backend.open() {
                Ok(session) => session,
                Err(e) => {
                    warn!(backend = backend.name(), "Backend unavailable: {:#}", e);
                    continue;
                }
            };

            let listed = session
                .devices()
                .with_context(|| format!("Failed to enumerate {} devices", backend.name()));

            // Release the handle even when enumeration failed
            if let Err(e) = session.close() {
                warn!(backend = backend.name(), "Failed to close session: {:#}", e);
            }

            let listed = listed?;
            debug!(backend = backend.name(), count = listed.len(), "Enumerated devices");
            devices.extend(listed);
        }

        Ok(devices)
    }
}

impl fmt::Debug for BackendRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list()
            .entries(self.backends.iter().map(|b| b.name()))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::mock::MockBackend;

    #[test]
    fn test_device_id_display_and_parse() {
        let id = DeviceId::new("rapl", "intel-rapl:0");
        assert_eq!(id.to_string(), "rapl:intel-rapl:0");

        let parsed: DeviceId = "rapl:intel-rapl:0".parse().unwrap();
        assert_eq!(parsed, id);
        assert_eq!(parsed.backend(), "rapl");
        assert_eq!(parsed.device(), "intel-rapl:0");

        assert!("nocolon".parse::<DeviceId>().is_err());
        assert!(":device".parse::<DeviceId>().is_err());
    }

    #[test]
    fn test_metric_kind_units() {
        assert_eq!(MetricKind::Energy.unit(), "J");
        assert_eq!(MetricKind::Power.unit(), "W");
        assert!(MetricKind::Energy.is_cumulative());
        assert!(!MetricKind::Power.is_cumulative());
    }

    #[test]
    fn test_inventory_skips_unavailable_backends() {
        let healthy = MockBackend::with_devices(2);
        let broken = MockBackend::named("broken", 3);
        broken.set_fail_open(true);

        let mut registry = BackendRegistry::new();
        registry.register(Arc::new(healthy.clone()));
        registry.register(Arc::new(broken));

        let inventory = registry.inventory().unwrap();
        assert_eq!(inventory.len(), 2);

        // Inventory sessions are released
        assert_eq!(healthy.open_count(), 1);
        assert_eq!(healthy.close_count(), 1);
    }

    #[test]
    fn test_from_config_rejects_unknown_backend() {
        let config = BackendsConfig {
            enabled: vec!["nvml".to_string()],
            ..Default::default()
        };
        assert!(BackendRegistry::from_config(&config).is_err());
    }

    #[test]
    fn test_registry_lookup() {
        let mut registry = BackendRegistry::new();
        registry.register(Arc::new(MockBackend::with_devices(1)));
        assert!(registry.get("mock").is_some());
        assert!(registry.get("rapl").is_none());
        assert_eq!(registry.len(), 1);
    }
}

//! Device ownership across the ranks of a job
//!
//! Several ranks usually share a host, and a host's sensors must be sampled
//! by exactly one of them. Every rank enumerates its node's devices; the
//! inventories are all-gathered together with the host names and each host's
//! devices go to the lowest rank running on it.

use crate::backend::{BackendRegistry, DeviceId, DeviceInfo};
use crate::comm::{all_gather_value, Communicator};
use crate::Result;
use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use tracing::{debug, info};

/// Name of this node, as used to group ranks by host
pub fn node_name() -> String {
    hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "unknown".to_string())
}

/// One rank's view of its node
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HostInventory {
    pub rank: usize,
    pub hostname: String,
    pub devices: Vec<DeviceInfo>,
}

/// Mapping from rank to the devices it samples
///
/// Each device appears under at most one rank; ranks without devices map to
/// an empty list.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DeviceAssignment {
    by_rank: BTreeMap<usize, Vec<DeviceInfo>>,
}

impl DeviceAssignment {
    /// Apply the lowest-rank-per-host rule to gathered inventories
    pub fn from_inventories(inventories: &[HostInventory]) -> Self {
        let mut owner_of_host: BTreeMap<&str, usize> = BTreeMap::new();
        for inv in inventories {
            owner_of_host
                .entry(inv.hostname.as_str())
                .and_modify(|owner| *owner = (*owner).min(inv.rank))
                .or_insert(inv.rank);
        }

        let mut by_rank = BTreeMap::new();
        for inv in inventories {
            let owns = owner_of_host.get(inv.hostname.as_str()) == Some(&inv.rank);
            let devices = if owns {
                let mut seen: HashSet<&DeviceId> = HashSet::new();
                inv.devices
                    .iter()
                    .filter(|d| seen.insert(&d.id))
                    .cloned()
                    .collect()
            } else {
                Vec::new()
            };
            by_rank.insert(inv.rank, devices);
        }

        Self { by_rank }
    }

    /// Devices owned by `rank` (empty if it owns none)
    pub fn for_rank(&self, rank: usize) -> &[DeviceInfo] {
        self.by_rank.get(&rank).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Ranks that own at least one device
    pub fn ranks(&self) -> impl Iterator<Item = usize> + '_ {
        self.by_rank
            .iter()
            .filter(|(_, devices)| !devices.is_empty())
            .map(|(rank, _)| *rank)
    }
}

/// Computes the devices owned by the current rank
pub struct DeviceResolver {
    comm: Arc<dyn Communicator>,
    registry: Arc<BackendRegistry>,
}

impl DeviceResolver {
    pub fn new(comm: Arc<dyn Communicator>, registry: Arc<BackendRegistry>) -> Self {
        Self { comm, registry }
    }

    /// Resolve this rank's devices
    ///
    /// Collective: every rank must call it. Backend sessions opened for the
    /// inventory are released before returning.
    pub fn resolve(&self) -> Result<Vec<DeviceInfo>> {
        let local = HostInventory {
            rank: self.comm.rank(),
            hostname: node_name(),
            devices: self
                .registry
                .inventory()
                .context("Failed to enumerate local devices")?,
        };
        debug!(
            host = %local.hostname,
            count = local.devices.len(),
            "Local inventory"
        );

        let inventories = all_gather_value(self.comm.as_ref(), &local)
            .context("Failed to exchange device inventories")?;
        let assignment = DeviceAssignment::from_inventories(&inventories);
        let owned = assignment.for_rank(self.comm.rank()).to_vec();

        info!(
            devices = owned.len(),
            owners = assignment.ranks().count(),
            "Resolved device assignment"
        );
        Ok(owned)
    }
}

//! Collective rendezvous between cooperating processes
//!
//! Every process of a monitored job holds one `Communicator`. All
//! collectives are blocking and all-or-nothing: a call returns only after
//! every rank made the same call, and there is no timeout. A rank that never
//! arrives blocks its peers indefinitely.
//!
//! # Implementations
//!
//! - **LocalCommunicator**: a world of one; every collective returns at once
//! - **TcpCommunicator**: rank 0 acts as hub for the other ranks

pub mod protocol;
pub mod tcp;

pub use tcp::TcpCommunicator;

use crate::config::ClusterConfig;
use crate::Result;
use anyhow::Context;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;

/// Collective rendezvous primitive shared by all ranks
pub trait Communicator: Send + Sync {
    /// Rank of this process, in `0..size()`
    fn rank(&self) -> usize;

    /// Number of cooperating processes
    fn size(&self) -> usize;

    /// Contribute `payload` and receive every rank's payload, in rank order
    fn all_gather(&self, payload: Vec<u8>) -> Result<Vec<Vec<u8>>>;

    /// Block until every rank has called `barrier`
    fn barrier(&self) -> Result<()> {
        self.all_gather(Vec::new()).map(|_| ())
    }

    /// Receive the payload contributed by `root`
    ///
    /// Non-root payloads are ignored; they are usually empty.
    fn broadcast(&self, root: usize, payload: Vec<u8>) -> Result<Vec<u8>> {
        let mut gathered = self.all_gather(payload)?;
        if root >= gathered.len() {
            anyhow::bail!("Broadcast root {} outside world of {}", root, gathered.len());
        }
        Ok(gathered.swap_remove(root))
    }

    /// Whether this process is the designated rank 0
    fn is_root(&self) -> bool {
        self.rank() == 0
    }
}

/// Gather a typed value from every rank
pub fn all_gather_value<T>(comm: &dyn Communicator, value: &T) -> Result<Vec<T>>
where
    T: Serialize + DeserializeOwned,
{
    let payload = bincode::serialize(value).context("Failed to encode collective payload")?;
    comm.all_gather(payload)?
        .iter()
        .enumerate()
        .map(|(rank, bytes)| {
            bincode::deserialize(bytes)
                .with_context(|| format!("Failed to decode payload from rank {}", rank))
        })
        .collect()
}

/// Broadcast a typed value from `root`
///
/// `root` passes `Some(value)`, every other rank passes `None`.
pub fn broadcast_value<T>(comm: &dyn Communicator, root: usize, value: Option<&T>) -> Result<T>
where
    T: Serialize + DeserializeOwned,
{
    let payload = match value {
        Some(v) if comm.rank() == root => {
            bincode::serialize(v).context("Failed to encode broadcast payload")?
        }
        _ => Vec::new(),
    };

    let bytes = comm.broadcast(root, payload)?;
    bincode::deserialize(&bytes)
        .with_context(|| format!("Failed to decode broadcast from rank {}", root))
}

/// Communicator for a process that runs alone
#[derive(Debug, Default, Clone, Copy)]
pub struct LocalCommunicator;

impl LocalCommunicator {
    pub fn new() -> Self {
        Self
    }
}

impl Communicator for LocalCommunicator {
    fn rank(&self) -> usize {
        0
    }

    fn size(&self) -> usize {
        1
    }

    fn all_gather(&self, payload: Vec<u8>) -> Result<Vec<Vec<u8>>> {
        Ok(vec![payload])
    }
}

/// Join the job described by the cluster config
///
/// A world of one gets a `LocalCommunicator` and never touches the network.
pub fn connect(cluster: &ClusterConfig) -> Result<Arc<dyn Communicator>> {
    let (rank, size) = cluster.world();
    if size <= 1 {
        return Ok(Arc::new(LocalCommunicator::new()));
    }

    let addr = cluster
        .coordinator
        .as_deref()
        .ok_or_else(|| anyhow::anyhow!("A coordinator address is required for {} ranks", size))?;

    let comm = TcpCommunicator::connect(
        rank,
        size,
        addr,
        Duration::from_secs(cluster.connect_timeout_secs),
    )?;
    Ok(Arc::new(comm))
}

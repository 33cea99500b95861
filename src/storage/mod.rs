//! Experiment storage
//!
//! An experiment is a directory holding a manifest and one record per rank
//! and run:
//!
//! ```text
//! <outdir>/<script>.pulse/
//! ├── experiment.json          manifest (runs, per-rank entries)
//! ├── run-0000/
//! │   ├── rank-0000.json       samples of rank 0, or null
//! │   └── rank-0001.json
//! └── run-0001/
//!     └── ...
//! ```
//!
//! Runs accumulate across monitor invocations of the same script. Opening,
//! adding and committing runs are collective: rank 0 owns the manifest and
//! every other rank learns the outcome through the communicator, so run
//! indices are identical on all ranks. A run only counts once it has been
//! committed; a run whose persistence failed on any rank stays in the
//! manifest as incomplete and is ignored by reports and postprocessing.
//!
//! The output directory is expected to be visible to every rank (shared
//! filesystem) when the job spans several hosts.

use crate::comm::{all_gather_value, broadcast_value, Communicator};
use crate::postprocess::RankSummary;
use crate::resolver::node_name;
use crate::sampler::LocalResultBuffer;
use crate::Result;
use anyhow::Context;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};

/// Version of the on-disk layout
pub const FORMAT_VERSION: u32 = 1;

/// Manifest file name inside an experiment directory
pub const MANIFEST_FILE: &str = "experiment.json";

/// Extension of experiment directories
pub const EXPERIMENT_EXTENSION: &str = "pulse";

/// Dense index of a run inside an experiment
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RunId(usize);

impl RunId {
    pub fn new(index: usize) -> Self {
        Self(index)
    }

    pub fn index(&self) -> usize {
        self.0
    }

    fn dir_name(&self) -> String {
        format!("run-{:04}", self.0)
    }
}

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Top-level description of an experiment
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExperimentManifest {
    pub name: String,
    pub created_at: DateTime<Utc>,
    pub format_version: u32,
    pub runs: Vec<RunEntry>,
}

/// One run as listed in the manifest
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunEntry {
    pub id: RunId,
    pub created_at: DateTime<Utc>,
    pub world_size: usize,
    /// One entry per rank, in rank order
    pub ranks: Vec<RankEntry>,
    /// Set by [`ExperimentStorage::commit_run`] once every rank persisted its record
    #[serde(default)]
    pub complete: bool,
}

/// One rank's contribution to a run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RankEntry {
    pub rank: usize,
    pub hostname: String,
    pub devices: usize,
    pub samples: usize,
    pub has_data: bool,
}

/// Contents of `run-NNNN/rank-NNNN.json`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RankRecord {
    pub run_id: RunId,
    pub rank: usize,
    pub hostname: String,
    /// Samples, or `None` for a rank that owned no devices
    pub data: Option<LocalResultBuffer>,
    /// Filled in by postprocessing
    #[serde(default)]
    pub summary: Option<RankSummary>,
}

/// Handle onto an experiment directory
pub struct ExperimentStorage {
    root: PathBuf,
    comm: Arc<dyn Communicator>,
    manifest: ExperimentManifest,
}

impl ExperimentStorage {
    /// Experiment directory used for `script` under `outdir`
    ///
    /// ```
    /// use powerpulse::storage::ExperimentStorage;
    /// use std::path::Path;
    ///
    /// let dir = ExperimentStorage::experiment_dir(Path::new("out"), Path::new("jobs/train.py"));
    /// assert_eq!(dir, Path::new("out/train.pulse"));
    /// ```
    pub fn experiment_dir(outdir: &Path, script: &Path) -> PathBuf {
        let stem = script
            .file_stem()
            .and_then(|s| s.to_str())
            .filter(|s| !s.is_empty())
            .unwrap_or("experiment");
        outdir.join(format!("{}.{}", stem, EXPERIMENT_EXTENSION))
    }

    /// Open or create the experiment at `path`
    ///
    /// Collective. Rank 0 creates the directory and manifest; the other
    /// ranks only touch the path after rank 0 reported success.
    pub fn open(path: &Path, comm: Arc<dyn Communicator>) -> Result<Self> {
        let status = if comm.is_root() {
            Some(create_or_load(path).err().map(|e| format!("{:#}", e)))
        } else {
            None
        };

        let status: Option<String> = broadcast_value(comm.as_ref(), 0, status.as_ref())
            .context("Failed to agree on experiment creation")?;
        if let Some(reason) = status {
            anyhow::bail!("Rank 0 could not prepare {}: {}", path.display(), reason);
        }

        let manifest = load_manifest(path)?;
        debug!(path = %path.display(), runs = manifest.runs.len(), "Opened experiment");

        Ok(Self {
            root: path.to_path_buf(),
            comm,
            manifest,
        })
    }

    /// Open an existing experiment without any collective
    ///
    /// `path` may be the experiment directory or its manifest file.
    pub fn open_existing(path: &Path, comm: Arc<dyn Communicator>) -> Result<Self> {
        let root = if path.is_file() {
            path.parent()
                .map(Path::to_path_buf)
                .ok_or_else(|| anyhow::anyhow!("Invalid experiment path {}", path.display()))?
        } else {
            path.to_path_buf()
        };

        let manifest = load_manifest(&root)
            .with_context(|| format!("{} is not an experiment", path.display()))?;

        Ok(Self {
            root,
            comm,
            manifest,
        })
    }

    /// Register a new run
    ///
    /// Collective. Every rank calls it, with its buffer or `None`, and every
    /// rank receives the same `RunId`. Each rank's record starts out as a
    /// null marker; owners fill it with [`attach_device_data`](Self::attach_device_data).
    pub fn add_run(&mut self, data: Option<&LocalResultBuffer>) -> Result<RunId> {
        let entry = RankEntry {
            rank: self.comm.rank(),
            hostname: data
                .map(|d| d.hostname().to_string())
                .unwrap_or_else(node_name),
            devices: data.map_or(0, LocalResultBuffer::device_count),
            samples: data.map_or(0, LocalResultBuffer::sample_count),
            has_data: data.is_some(),
        };
        let hostname = entry.hostname.clone();

        let entries = all_gather_value(self.comm.as_ref(), &entry)
            .context("Failed to gather run entries")?;

        let allocated = if self.comm.is_root() {
            Some(self.allocate_run(entries).map_err(|e| format!("{:#}", e)))
        } else {
            None
        };
        let allocated: std::result::Result<RunId, String> =
            broadcast_value(self.comm.as_ref(), 0, allocated.as_ref())
                .context("Failed to agree on run id")?;
        let run_id = allocated.map_err(|reason| anyhow::anyhow!("Rank 0 could not add run: {}", reason))?;

        self.store_rank_record(&RankRecord {
            run_id,
            rank: self.comm.rank(),
            hostname,
            data: None,
            summary: None,
        })?;
        self.reload()?;

        info!(run = %run_id, "Registered run");
        Ok(run_id)
    }

    /// Store the samples of this rank for `run`
    ///
    /// Only the rank that produced the buffer may attach it.
    pub fn attach_device_data(&self, run: RunId, buffer: &LocalResultBuffer) -> Result<()> {
        if buffer.rank() != self.comm.rank() {
            anyhow::bail!(
                "Rank {} cannot attach the buffer of rank {}",
                self.comm.rank(),
                buffer.rank()
            );
        }
        self.run(run)?;

        self.store_rank_record(&RankRecord {
            run_id: run,
            rank: buffer.rank(),
            hostname: buffer.hostname().to_string(),
            data: Some(buffer.clone()),
            summary: None,
        })
    }

    /// Mark `run` complete if every rank persisted its record
    ///
    /// Collective. `persisted` is this rank's own outcome. Rank 0 flags the
    /// run as complete only when all ranks succeeded; otherwise the run stays
    /// incomplete and every rank gets an error naming the failed ranks.
    pub fn commit_run(&mut self, run: RunId, persisted: bool) -> Result<()> {
        let outcomes = all_gather_value(self.comm.as_ref(), &persisted)
            .context("Failed to gather persistence outcomes")?;
        let failed: Vec<usize> = outcomes
            .iter()
            .enumerate()
            .filter(|(_, ok)| !**ok)
            .map(|(rank, _)| rank)
            .collect();

        let committed = if self.comm.is_root() && failed.is_empty() {
            Some(self.mark_complete(run).err().map(|e| format!("{:#}", e)))
        } else {
            None
        };
        // Without failures rank 0 reports its own manifest update
        if failed.is_empty() {
            let status: Option<String> = broadcast_value(self.comm.as_ref(), 0, committed.as_ref())
                .context("Failed to agree on run completion")?;
            if let Some(reason) = status {
                anyhow::bail!("Rank 0 could not commit run {}: {}", run, reason);
            }
        }

        self.reload()?;
        if !failed.is_empty() {
            anyhow::bail!("Run {} left incomplete: ranks {:?} failed to persist", run, failed);
        }

        debug!(run = %run, "Committed run");
        Ok(())
    }

    /// Release the handle
    ///
    /// Collective, so no rank leaves while another still writes.
    pub fn close(self) -> Result<()> {
        self.comm.barrier().context("Failed to close experiment")
    }

    pub fn path(&self) -> &Path {
        &self.root
    }

    pub fn name(&self) -> &str {
        &self.manifest.name
    }

    pub fn manifest(&self) -> &ExperimentManifest {
        &self.manifest
    }

    pub fn comm(&self) -> &Arc<dyn Communicator> {
        &self.comm
    }

    pub fn runs(&self) -> &[RunEntry] {
        &self.manifest.runs
    }

    /// Runs that were committed, in order
    pub fn completed_runs(&self) -> impl Iterator<Item = &RunEntry> + '_ {
        self.manifest.runs.iter().filter(|r| r.complete)
    }

    /// Most recent committed run
    pub fn latest_run(&self) -> Option<RunId> {
        self.completed_runs().last().map(|r| r.id)
    }

    pub fn run(&self, id: RunId) -> Result<&RunEntry> {
        self.manifest
            .runs
            .iter()
            .find(|r| r.id == id)
            .ok_or_else(|| {
                anyhow::anyhow!("Run {} not found in experiment '{}'", id, self.manifest.name)
            })
    }

    /// Re-read the manifest from disk
    pub fn reload(&mut self) -> Result<()> {
        self.manifest = load_manifest(&self.root)?;
        Ok(())
    }

    pub fn load_rank_record(&self, run: RunId, rank: usize) -> Result<RankRecord> {
        read_json(&self.rank_record_path(run, rank))
    }

    pub fn store_rank_record(&self, record: &RankRecord) -> Result<()> {
        write_json_atomic(&self.rank_record_path(record.run_id, record.rank), record)
    }

    fn rank_record_path(&self, run: RunId, rank: usize) -> PathBuf {
        self.root
            .join(run.dir_name())
            .join(format!("rank-{:04}.json", rank))
    }

    /// Append a run to the manifest on disk (rank 0 only)
    fn allocate_run(&mut self, ranks: Vec<RankEntry>) -> Result<RunId> {
        let mut manifest = load_manifest(&self.root)?;
        let id = RunId::new(manifest.runs.len());

        let run_dir = self.root.join(id.dir_name());
        fs::create_dir_all(&run_dir)
            .with_context(|| format!("Failed to create {}", run_dir.display()))?;

        manifest.runs.push(RunEntry {
            id,
            created_at: Utc::now(),
            world_size: ranks.len(),
            ranks,
            complete: false,
        });
        write_json_atomic(&self.root.join(MANIFEST_FILE), &manifest)?;
        self.manifest = manifest;

        Ok(id)
    }

    /// Flag `run` as complete in the manifest on disk (rank 0 only)
    fn mark_complete(&mut self, run: RunId) -> Result<()> {
        let mut manifest = load_manifest(&self.root)?;
        let entry = manifest
            .runs
            .iter_mut()
            .find(|r| r.id == run)
            .ok_or_else(|| anyhow::anyhow!("Run {} not found", run))?;
        entry.complete = true;
        write_json_atomic(&self.root.join(MANIFEST_FILE), &manifest)?;
        self.manifest = manifest;
        Ok(())
    }
}

fn create_or_load(path: &Path) -> Result<()> {
    fs::create_dir_all(path).with_context(|| format!("Failed to create {}", path.display()))?;

    let manifest_path = path.join(MANIFEST_FILE);
    if manifest_path.exists() {
        let manifest = load_manifest(path)?;
        if manifest.format_version != FORMAT_VERSION {
            anyhow::bail!(
                "Experiment format version {} is not supported (expected {})",
                manifest.format_version,
                FORMAT_VERSION
            );
        }
        return Ok(());
    }

    let name = path
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("experiment")
        .to_string();
    let manifest = ExperimentManifest {
        name,
        created_at: Utc::now(),
        format_version: FORMAT_VERSION,
        runs: Vec::new(),
    };
    write_json_atomic(&manifest_path, &manifest)
}

fn load_manifest(root: &Path) -> Result<ExperimentManifest> {
    read_json(&root.join(MANIFEST_FILE))
}

fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let contents = fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    serde_json::from_str(&contents).with_context(|| format!("Failed to parse {}", path.display()))
}

/// Write pretty JSON to `path` through a temporary file and a rename
pub fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let json = serde_json::to_string_pretty(value).context("Failed to serialize JSON")?;

    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);

    fs::write(&tmp, json).with_context(|| format!("Failed to write {}", tmp.display()))?;
    fs::rename(&tmp, path).with_context(|| format!("Failed to replace {}", path.display()))?;
    Ok(())
}

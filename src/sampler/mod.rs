//! Sampler worker
//!
//! The sampler is a dedicated OS thread that owns its backend sessions and
//! its sample buffer. The orchestrator talks to it only through three
//! channels:
//!
//! - **ready** (bounded, one message): `Ok` after the first sample, or the
//!   reason the sessions could not be opened
//! - **stop** (closed-once): see [`signal`]
//! - **hand-off** (bounded, one message): the finalized buffer
//!
//! # Sampling loop
//!
//! Deadlines are computed from the instant of the first sample
//! (`origin + tick * period`), so the period does not drift with read
//! latency. Ticks that were missed entirely are skipped, not replayed.
//! Between samples the thread waits on the stop channel, so a stop request
//! is observed within one period.
//!
//! # Example
//!
//! ```
//! use powerpulse::backend::{BackendRegistry, mock::MockBackend};
//! use powerpulse::sampler::{BufferMeta, SamplerHandle, SamplingFrequency};
//! use std::sync::Arc;
//!
//! let mut registry = BackendRegistry::new();
//! registry.register(Arc::new(MockBackend::with_devices(1)));
//! let registry = Arc::new(registry);
//! let devices = registry.inventory()?;
//!
//! let meta = BufferMeta { rank: 0, hostname: "localhost".into() };
//! let sampler = SamplerHandle::spawn(registry, devices, SamplingFrequency::new(10.0)?, meta)?;
//! sampler.wait_ready()?;
//! sampler.signal_stop();
//! let buffer = sampler.collect()?;
//! assert!(buffer.sample_count() >= 1);
//! # Ok::<(), anyhow::Error>(())
//! ```

pub mod buffer;
pub mod signal;

pub use buffer::{BufferMeta, DeviceSeries, LocalResultBuffer, Reading, Sample, SampleBuffer};
pub use signal::{stop_signal, StopListener, StopSignal};

use crate::backend::{BackendRegistry, BackendSession, DeviceInfo};
use crate::Result;
use anyhow::Context;
use crossbeam::channel::{self, Receiver, Sender};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Sampling frequency in Hz
///
/// Positive and finite, with a period of at least one nanosecond that a
/// monotonic clock deadline can still represent.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SamplingFrequency(f64);

impl SamplingFrequency {
    pub fn new(hz: f64) -> Result<Self> {
        if !hz.is_finite() || hz <= 0.0 {
            anyhow::bail!("Sampling frequency must be a positive number, got {}", hz);
        }
        let period = match Duration::try_from_secs_f64(1.0 / hz) {
            Ok(period) if !period.is_zero() => period,
            Ok(_) => anyhow::bail!("Sampling frequency {} Hz is too high", hz),
            Err(_) => anyhow::bail!("Sampling frequency {} Hz is too low", hz),
        };
        if Instant::now().checked_add(period).is_none() {
            anyhow::bail!("Sampling frequency {} Hz is too low", hz);
        }
        Ok(Self(hz))
    }

    pub fn hz(&self) -> f64 {
        self.0
    }

    /// Time between two samples (`1/f`)
    pub fn period(&self) -> Duration {
        Duration::from_secs_f64(1.0 / self.0)
    }
}

impl Default for SamplingFrequency {
    fn default() -> Self {
        Self(1.0)
    }
}

impl fmt::Display for SamplingFrequency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} Hz", self.0)
    }
}

/// Orchestrator-side handle of a running sampler thread
pub struct SamplerHandle {
    stop: StopSignal,
    ready: Receiver<std::result::Result<(), String>>,
    handoff: Receiver<LocalResultBuffer>,
    thread: Option<JoinHandle<()>>,
}

impl SamplerHandle {
    /// Launch a sampler thread for `devices`
    ///
    /// Returns immediately; use [`wait_ready`](Self::wait_ready) to block
    /// until the first sample was taken.
    pub fn spawn(
        registry: Arc<BackendRegistry>,
        devices: Vec<DeviceInfo>,
        frequency: SamplingFrequency,
        meta: BufferMeta,
    ) -> Result<Self> {
        let (stop, listener) = stop_signal();
        let (ready_tx, ready) = channel::bounded(1);
        let (handoff_tx, handoff) = channel::bounded(1);

        let thread = std::thread::Builder::new()
            .name(format!("sampler-{}", meta.rank))
            .spawn(move || {
                let sampler = Sampler {
                    registry,
                    devices,
                    frequency,
                    meta,
                    stop: listener,
                };
                sampler.run(ready_tx, handoff_tx);
            })
            .context("Failed to spawn sampler thread")?;

        Ok(Self {
            stop,
            ready,
            handoff,
            thread: Some(thread),
        })
    }

    /// Block until the sampler took its first sample
    pub fn wait_ready(&self) -> Result<()> {
        match self.ready.recv() {
            Ok(Ok(())) => Ok(()),
            Ok(Err(reason)) => anyhow::bail!("Sampler failed to start: {}", reason),
            Err(_) => anyhow::bail!("Sampler exited before signaling readiness"),
        }
    }

    /// Signal stop; returns `true` if this call set it
    pub fn signal_stop(&self) -> bool {
        self.stop.set()
    }

    /// Join the sampler thread and take its finalized buffer
    ///
    /// Fails without joining if stop was never signaled, since the thread
    /// would sample forever.
    pub fn collect(mut self) -> Result<LocalResultBuffer> {
        if !self.stop.is_set() {
            anyhow::bail!("Sampler collected before stop was signaled");
        }
        if let Some(thread) = self.thread.take() {
            thread
                .join()
                .map_err(|_| anyhow::anyhow!("Sampler thread panicked"))?;
        }

        self.handoff
            .try_recv()
            .map_err(|_| anyhow::anyhow!("Sampler exited without handing off its buffer"))
    }
}

impl Drop for SamplerHandle {
    fn drop(&mut self) {
        self.stop.set();
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

/// State owned by the sampler thread
struct Sampler {
    registry: Arc<BackendRegistry>,
    devices: Vec<DeviceInfo>,
    frequency: SamplingFrequency,
    meta: BufferMeta,
    stop: StopListener,
}

impl Sampler {
    fn run(
        self,
        ready: Sender<std::result::Result<(), String>>,
        handoff: Sender<LocalResultBuffer>,
    ) {
        let mut sessions = match self.open_sessions() {
            Ok(sessions) => sessions,
            Err(e) => {
                let _ = ready.send(Err(format!("{:#}", e)));
                return;
            }
        };

        let mut buffer = SampleBuffer::new(self.meta.clone(), self.frequency.hz(), &self.devices);
        let period = self.frequency.period();
        let origin = Instant::now();

        self.sample_once(&mut sessions, &mut buffer, origin);
        let _ = ready.send(Ok(()));

        let mut tick: u64 = 1;
        let mut skipped: u64 = 0;
        loop {
            // Past the clock's range there is no next sample, only stop
            let stopped = match tick_deadline(origin, period, tick) {
                Some(deadline) => self.stop.wait_until(deadline),
                None => {
                    self.stop.wait();
                    true
                }
            };
            if stopped {
                break;
            }

            self.sample_once(&mut sessions, &mut buffer, origin);

            tick += 1;
            let now = Instant::now();
            while tick_deadline(origin, period, tick).is_some_and(|d| d <= now) {
                tick += 1;
                skipped += 1;
            }
        }

        let duration = origin.elapsed();
        for (backend, session) in sessions.iter_mut() {
            if let Err(e) = session.close() {
                warn!(backend = %backend, "Failed to close session: {:#}", e);
            }
        }

        if skipped > 0 {
            debug!(skipped, "Sampler missed deadlines");
        }

        let _ = handoff.send(buffer.finalize(duration));
    }

    /// Open one session per backend owning at least one device
    fn open_sessions(&self) -> Result<BTreeMap<String, Box<dyn BackendSession>>> {
        let mut sessions: BTreeMap<String, Box<dyn BackendSession>> = BTreeMap::new();

        for device in &self.devices {
            let name = device.id.backend();
            if sessions.contains_key(name) {
                continue;
            }

            let opened = self
                .registry
                .get(name)
                .ok_or_else(|| anyhow::anyhow!("Backend '{}' is not registered", name))
                .and_then(|backend| backend.open());

            match opened {
                Ok(session) => {
                    sessions.insert(name.to_string(), session);
                }
                Err(e) => {
                    for session in sessions.values_mut() {
                        let _ = session.close();
                    }
                    return Err(e.context(format!("Failed to open backend '{}'", name)));
                }
            }
        }

        Ok(sessions)
    }

    /// Read every device once; unreachable devices get an error marker
    fn sample_once(
        &self,
        sessions: &mut BTreeMap<String, Box<dyn BackendSession>>,
        buffer: &mut SampleBuffer,
        origin: Instant,
    ) {
        for (index, device) in self.devices.iter().enumerate() {
            let reading = match sessions.get_mut(device.id.backend()) {
                Some(session) => match session.read(&device.id) {
                    Ok(value) => Reading::Value(value),
                    Err(e) => {
                        debug!(device = %device.id, "Read failed: {:#}", e);
                        Reading::Error(format!("{:#}", e))
                    }
                },
                None => Reading::Error("no session".to_string()),
            };
            buffer.push(index, origin.elapsed().as_secs_f64(), reading);
        }
    }
}

/// Instant of sample `tick`, or `None` if it is beyond the clock's range
fn tick_deadline(origin: Instant, period: Duration, tick: u64) -> Option<Instant> {
    let offset = Duration::try_from_secs_f64(period.as_secs_f64() * tick as f64).ok()?;
    origin.checked_add(offset)
}

//! One-shot signals between the orchestrator and the sampler thread
//!
//! Stop is modelled as a closed-once channel: the orchestrator holds the only
//! sender and drops it to signal. The listener observes the disconnection
//! from inside its per-period wait, so no polling flag is needed.

use crate::util::lock;
use crossbeam::channel::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::Mutex;
use std::time::Instant;

/// Create a connected stop signal / listener pair
pub fn stop_signal() -> (StopSignal, StopListener) {
    let (tx, rx) = channel::bounded(0);
    (
        StopSignal {
            sender: Mutex::new(Some(tx)),
        },
        StopListener { rx },
    )
}

/// Writer half of the stop signal
pub struct StopSignal {
    sender: Mutex<Option<Sender<()>>>,
}

impl StopSignal {
    /// Signal stop
    ///
    /// Idempotent. Returns `true` only for the call that actually set it.
    pub fn set(&self) -> bool {
        lock(&self.sender).take().is_some()
    }

    pub fn is_set(&self) -> bool {
        lock(&self.sender).is_none()
    }
}

/// Reader half of the stop signal
pub struct StopListener {
    rx: Receiver<()>,
}

impl StopListener {
    /// Block until `deadline` or until stop is signaled
    ///
    /// Returns `true` if stop was signaled.
    pub fn wait_until(&self, deadline: Instant) -> bool {
        matches!(
            self.rx.recv_deadline(deadline),
            Ok(()) | Err(RecvTimeoutError::Disconnected)
        )
    }

    /// Block until stop is signaled
    pub fn wait(&self) {
        let _ = self.rx.recv();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_set_is_idempotent() {
        let (signal, listener) = stop_signal();
        assert!(!signal.is_set());

        assert!(signal.set());
        assert!(!signal.set());
        assert!(!signal.set());

        assert!(signal.is_set());
        // Returns at once after stop
        listener.wait();
        assert!(listener.wait_until(Instant::now() + Duration::from_secs(10)));
    }

    #[test]
    fn test_wait_times_out_without_stop() {
        let (_signal, listener) = stop_signal();
        let start = Instant::now();
        assert!(!listener.wait_until(start + Duration::from_millis(30)));
        assert!(start.elapsed() >= Duration::from_millis(30));
    }

    #[test]
    fn test_wait_wakes_on_stop() {
        let (signal, listener) = stop_signal();
        let waiter = thread::spawn(move || {
            let start = Instant::now();
            let stopped = listener.wait_until(start + Duration::from_secs(10));
            (stopped, start.elapsed())
        });

        thread::sleep(Duration::from_millis(20));
        signal.set();

        let (stopped, waited) = waiter.join().unwrap();
        assert!(stopped);
        assert!(waited < Duration::from_secs(5));
    }
}

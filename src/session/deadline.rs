//! Hard deadline for a supervised session.

use crate::process::KillHandle;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError, Sender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, warn};

/// Timer thread that force-kills a fixed set of processes on expiry.
///
/// Cancelling (explicitly or by dropping) stops the thread without touching
/// the processes.
pub struct DeadlineTimer {
    cancel: Option<Sender<()>>,
    fired: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl DeadlineTimer {
    pub fn arm(timeout: Duration, targets: Vec<KillHandle>) -> Self {
        let (tx, rx) = mpsc::channel::<()>();
        let fired = Arc::new(AtomicBool::new(false));
        let flag = fired.clone();

        let thread = thread::Builder::new()
            .name("session-deadline".to_string())
            .spawn(move || match rx.recv_timeout(timeout) {
                Err(RecvTimeoutError::Timeout) => {
                    flag.store(true, Ordering::Release);
                    for handle in &targets {
                        warn!(
                            pid = handle.pid(),
                            process = handle.label(),
                            timeout_secs = timeout.as_secs(),
                            "Timeout exceeded, force killed"
                        );
                        handle.force_terminate();
                    }
                }
                Ok(()) | Err(RecvTimeoutError::Disconnected) => {
                    debug!("Deadline timer cancelled");
                }
            });

        let thread = match thread {
            Ok(handle) => Some(handle),
            Err(e) => {
                warn!(error = %e, "Cannot start deadline timer");
                None
            }
        };

        Self {
            cancel: Some(tx),
            fired,
            thread,
        }
    }

    /// Whether the deadline expired and the kills were issued.
    pub fn fired(&self) -> bool {
        self.fired.load(Ordering::Acquire)
    }

    /// Stop the timer and wait for its thread. Idempotent.
    pub fn cancel(&mut self) {
        if let Some(tx) = self.cancel.take() {
            let _ = tx.send(());
        }
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

impl Drop for DeadlineTimer {
    fn drop(&mut self) {
        self.cancel();
    }
}

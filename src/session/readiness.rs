//! Bounded polling until a spawned debug server is usable.

use super::port_allocator::port_occupied;
use crate::process::ServerProcess;
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, info};

/// Default time allowed for a server to open its port.
pub const DEFAULT_READY_TIMEOUT: Duration = Duration::from_secs(30);
/// Default interval between readiness checks.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(400);

/// Why a server never became ready.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NotReady {
    /// The server process exited while we were waiting.
    Exited(i32),
    /// The window elapsed and the server is no longer running.
    TimedOut,
}

/// Polls a server until something is bound on its port.
#[derive(Debug, Clone, Copy)]
pub struct ReadinessPoller {
    pub timeout: Duration,
    pub interval: Duration,
}

impl Default for ReadinessPoller {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_READY_TIMEOUT,
            interval: DEFAULT_POLL_INTERVAL,
        }
    }
}

impl ReadinessPoller {
    pub fn new(timeout: Duration, interval: Duration) -> Self {
        Self { timeout, interval }
    }

    /// Wait until `port` is occupied.
    ///
    /// A server that is still running when the window closes is treated as
    /// ready; some servers bind lazily and the client connect will tell.
    pub fn wait(&self, server: &mut ServerProcess, port: u16) -> Result<(), NotReady> {
        self.wait_with(server, port, port_occupied)
    }

    fn wait_with<F>(&self, server: &mut ServerProcess, port: u16, occupied: F) -> Result<(), NotReady>
    where
        F: Fn(u16) -> bool,
    {
        let start = Instant::now();
        while start.elapsed() <= self.timeout {
            debug!(port, "Wait for gdb server ready");
            if let Some(code) = server.try_wait() {
                return Err(NotReady::Exited(code));
            }
            thread::sleep(self.interval);
            if occupied(port) {
                info!(port, elapsed_ms = start.elapsed().as_millis() as u64, "Debug server is ready");
                return Ok(());
            }
        }

        match server.try_wait() {
            None => Ok(()),
            Some(_) => Err(NotReady::TimedOut),
        }
    }
}

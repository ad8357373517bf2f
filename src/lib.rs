//! Debug-probe orchestration for microcontroller test pipelines.
//!
//! The crate programs and controls boards through interchangeable hardware
//! debug probes and drives an external `arm-none-eabi-gdb` client against the
//! probe's debug server.
//!
//! # Architecture
//!
//! - **Probe backends** ([`probe`]): one trait, two drivers.
//!   - `jlink` lowers every operation to a short J-Link Commander script.
//!   - `pyocd` talks to the pyOCD probe library and falls back to its CLI
//!     loader.
//!
//! - **Session supervisor** ([`session`]): allocates a port, spawns the debug
//!   server, waits until it is usable, runs a rendered gdb command script with
//!   fatal-marker detection and a hard deadline, and always tears both
//!   processes down.
//!
//! - **gdb client** ([`gdb`]): synchronous line request/response driver for
//!   the debugger console.
//!
//! - **[`Debugger`]**: facade binding one backend to one board, with the
//!   `before_load` hook and `programming()` dispatch by image type.
//!
//! # Operations
//!
//! ## Single-shot probe calls
//! - `reset`, `erase`, `flash`, `unlock`
//! - `read32` / `write32`: 32-bit memory access
//! - `list_connected_devices`, `test_connection`
//!
//! ## Sessions
//! - `gdb_program`: supervised flash through server and client
//! - `start_debug_session`: live server and client for interactive use
//!
//! Session failures are reported as `(exit_code, console)` through
//! [`session::ProgramOutcome`]; only single-shot calls and missing
//! preconditions return errors.

use std::path::PathBuf;

pub mod callbacks;
pub mod debugger;
pub mod error;
pub mod gdb;
pub mod probe;
pub mod process;
pub mod session;
pub mod target;
pub mod toolchain;

pub use callbacks::{CallbackRegistry, Stage};
pub use debugger::Debugger;
pub use error::{GdbError, ProbeError};
pub use gdb::GdbSession;
pub use probe::registry::{create_backend, get_backend, BACKEND_REGISTRY};
pub use probe::{ConnectionStatus, ProbeBackend, ProbeDevice, ServerOptions};
pub use session::{ProgramOutcome, ProgramRequest, SessionSupervisor, SupervisorError};
pub use target::{TargetDescriptor, TargetHandle};

/// Expand `~/` prefix to the user's home directory.
pub fn expand_path(path: &str) -> PathBuf {
    path.strip_prefix("~/")
        .and_then(|stripped| std::env::var_os("HOME").map(|h| PathBuf::from(h).join(stripped)))
        .unwrap_or_else(|| PathBuf::from(path))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn expand_path_keeps_plain_paths() {
        assert_eq!(expand_path("/opt/board.json"), PathBuf::from("/opt/board.json"));
        assert_eq!(expand_path("board.json"), PathBuf::from("board.json"));
    }
}

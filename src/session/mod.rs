//! Supervised debug sessions.
//!
//! ```text
//!   SessionSupervisor
//!   ├─ PortAllocator      free TCP port per session
//!   ├─ ServerProcess      probe debug server (JLinkGDBServer / pyocd gdbserver)
//!   ├─ ReadinessPoller    wait until the server bound its port
//!   ├─ GdbSession         arm-none-eabi-gdb over pipes, runs the command script
//!   └─ DeadlineTimer      force-kills both processes on timeout
//! ```

mod deadline;
mod port_allocator;
mod readiness;
pub mod script;
mod supervisor;

pub use deadline::DeadlineTimer;
pub use port_allocator::{find_free_port, port_in_use, port_occupied, PortAllocator};
pub use readiness::{NotReady, ReadinessPoller, DEFAULT_POLL_INTERVAL, DEFAULT_READY_TIMEOUT};
pub use script::{render_commands, DEFAULT_GDB_COMMANDS};
pub use supervisor::{
    execute_script, DebugSession, PlatformPolicy, ProgramOutcome, ProgramRequest,
    SessionSupervisor, SupervisorConfig, SupervisorError, DEFAULT_SERVER_EXIT_GRACE,
    DEFAULT_SETTLE_DELAY,
};

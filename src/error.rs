//! Error types for probe operations and debugger-client sessions.
//!
//! Single-shot probe calls (register access, erase, reset, ...) return
//! [`ProbeError`]. Session-level failures of a supervised flash are not errors:
//! they are reported through the `(exit_code, console)` outcome instead.

use std::io;
use thiserror::Error;

/// Errors raised by single-shot probe operations.
#[derive(Error, Debug)]
pub enum ProbeError {
    #[error("No target is bound to the {0} backend")]
    NoTarget(&'static str),

    #[error("Failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },

    #[error("Command {command} failed with exit code {code}")]
    CommandFailed { command: String, code: i32 },

    #[error("Cannot read the register {addr:#x}: {reason}")]
    RegisterRead { addr: u64, reason: String },

    #[error("Invalid address format: {0}")]
    InvalidAddress(String),

    #[error("Invalid target descriptor: {0}")]
    InvalidDescriptor(String),

    #[error("{backend}: {operation} is not supported")]
    NotSupported {
        backend: &'static str,
        operation: &'static str,
    },

    #[error("Unknown probe backend: {0}")]
    UnknownBackend(String),

    #[error("Unknown callback stage: {0}")]
    UnknownStage(String),

    #[error("No device available: {0}")]
    NoDevice(String),

    #[error("Probe library error: {0}")]
    Library(String),

    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Errors raised by a [`crate::gdb::GdbSession`].
#[derive(Error, Debug)]
pub enum GdbError {
    #[error("gdb start failed: {0}")]
    InitFailed(String),

    #[error("CMD: {command}, timeout={secs}s!")]
    Timeout { command: String, secs: u64 },

    #[error("gdb session is inactive, cannot send command")]
    Inactive,

    #[error("the console output cannot be accessed while the session is alive")]
    OutputUnavailable,

    #[error("gdb session has already been started")]
    AlreadyStarted,

    #[error(transparent)]
    Io(#[from] io::Error),
}

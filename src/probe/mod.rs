//! Debug-probe backends.
//!
//! Every probe driver implements [`ProbeBackend`]. Two drivers ship with the
//! crate:
//!
//! - [`jlink::JLink`] lowers each operation to a short command file run by the
//!   SEGGER `JLinkExe` CLI and classifies the result from its output.
//! - [`pyocd::PyOcd`] drives the pyOCD probe library through a process-wide
//!   [`library::ProbeLibrary`] handle, falling back to the pyOCD CLI for image
//!   loading and mass erase.
//!
//! Backends are looked up by name through [`registry`].

pub mod jlink;
pub mod library;
pub mod pyocd;
pub mod registry;

use crate::callbacks::CallbackRegistry;
use crate::error::ProbeError;
use crate::process::{CommandLine, CommandOutput};
use crate::target::{lock_target, TargetDescriptor, TargetHandle, WeakTarget};
use serde::Serialize;
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default time allowed for writing an image.
pub const DEFAULT_FLASH_TIMEOUT: Duration = Duration::from_secs(200);

/// Outcome of a connection test.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ConnectionStatus {
    NoError,
    NotConnected,
    CoreNotFound,
    Error,
}

impl ConnectionStatus {
    pub fn is_connected(&self) -> bool {
        *self == ConnectionStatus::NoError
    }
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConnectionStatus::NoError => "NoError",
            ConnectionStatus::NotConnected => "NotConnected",
            ConnectionStatus::CoreNotFound => "Could not find core",
            ConnectionStatus::Error => "Error",
        };
        f.write_str(s)
    }
}

/// A probe reported as connected by a backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProbeDevice {
    pub backend: String,
    pub usbid: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

/// Inclusive flash range for a partial erase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EraseRange {
    pub start: u64,
    pub end: u64,
}

/// Knobs for the debug-server command line.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServerOptions {
    pub port: Option<u16>,
    /// Interface speed, `auto` or kHz.
    pub speed: Option<String>,
    /// Backend script file (`-jlinkscriptfile` / `--script`).
    pub script: Option<PathBuf>,
    /// Erase mode applied by the server before loading.
    pub erase: Option<String>,
    pub core: Option<u32>,
}

impl ServerOptions {
    pub fn with_port(port: u16) -> Self {
        Self {
            port: Some(port),
            ..Self::default()
        }
    }
}

/// Image file format, guessed from the extension.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageFormat {
    Bin,
    Hex,
    Elf,
}

impl ImageFormat {
    pub fn guess(path: &Path) -> Self {
        let ext = path
            .extension()
            .map(|e| e.to_string_lossy().to_ascii_lowercase());
        match ext.as_deref() {
            Some("bin") => ImageFormat::Bin,
            Some("hex") => ImageFormat::Hex,
            _ => ImageFormat::Elf,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ImageFormat::Bin => "bin",
            ImageFormat::Hex => "hex",
            ImageFormat::Elf => "elf",
        }
    }
}

/// Capability set shared by all probe drivers.
pub trait ProbeBackend: Send {
    /// Registry name (`jlink`, `pyocd`).
    fn name(&self) -> &'static str;

    fn version(&self) -> Option<String>;

    /// Remember `target` (weakly) and apply backend-specific setup.
    fn bind_target(&mut self, target: &TargetHandle);

    /// The currently bound target, if it is still alive.
    fn target(&self) -> Option<TargetHandle>;

    fn reset(&self) -> Result<CommandOutput, ProbeError>;

    fn erase(&self, range: Option<EraseRange>) -> Result<CommandOutput, ProbeError>;

    /// Write `image` to flash. `before_load` fires right before the write.
    fn flash(
        &self,
        image: &Path,
        addr: Option<u64>,
        callbacks: &mut CallbackRegistry,
    ) -> Result<CommandOutput, ProbeError>;

    fn read32(&self, addr: u64) -> Result<u32, ProbeError>;

    fn write32(&self, addr: u64, value: u32) -> Result<(), ProbeError>;

    fn unlock(&self) -> Result<CommandOutput, ProbeError>;

    fn list_connected_devices(&self) -> Result<Vec<ProbeDevice>, ProbeError>;

    fn test_connection(&self) -> ConnectionStatus;

    /// Debug-server command line. Pure construction, nothing is spawned.
    fn build_server_command(&self, options: &ServerOptions) -> CommandLine;

    /// Command template run by the debugger client after connecting.
    fn default_gdb_commands(&self) -> &'static str;
}

/// Snapshot of the bound target, or `NoTarget`.
pub(crate) fn snapshot(target: &WeakTarget, backend: &'static str) -> Result<TargetDescriptor, ProbeError> {
    let handle = target.upgrade().ok_or(ProbeError::NoTarget(backend))?;
    let guard = lock_target(&handle);
    Ok(guard.clone())
}

/// Dotted numeric version components; non-numeric suffixes are ignored.
pub fn parse_version(version: &str) -> Vec<u64> {
    version
        .trim()
        .trim_start_matches('v')
        .split(['.', '+', '-'])
        .map_while(|part| {
            let digits: String = part.chars().take_while(char::is_ascii_digit).collect();
            digits.parse().ok()
        })
        .collect()
}

/// `a < b` comparing dotted numeric versions component-wise.
pub fn version_less_than(a: &str, b: &str) -> bool {
    let (mut a, mut b) = (parse_version(a), parse_version(b));
    let len = a.len().max(b.len());
    a.resize(len, 0);
    b.resize(len, 0);
    a < b
}

//! Registry of probe backends, looked up by name.

use super::jlink::{self, JLink};
use super::pyocd::{self, PyOcd};
use super::ProbeBackend;
use crate::error::ProbeError;

/// Static description of a backend.
#[derive(Debug)]
pub struct BackendInfo {
    pub name: &'static str,
    pub description: &'static str,
    /// Alternative names accepted on lookup.
    pub aliases: &'static [&'static str],
    constructor: fn() -> Result<Box<dyn ProbeBackend>, ProbeError>,
}

impl BackendInfo {
    /// Construct a fresh backend instance.
    pub fn create(&self) -> Result<Box<dyn ProbeBackend>, ProbeError> {
        (self.constructor)()
    }

    fn matches(&self, name: &str) -> bool {
        self.name.eq_ignore_ascii_case(name)
            || self.aliases.iter().any(|a| a.eq_ignore_ascii_case(name))
    }
}

fn create_jlink() -> Result<Box<dyn ProbeBackend>, ProbeError> {
    Ok(Box::new(JLink::discover()?))
}

fn create_pyocd() -> Result<Box<dyn ProbeBackend>, ProbeError> {
    Ok(Box::new(PyOcd::new()))
}

/// All known backends.
pub static BACKEND_REGISTRY: &[BackendInfo] = &[
    BackendInfo {
        name: jlink::NAME,
        description: "SEGGER J-Link through the J-Link Commander CLI",
        aliases: &["segger"],
        constructor: create_jlink,
    },
    BackendInfo {
        name: pyocd::NAME,
        description: "CMSIS-DAP and other probes through the pyOCD library",
        aliases: &["cmsis-dap"],
        constructor: create_pyocd,
    },
];

/// Look up a backend by name or alias (case-insensitive).
pub fn get_backend(name: &str) -> Option<&'static BackendInfo> {
    BACKEND_REGISTRY.iter().find(|b| b.matches(name))
}

/// Names of every registered backend.
pub fn backend_names() -> impl Iterator<Item = &'static str> {
    BACKEND_REGISTRY.iter().map(|b| b.name)
}

/// Create a backend by name; unknown names are rejected.
pub fn create_backend(name: &str) -> Result<Box<dyn ProbeBackend>, ProbeError> {
    let info = get_backend(name).ok_or_else(|| ProbeError::UnknownBackend(name.to_string()))?;
    info.create()
}

//! Target descriptor: the board a probe is attached to.
//!
//! Descriptors are owned by the caller and shared with backends and the
//! session supervisor through a [`TargetHandle`]. Backends only keep a weak
//! reference; the supervisor writes the chosen debug-server port back into it.

use crate::error::ProbeError;
use serde::{Deserialize, Deserializer, Serialize};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard, Weak};

/// Default debug-server port used when a descriptor does not name one.
pub const DEFAULT_GDB_PORT: u16 = 3333;

/// Shared, mutable handle to a target descriptor.
pub type TargetHandle = Arc<Mutex<TargetDescriptor>>;

/// Non-owning reference held by probe backends.
pub type WeakTarget = Weak<Mutex<TargetDescriptor>>;

/// One physical board under test.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TargetDescriptor {
    /// Board name (e.g. `frdmk64f`).
    pub name: String,
    /// Device name passed to the probe (e.g. `MK64FN1M0xxx12`).
    pub devicename: String,
    /// Debug interface: `SWD` or `JTAG`.
    pub interface: String,
    /// Debug-server TCP port. Rewritten by the supervisor for each session.
    pub gdbport: u16,
    /// Probe serial id.
    pub usbid: Option<String>,
    /// Flash start address used for raw binary images.
    #[serde(deserialize_with = "de_opt_address")]
    pub start_address: Option<u64>,
    /// Initial stack pointer to set after loading.
    #[serde(deserialize_with = "de_opt_address")]
    pub sp: Option<u64>,
    /// Initial program counter to set after loading.
    #[serde(deserialize_with = "de_opt_address")]
    pub pc: Option<u64>,
    /// Board-specific command template, overriding the backend default.
    pub gdb_commands: Option<String>,
}

impl Default for TargetDescriptor {
    fn default() -> Self {
        Self {
            name: String::new(),
            devicename: String::new(),
            interface: "SWD".to_string(),
            gdbport: DEFAULT_GDB_PORT,
            usbid: None,
            start_address: None,
            sp: None,
            pc: None,
            gdb_commands: None,
        }
    }
}

impl TargetDescriptor {
    /// Create a descriptor for the given board and device names.
    pub fn new(name: impl Into<String>, devicename: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            devicename: devicename.into(),
            ..Self::default()
        }
    }

    /// Load a descriptor from a JSON file.
    pub fn from_json_file(path: &Path) -> Result<Self, ProbeError> {
        let text = std::fs::read_to_string(path)?;
        serde_json::from_str(&text)
            .map_err(|e| ProbeError::InvalidDescriptor(format!("{}: {}", path.display(), e)))
    }

    /// Wrap the descriptor into a shared handle.
    pub fn into_handle(self) -> TargetHandle {
        Arc::new(Mutex::new(self))
    }

    /// Probe serial id, treating an empty string as unset.
    pub fn probe_id(&self) -> Option<&str> {
        self.usbid.as_deref().filter(|id| !id.is_empty())
    }
}

impl std::fmt::Display for TargetDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "<Target(name={}, usbid={})>",
            self.devicename,
            self.probe_id().unwrap_or("None")
        )
    }
}

/// Lock a target handle, recovering from a poisoned mutex.
pub fn lock_target(target: &TargetHandle) -> MutexGuard<'_, TargetDescriptor> {
    target.lock().unwrap_or_else(|e| e.into_inner())
}

/// Parse an address given as `0x...` hex or decimal.
pub fn parse_address(s: &str) -> Result<u64, ProbeError> {
    let s = s.trim();
    if let Some(hex) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        u64::from_str_radix(hex, 16).map_err(|_| ProbeError::InvalidAddress(s.to_string()))
    } else {
        s.parse::<u64>()
            .map_err(|_| ProbeError::InvalidAddress(s.to_string()))
    }
}

fn de_opt_address<'de, D>(deserializer: D) -> Result<Option<u64>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Int(u64),
        Text(String),
    }

    match Option::<Raw>::deserialize(deserializer)? {
        None => Ok(None),
        Some(Raw::Int(v)) => Ok(Some(v)),
        Some(Raw::Text(s)) if s.trim().is_empty() => Ok(None),
        Some(Raw::Text(s)) => parse_address(&s)
            .map(Some)
            .map_err(serde::de::Error::custom),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_hex_and_decimal() {
        assert_eq!(parse_address("0x08000000").unwrap(), 0x0800_0000);
        assert_eq!(parse_address("0X10").unwrap(), 16);
        assert_eq!(parse_address(" 4096 ").unwrap(), 4096);
        assert!(parse_address("0xZZ").is_err());
        assert!(parse_address("abc").is_err());
    }

    #[test]
    fn descriptor_from_json_accepts_hex_strings() {
        let json = r#"{
            "name": "frdmk64f",
            "devicename": "MK64FN1M0xxx12",
            "usbid": "621000000",
            "start_address": "0x0",
            "sp": "0x20000000",
            "pc": 4096
        }"#;
        let target: TargetDescriptor = serde_json::from_str(json).unwrap();
        assert_eq!(target.interface, "SWD");
        assert_eq!(target.gdbport, DEFAULT_GDB_PORT);
        assert_eq!(target.start_address, Some(0));
        assert_eq!(target.sp, Some(0x2000_0000));
        assert_eq!(target.pc, Some(0x1000));
        assert_eq!(target.probe_id(), Some("621000000"));
    }

    #[test]
    fn empty_usbid_is_unset() {
        let mut target = TargetDescriptor::new("b", "d");
        target.usbid = Some(String::new());
        assert_eq!(target.probe_id(), None);
    }

    #[test]
    fn from_json_file_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("board.json");
        std::fs::write(&path, r#"{"name": "evk", "gdbport": 2331}"#).unwrap();
        let target = TargetDescriptor::from_json_file(&path).unwrap();
        assert_eq!(target.name, "evk");
        assert_eq!(target.gdbport, 2331);
    }
}

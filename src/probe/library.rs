//! Process-wide handle to the pyOCD probe library.
//!
//! The library is expensive to bring up, so it is initialized on first use
//! and shared afterwards. Tests and embedders can install their own
//! [`ProbeLibrary`] with [`install_library`].

use super::{ImageFormat, ProbeDevice};
use crate::error::ProbeError;
use crate::process::{run_command, CommandLine, CommandOutput};
use regex::Regex;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;
use tracing::{debug, info};

/// Environment variable naming the Python runtime that has pyOCD installed.
pub const PYOCD_PYTHON_ENV: &str = "PYOCD_PYTHON";

/// Time allowed for library queries (version, probes, targets).
const QUERY_TIMEOUT_SECS: u64 = 60;
/// Time allowed for a commander session.
const SESSION_TIMEOUT_SECS: u64 = 120;
/// Time allowed for programming through a session.
const PROGRAM_TIMEOUT_SECS: u64 = 300;

/// How to open a session.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionRequest {
    /// Probe unique id.
    pub unique_id: Option<String>,
    pub target_override: Option<String>,
    pub pack: Option<PathBuf>,
    /// Session options in insertion order.
    pub options: Vec<(String, String)>,
}

impl SessionRequest {
    pub fn option(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.options.push((key.into(), value.into()));
        self
    }
}

/// An open connection to one probe and its target.
pub trait ProbeSession {
    fn read32(&mut self, addr: u64) -> Result<u32, ProbeError>;

    fn write32(&mut self, addr: u64, value: u32) -> Result<(), ProbeError>;

    /// Program an image through the session.
    fn program(
        &mut self,
        image: &Path,
        format: ImageFormat,
        base_address: Option<u64>,
    ) -> Result<(), ProbeError>;
}

/// Entry points of the probe library used by the pyOCD backend.
pub trait ProbeLibrary: Send + Sync {
    fn version(&self) -> String;

    /// Interpreter used to run the library's CLI (`<runtime> -m pyocd ...`).
    fn runtime(&self) -> &str;

    /// Whether `name` is a target built into the library.
    fn is_builtin_target(&self, name: &str) -> bool;

    fn connected_probes(&self) -> Result<Vec<ProbeDevice>, ProbeError>;

    /// Open a session; fails if the probe or target cannot be reached.
    fn open_session(&self, request: &SessionRequest) -> Result<Box<dyn ProbeSession>, ProbeError>;

    /// Hardware reset through the probe, without a target session.
    fn reset_probe(&self, unique_id: Option<&str>) -> Result<(), ProbeError>;
}

static LIBRARY: Mutex<Option<Arc<dyn ProbeLibrary>>> = Mutex::new(None);

/// The shared library handle, initializing it on first call.
pub fn library() -> Result<Arc<dyn ProbeLibrary>, ProbeError> {
    let mut slot = LIBRARY.lock().unwrap_or_else(|e| e.into_inner());
    if let Some(lib) = slot.as_ref() {
        return Ok(lib.clone());
    }
    info!("Initializing pyOCD library (deferred, first request)");
    let lib: Arc<dyn ProbeLibrary> = Arc::new(PyocdLibrary::load()?);
    info!(version = %lib.version(), "pyOCD library initialized");
    *slot = Some(lib.clone());
    Ok(lib)
}

/// Replace the shared handle.
pub fn install_library(lib: Arc<dyn ProbeLibrary>) {
    let mut slot = LIBRARY.lock().unwrap_or_else(|e| e.into_inner());
    *slot = Some(lib);
}

/// Drop the shared handle; the next [`library`] call initializes again.
pub fn reset_library() {
    let mut slot = LIBRARY.lock().unwrap_or_else(|e| e.into_inner());
    *slot = None;
}

/// Library binding that drives the pyOCD command line tools.
pub struct PyocdLibrary {
    runtime: String,
    version: String,
    targets: OnceLock<Vec<String>>,
}

impl PyocdLibrary {
    /// Find a runtime with pyOCD installed and query its version.
    pub fn load() -> Result<Self, ProbeError> {
        let runtime = find_runtime()?;
        let cmd = CommandLine::new(&runtime).args(["-m", "pyocd", "--version"]);
        let out = run_command(&cmd, Duration::from_secs(QUERY_TIMEOUT_SECS))?;
        if !out.success() {
            return Err(ProbeError::Library(format!(
                "pyocd is not available for {}: {}",
                runtime,
                out.output.trim()
            )));
        }
        let version = out.output.trim().lines().last().unwrap_or_default().trim().to_string();
        Ok(Self {
            runtime,
            version,
            targets: OnceLock::new(),
        })
    }

    fn pyocd(&self) -> CommandLine {
        CommandLine::new(&self.runtime).args(["-m", "pyocd"])
    }

    fn query(&self, args: &[&str]) -> Result<CommandOutput, ProbeError> {
        let cmd = self.pyocd().args(args.iter().copied());
        let out = run_command(&cmd, Duration::from_secs(QUERY_TIMEOUT_SECS))?;
        if out.success() {
            Ok(out)
        } else {
            Err(ProbeError::CommandFailed {
                command: cmd.to_string(),
                code: out.exit_code,
            })
        }
    }

    fn builtin_targets(&self) -> &[String] {
        self.targets.get_or_init(|| match self.query(&["json", "--targets"]) {
            Ok(out) => parse_targets_json(&out.output).unwrap_or_default(),
            Err(e) => {
                debug!(error = %e, "Cannot list builtin targets");
                Vec::new()
            }
        })
    }
}

impl ProbeLibrary for PyocdLibrary {
    fn version(&self) -> String {
        self.version.clone()
    }

    fn runtime(&self) -> &str {
        &self.runtime
    }

    fn is_builtin_target(&self, name: &str) -> bool {
        self.builtin_targets().iter().any(|t| t == name)
    }

    fn connected_probes(&self) -> Result<Vec<ProbeDevice>, ProbeError> {
        let out = self.query(&["json", "--probes"])?;
        parse_probes_json(&out.output)
    }

    fn open_session(&self, request: &SessionRequest) -> Result<Box<dyn ProbeSession>, ProbeError> {
        let session = CommanderSession {
            base: self.pyocd().arg("commander").args(session_args(request)),
        };
        // Probe the connection once so that failures surface on open.
        session.run(&["status"], Duration::from_secs(SESSION_TIMEOUT_SECS))?;
        Ok(Box::new(session))
    }

    fn reset_probe(&self, unique_id: Option<&str>) -> Result<(), ProbeError> {
        let mut cmd = self.pyocd().args(["reset", "-m", "hw"]);
        if let Some(id) = unique_id {
            cmd = cmd.args(["-u", id]);
        }
        let out = run_command(&cmd, Duration::from_secs(QUERY_TIMEOUT_SECS))?;
        if out.success() {
            Ok(())
        } else {
            Err(ProbeError::CommandFailed {
                command: cmd.to_string(),
                code: out.exit_code,
            })
        }
    }
}

/// Session backed by one-shot `pyocd commander -c ...` invocations.
struct CommanderSession {
    base: CommandLine,
}

impl CommanderSession {
    fn run(&self, commands: &[&str], timeout: Duration) -> Result<String, ProbeError> {
        let mut cmd = self.base.clone();
        for c in commands {
            cmd = cmd.args(["-c", *c]);
        }
        let out = run_command(&cmd, timeout)?;
        if out.success() {
            Ok(out.output)
        } else {
            Err(ProbeError::CommandFailed {
                command: cmd.to_string(),
                code: out.exit_code,
            })
        }
    }
}

impl ProbeSession for CommanderSession {
    fn read32(&mut self, addr: u64) -> Result<u32, ProbeError> {
        let command = format!("read32 {:#010x}", addr);
        let output = self.run(&[command.as_str()], Duration::from_secs(SESSION_TIMEOUT_SECS))?;
        parse_commander_word(&output, addr).ok_or_else(|| ProbeError::RegisterRead {
            addr,
            reason: "no value in commander output".to_string(),
        })
    }

    fn write32(&mut self, addr: u64, value: u32) -> Result<(), ProbeError> {
        let command = format!("write32 {:#010x} {:#010x}", addr, value);
        self.run(&[command.as_str()], Duration::from_secs(SESSION_TIMEOUT_SECS))?;
        Ok(())
    }

    fn program(
        &mut self,
        image: &Path,
        format: ImageFormat,
        base_address: Option<u64>,
    ) -> Result<(), ProbeError> {
        let path = image.display().to_string().replace('\\', "/");
        let mut command = format!("load \"{}\"", path);
        if let (ImageFormat::Bin, Some(base)) = (format, base_address) {
            command.push_str(&format!(" {:#x}", base));
        }
        self.run(&[command.as_str()], Duration::from_secs(PROGRAM_TIMEOUT_SECS))?;
        Ok(())
    }
}

/// `-u <id> -t <target> --pack <file> -O k=v ...` for a session request.
pub fn session_args(request: &SessionRequest) -> Vec<String> {
    let mut args = Vec::new();
    if let Some(id) = &request.unique_id {
        args.extend(["-u".to_string(), id.clone()]);
    }
    if let Some(target) = &request.target_override {
        args.extend(["-t".to_string(), target.clone()]);
        if let Some(pack) = &request.pack {
            args.extend(["--pack".to_string(), pack.display().to_string()]);
        }
    }
    args.extend(
        request
            .options
            .iter()
            .map(|(k, v)| format!("-O{}={}", k, v.to_lowercase())),
    );
    args
}

fn find_runtime() -> Result<String, ProbeError> {
    if let Ok(python) = std::env::var(PYOCD_PYTHON_ENV) {
        if !python.trim().is_empty() {
            return Ok(python);
        }
    }
    ["python3", "python"]
        .iter()
        .find_map(|name| which::which(name).ok())
        .map(|p| p.display().to_string())
        .ok_or_else(|| {
            ProbeError::Library(format!(
                "no Python runtime found; set {} to the interpreter with pyocd installed",
                PYOCD_PYTHON_ENV
            ))
        })
}

#[derive(Deserialize)]
struct ProbesReport {
    #[serde(default)]
    boards: Vec<ProbeEntry>,
}

#[derive(Deserialize)]
struct ProbeEntry {
    unique_id: String,
    #[serde(default)]
    info: Option<String>,
    #[serde(default)]
    product_name: Option<String>,
}

#[derive(Deserialize)]
struct TargetsReport {
    #[serde(default)]
    targets: Vec<TargetEntry>,
}

#[derive(Deserialize)]
struct TargetEntry {
    name: String,
}

/// Probes from `pyocd json --probes`.
pub fn parse_probes_json(text: &str) -> Result<Vec<ProbeDevice>, ProbeError> {
    let report: ProbesReport = serde_json::from_str(text)
        .map_err(|e| ProbeError::Library(format!("invalid probe list: {}", e)))?;
    Ok(report
        .boards
        .into_iter()
        .map(|b| ProbeDevice {
            backend: "pyocd".to_string(),
            usbid: b.unique_id,
            description: b.info.or(b.product_name),
        })
        .collect())
}

/// Target names from `pyocd json --targets`.
pub fn parse_targets_json(text: &str) -> Result<Vec<String>, ProbeError> {
    let report: TargetsReport = serde_json::from_str(text)
        .map_err(|e| ProbeError::Library(format!("invalid target list: {}", e)))?;
    Ok(report.targets.into_iter().map(|t| t.name).collect())
}

/// Word printed by commander `read32`: `40048024:  f1641000    |....|`.
pub fn parse_commander_word(output: &str, addr: u64) -> Option<u32> {
    static LINE: OnceLock<Regex> = OnceLock::new();
    let line = LINE.get_or_init(|| {
        Regex::new(r"(?im)^\s*(?:0x)?([0-9a-f]+):\s+([0-9a-f]{8})\b").expect("valid regex")
    });
    line.captures_iter(output)
        .filter(|caps| u64::from_str_radix(&caps[1], 16).ok() == Some(addr))
        .filter_map(|caps| u32::from_str_radix(&caps[2], 16).ok())
        .last()
}

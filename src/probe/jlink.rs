//! SEGGER J-Link backend.
//!
//! Each operation writes a short J-Link Commander script to a temporary file
//! and runs `JLinkExe -CommandFile <file>` with a bounded timeout. Results are
//! classified by scanning the combined console output.

use super::{
    snapshot, ConnectionStatus, EraseRange, ProbeBackend, ProbeDevice, ServerOptions,
    DEFAULT_FLASH_TIMEOUT,
};
use crate::callbacks::{CallbackRegistry, Stage};
use crate::error::ProbeError;
use crate::process::{run_command, CommandLine, CommandOutput};
use crate::target::{lock_target, TargetHandle, WeakTarget};
use regex::Regex;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{OnceLock, Weak};
use std::time::Duration;
use tracing::{debug, error, info, warn};

pub const NAME: &str = "jlink";

/// Time allowed for short register/reset scripts.
const COMMAND_TIMEOUT_SECS: u64 = 30;
/// Time allowed for an erase script.
const ERASE_TIMEOUT_SECS: u64 = 500;
/// Time allowed for probe enumeration.
const LIST_TIMEOUT_SECS: u64 = 10;
/// Timeout for ad-hoc command lists.
const DEFAULT_RUN_TIMEOUT_SECS: u64 = 60;

/// Environment variable pointing at a J-Link installation directory.
pub const JLINK_PATH_ENV: &str = "JLINK_PATH";

const DEFAULT_GDB_COMMANDS: &str = "target remote localhost:{port}\n\
monitor reset\n\
monitor halt\n\
load\n\
{PC_SP}\n\
monitor go\n\
q";

#[cfg(windows)]
const JLINK_EXE: &str = "JLink.exe";
#[cfg(not(windows))]
const JLINK_EXE: &str = "JLinkExe";

#[cfg(windows)]
const GDBSERVER_EXE: &str = "JLinkGDBServerCL.exe";
#[cfg(not(windows))]
const GDBSERVER_EXE: &str = "JLinkGDBServerCLExe";

/// How `JLinkExe` selects the probe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Connection {
    /// USB probe by serial number.
    Usb(String),
    /// Networked probe, `host:port`.
    Ip(String),
}

impl Connection {
    fn args(&self) -> [&str; 2] {
        match self {
            Connection::Usb(serial) => ["-SelectEmuBySN", serial.as_str()],
            Connection::Ip(addr) => ["-ip", addr.as_str()],
        }
    }
}

/// Probe driven through the J-Link Commander CLI.
pub struct JLink {
    install_dir: PathBuf,
    version: Option<String>,
    connection: Option<Connection>,
    speed: Option<String>,
    jlinkscript: Option<PathBuf>,
    target: WeakTarget,
}

impl JLink {
    /// Use the installation in `install_dir`.
    pub fn new(install_dir: impl Into<PathBuf>, version: Option<String>) -> Self {
        Self {
            install_dir: install_dir.into(),
            version,
            connection: None,
            speed: None,
            jlinkscript: None,
            target: Weak::new(),
        }
    }

    /// Locate the newest installation.
    ///
    /// Checks `$JLINK_PATH` first, then the platform's SEGGER directory.
    pub fn discover() -> Result<Self, ProbeError> {
        if let Ok(dir) = std::env::var(JLINK_PATH_ENV) {
            let dir = PathBuf::from(dir);
            if dir.join(JLINK_EXE).exists() {
                let version = dir
                    .file_name()
                    .and_then(|n| version_from_dir_name(&n.to_string_lossy()));
                return Ok(Self::new(dir, version));
            }
            warn!(path = %dir.display(), "{} does not contain {}", JLINK_PATH_ENV, JLINK_EXE);
        }

        for root in segger_roots() {
            if let Some((dir, version)) = newest_install(Path::new(root)) {
                debug!(path = %dir.display(), ?version, "Found J-Link installation");
                return Ok(Self::new(dir, version));
            }
        }

        Err(ProbeError::NoDevice(format!(
            "Cannot find a J-Link installation. Set {} to the J-Link directory.",
            JLINK_PATH_ENV
        )))
    }

    pub fn install_dir(&self) -> &Path {
        &self.install_dir
    }

    pub fn jlink_exe(&self) -> PathBuf {
        self.install_dir.join(JLINK_EXE)
    }

    pub fn gdbserver_exe(&self) -> PathBuf {
        self.install_dir.join(GDBSERVER_EXE)
    }

    /// Whether the Commander executable exists.
    pub fn is_ready(&self) -> bool {
        self.jlink_exe().exists()
    }

    pub fn set_connection(&mut self, connection: Connection) {
        self.connection = Some(connection);
    }

    pub fn connection(&self) -> Option<&Connection> {
        self.connection.as_ref()
    }

    /// Interface speed passed to `JLinkExe` (`-speed`).
    pub fn set_speed(&mut self, speed: impl Into<String>) {
        self.speed = Some(speed.into());
    }

    /// J-Link script passed with `-jlinkscriptfile`.
    pub fn set_jlinkscript(&mut self, script: impl Into<PathBuf>) {
        self.jlinkscript = Some(script.into());
    }

    /// `JLinkExe` invocation for `command_file`.
    pub fn commander_command(&self, command_file: &Path, auto_connect: bool) -> CommandLine {
        let mut cmd = CommandLine::new(self.jlink_exe().display().to_string());

        let target = self.target.upgrade();
        let (device, interface) = match &target {
            Some(handle) => {
                let t = lock_target(handle);
                (Some(t.devicename.clone()), Some(t.interface.clone()))
            }
            None => (None, None),
        };
        if target.is_some() {
            if let Some(connection) = &self.connection {
                cmd = cmd.args(connection.args());
            }
        }

        if let Some(device) = device.filter(|d| !d.is_empty()) {
            cmd = cmd.args(["-Device", device.as_str()]);
        }
        if let Some(interface) = interface.filter(|i| !i.is_empty()) {
            let jtag = interface.eq_ignore_ascii_case("JTAG");
            cmd = cmd.args(["-IF", interface.as_str()]);
            if jtag {
                cmd = cmd.args(["-jtagconf", "-1,-1"]);
            }
        }
        if let Some(speed) = &self.speed {
            cmd = cmd.args(["-speed", speed.as_str()]);
        }
        cmd = cmd
            .args(["-autoconnect", if auto_connect { "1" } else { "0" }])
            .arg("-CommandFile")
            .arg(command_file.display().to_string());
        if let Some(script) = &self.jlinkscript {
            cmd = cmd.arg("-jlinkscriptfile").arg(script.display().to_string());
        }
        cmd
    }

    /// Run a list of Commander commands.
    pub fn run_commands<S: AsRef<str>>(
        &self,
        commands: &[S],
        auto_connect: bool,
        timeout: Duration,
    ) -> Result<CommandOutput, ProbeError> {
        let script = commands
            .iter()
            .map(|c| c.as_ref())
            .collect::<Vec<_>>()
            .join("\n");

        let mut file = tempfile::Builder::new()
            .prefix("jlink-")
            .suffix(".jlink")
            .tempfile()?;
        file.write_all(script.as_bytes())?;
        file.flush()?;
        debug!(file = %file.path().display(), commands = %script, "Running J-Link commands");

        let cmd = self.commander_command(file.path(), auto_connect);
        let output = run_command(&cmd, timeout)?;
        if output.success() {
            debug!(output = %output.output, "JLink.exe output");
        } else {
            error!(code = output.exit_code, output = %output.output, "JLink.exe output");
        }
        Ok(output)
    }

    /// Save `num_bytes` of target memory at `addr` into `file`.
    pub fn savebin(&self, file: &Path, addr: u64, num_bytes: u64) -> Result<CommandOutput, ProbeError> {
        let commands = [
            format!("savebin {}, {:#x}, {:#x}", file.display(), addr, num_bytes),
            "qc".to_string(),
        ];
        self.run_commands(&commands, true, Duration::from_secs(COMMAND_TIMEOUT_SECS))
    }
}

impl ProbeBackend for JLink {
    fn name(&self) -> &'static str {
        NAME
    }

    fn version(&self) -> Option<String> {
        self.version.clone()
    }

    fn bind_target(&mut self, target: &TargetHandle) {
        if let Some(id) = lock_target(target).probe_id() {
            self.connection = Some(Connection::Usb(id.to_string()));
        }
        self.target = std::sync::Arc::downgrade(target);
    }

    fn target(&self) -> Option<TargetHandle> {
        self.target.upgrade()
    }

    fn reset(&self) -> Result<CommandOutput, ProbeError> {
        info!("Resetting board by jlink");
        self.run_commands(&["r0", "r1", "q"], false, Duration::from_secs(COMMAND_TIMEOUT_SECS))
    }

    fn erase(&self, range: Option<EraseRange>) -> Result<CommandOutput, ProbeError> {
        let commands = erase_commands(range);
        info!(command = %commands[2], "Erasing flash");
        self.run_commands(&commands, true, Duration::from_secs(ERASE_TIMEOUT_SECS))
    }

    fn flash(
        &self,
        image: &Path,
        addr: Option<u64>,
        callbacks: &mut CallbackRegistry,
    ) -> Result<CommandOutput, ProbeError> {
        let address = addr
            .or_else(|| {
                let target = self.target()?;
                let start = lock_target(&target).start_address;
                start
            })
            .unwrap_or(0);
        let commands = flash_commands(image, address);
        info!(address = %format!("{:#x}", address), image = %image.display(), "Flashing image");

        callbacks.fire(Stage::BeforeLoad);
        self.run_commands(&commands, true, DEFAULT_FLASH_TIMEOUT)
    }

    fn read32(&self, addr: u64) -> Result<u32, ProbeError> {
        let commands = [format!("mem {:#010x}, 0x4", addr), "qc".to_string()];
        let output = self.run_commands(&commands, true, Duration::from_secs(COMMAND_TIMEOUT_SECS))?;
        if !output.success() {
            return Err(ProbeError::RegisterRead {
                addr,
                reason: format!("JLink script failed ({})", output.exit_code),
            });
        }
        parse_mem_read(&output.output, addr).ok_or_else(|| ProbeError::RegisterRead {
            addr,
            reason: "no matching memory line in output".to_string(),
        })
    }

    fn write32(&self, addr: u64, value: u32) -> Result<(), ProbeError> {
        info!(addr = %format!("{:#010x}", addr), value = %format!("{:#010x}", value), "Write 32-bit register");
        let commands = [format!("w4 {:#010x}, {:#010x}", addr, value), "qc".to_string()];
        let output = self.run_commands(&commands, true, Duration::from_secs(COMMAND_TIMEOUT_SECS))?;
        if output.success() {
            Ok(())
        } else {
            Err(ProbeError::CommandFailed {
                command: commands[0].clone(),
                code: output.exit_code,
            })
        }
    }

    fn unlock(&self) -> Result<CommandOutput, ProbeError> {
        info!("Unlocking Kinetis device");
        self.run_commands(
            &["unlock Kinetis", "q"],
            true,
            Duration::from_secs(DEFAULT_RUN_TIMEOUT_SECS),
        )
    }

    fn list_connected_devices(&self) -> Result<Vec<ProbeDevice>, ProbeError> {
        let output = self.run_commands(
            &["ShowEmuList", "qc"],
            true,
            Duration::from_secs(LIST_TIMEOUT_SECS),
        )?;
        if !output.success() {
            return Ok(Vec::new());
        }
        Ok(parse_emu_list(&output.output)
            .into_iter()
            .map(|usbid| ProbeDevice {
                backend: NAME.to_string(),
                usbid,
                description: None,
            })
            .collect())
    }

    fn test_connection(&self) -> ConnectionStatus {
        match self.run_commands(&["regs", "qc"], true, Duration::from_secs(COMMAND_TIMEOUT_SECS)) {
            Ok(output) => classify_connection(&output.output),
            Err(e) => {
                error!(error = %e, "J-Link connection test failed");
                ConnectionStatus::Error
            }
        }
    }

    fn build_server_command(&self, options: &ServerOptions) -> CommandLine {
        let target = snapshot(&self.target, NAME).ok();
        let devicename = target.as_ref().map(|t| t.devicename.clone()).unwrap_or_default();
        let interface = target
            .as_ref()
            .map(|t| t.interface.clone())
            .filter(|i| !i.is_empty())
            .unwrap_or_else(|| "SWD".to_string());
        let usbid = target
            .as_ref()
            .and_then(|t| t.probe_id().map(str::to_string));

        if devicename.is_empty() {
            warn!("jlink: device name is not set");
        }
        if usbid.is_none() {
            warn!("jlink: serial number is not set");
        }

        let mut cmd = CommandLine::new(self.gdbserver_exe().display().to_string())
            .args(["-if", interface.as_str(), "-singlerun", "-strict", "-noir"]);
        if !devicename.is_empty() {
            cmd = cmd.args(["-device", devicename.as_str()]);
        }
        if let Some(id) = usbid {
            cmd = cmd.arg("-select").arg(format!("usb={}", id));
        }
        if let Some(port) = options.port {
            cmd = cmd.args(["-port".to_string(), port.to_string()]);
        }
        let speed = options.speed.as_deref().unwrap_or("auto");
        cmd = cmd.args(["-speed", speed]);
        if let Some(script) = &options.script {
            cmd = cmd
                .arg("-jlinkscriptfile")
                .arg(script.display().to_string());
        }
        cmd
    }

    fn default_gdb_commands(&self) -> &'static str {
        DEFAULT_GDB_COMMANDS
    }
}

/// Commander script for writing `image` at `address`.
///
/// `.hex` uses `loadfile`, `.bin` uses `loadbin`; other formats get no load
/// step.
pub fn flash_commands(image: &Path, address: u64) -> Vec<String> {
    let path = image.display();
    let ext = image
        .extension()
        .map(|e| e.to_string_lossy().to_ascii_lowercase());

    let mut commands = vec!["r".to_string(), "waithalt".to_string(), "sleep 10".to_string()];
    match ext.as_deref() {
        Some("hex") => commands.push(format!("loadfile \"{}\"", path)),
        Some("bin") => commands.push(format!("loadbin \"{}\" {:#010x}", path, address)),
        _ => warn!(image = %path, "Unsupported image format, nothing will be loaded"),
    }
    commands.extend(["r", "wh", "g", "qc"].map(String::from));
    commands
}

/// Commander script for a full or ranged erase.
pub fn erase_commands(range: Option<EraseRange>) -> Vec<String> {
    let erase = match range {
        Some(EraseRange { start, end }) => format!("erase {:#x} {:#x}", start, end),
        None => "erase".to_string(),
    };
    vec!["r".into(), "wh".into(), erase, "r".into(), "qc".into()]
}

struct ConnectionPatterns {
    not_connected: Regex,
    core_not_found: Regex,
    connected: [Regex; 3],
}

fn connection_patterns() -> &'static ConnectionPatterns {
    static PATTERNS: OnceLock<ConnectionPatterns> = OnceLock::new();
    PATTERNS.get_or_init(|| ConnectionPatterns {
        not_connected: Regex::new("Connecting to J-Link via USB.{3}FAILED").expect("valid regex"),
        core_not_found: Regex::new("Could not find core in Coresight setup").expect("valid regex"),
        connected: [
            Regex::new("Found.*JTAG").expect("valid regex"),
            Regex::new("Found.*SW").expect("valid regex"),
            Regex::new("JTAG chain detection found 1 devices").expect("valid regex"),
        ],
    })
}

/// Classify `regs` output, most specific failure first.
pub fn classify_connection(output: &str) -> ConnectionStatus {
    let p = connection_patterns();
    if p.not_connected.is_match(output) {
        ConnectionStatus::NotConnected
    } else if p.core_not_found.is_match(output) {
        ConnectionStatus::CoreNotFound
    } else if p.connected.iter().any(|re| re.is_match(output)) {
        ConnectionStatus::NoError
    } else {
        ConnectionStatus::Error
    }
}

/// Value of a `mem <addr>, 0x4` dump line: `<ADDR> = b0 b1 b2 b3`.
pub fn parse_mem_read(output: &str, addr: u64) -> Option<u32> {
    static LINE: OnceLock<Regex> = OnceLock::new();
    let line = LINE.get_or_init(|| {
        Regex::new(r"(?im)([0-9a-f]+)\s*=\s*([0-9a-f]{2})\s+([0-9a-f]{2})\s+([0-9a-f]{2})\s+([0-9a-f]{2})")
            .expect("valid regex")
    });

    line.captures_iter(output)
        .filter(|caps| u64::from_str_radix(&caps[1], 16).ok() == Some(addr))
        .filter_map(|caps| {
            let mut bytes = [0u8; 4];
            for (i, b) in bytes.iter_mut().enumerate() {
                *b = u8::from_str_radix(&caps[i + 2], 16).ok()?;
            }
            Some(u32::from_le_bytes(bytes))
        })
        .last()
}

/// Probe serials from `ShowEmuList` output.
///
/// Some firmware prints serials as negative 32-bit numbers; those are
/// converted to their unsigned form.
pub fn parse_emu_list(output: &str) -> Vec<String> {
    static LINE: OnceLock<Regex> = OnceLock::new();
    let line = LINE.get_or_init(|| {
        Regex::new(r"number: (-?\d{5,15}), ProductName:").expect("valid regex")
    });

    line.captures_iter(output)
        .filter_map(|caps| {
            let raw = &caps[1];
            if raw.starts_with('-') {
                let value: i64 = raw.parse().ok()?;
                Some((value + 0x1_0000_0000).to_string())
            } else {
                Some(raw.to_string())
            }
        })
        .collect()
}

#[cfg(windows)]
fn segger_roots() -> &'static [&'static str] {
    &[r"C:\Program Files\SEGGER", r"C:\Program Files (x86)\SEGGER"]
}

#[cfg(target_os = "macos")]
fn segger_roots() -> &'static [&'static str] {
    &["/Applications/SEGGER"]
}

#[cfg(not(any(windows, target_os = "macos")))]
fn segger_roots() -> &'static [&'static str] {
    &["/opt/SEGGER"]
}

/// Lexicographically highest `JLink*` directory under `root`.
fn newest_install(root: &Path) -> Option<(PathBuf, Option<String>)> {
    let mut dirs: Vec<PathBuf> = std::fs::read_dir(root)
        .ok()?
        .filter_map(Result::ok)
        .map(|entry| entry.path())
        .filter(|path| {
            path.is_dir()
                && path
                    .file_name()
                    .is_some_and(|n| n.to_string_lossy().starts_with("JLink"))
        })
        .collect();
    dirs.sort();
    let dir = dirs.pop()?;
    let version = dir
        .file_name()
        .and_then(|n| version_from_dir_name(&n.to_string_lossy()));
    Some((dir, version))
}

/// `JLink_V794e` -> `V794e`.
fn version_from_dir_name(name: &str) -> Option<String> {
    let suffix = name.rsplit("JLink").next()?.replace('_', "");
    (!suffix.is_empty()).then_some(suffix)
}

//! pyOCD backend.
//!
//! Register access, reset, unlock and connection tests go through a
//! [`ProbeSession`] opened on the shared [`ProbeLibrary`]. Image loading uses
//! the library's own CLI loader, except on releases older than 0.34.1 whose
//! loader cannot handle some characters in paths; those program through the
//! session instead.

use super::library::{self, session_args, ProbeLibrary, ProbeSession, SessionRequest};
use super::{
    snapshot, version_less_than, ConnectionStatus, EraseRange, ImageFormat, ProbeBackend,
    ProbeDevice, ServerOptions, DEFAULT_FLASH_TIMEOUT,
};
use crate::callbacks::{CallbackRegistry, Stage};
use crate::error::ProbeError;
use crate::process::{run_command, CommandLine, CommandOutput};
use crate::target::{lock_target, TargetDescriptor, TargetHandle, WeakTarget};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tracing::{debug, error, info, warn};

pub const NAME: &str = "pyocd";

/// Releases below this program through the session API.
pub const CLI_LOADER_MIN_VERSION: &str = "0.34.1";

/// Time allowed for a mass erase.
const ERASE_TIMEOUT_SECS: u64 = 300;

/// Runtime used for server commands when the library cannot be loaded.
const FALLBACK_RUNTIME: &str = "python3";

const DEFAULT_GDB_COMMANDS: &str = "target remote localhost:{port}\n\
monitor reset --halt\n\
monitor halt\n\
load\n\
{PC_SP}\n\
q";

type Options = Vec<(String, String)>;

fn opt(key: &str, value: &str) -> (String, String) {
    (key.to_string(), value.to_string())
}

/// Probe driven through the pyOCD library.
pub struct PyOcd {
    library: Option<Arc<dyn ProbeLibrary>>,
    target: WeakTarget,
    pack_file: Option<PathBuf>,
    target_override: Option<String>,
}

impl Default for PyOcd {
    fn default() -> Self {
        Self::new()
    }
}

impl PyOcd {
    /// Backend using the process-wide library, initialized on first use.
    pub fn new() -> Self {
        Self {
            library: None,
            target: Weak::new(),
            pack_file: None,
            target_override: None,
        }
    }

    /// Backend bound to a specific library handle.
    pub fn with_library(library: Arc<dyn ProbeLibrary>) -> Self {
        Self {
            library: Some(library),
            ..Self::new()
        }
    }

    fn lib(&self) -> Result<Arc<dyn ProbeLibrary>, ProbeError> {
        match &self.library {
            Some(lib) => Ok(lib.clone()),
            None => library::library(),
        }
    }

    fn runtime(&self) -> String {
        match self.lib() {
            Ok(lib) => lib.runtime().to_string(),
            Err(e) => {
                warn!(error = %e, "pyOCD library unavailable, using {}", FALLBACK_RUNTIME);
                FALLBACK_RUNTIME.to_string()
            }
        }
    }

    pub fn target_override(&self) -> Option<&str> {
        self.target_override.as_deref()
    }

    pub fn pack_file(&self) -> Option<&Path> {
        self.pack_file.as_deref()
    }

    /// Options applied to every session for `target`.
    fn default_options(target: Option<&TargetDescriptor>) -> Options {
        let mut options = Options::new();
        // Low-power Kinetis parts only connect reliably under reset.
        if target.is_some_and(|t| t.name.starts_with("frdm")) {
            options.push(opt("connect_mode", "under-reset"));
        }
        options
    }

    fn request(&self, target: Option<&TargetDescriptor>, options: Options) -> SessionRequest {
        SessionRequest {
            unique_id: target.and_then(|t| t.probe_id().map(str::to_string)),
            target_override: self.target_override.clone(),
            pack: self.pack_file.clone(),
            options,
        }
    }

    /// CLI arguments selecting the probe and target.
    pub fn build_cmd_args(&self, target: Option<&TargetDescriptor>, options: Options) -> Vec<String> {
        session_args(&self.request(target, options))
    }

    fn open_session(&self, options: Option<Options>) -> Result<Box<dyn ProbeSession>, ProbeError> {
        let target = snapshot(&self.target, NAME)?;
        let options = options.unwrap_or_else(|| Self::default_options(Some(&target)));
        let request = self.request(Some(&target), options);
        debug!(usbid = ?request.unique_id, target = ?request.target_override, "Opening pyOCD session");
        self.lib()?.open_session(&request)
    }

    /// `<runtime> -m pyocd load -W --format <fmt> <args> <image> [-a <addr>]`.
    pub fn load_command(&self, runtime: &str, image: &Path, addr: Option<u64>) -> CommandLine {
        let target = snapshot(&self.target, NAME).ok();
        let format = ImageFormat::guess(image);
        let mut cmd = CommandLine::new(runtime)
            .args(["-m", "pyocd", "load", "-W", "--format", format.as_str()])
            .args(self.build_cmd_args(target.as_ref(), Self::default_options(target.as_ref())))
            .arg(image.display().to_string().replace('\\', "/"));
        if let Some(addr) = addr {
            cmd = cmd.arg("-a").arg(format!("{:#x}", addr));
        }
        cmd
    }

    /// `<runtime> -m pyocd erase --mass -v -W <args>`.
    pub fn erase_command(&self, runtime: &str) -> CommandLine {
        let target = snapshot(&self.target, NAME).ok();
        let options = vec![
            opt("resume_on_disconnect", "false"),
            opt("allow_no_cores", "true"),
        ];
        CommandLine::new(runtime)
            .args(["-m", "pyocd", "erase", "--mass", "-v", "-W"])
            .args(self.build_cmd_args(target.as_ref(), options))
    }

    fn flash_with_api(
        &self,
        image: &Path,
        addr: Option<u64>,
        callbacks: &mut CallbackRegistry,
    ) -> Result<CommandOutput, ProbeError> {
        let image = PathBuf::from(image.display().to_string().replace('\\', "/"));
        let mut session = self
            .open_session(None)
            .map_err(|e| ProbeError::NoDevice(format!("No device available to flash: {}", e)))?;
        callbacks.fire(Stage::BeforeLoad);
        session.program(&image, ImageFormat::guess(&image), addr)?;
        Ok(CommandOutput {
            exit_code: 0,
            output: String::new(),
        })
    }
}

impl ProbeBackend for PyOcd {
    fn name(&self) -> &'static str {
        NAME
    }

    fn version(&self) -> Option<String> {
        self.lib().ok().map(|lib| lib.version())
    }

    fn bind_target(&mut self, target: &TargetHandle) {
        self.pack_file = None;
        self.target_override = None;

        let devicename = {
            let mut t = lock_target(target);
            let stripped = t
                .usbid
                .as_deref()
                .and_then(|id| id.rsplit_once(':'))
                .map(|(_, id)| id.to_string());
            if stripped.is_some() {
                t.usbid = stripped;
            }
            t.devicename.clone()
        };

        if devicename.ends_with("pack") && Path::new(&devicename).exists() {
            let pack = PathBuf::from(&devicename);
            self.target_override = pack
                .file_name()
                .and_then(|n| n.to_string_lossy().split('.').nth(1).map(str::to_string))
                .map(|part| part.replace("_DFP", ""));
            self.pack_file = Some(pack);
        } else if !devicename.is_empty() {
            match self.lib() {
                Ok(lib) if lib.is_builtin_target(&devicename) => {
                    self.target_override = Some(devicename);
                }
                Ok(_) => {}
                Err(e) => debug!(error = %e, "Cannot check builtin targets"),
            }
        }
        self.target = Arc::downgrade(target);
    }

    fn target(&self) -> Option<TargetHandle> {
        self.target.upgrade()
    }

    /// Hardware reset through the probe only; the target is not attached.
    fn reset(&self) -> Result<CommandOutput, ProbeError> {
        info!("Resetting board by pyocd");
        let target = snapshot(&self.target, NAME)?;
        self.lib()?.reset_probe(target.probe_id())?;
        info!("Reset done");
        Ok(CommandOutput {
            exit_code: 0,
            output: String::new(),
        })
    }

    fn erase(&self, range: Option<EraseRange>) -> Result<CommandOutput, ProbeError> {
        if range.is_some() {
            return Err(ProbeError::NotSupported {
                backend: NAME,
                operation: "ranged erase",
            });
        }
        let cmd = self.erase_command(&self.runtime());
        info!(command = %cmd, "Erase command");
        run_command(&cmd, Duration::from_secs(ERASE_TIMEOUT_SECS))
    }

    fn flash(
        &self,
        image: &Path,
        addr: Option<u64>,
        callbacks: &mut CallbackRegistry,
    ) -> Result<CommandOutput, ProbeError> {
        let target = snapshot(&self.target, NAME)?;
        let addr = addr.or(target.start_address);
        if let Some(addr) = addr {
            info!(addr = %format!("{:#x}", addr), "Start address");
        }

        let lib = self.lib()?;
        let version = lib.version();
        if version_less_than(&version, CLI_LOADER_MIN_VERSION) {
            debug!(%version, "Programming through the session API");
            return self.flash_with_api(image, addr, callbacks);
        }

        let cmd = self.load_command(lib.runtime(), image, addr);
        info!(command = %cmd, "Flash command");
        callbacks.fire(Stage::BeforeLoad);
        run_command(&cmd, DEFAULT_FLASH_TIMEOUT)
    }

    fn read32(&self, addr: u64) -> Result<u32, ProbeError> {
        let mut session = self.open_session(Some(vec![opt("connect_mode", "attach")]))?;
        session.read32(addr)
    }

    fn write32(&self, addr: u64, value: u32) -> Result<(), ProbeError> {
        let mut session = self.open_session(Some(vec![opt("connect_mode", "attach")]))?;
        session.write32(addr, value)
    }

    fn unlock(&self) -> Result<CommandOutput, ProbeError> {
        info!("Unlock board");
        self.open_session(Some(vec![opt("auto_unlock", "true")]))?;
        Ok(CommandOutput {
            exit_code: 0,
            output: String::new(),
        })
    }

    fn list_connected_devices(&self) -> Result<Vec<ProbeDevice>, ProbeError> {
        self.lib()?.connected_probes()
    }

    fn test_connection(&self) -> ConnectionStatus {
        match self.open_session(None) {
            Ok(_) => ConnectionStatus::NoError,
            Err(e) => {
                error!(error = %e, "ConnectError");
                ConnectionStatus::Error
            }
        }
    }

    fn build_server_command(&self, options: &ServerOptions) -> CommandLine {
        let target = snapshot(&self.target, NAME).ok();
        let mut cmd = CommandLine::new(self.runtime()).args(["-m", "pyocd", "gdbserver", "--no-wait"]);
        if let Some(port) = options.port {
            cmd = cmd.arg("--port").arg(port.to_string());
        }
        if let Some(erase) = &options.erase {
            cmd = cmd.arg("--erase").arg(erase.clone());
        }
        if let Some(script) = &options.script {
            cmd = cmd.arg("--script").arg(script.display().to_string());
        }
        if let Some(core) = options.core {
            cmd = cmd.arg("--core").arg(core.to_string());
        }

        let mut session_options = Self::default_options(target.as_ref());
        // Keep semihosting on the console rather than a telnet server.
        session_options.push(opt("semihost_console_type", "console"));
        session_options.push(opt("keep_unwritten", "0"));
        cmd.args(self.build_cmd_args(target.as_ref(), session_options))
    }

    fn default_gdb_commands(&self) -> &'static str {
        DEFAULT_GDB_COMMANDS
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    /// Library double recording every call.
    struct FakeLibrary {
        version: String,
        runtime: String,
        builtin: Vec<&'static str>,
        fail_open: bool,
        log: Arc<Mutex<Vec<String>>>,
    }

    impl FakeLibrary {
        fn new(version: &str) -> Self {
            Self {
                version: version.into(),
                runtime: "python3".into(),
                builtin: vec!["k64f", "lpc55s69"],
                fail_open: false,
                log: Arc::new(Mutex::new(Vec::new())),
            }
        }
    }

    struct FakeSession {
        log: Arc<Mutex<Vec<String>>>,
    }

    impl ProbeSession for FakeSession {
        fn read32(&mut self, addr: u64) -> Result<u32, ProbeError> {
            self.log.lock().unwrap().push(format!("read32 {:#x}", addr));
            Ok(0xdead_beef)
        }
        fn write32(&mut self, addr: u64, value: u32) -> Result<(), ProbeError> {
            self.log.lock().unwrap().push(format!("write32 {:#x} {:#x}", addr, value));
            Ok(())
        }
        fn program(&mut self, image: &Path, format: ImageFormat, base: Option<u64>) -> Result<(), ProbeError> {
            self.log
                .lock()
                .unwrap()
                .push(format!("program {} {} {:?}", image.display(), format.as_str(), base));
            Ok(())
        }
    }

    impl ProbeLibrary for FakeLibrary {
        fn version(&self) -> String {
            self.version.clone()
        }
        fn runtime(&self) -> &str {
            &self.runtime
        }
        fn is_builtin_target(&self, name: &str) -> bool {
            self.builtin.iter().any(|b| *b == name)
        }
        fn connected_probes(&self) -> Result<Vec<ProbeDevice>, ProbeError> {
            Ok(vec![ProbeDevice {
                backend: NAME.into(),
                usbid: "0240000032044e45".into(),
                description: Some("LPC-LINK2".into()),
            }])
        }
        fn open_session(&self, request: &SessionRequest) -> Result<Box<dyn ProbeSession>, ProbeError> {
            self.log
                .lock()
                .unwrap()
                .push(format!("open {}", session_args(request).join(" ")));
            if self.fail_open {
                return Err(ProbeError::NoDevice("probe not found".into()));
            }
            Ok(Box::new(FakeSession { log: self.log.clone() }))
        }
        fn reset_probe(&self, unique_id: Option<&str>) -> Result<(), ProbeError> {
            self.log.lock().unwrap().push(format!("reset {:?}", unique_id));
            Ok(())
        }
    }

    fn bound(lib: FakeLibrary, name: &str, devicename: &str) -> (PyOcd, TargetHandle, Arc<Mutex<Vec<String>>>) {
        let log = lib.log.clone();
        let mut target = TargetDescriptor::new(name, devicename);
        target.usbid = Some("cmsisdap:0240000032044e45".into());
        let handle = target.into_handle();
        let mut pyocd = PyOcd::with_library(Arc::new(lib));
        pyocd.bind_target(&handle);
        (pyocd, handle, log)
    }

    #[test]
    fn bind_strips_usbid_prefix_and_finds_builtin_target() {
        let (pyocd, handle, _) = bound(FakeLibrary::new("0.36.0"), "evkmimxrt1060", "k64f");
        assert_eq!(lock_target(&handle).usbid.as_deref(), Some("0240000032044e45"));
        assert_eq!(pyocd.target_override(), Some("k64f"));
        assert!(pyocd.pack_file().is_none());
    }

    #[test]
    fn bind_uses_pack_file_name() {
        let dir = tempfile::tempdir().unwrap();
        let pack = dir.path().join("NXP.LPC55S69_DFP.15.0.0.pack");
        std::fs::write(&pack, b"").unwrap();
        let (pyocd, _handle, _) = bound(
            FakeLibrary::new("0.36.0"),
            "lpcxpresso55s69",
            &pack.display().to_string(),
        );
        assert_eq!(pyocd.target_override(), Some("LPC55S69"));
        assert_eq!(pyocd.pack_file(), Some(pack.as_path()));
    }

    #[test]
    fn unknown_device_has_no_override() {
        let (pyocd, _handle, _) = bound(FakeLibrary::new("0.36.0"), "board", "MK64FN1M0xxx12");
        assert_eq!(pyocd.target_override(), None);
    }

    #[test]
    fn server_command_for_frdm_board() {
        let (pyocd, _handle, _) = bound(FakeLibrary::new("0.36.0"), "frdmk64f", "k64f");
        let cmd = pyocd.build_server_command(&ServerOptions {
            port: Some(50123),
            erase: Some("chip".into()),
            core: Some(1),
            ..ServerOptions::default()
        });
        assert_eq!(
            cmd.to_string(),
            "python3 -m pyocd gdbserver --no-wait --port 50123 --erase chip --core 1 \
             -u 0240000032044e45 -t k64f -Oconnect_mode=under-reset \
             -Osemihost_console_type=console -Okeep_unwritten=0"
        );
    }

    #[test]
    fn erase_and_load_commands() {
        let (pyocd, _handle, _) = bound(FakeLibrary::new("0.36.0"), "evk", "k64f");
        assert_eq!(
            pyocd.erase_command("py").to_string(),
            "py -m pyocd erase --mass -v -W -u 0240000032044e45 -t k64f \
             -Oresume_on_disconnect=false -Oallow_no_cores=true"
        );
        assert_eq!(
            pyocd
                .load_command("py", Path::new("/tmp/app.bin"), Some(0x1000))
                .to_string(),
            "py -m pyocd load -W --format bin -u 0240000032044e45 -t k64f /tmp/app.bin -a 0x1000"
        );
        assert!(matches!(
            pyocd.erase(Some(EraseRange { start: 0, end: 1 })),
            Err(ProbeError::NotSupported { .. })
        ));
    }

    #[test]
    fn old_version_programs_through_session() {
        let (pyocd, handle, log) = bound(FakeLibrary::new("0.30.3"), "frdmk64f", "k64f");
        lock_target(&handle).start_address = Some(0x1000);
        let fired = Arc::new(Mutex::new(0));
        let mut callbacks = CallbackRegistry::new();
        let f = fired.clone();
        callbacks.register(Stage::BeforeLoad, move || *f.lock().unwrap() += 1);

        let out = pyocd
            .flash(Path::new("/tmp/app@1.bin"), None, &mut callbacks)
            .unwrap();
        assert!(out.success());
        assert_eq!(*fired.lock().unwrap(), 1);
        let log = log.lock().unwrap();
        assert_eq!(
            log.as_slice(),
            &[
                "open -u 0240000032044e45 -t k64f -Oconnect_mode=under-reset".to_string(),
                "program /tmp/app@1.bin bin Some(4096)".to_string(),
            ]
        );
    }

    #[cfg(unix)]
    #[test]
    fn new_version_uses_cli_loader() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let runtime = dir.path().join("fake-python");
        std::fs::write(&runtime, "#!/bin/sh\necho \"$@\"\n").unwrap();
        std::fs::set_permissions(&runtime, std::fs::Permissions::from_mode(0o755)).unwrap();

        let mut lib = FakeLibrary::new("0.36.0");
        lib.runtime = runtime.display().to_string();
        let (pyocd, _handle, log) = bound(lib, "evk", "k64f");

        let mut callbacks = CallbackRegistry::new();
        let out = pyocd
            .flash(Path::new("/tmp/app.hex"), None, &mut callbacks)
            .unwrap();
        assert!(out.success());
        assert!(out
            .output
            .contains("-m pyocd load -W --format hex -u 0240000032044e45 -t k64f /tmp/app.hex"));
        assert!(log.lock().unwrap().is_empty());
    }

    #[test]
    fn register_access_attaches() {
        let (pyocd, _handle, log) = bound(FakeLibrary::new("0.36.0"), "frdmk64f", "k64f");
        assert_eq!(pyocd.read32(0x4004_8024).unwrap(), 0xdead_beef);
        pyocd.write32(0x4004_8024, 1).unwrap();
        let log = log.lock().unwrap();
        assert_eq!(log[0], "open -u 0240000032044e45 -t k64f -Oconnect_mode=attach");
        assert_eq!(log[1], "read32 0x40048024");
        assert_eq!(log[3], "write32 0x40048024 0x1");
    }

    #[test]
    fn connection_reset_unlock_and_list() {
        let (pyocd, _handle, log) = bound(FakeLibrary::new("0.36.0"), "evk", "k64f");
        assert_eq!(pyocd.test_connection(), ConnectionStatus::NoError);
        assert!(pyocd.reset().unwrap().success());
        assert!(pyocd.unlock().unwrap().success());
        assert_eq!(pyocd.list_connected_devices().unwrap().len(), 1);
        let log = log.lock().unwrap();
        assert_eq!(log[1], "reset Some(\"0240000032044e45\")");
        assert_eq!(log[2], "open -u 0240000032044e45 -t k64f -Oauto_unlock=true");

        let mut failing = FakeLibrary::new("0.36.0");
        failing.fail_open = true;
        let (pyocd, _handle, _) = bound(failing, "evk", "k64f");
        assert_eq!(pyocd.test_connection(), ConnectionStatus::Error);
    }

    #[test]
    fn operations_need_a_target() {
        let pyocd = PyOcd::with_library(Arc::new(FakeLibrary::new("0.36.0")));
        assert!(matches!(pyocd.read32(0), Err(ProbeError::NoTarget(NAME))));
        assert_eq!(pyocd.test_connection(), ConnectionStatus::Error);
    }
}

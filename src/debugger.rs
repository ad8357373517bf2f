//! Public entry point: one probe backend bound to one board.

use crate::callbacks::{CallbackRegistry, Stage};
use crate::error::ProbeError;
use crate::probe::registry::create_backend;
use crate::probe::{ConnectionStatus, EraseRange, ProbeBackend, ProbeDevice, ServerOptions};
use crate::process::{CommandLine, CommandOutput};
use crate::session::{
    DebugSession, ProgramOutcome, ProgramRequest, SessionSupervisor, SupervisorConfig,
    SupervisorError,
};
use crate::target::{lock_target, TargetHandle};
use chrono::Utc;
use std::path::Path;
use std::time::Instant;
use tracing::info;

/// A probe backend, the board it drives and its lifecycle hooks.
pub struct Debugger {
    backend: Box<dyn ProbeBackend>,
    target: Option<TargetHandle>,
    callbacks: CallbackRegistry,
    supervisor: SessionSupervisor,
}

impl Debugger {
    pub fn new(backend: Box<dyn ProbeBackend>) -> Self {
        Self {
            backend,
            target: None,
            callbacks: CallbackRegistry::new(),
            supervisor: SessionSupervisor::default(),
        }
    }

    /// Create a debugger for a registered backend name.
    pub fn from_name(name: &str) -> Result<Self, ProbeError> {
        Ok(Self::new(create_backend(name)?))
    }

    pub fn with_supervisor(mut self, config: SupervisorConfig) -> Self {
        self.supervisor = SessionSupervisor::new(config);
        self
    }

    pub fn backend(&self) -> &dyn ProbeBackend {
        self.backend.as_ref()
    }

    pub fn supervisor(&self) -> &SessionSupervisor {
        &self.supervisor
    }

    /// Attach the board. The debugger keeps it alive; the backend only
    /// holds a weak reference.
    pub fn set_target(&mut self, target: TargetHandle) {
        self.backend.bind_target(&target);
        self.target = Some(target);
    }

    pub fn target(&self) -> Option<&TargetHandle> {
        self.target.as_ref()
    }

    pub fn register_callback<F>(&mut self, stage: Stage, hook: F)
    where
        F: FnMut() + Send + 'static,
    {
        self.callbacks.register(stage, hook);
    }

    pub fn remove_callback(&mut self, stage: Stage) -> bool {
        self.callbacks.remove(stage)
    }

    pub fn reset(&self) -> Result<CommandOutput, ProbeError> {
        self.backend.reset()
    }

    pub fn erase(&self, range: Option<EraseRange>) -> Result<CommandOutput, ProbeError> {
        self.backend.erase(range)
    }

    pub fn flash(&mut self, image: &Path, addr: Option<u64>) -> Result<CommandOutput, ProbeError> {
        self.backend.flash(image, addr, &mut self.callbacks)
    }

    pub fn read32(&self, addr: u64) -> Result<u32, ProbeError> {
        self.backend.read32(addr)
    }

    pub fn write32(&self, addr: u64, value: u32) -> Result<(), ProbeError> {
        self.backend.write32(addr, value)
    }

    pub fn unlock(&self) -> Result<CommandOutput, ProbeError> {
        self.backend.unlock()
    }

    pub fn list_connected_devices(&self) -> Result<Vec<ProbeDevice>, ProbeError> {
        self.backend.list_connected_devices()
    }

    pub fn test_connection(&self) -> ConnectionStatus {
        self.backend.test_connection()
    }

    /// Server command line, defaulting the port to the board's.
    pub fn server_command(&self, options: &ServerOptions) -> CommandLine {
        let mut options = options.clone();
        if options.port.is_none() {
            options.port = self.target.as_ref().map(|t| lock_target(t).gdbport);
        }
        self.backend.build_server_command(&options)
    }

    /// Supervised debug-server plus client session.
    pub fn gdb_program(&mut self, request: &ProgramRequest) -> Result<ProgramOutcome, SupervisorError> {
        self.supervisor
            .gdb_program(self.backend.as_ref(), &mut self.callbacks, request)
    }

    pub fn start_debug_session(
        &mut self,
        request: &ProgramRequest,
    ) -> Result<DebugSession, SupervisorError> {
        self.supervisor
            .start_debug_session(self.backend.as_ref(), &mut self.callbacks, request)
    }

    /// Program an image, picking the method from its extension: raw
    /// `.bin`/`.img` images go through the probe's own loader at the board's
    /// start address, everything else through a debug session.
    pub fn programming(
        &mut self,
        image: &Path,
        request: ProgramRequest,
    ) -> Result<ProgramOutcome, SupervisorError> {
        info!(image = %image.display(), "programming");
        let raw = image
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.eq_ignore_ascii_case("bin") || e.eq_ignore_ascii_case("img"))
            .unwrap_or(false);

        if !raw {
            let request = ProgramRequest {
                image: Some(image.to_path_buf()),
                ..request
            };
            return self.gdb_program(&request);
        }

        let started_at = Utc::now();
        let start = Instant::now();
        let addr = self.target.as_ref().and_then(|t| lock_target(t).start_address);
        let output = self.flash(image, addr)?;
        Ok(ProgramOutcome {
            exit_code: output.exit_code,
            console: output.output,
            started_at,
            elapsed_ms: start.elapsed().as_millis() as u64,
            timed_out: false,
            server_exit_code: None,
            client_exit_code: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::target::{TargetDescriptor, WeakTarget};
    use std::sync::{Arc, Mutex};

    /// Backend double recording every call.
    #[derive(Default)]
    struct FakeBackend {
        calls: Arc<Mutex<Vec<String>>>,
        target: WeakTarget,
    }

    impl FakeBackend {
        fn log(&self, call: String) {
            self.calls.lock().unwrap().push(call);
        }

        fn ok(&self) -> Result<CommandOutput, ProbeError> {
            Ok(CommandOutput {
                exit_code: 0,
                output: "done\n".into(),
            })
        }
    }

    impl ProbeBackend for FakeBackend {
        fn name(&self) -> &'static str {
            "fake"
        }
        fn version(&self) -> Option<String> {
            None
        }
        fn bind_target(&mut self, target: &TargetHandle) {
            self.target = Arc::downgrade(target);
        }
        fn target(&self) -> Option<TargetHandle> {
            self.target.upgrade()
        }
        fn reset(&self) -> Result<CommandOutput, ProbeError> {
            self.log("reset".into());
            self.ok()
        }
        fn erase(&self, range: Option<EraseRange>) -> Result<CommandOutput, ProbeError> {
            self.log(format!("erase {:?}", range.map(|r| (r.start, r.end))));
            self.ok()
        }
        fn flash(
            &self,
            image: &Path,
            addr: Option<u64>,
            callbacks: &mut CallbackRegistry,
        ) -> Result<CommandOutput, ProbeError> {
            callbacks.fire(Stage::BeforeLoad);
            self.log(format!("flash {} {:?}", image.display(), addr));
            self.ok()
        }
        fn read32(&self, addr: u64) -> Result<u32, ProbeError> {
            self.log(format!("read32 {:#x}", addr));
            Ok(0xdead_beef)
        }
        fn write32(&self, addr: u64, value: u32) -> Result<(), ProbeError> {
            self.log(format!("write32 {:#x} {:#x}", addr, value));
            Ok(())
        }
        fn unlock(&self) -> Result<CommandOutput, ProbeError> {
            self.log("unlock".into());
            self.ok()
        }
        fn list_connected_devices(&self) -> Result<Vec<ProbeDevice>, ProbeError> {
            Ok(vec![ProbeDevice {
                backend: "fake".into(),
                usbid: "42".into(),
                description: None,
            }])
        }
        fn test_connection(&self) -> ConnectionStatus {
            ConnectionStatus::NoError
        }
        fn build_server_command(&self, options: &ServerOptions) -> CommandLine {
            let mut cmd = CommandLine::new("fake-server");
            if let Some(port) = options.port {
                cmd = cmd.arg(port.to_string());
            }
            cmd
        }
        fn default_gdb_commands(&self) -> &'static str {
            "q\n"
        }
    }

    fn debugger() -> (Debugger, Arc<Mutex<Vec<String>>>) {
        let backend = FakeBackend::default();
        let calls = backend.calls.clone();
        (Debugger::new(Box::new(backend)), calls)
    }

    #[test]
    fn raw_images_use_the_probe_loader() {
        let (mut dbg, calls) = debugger();
        let mut board = TargetDescriptor::new("frdmk64f", "MK64FN1M0xxx12");
        board.start_address = Some(0x6000_0000);
        dbg.set_target(board.into_handle());

        let fired = Arc::new(Mutex::new(0));
        let f = fired.clone();
        dbg.register_callback(Stage::BeforeLoad, move || *f.lock().unwrap() += 1);

        let outcome = dbg
            .programming(Path::new("/tmp/app.BIN"), ProgramRequest::default())
            .unwrap();
        assert!(outcome.success());
        assert_eq!(outcome.console, "done\n");
        assert_eq!(
            calls.lock().unwrap().as_slice(),
            ["flash /tmp/app.BIN Some(1610612736)"]
        );
        assert_eq!(*fired.lock().unwrap(), 1);
    }

    #[test]
    fn other_images_need_a_session() {
        let (mut dbg, calls) = debugger();
        let err = dbg
            .programming(Path::new("/tmp/app.elf"), ProgramRequest::default())
            .unwrap_err();
        assert!(matches!(err, SupervisorError::NoTarget));
        assert!(calls.lock().unwrap().is_empty());
    }

    #[test]
    fn raw_image_loader_failure_is_an_error() {
        let mut dbg = Debugger::new(Box::new(crate::probe::jlink::JLink::new("/nonexistent", None)));
        dbg.set_target(TargetDescriptor::new("evk", "MIMXRT1052").into_handle());
        let err = dbg
            .programming(Path::new("/tmp/app.bin"), ProgramRequest::default())
            .unwrap_err();
        assert!(matches!(err, SupervisorError::Probe(_)), "{:?}", err);
    }

    #[test]
    fn operations_delegate_to_backend() {
        let (mut dbg, calls) = debugger();
        dbg.set_target(TargetDescriptor::new("evk", "MIMXRT1052").into_handle());
        assert_eq!(dbg.read32(0x400f_e000).unwrap(), 0xdead_beef);
        dbg.write32(0x2000_0000, 1).unwrap();
        dbg.reset().unwrap();
        dbg.unlock().unwrap();
        dbg.erase(Some(EraseRange { start: 0, end: 0x1000 })).unwrap();
        assert_eq!(
            calls.lock().unwrap().as_slice(),
            [
                "read32 0x400fe000",
                "write32 0x20000000 0x1",
                "reset",
                "unlock",
                "erase Some((0, 4096))",
            ]
        );
        assert_eq!(dbg.test_connection(), ConnectionStatus::NoError);
        assert_eq!(dbg.list_connected_devices().unwrap()[0].usbid, "42");
    }

    #[test]
    fn server_command_uses_board_port() {
        let (mut dbg, _) = debugger();
        assert_eq!(dbg.server_command(&ServerOptions::default()).to_string(), "fake-server");

        let mut board = TargetDescriptor::new("evk", "MIMXRT1052");
        board.gdbport = 2331;
        dbg.set_target(board.into_handle());
        assert_eq!(
            dbg.server_command(&ServerOptions::default()).to_string(),
            "fake-server 2331"
        );
        assert_eq!(
            dbg.server_command(&ServerOptions::with_port(4000)).to_string(),
            "fake-server 4000"
        );
    }

    #[test]
    fn target_outlives_caller_handle() {
        let (mut dbg, _) = debugger();
        dbg.set_target(TargetDescriptor::new("evk", "MIMXRT1052").into_handle());
        assert!(dbg.backend().target().is_some());
        assert_eq!(lock_target(dbg.target().unwrap()).name, "evk");
    }
}

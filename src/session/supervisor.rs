//! End-to-end supervised flash/debug sessions.
//!
//! A session allocates a port, starts the probe's debug server, waits for it,
//! starts the debugger client, runs the rendered command script and tears
//! everything down again. Session-level failures are reported through
//! [`ProgramOutcome`]; only missing preconditions are errors.

use super::deadline::DeadlineTimer;
use super::port_allocator::PortAllocator;
use super::readiness::{NotReady, ReadinessPoller};
use super::script::{find_fatal_marker, render_commands, script_lines};
use crate::callbacks::{CallbackRegistry, Stage};
use crate::error::ProbeError;
use crate::gdb::{client_command_line, CommandChannel, GdbSession};
use crate::probe::{ProbeBackend, ServerOptions};
use crate::process::{CommandLine, ServerProcess};
use crate::target::{lock_target, TargetHandle};
use crate::toolchain::resolve_gdb;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, info_span, warn};
use uuid::Uuid;

/// Pause after spawning the server before checking it is still alive.
pub const DEFAULT_SETTLE_DELAY: Duration = Duration::from_millis(300);
/// How long a server may keep running after the client quit, without a deadline.
pub const DEFAULT_SERVER_EXIT_GRACE: Duration = Duration::from_secs(10);
/// Time between SIGTERM and SIGKILL when stopping a server.
const TERMINATE_GRACE_MS: u64 = 1000;
const EXIT_POLL_INTERVAL_MS: u64 = 20;
/// Added to the session deadline to form the per-command client timeout, so
/// the deadline timer always fires first.
const DEADLINE_COMMAND_MARGIN: Duration = Duration::from_secs(5);

/// Platform-dependent port and readiness behaviour.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlatformPolicy {
    /// Reuse the target's configured port instead of a fresh ephemeral one.
    pub reuse_configured_port: bool,
    /// Poll the port until the server has bound it.
    pub poll_readiness: bool,
}

impl PlatformPolicy {
    /// Windows releases ports reliably across process restarts, so the
    /// configured port is reused and the server is not polled. Elsewhere a
    /// fresh port is taken and the server is polled until it binds it.
    pub fn native() -> Self {
        let windows = cfg!(windows);
        Self {
            reuse_configured_port: windows,
            poll_readiness: !windows,
        }
    }
}

impl Default for PlatformPolicy {
    fn default() -> Self {
        Self::native()
    }
}

/// Supervisor settings.
#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    /// Debugger client; discovered when unset.
    pub gdb_path: Option<PathBuf>,
    pub policy: PlatformPolicy,
    pub poller: ReadinessPoller,
    pub settle_delay: Duration,
    pub server_exit_grace: Duration,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            gdb_path: None,
            policy: PlatformPolicy::native(),
            poller: ReadinessPoller::default(),
            settle_delay: DEFAULT_SETTLE_DELAY,
            server_exit_grace: DEFAULT_SERVER_EXIT_GRACE,
        }
    }
}

/// Precondition and startup failures.
#[derive(Debug, thiserror::Error)]
pub enum SupervisorError {
    #[error("no board is associated with the debugger")]
    NoTarget,
    #[error("gdb server start failure:\n{0}")]
    Startup(String),
    #[error("gdb command script failed:\n{0}")]
    ScriptFailed(String),
    #[error(transparent)]
    Probe(#[from] ProbeError),
}

/// Caller inputs for one session.
#[derive(Debug, Clone, Default)]
pub struct ProgramRequest {
    /// Image handed to the debugger client.
    pub image: Option<PathBuf>,
    /// Server command line replacing the backend's.
    pub server_cmdline: Option<String>,
    /// Command template replacing the target's and the backend's.
    pub gdb_commands: Option<String>,
    /// Hard deadline for the whole session.
    pub timeout: Option<Duration>,
    pub server_options: ServerOptions,
}

/// Result of one supervised session.
#[derive(Debug, Clone, Serialize)]
pub struct ProgramOutcome {
    pub exit_code: i32,
    /// Server output followed by the client transcript.
    pub console: String,
    pub started_at: DateTime<Utc>,
    pub elapsed_ms: u64,
    /// The session deadline expired and force-killed the processes.
    pub timed_out: bool,
    /// Debug-server exit code; negative for a signal.
    pub server_exit_code: Option<i32>,
    /// Debugger client exit code; negative for a signal.
    pub client_exit_code: Option<i32>,
}

impl ProgramOutcome {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Run `lines` through `channel`.
///
/// `before_load` fires once, before the first line starting with `load`.
/// A fatal marker in a response stops the script; a failing command is
/// logged and the remaining lines still run. Returns `true` on failure.
pub fn execute_script<C>(channel: &mut C, lines: &[String], callbacks: &mut CallbackRegistry) -> bool
where
    C: CommandChannel + ?Sized,
{
    let mut failed = false;
    let mut load_seen = false;
    for line in lines {
        if !load_seen && line.starts_with("load") {
            load_seen = true;
            callbacks.fire(Stage::BeforeLoad);
        }
        match channel.execute(line) {
            Ok(response) => {
                if let Some(marker) = find_fatal_marker(&response) {
                    error!(command = %line, marker, "{}", response);
                    failed = true;
                    break;
                }
            }
            Err(e) => {
                error!(command = %line, error = %e, "gdb cmd error");
                failed = true;
            }
        }
    }
    failed
}

/// A server and connected client handed to the caller.
pub struct DebugSession {
    session_id: String,
    port: u16,
    gdb: GdbSession,
    server: ServerProcess,
    ports: Arc<PortAllocator>,
    exit_grace: Duration,
    released: bool,
}

impl DebugSession {
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn gdb(&mut self) -> &mut GdbSession {
        &mut self.gdb
    }

    pub fn server(&mut self) -> &mut ServerProcess {
        &mut self.server
    }

    /// Quit the client, stop the server and return `(exit_code, console)`.
    pub fn close(&mut self) -> (i32, String) {
        self.gdb.close();
        let code = wait_or_terminate(&mut self.server, self.exit_grace);
        let mut console = self.server.finish_output();
        console.push_str(self.gdb.console_output().unwrap_or_default());
        self.release();
        (code, console)
    }

    fn release(&mut self) {
        if !self.released {
            self.ports.release(self.port);
            self.released = true;
        }
    }
}

impl Drop for DebugSession {
    fn drop(&mut self) {
        self.release();
    }
}

/// Orchestrates debug server and client for one target at a time.
pub struct SessionSupervisor {
    config: SupervisorConfig,
    ports: Arc<PortAllocator>,
}

impl Default for SessionSupervisor {
    fn default() -> Self {
        Self::new(SupervisorConfig::default())
    }
}

impl SessionSupervisor {
    pub fn new(config: SupervisorConfig) -> Self {
        Self {
            config,
            ports: Arc::new(PortAllocator::new()),
        }
    }

    pub fn config(&self) -> &SupervisorConfig {
        &self.config
    }

    pub fn ports(&self) -> &PortAllocator {
        &self.ports
    }

    /// Program the backend's target through a debug server and client.
    pub fn gdb_program(
        &self,
        backend: &dyn ProbeBackend,
        callbacks: &mut CallbackRegistry,
        request: &ProgramRequest,
    ) -> Result<ProgramOutcome, SupervisorError> {
        let started_at = Utc::now();
        let start = Instant::now();
        let target = backend.target().ok_or(SupervisorError::NoTarget)?;
        let session_id = Uuid::new_v4().to_string();
        let _span = info_span!("gdb_program", session_id = %session_id, backend = backend.name()).entered();

        let outcome = |exit_code: i32, console: String| {
            let elapsed_ms = start.elapsed().as_millis() as u64;
            info!(exit_code, elapsed_ms, "time used: {:.2}s", elapsed_ms as f64 / 1000.0);
            ProgramOutcome {
                exit_code,
                console,
                started_at,
                elapsed_ms,
                timed_out: false,
                server_exit_code: None,
                client_exit_code: None,
            }
        };

        let Launched {
            mut server,
            mut gdb,
            port,
            lines,
        } = match self.launch(backend, &target, request) {
            Ok(launched) => launched,
            Err(console) => return Ok(outcome(1, console)),
        };

        let mut timer = request.timeout.map(|timeout| {
            let mut handles = vec![server.kill_handle()];
            handles.extend(gdb.kill_handle());
            DeadlineTimer::arm(timeout, handles)
        });

        let failed = execute_script(&mut gdb, &lines, callbacks);

        let mut exit_code = if failed {
            gdb.close();
            terminate_server(&mut server);
            1
        } else {
            gdb.close();
            match request.timeout {
                Some(_) => server.wait(),
                None => wait_or_terminate(&mut server, self.config.server_exit_grace),
            }
        };

        let mut timed_out = false;
        if let Some(timer) = timer.as_mut() {
            timer.cancel();
            timed_out = timer.fired();
            if timed_out && exit_code == 0 {
                exit_code = 1;
            }
        }
        self.ports.release(port);
        debug!(code = ?server.exit_code(), "gdbserver exit code");

        let mut console = server.finish_output();
        console.push_str(gdb.console_output().unwrap_or_default());
        Ok(ProgramOutcome {
            timed_out,
            server_exit_code: server.exit_code(),
            client_exit_code: gdb.exit_code(),
            ..outcome(exit_code, console)
        })
    }

    /// Start server and client and run the command script, without a
    /// deadline, handing the live session to the caller.
    pub fn start_debug_session(
        &self,
        backend: &dyn ProbeBackend,
        callbacks: &mut CallbackRegistry,
        request: &ProgramRequest,
    ) -> Result<DebugSession, SupervisorError> {
        let target = backend.target().ok_or(SupervisorError::NoTarget)?;
        let session_id = Uuid::new_v4().to_string();
        let _span = info_span!("debug_session", session_id = %session_id).entered();

        let request = ProgramRequest {
            timeout: None,
            ..request.clone()
        };
        let launched = self
            .launch(backend, &target, &request)
            .map_err(SupervisorError::Startup)?;

        let mut session = DebugSession {
            session_id,
            port: launched.port,
            gdb: launched.gdb,
            server: launched.server,
            ports: self.ports.clone(),
            exit_grace: self.config.server_exit_grace,
            released: false,
        };

        if execute_script(&mut session.gdb, &launched.lines, callbacks) {
            session.gdb.close();
            terminate_server(&mut session.server);
            let mut console = session.server.finish_output();
            console.push_str(session.gdb.console_output().unwrap_or_default());
            return Err(SupervisorError::ScriptFailed(console));
        }
        Ok(session)
    }

    /// Steps shared by both entry points: port, server, readiness, script
    /// rendering and client start. On failure everything started so far is
    /// stopped and the collected console text is returned.
    fn launch(
        &self,
        backend: &dyn ProbeBackend,
        target: &TargetHandle,
        request: &ProgramRequest,
    ) -> Result<Launched, String> {
        let gdb_exe = resolve_gdb(self.config.gdb_path.as_deref());

        let configured = lock_target(target).gdbport;
        let port = self
            .ports
            .resolve(configured, self.config.policy.reuse_configured_port)
            .map_err(|e| format!("cannot allocate a port: {}", e))?;
        lock_target(target).gdbport = port;

        let server_cmd = request
            .server_cmdline
            .as_deref()
            .and_then(CommandLine::parse)
            .unwrap_or_else(|| {
                backend.build_server_command(&ServerOptions {
                    port: Some(port),
                    ..request.server_options.clone()
                })
            });
        info!(command = %server_cmd, port, "gdbserver");

        let mut server = match ServerProcess::spawn(&server_cmd, port) {
            Ok(server) => server,
            Err(e) => {
                error!(error = %e, "gdb server start failed");
                self.ports.release(port);
                return Err(e.to_string());
            }
        };

        thread::sleep(self.config.settle_delay);
        if let Some(code) = server.try_wait() {
            error!(code, "gdb server start failed");
        }

        if self.config.policy.poll_readiness {
            if let Err(reason) = self.config.poller.wait(&mut server, port) {
                match reason {
                    NotReady::Exited(code) => error!(code, "gdbserver exited before it was ready"),
                    NotReady::TimedOut => error!(port, "gdbserver never opened its port"),
                }
                server.kill();
                server.wait();
                let output = server.finish_output();
                error!("gdbserver cannot start, console output:\n{}", output);
                self.ports.release(port);
                return Err(output);
            }
        }
        debug!(pid = server.pid(), port, "gdbserver is ready");

        let rendered = {
            let t = lock_target(target);
            let template = request
                .gdb_commands
                .as_deref()
                .or(t.gdb_commands.as_deref())
                .unwrap_or_else(|| backend.default_gdb_commands());
            render_commands(template, &t)
        };
        let lines = script_lines(&rendered);

        let client = client_command_line(&gdb_exe, request.image.as_deref());
        debug!(command = %client, "start gdb client to connect to server");
        let mut gdb = GdbSession::new(client);
        if let Some(timeout) = request.timeout {
            gdb.set_timeout(timeout + DEADLINE_COMMAND_MARGIN);
            gdb.set_start_timeout(timeout);
        }
        if let Err(e) = gdb.start() {
            error!(error = %e, "gdb client start failed");
            terminate_server(&mut server);
            let mut output = server.finish_output();
            output.push_str(&e.to_string());
            output.push('\n');
            self.ports.release(port);
            return Err(output);
        }

        Ok(Launched {
            server,
            gdb,
            port,
            lines,
        })
    }
}

struct Launched {
    server: ServerProcess,
    gdb: GdbSession,
    port: u16,
    lines: Vec<String>,
}

/// SIGTERM, then SIGKILL if the server ignores it. Returns the exit code.
fn terminate_server(server: &mut ServerProcess) -> i32 {
    server.terminate();
    wait_until_exit(server, Duration::from_millis(TERMINATE_GRACE_MS));
    if server.is_running() {
        warn!(pid = server.pid(), "Debug server ignored SIGTERM, killing");
        server.kill();
    }
    server.wait()
}

/// Give the server `grace` to exit on its own, then terminate it.
fn wait_or_terminate(server: &mut ServerProcess, grace: Duration) -> i32 {
    if wait_until_exit(server, grace) {
        return server.wait();
    }
    warn!(pid = server.pid(), "Debug server still running after client exit");
    terminate_server(server)
}

fn wait_until_exit(server: &mut ServerProcess, timeout: Duration) -> bool {
    let start = Instant::now();
    while server.is_running() {
        if start.elapsed() >= timeout {
            return false;
        }
        thread::sleep(Duration::from_millis(EXIT_POLL_INTERVAL_MS));
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::GdbError;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Channel double: replies from a queue, errors on `fail`.
    struct FakeChannel {
        sent: Vec<String>,
        replies: VecDeque<String>,
    }

    impl FakeChannel {
        fn new(replies: &[&str]) -> Self {
            Self {
                sent: Vec::new(),
                replies: replies.iter().map(|r| r.to_string()).collect(),
            }
        }
    }

    impl CommandChannel for FakeChannel {
        fn execute(&mut self, cmd: &str) -> Result<String, GdbError> {
            self.sent.push(cmd.to_string());
            if cmd == "fail" {
                return Err(GdbError::Timeout {
                    command: cmd.to_string(),
                    secs: 1,
                });
            }
            Ok(self.replies.pop_front().unwrap_or_default())
        }
    }

    fn lines(text: &str) -> Vec<String> {
        script_lines(text)
    }

    fn counting_callbacks() -> (CallbackRegistry, Arc<AtomicUsize>) {
        let count = Arc::new(AtomicUsize::new(0));
        let mut callbacks = CallbackRegistry::new();
        let c = count.clone();
        callbacks.register(Stage::BeforeLoad, move || {
            c.fetch_add(1, Ordering::SeqCst);
        });
        (callbacks, count)
    }

    #[test]
    fn fatal_marker_stops_script() {
        let mut channel = FakeChannel::new(&["", "Error finishing flash operation", "", ""]);
        let (mut callbacks, count) = counting_callbacks();
        let failed = execute_script(
            &mut channel,
            &lines("target remote :1\nload\nmonitor go\nq"),
            &mut callbacks,
        );
        assert!(failed);
        assert_eq!(channel.sent, vec!["target remote :1", "load"]);
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn before_load_fires_once_and_only_for_load() {
        let (mut callbacks, count) = counting_callbacks();
        let mut channel = FakeChannel::new(&[]);
        assert!(!execute_script(&mut channel, &lines("target remote :1\nq"), &mut callbacks));
        assert_eq!(count.load(Ordering::SeqCst), 0);

        let mut channel = FakeChannel::new(&[]);
        execute_script(&mut channel, &lines("load\nload app.elf\nq"), &mut callbacks);
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn command_error_marks_failure_and_continues() {
        let mut channel = FakeChannel::new(&[]);
        let mut callbacks = CallbackRegistry::new();
        let failed = execute_script(&mut channel, &lines("fail\nmonitor go\nq"), &mut callbacks);
        assert!(failed);
        assert_eq!(channel.sent, vec!["fail", "monitor go", "q"]);
    }

    #[test]
    fn native_policy() {
        let policy = PlatformPolicy::native();
        assert_eq!(policy.reuse_configured_port, cfg!(windows));
        assert_eq!(policy.poll_readiness, !cfg!(windows));
        assert_ne!(policy.reuse_configured_port, policy.poll_readiness);
    }

    #[test]
    fn program_without_target_fails() {
        let supervisor = SessionSupervisor::default();
        let backend = crate::probe::jlink::JLink::new("/nonexistent", None);
        let mut callbacks = CallbackRegistry::new();
        let err = supervisor
            .gdb_program(&backend, &mut callbacks, &ProgramRequest::default())
            .unwrap_err();
        assert!(matches!(err, SupervisorError::NoTarget));
    }

    #[cfg(unix)]
    mod process {
        use super::*;
        use crate::probe::jlink::JLink;
        use crate::target::TargetDescriptor;
        use std::os::unix::fs::PermissionsExt;
        use std::path::Path;

        /// Debugger client double; `load` prints `load_reply` or hangs.
        fn fake_gdb(dir: &Path, load_reply: &str) -> PathBuf {
            let load_action = if load_reply == "hang" {
                "exec sleep 30".to_string()
            } else {
                format!("printf '{}\\n(gdb) '", load_reply)
            };
            let body = format!(
                "#!/bin/sh\nprintf '(gdb) '\nwhile IFS= read -r line; do\n  case \"$line\" in\n    q) exit 0 ;;\n    load*) {} ;;\n    *) printf 'ok %s\\n(gdb) ' \"$line\" ;;\n  esac\ndone\n",
                load_action
            );
            write_script(dir, "fake-gdb", &body)
        }

        fn write_script(dir: &Path, name: &str, body: &str) -> PathBuf {
            let path = dir.join(name);
            std::fs::write(&path, body).unwrap();
            std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
            path
        }

        fn setup(gdb: PathBuf) -> (SessionSupervisor, JLink, TargetHandle) {
            let config = SupervisorConfig {
                gdb_path: Some(gdb),
                policy: PlatformPolicy {
                    reuse_configured_port: false,
                    poll_readiness: false,
                },
                poller: ReadinessPoller::new(Duration::from_secs(2), Duration::from_millis(50)),
                settle_delay: Duration::from_millis(50),
                server_exit_grace: Duration::from_secs(5),
            };
            let target = TargetDescriptor::new("evk", "MIMXRT1062").into_handle();
            let mut backend = JLink::new("/nonexistent", None);
            backend.bind_target(&target);
            (SessionSupervisor::new(config), backend, target)
        }

        fn request(server: &Path, timeout: Option<Duration>) -> ProgramRequest {
            ProgramRequest {
                image: Some(PathBuf::from("/tmp/app.elf")),
                server_cmdline: Some(server.display().to_string()),
                gdb_commands: Some("target remote :{port}\nload\n{PC_SP}\nmonitor go\nq\n".into()),
                timeout,
                server_options: ServerOptions::default(),
            }
        }

        #[test]
        fn successful_session() {
            let dir = tempfile::tempdir().unwrap();
            let server = write_script(dir.path(), "server", "#!/bin/sh\necho 'Waiting for GDB connection'\nsleep 1\n");
            let (supervisor, backend, target) = setup(fake_gdb(dir.path(), "Loading section .text"));
            let (mut callbacks, count) = counting_callbacks();

            let outcome = supervisor
                .gdb_program(&backend, &mut callbacks, &request(&server, Some(Duration::from_secs(20))))
                .unwrap();
            assert_eq!(outcome.exit_code, 0, "{}", outcome.console);
            assert!(!outcome.timed_out);
            assert_eq!(outcome.server_exit_code, Some(0));
            assert_eq!(outcome.client_exit_code, Some(0));
            assert!(outcome.console.starts_with("Waiting for GDB connection\n"));
            let port = lock_target(&target).gdbport;
            assert!(outcome.console.contains(&format!("ok target remote :{}", port)));
            assert!(outcome.console.contains("Loading section .text"));
            assert_eq!(count.load(Ordering::SeqCst), 1);
            assert_eq!(supervisor.ports().allocated_count(), 0);
        }

        #[test]
        fn fatal_marker_fails_session() {
            let dir = tempfile::tempdir().unwrap();
            let server = write_script(dir.path(), "server", "#!/bin/sh\necho started\nexec sleep 30\n");
            let (supervisor, backend, _target) = setup(fake_gdb(dir.path(), "Load failed"));
            let mut callbacks = CallbackRegistry::new();

            let start = Instant::now();
            let outcome = supervisor
                .gdb_program(&backend, &mut callbacks, &request(&server, None))
                .unwrap();
            assert_eq!(outcome.exit_code, 1);
            assert!(outcome.console.starts_with("started\n"));
            assert!(outcome.console.contains("Load failed"));
            assert!(!outcome.console.contains("ok monitor go"));
            assert!(start.elapsed() < Duration::from_secs(10));
        }

        #[test]
        fn deadline_kills_both_processes() {
            let dir = tempfile::tempdir().unwrap();
            let server = write_script(dir.path(), "server", "#!/bin/sh\nexec sleep 30\n");
            let (supervisor, backend, _target) = setup(fake_gdb(dir.path(), "hang"));
            let mut callbacks = CallbackRegistry::new();

            let start = Instant::now();
            let outcome = supervisor
                .gdb_program(
                    &backend,
                    &mut callbacks,
                    &request(&server, Some(Duration::from_millis(800))),
                )
                .unwrap();
            assert_ne!(outcome.exit_code, 0);
            assert!(outcome.timed_out);
            assert_eq!(outcome.server_exit_code, Some(-libc::SIGKILL));
            assert_eq!(outcome.client_exit_code, Some(-libc::SIGKILL));
            // A client command alone would only time out after deadline + margin.
            assert!(start.elapsed() < DEADLINE_COMMAND_MARGIN);
            assert_eq!(supervisor.ports().allocated_count(), 0);
        }

        #[test]
        fn server_exit_during_readiness_is_startup_failure() {
            let dir = tempfile::tempdir().unwrap();
            let server = write_script(dir.path(), "server", "#!/bin/sh\necho 'no probe found'\nexit 3\n");
            let (mut supervisor, backend, _target) = setup(fake_gdb(dir.path(), "ok"));
            supervisor.config.policy.poll_readiness = true;
            let mut callbacks = CallbackRegistry::new();

            let outcome = supervisor
                .gdb_program(&backend, &mut callbacks, &request(&server, None))
                .unwrap();
            assert_eq!(outcome.exit_code, 1);
            assert!(outcome.console.contains("no probe found"));
            assert_eq!(supervisor.ports().allocated_count(), 0);
        }

        #[test]
        fn missing_client_is_startup_failure() {
            let dir = tempfile::tempdir().unwrap();
            let server = write_script(dir.path(), "server", "#!/bin/sh\necho up\nexec sleep 30\n");
            let (supervisor, backend, _target) = setup(dir.path().join("no-such-gdb"));
            let mut callbacks = CallbackRegistry::new();

            let outcome = supervisor
                .gdb_program(&backend, &mut callbacks, &request(&server, None))
                .unwrap();
            assert_eq!(outcome.exit_code, 1);
            assert!(outcome.console.starts_with("up\n"));
        }

        #[test]
        fn interactive_session() {
            let dir = tempfile::tempdir().unwrap();
            let server = write_script(dir.path(), "server", "#!/bin/sh\necho up\nsleep 1\n");
            let (supervisor, backend, _target) = setup(fake_gdb(dir.path(), "loaded"));
            let mut callbacks = CallbackRegistry::new();
            let mut req = request(&server, None);
            req.gdb_commands = Some("target remote :{port}\nload".into());

            let mut session = supervisor
                .start_debug_session(&backend, &mut callbacks, &req)
                .unwrap();
            assert!(supervisor.ports().is_allocated(session.port()));
            let reply = session.gdb().run_cmd("info registers", true, None).unwrap();
            assert_eq!(reply, "ok info registers\n");

            let (code, console) = session.close();
            assert_eq!(code, 0);
            assert!(console.contains("loaded"));
            assert_eq!(supervisor.ports().allocated_count(), 0);
        }
    }
}

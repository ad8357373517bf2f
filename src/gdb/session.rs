//! Interactive debugger-client session.

use crate::error::GdbError;
use crate::process::{self, drain_until_closed, exit_code, CommandLine, KillHandle, ReapGuard};
use regex::Regex;
use std::io::Write;
use std::process::{Child, ChildStdin, Stdio};
use std::sync::mpsc::{Receiver, RecvTimeoutError};
use std::sync::OnceLock;
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Default time to wait for a command response.
pub const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(300);
/// Time allowed for the client to exit after `q` before it is killed.
const CLOSE_GRACE_PERIOD: Duration = Duration::from_secs(2);
/// Poll interval while waiting for the client to exit.
const EXIT_POLL_INTERVAL_MS: u64 = 20;
/// Time allowed for the client to be reaped once its output closed.
const EOF_REAP_TIMEOUT_MS: u64 = 1000;
/// Time allowed for the output readers to flush after exit.
const OUTPUT_DRAIN_TIMEOUT_MS: u64 = 1000;
/// Marker printed when the target resumes.
const RESUME_MARKER: &str = "Continuing";

fn prompt_patterns() -> &'static [Regex] {
    static PATTERNS: OnceLock<Vec<Regex>> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        vec![
            Regex::new(r"\(gdb\) ").expect("valid prompt regex"),
            Regex::new(r"(?m)^>").expect("valid prompt regex"),
        ]
    })
}

fn resume_patterns() -> &'static [Regex] {
    static PATTERNS: OnceLock<Vec<Regex>> = OnceLock::new();
    PATTERNS.get_or_init(|| vec![Regex::new(&regex::escape(RESUME_MARKER)).expect("valid regex")])
}

/// Lifecycle of a [`GdbSession`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Unstarted,
    Running,
    Closed,
}

enum Expected {
    Matched(String),
    Eof(String),
    TimedOut,
}

/// One spawned debugger client, driven line by line.
///
/// ```no_run
/// use mcu_probe::gdb::GdbSession;
///
/// let mut session = GdbSession::launch("arm-none-eabi-gdb app.elf --silent")?;
/// session.run_cmd("target remote :3333", true, None)?;
/// session.run_cmd("load", true, None)?;
/// session.close();
/// println!("{}", session.console_output()?);
/// # Ok::<(), mcu_probe::error::GdbError>(())
/// ```
pub struct GdbSession {
    command_line: String,
    state: SessionState,
    child: Option<Child>,
    stdin: Option<ChildStdin>,
    rx: Option<Receiver<String>>,
    /// Received text not yet consumed by an expect.
    pending: String,
    /// Full record of the session, finalized on close.
    transcript: String,
    console: Option<String>,
    timeout: Duration,
    start_timeout: Duration,
    reaped: ReapGuard,
    exit_code: Option<i32>,
}

impl GdbSession {
    /// Create an unstarted session for the given client command line.
    pub fn new(command_line: impl Into<String>) -> Self {
        Self {
            command_line: command_line.into(),
            state: SessionState::Unstarted,
            child: None,
            stdin: None,
            rx: None,
            pending: String::new(),
            transcript: String::new(),
            console: None,
            timeout: DEFAULT_COMMAND_TIMEOUT,
            start_timeout: DEFAULT_COMMAND_TIMEOUT,
            reaped: ReapGuard::default(),
            exit_code: None,
        }
    }

    /// Shortcut: create and start a session.
    pub fn launch(command_line: impl Into<String>) -> Result<Self, GdbError> {
        let mut session = Self::new(command_line);
        session.start()?;
        Ok(session)
    }

    /// Default per-command timeout.
    pub fn set_timeout(&mut self, timeout: Duration) {
        self.timeout = timeout;
    }

    /// Time allowed for the first prompt.
    pub fn set_start_timeout(&mut self, timeout: Duration) {
        self.start_timeout = timeout;
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn command_line(&self) -> &str {
        &self.command_line
    }

    /// Spawn the client and wait for its first prompt.
    pub fn start(&mut self) -> Result<(), GdbError> {
        if self.state != SessionState::Unstarted {
            return Err(GdbError::AlreadyStarted);
        }
        info!(command = %self.command_line, "Starting gdb client");

        let cmd = CommandLine::parse(&self.command_line)
            .ok_or_else(|| GdbError::InitFailed("empty command line".to_string()))?;
        let (mut child, rx, _readers) = process::spawn_captured(&cmd, Stdio::piped())
            .map_err(|e| GdbError::InitFailed(e.to_string()))?;

        self.stdin = child.stdin.take();
        self.child = Some(child);
        self.rx = Some(rx);
        self.state = SessionState::Running;

        match self.expect(prompt_patterns(), self.start_timeout) {
            Expected::Matched(_) => Ok(()),
            Expected::Eof(text) => {
                self.close();
                Err(GdbError::InitFailed(format!("client exited before prompt: {}", text.trim())))
            }
            Expected::TimedOut => {
                self.close();
                Err(GdbError::InitFailed(format!(
                    "no prompt within {}s",
                    self.start_timeout.as_secs()
                )))
            }
        }
    }

    /// Send one command and return the text printed before the next prompt.
    ///
    /// With `wait == false`, `c`/`continue`/`jump` only wait for the resume
    /// marker. If the client dies mid-command the buffered text is returned.
    pub fn run_cmd(
        &mut self,
        cmd: &str,
        wait: bool,
        timeout: Option<Duration>,
    ) -> Result<String, GdbError> {
        if !self.is_alive() {
            return Err(GdbError::Inactive);
        }
        let timeout = timeout.unwrap_or(self.timeout);

        info!("gdb=> {}", cmd);
        self.send_line(cmd)?;

        let timed_out = |command: &str| GdbError::Timeout {
            command: command.to_string(),
            secs: timeout.as_secs(),
        };

        // The pipe transport does not flush after a bare `end`; an extra
        // newline produces the prompt we wait on.
        if cmd == "end" {
            self.send_raw("\n")?;
            if let Expected::TimedOut = self.expect(prompt_patterns(), timeout) {
                return Err(timed_out(cmd));
            }
        }

        let lower = cmd.to_lowercase();
        let resumes = lower == "c" || lower == "continue" || lower.starts_with("jump");
        let patterns = if !wait && resumes {
            resume_patterns()
        } else {
            prompt_patterns()
        };

        match self.expect(patterns, timeout) {
            Expected::Matched(text) => {
                debug!(response = %text, "gdb response");
                Ok(text)
            }
            Expected::Eof(text) => {
                debug!("GDB EOF");
                Ok(text)
            }
            Expected::TimedOut => Err(timed_out(&lower)),
        }
    }

    /// Run a list of commands, stopping at the first error.
    pub fn run_cmds<S: AsRef<str>>(&mut self, cmds: &[S]) -> Result<Vec<String>, GdbError> {
        cmds.iter()
            .map(|cmd| self.run_cmd(cmd.as_ref(), true, None))
            .collect()
    }

    /// Whether the client process is running.
    pub fn is_alive(&mut self) -> bool {
        if self.state != SessionState::Running {
            return false;
        }
        let Some(child) = self.child.as_mut() else {
            return false;
        };
        match self.reaped.try_wait(child) {
            Ok(None) => true,
            Ok(Some(status)) => {
                self.exit_code = Some(exit_code(status));
                false
            }
            Err(_) => false,
        }
    }

    pub fn pid(&self) -> Option<u32> {
        self.child.as_ref().map(Child::id)
    }

    /// Exit code of the client, once it has been reaped.
    pub fn exit_code(&self) -> Option<i32> {
        self.exit_code
    }

    /// Handle the deadline timer uses to kill the client.
    pub fn kill_handle(&self) -> Option<KillHandle> {
        self.pid()
            .map(|pid| KillHandle::new(pid, "gdb-client", self.reaped.clone()))
    }

    /// Kill the client process.
    pub fn kill(&mut self) {
        if self.is_alive() {
            if let Some(child) = self.child.as_mut() {
                let _ = child.kill();
            }
        }
    }

    /// Ask the client to quit, force-kill it after a grace period, and
    /// finalize the console output. Closing twice is a no-op.
    pub fn close(&mut self) {
        match self.state {
            SessionState::Closed => return,
            SessionState::Unstarted => {
                self.state = SessionState::Closed;
                self.console = Some(String::new());
                return;
            }
            SessionState::Running => {}
        }

        if self.is_alive() {
            // Ignore write errors: the client may exit at any moment.
            let _ = self.send_raw("q\n");

            let start = Instant::now();
            while self.is_alive() {
                if start.elapsed() > CLOSE_GRACE_PERIOD {
                    if let Some(child) = self.child.as_mut() {
                        let _ = child.kill();
                    }
                    warn!(pid = ?self.pid(), "force terminate GDB");
                    break;
                }
                thread::sleep(Duration::from_millis(EXIT_POLL_INTERVAL_MS));
            }
        }

        self.stdin = None;
        if let Some(child) = self.child.as_mut() {
            if self.exit_code.is_none() {
                match self.reaped.wait(child) {
                    Ok(status) => self.exit_code = Some(exit_code(status)),
                    Err(e) => {
                        warn!(error = %e, "Failed to wait for gdb client");
                        self.reaped.mark_reaped();
                    }
                }
            }
        }

        if let Some(rx) = self.rx.take() {
            drain_until_closed(
                &rx,
                &mut self.transcript,
                Duration::from_millis(OUTPUT_DRAIN_TIMEOUT_MS),
            );
        }
        self.pending.clear();
        self.console = Some(std::mem::take(&mut self.transcript));
        self.state = SessionState::Closed;
        info!("Debug session is closed");
    }

    /// Everything exchanged with the client. Only available once closed.
    pub fn console_output(&self) -> Result<&str, GdbError> {
        match (self.state, self.console.as_deref()) {
            (SessionState::Closed, Some(console)) => Ok(console),
            _ => Err(GdbError::OutputUnavailable),
        }
    }

    fn send_line(&mut self, line: &str) -> Result<(), GdbError> {
        self.transcript.push_str(line);
        self.transcript.push('\n');
        self.send_raw(&format!("{}\n", line))
    }

    fn send_raw(&mut self, text: &str) -> Result<(), GdbError> {
        let stdin = self.stdin.as_mut().ok_or(GdbError::Inactive)?;
        stdin.write_all(text.as_bytes())?;
        stdin.flush()?;
        Ok(())
    }

    /// Both pipes closed: the client is exiting, so record its status.
    fn collect_exit(&mut self, timeout: Duration) {
        if self.exit_code.is_some() {
            return;
        }
        let Some(child) = self.child.as_mut() else {
            return;
        };
        match self.reaped.wait_timeout(child, timeout) {
            Ok(Some(status)) => self.exit_code = Some(exit_code(status)),
            Ok(None) => debug!(pid = child.id(), "gdb closed its output but is still running"),
            Err(e) => warn!(error = %e, "Failed to reap gdb client"),
        }
    }

    /// Read until one of `patterns` matches; return the text before it.
    fn expect(&mut self, patterns: &[Regex], timeout: Duration) -> Expected {
        let deadline = Instant::now() + timeout;
        loop {
            let earliest = patterns
                .iter()
                .filter_map(|re| re.find(&self.pending))
                .min_by_key(|m| m.start())
                .map(|m| (m.start(), m.end()));
            if let Some((start, end)) = earliest {
                let before = self.pending[..start].to_string();
                self.pending.drain(..end);
                return Expected::Matched(before);
            }

            let Some(rx) = self.rx.as_ref() else {
                return Expected::Eof(std::mem::take(&mut self.pending));
            };
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Expected::TimedOut;
            }
            match rx.recv_timeout(remaining) {
                Ok(text) => {
                    self.transcript.push_str(&text);
                    self.pending.push_str(&text);
                }
                Err(RecvTimeoutError::Timeout) => return Expected::TimedOut,
                Err(RecvTimeoutError::Disconnected) => {
                    self.collect_exit(Duration::from_millis(EOF_REAP_TIMEOUT_MS));
                    return Expected::Eof(std::mem::take(&mut self.pending));
                }
            }
        }
    }
}

impl Drop for GdbSession {
    fn drop(&mut self) {
        if self.state == SessionState::Running {
            if let Some(child) = self.child.as_mut() {
                let _ = child.kill();
                if self.reaped.wait(child).is_err() {
                    self.reaped.mark_reaped();
                }
            }
        }
    }
}

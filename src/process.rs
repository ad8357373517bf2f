//! Subprocess supervision.
//!
//! Every spawned child gets one reader thread per output pipe. Readers push
//! decoded text chunks into a channel; the owning handle is the only consumer
//! and appends them to its output buffer, so a chatty child never blocks on a
//! full pipe and nothing needs a lock.

use crate::error::ProbeError;
use std::fmt;
use std::io::{self, Read};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender, TryRecvError};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Poll interval while waiting on a child process.
const WAIT_POLL_INTERVAL_MS: u64 = 20;
/// Time allowed for reader threads to flush after the child exited.
const READER_DRAIN_TIMEOUT_MS: u64 = 1000;
/// Size of a single pipe read.
const READ_CHUNK_SIZE: usize = 4096;

/// A program plus its arguments.
///
/// `Display` renders the shell-style command line that is logged and shown to
/// users; spawning always uses the structured form.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandLine {
    pub program: String,
    pub args: Vec<String>,
}

impl CommandLine {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }

    /// Append one argument.
    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Append several arguments.
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Parse a shell-style command line.
    ///
    /// Returns `None` for an empty line.
    pub fn parse(line: &str) -> Option<Self> {
        let mut words = split_command_line(line).into_iter();
        let program = words.next()?;
        Some(Self {
            program,
            args: words.collect(),
        })
    }

    fn to_command(&self) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args);
        cmd
    }
}

impl fmt::Display for CommandLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", quote_word(&self.program))?;
        for arg in &self.args {
            write!(f, " {}", quote_word(arg))?;
        }
        Ok(())
    }
}

fn quote_word(word: &str) -> String {
    if word.is_empty() || word.chars().any(char::is_whitespace) {
        format!("\"{}\"", word)
    } else {
        word.to_string()
    }
}

/// Split a command line into words, honouring single and double quotes.
///
/// Backslashes are kept literally so Windows paths survive unchanged.
pub fn split_command_line(line: &str) -> Vec<String> {
    let mut words = Vec::new();
    let mut current = String::new();
    let mut in_word = false;
    let mut quote: Option<char> = None;

    for ch in line.chars() {
        match quote {
            Some(q) if ch == q => quote = None,
            Some(_) => current.push(ch),
            None if ch == '"' || ch == '\'' => {
                quote = Some(ch);
                in_word = true;
            }
            None if ch.is_whitespace() => {
                if in_word {
                    words.push(std::mem::take(&mut current));
                    in_word = false;
                }
            }
            None => {
                current.push(ch);
                in_word = true;
            }
        }
    }
    if in_word {
        words.push(current);
    }
    words
}

/// Exit code of a finished process.
///
/// Processes killed by a signal report the negated signal number.
pub fn exit_code(status: ExitStatus) -> i32 {
    if let Some(code) = status.code() {
        return code;
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(sig) = status.signal() {
            return -sig;
        }
    }
    -1
}

/// Incremental UTF-8 decoder that keeps split multi-byte sequences.
#[derive(Default)]
pub(crate) struct Utf8Decoder {
    carry: Vec<u8>,
}

impl Utf8Decoder {
    pub(crate) fn push(&mut self, bytes: &[u8]) -> String {
        self.carry.extend_from_slice(bytes);
        let valid = match std::str::from_utf8(&self.carry) {
            Ok(_) => self.carry.len(),
            Err(e) if e.error_len().is_none() => e.valid_up_to(),
            Err(_) => {
                let text = String::from_utf8_lossy(&self.carry).into_owned();
                self.carry.clear();
                return text;
            }
        };
        let rest = self.carry.split_off(valid);
        let text = String::from_utf8_lossy(&self.carry).into_owned();
        self.carry = rest;
        text
    }
}

/// Spawn a thread that forwards everything read from `reader` to `tx`.
pub(crate) fn spawn_reader<R>(mut reader: R, tx: Sender<String>, label: String) -> JoinHandle<()>
where
    R: Read + Send + 'static,
{
    thread::spawn(move || {
        let mut decoder = Utf8Decoder::default();
        let mut buf = [0u8; READ_CHUNK_SIZE];
        loop {
            match reader.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => {
                    let text = decoder.push(&buf[..n]);
                    if !text.is_empty() && tx.send(text).is_err() {
                        break;
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    debug!(reader = %label, error = %e, "Output reader stopped");
                    break;
                }
            }
        }
    })
}

/// Spawn `cmd` with piped stdout/stderr feeding one channel.
pub(crate) fn spawn_captured(
    cmd: &CommandLine,
    stdin: Stdio,
) -> Result<(Child, Receiver<String>, Vec<JoinHandle<()>>), ProbeError> {
    let mut command = cmd.to_command();
    command
        .stdin(stdin)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());

    #[cfg(windows)]
    {
        use std::os::windows::process::CommandExt;
        const CREATE_NEW_PROCESS_GROUP: u32 = 0x0000_0200;
        command.creation_flags(CREATE_NEW_PROCESS_GROUP);
    }

    let mut child = command.spawn().map_err(|source| ProbeError::Spawn {
        program: cmd.program.clone(),
        source,
    })?;

    let (tx, rx) = mpsc::channel();
    let mut readers = Vec::with_capacity(2);
    if let Some(stdout) = child.stdout.take() {
        readers.push(spawn_reader(stdout, tx.clone(), format!("{}:stdout", cmd.program)));
    }
    if let Some(stderr) = child.stderr.take() {
        readers.push(spawn_reader(stderr, tx, format!("{}:stderr", cmd.program)));
    }
    Ok((child, rx, readers))
}

/// Append everything the readers produce until they finish or `timeout` passes.
pub(crate) fn drain_until_closed(rx: &Receiver<String>, out: &mut String, timeout: Duration) {
    let deadline = Instant::now() + timeout;
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        match rx.recv_timeout(remaining) {
            Ok(text) => out.push_str(&text),
            Err(RecvTimeoutError::Disconnected) => break,
            Err(RecvTimeoutError::Timeout) => {
                debug!("Output readers still open after drain timeout");
                break;
            }
        }
    }
}

/// Send SIGKILL (or `taskkill /F /T` on Windows) to a process id.
pub fn force_terminate(pid: u32) -> io::Result<()> {
    #[cfg(unix)]
    {
        // SAFETY: kill(2) has no memory-safety preconditions; a stale pid
        // only yields ESRCH.
        let rc = unsafe { libc::kill(pid as libc::pid_t, libc::SIGKILL) };
        if rc == -1 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    #[cfg(windows)]
    {
        let status = Command::new("TASKKILL")
            .args(["/F", "/T", "/PID", &pid.to_string()])
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()?;
        if status.success() {
            Ok(())
        } else {
            Err(io::Error::new(
                io::ErrorKind::Other,
                format!("TASKKILL exited with {}", status),
            ))
        }
    }

    #[cfg(not(any(unix, windows)))]
    {
        let _ = pid;
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "force terminate is not supported on this platform",
        ))
    }
}

/// Reap state shared by a process owner and its kill handles.
///
/// Reaping and force-killing both happen under the lock, so a kill never
/// reaches a pid whose exit status was already collected (and which the OS
/// may have recycled).
#[derive(Debug, Clone, Default)]
pub(crate) struct ReapGuard(Arc<Mutex<bool>>);

impl ReapGuard {
    fn lock(&self) -> MutexGuard<'_, bool> {
        self.0.lock().unwrap_or_else(|e| e.into_inner())
    }

    #[cfg(test)]
    pub(crate) fn is_reaped(&self) -> bool {
        *self.lock()
    }

    /// Non-blocking reap.
    pub(crate) fn try_wait(&self, child: &mut Child) -> io::Result<Option<ExitStatus>> {
        let mut reaped = self.lock();
        let status = child.try_wait()?;
        if status.is_some() {
            *reaped = true;
        }
        Ok(status)
    }

    /// Reap, polling for up to `timeout`.
    pub(crate) fn wait_timeout(
        &self,
        child: &mut Child,
        timeout: Duration,
    ) -> io::Result<Option<ExitStatus>> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(status) = self.try_wait(child)? {
                return Ok(Some(status));
            }
            if Instant::now() >= deadline {
                return Ok(None);
            }
            thread::sleep(Duration::from_millis(WAIT_POLL_INTERVAL_MS));
        }
    }

    /// Reap, polling until the child exits. Never blocks inside the lock.
    pub(crate) fn wait(&self, child: &mut Child) -> io::Result<ExitStatus> {
        loop {
            if let Some(status) = self.try_wait(child)? {
                return Ok(status);
            }
            thread::sleep(Duration::from_millis(WAIT_POLL_INTERVAL_MS));
        }
    }

    /// Stop kill handles from touching the pid, e.g. after a failed wait.
    pub(crate) fn mark_reaped(&self) {
        *self.lock() = true;
    }
}

/// Thread-safe handle that can force-kill a supervised process.
///
/// Once the owner has reaped the process the handle does nothing.
#[derive(Debug, Clone)]
pub struct KillHandle {
    pid: u32,
    label: String,
    reaped: ReapGuard,
}

impl KillHandle {
    pub(crate) fn new(pid: u32, label: impl Into<String>, reaped: ReapGuard) -> Self {
        Self {
            pid,
            label: label.into(),
            reaped,
        }
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    /// Force-kill the process unless it was already reaped.
    pub fn force_terminate(&self) {
        // Held across the kill so the owner cannot reap in between.
        let reaped = self.reaped.lock();
        if *reaped {
            debug!(pid = self.pid, process = %self.label, "Process already reaped, skip kill");
            return;
        }
        if let Err(e) = force_terminate(self.pid) {
            debug!(pid = self.pid, process = %self.label, error = %e, "Force terminate failed");
        }
    }
}

/// Result of a one-shot command run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutput {
    pub exit_code: i32,
    pub output: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Run a command to completion, capturing combined output.
///
/// A command still running after `timeout` is force-killed; its (non-zero)
/// exit code and partial output are returned.
pub fn run_command(cmd: &CommandLine, timeout: Duration) -> Result<CommandOutput, ProbeError> {
    debug!(command = %cmd, timeout_secs = timeout.as_secs(), "Running command");
    let (mut child, rx, readers) = spawn_captured(cmd, Stdio::null())?;
    let mut output = String::new();
    let deadline = Instant::now() + timeout;

    let status = loop {
        while let Ok(text) = rx.try_recv() {
            output.push_str(&text);
        }
        if let Some(status) = child.try_wait()? {
            break status;
        }
        if Instant::now() >= deadline {
            warn!(
                pid = child.id(),
                command = %cmd.program,
                timeout_secs = timeout.as_secs(),
                "Command exceeded timeout, force killed"
            );
            let _ = child.kill();
            break child.wait()?;
        }
        thread::sleep(Duration::from_millis(WAIT_POLL_INTERVAL_MS));
    };

    drain_until_closed(&rx, &mut output, Duration::from_millis(READER_DRAIN_TIMEOUT_MS));
    for reader in readers {
        if reader.is_finished() {
            let _ = reader.join();
        }
    }

    Ok(CommandOutput {
        exit_code: exit_code(status),
        output,
    })
}

/// A running debug-server subprocess with captured output.
pub struct ServerProcess {
    child: Child,
    port: u16,
    rx: Receiver<String>,
    output: String,
    readers: Vec<JoinHandle<()>>,
    reaped: ReapGuard,
    exit_code: Option<i32>,
}

impl ServerProcess {
    /// Spawn the server; its stdout and stderr are drained in the background.
    pub fn spawn(cmd: &CommandLine, port: u16) -> Result<Self, ProbeError> {
        info!(command = %cmd, port, "Starting debug server");
        let (child, rx, readers) = spawn_captured(cmd, Stdio::null())?;
        debug!(pid = child.id(), port, "Debug server spawned");
        Ok(Self {
            child,
            port,
            rx,
            output: String::new(),
            readers,
            reaped: ReapGuard::default(),
            exit_code: None,
        })
    }

    pub fn pid(&self) -> u32 {
        self.child.id()
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Handle the deadline timer uses to kill this process.
    pub fn kill_handle(&self) -> KillHandle {
        KillHandle::new(self.pid(), "debug-server", self.reaped.clone())
    }

    /// Exit code if the process has finished, without blocking.
    pub fn try_wait(&mut self) -> Option<i32> {
        if self.exit_code.is_some() {
            return self.exit_code;
        }
        match self.reaped.try_wait(&mut self.child) {
            Ok(Some(status)) => {
                self.mark_exited(status);
                self.exit_code
            }
            Ok(None) => None,
            Err(e) => {
                warn!(pid = self.pid(), error = %e, "Failed to poll debug server");
                None
            }
        }
    }

    pub fn is_running(&mut self) -> bool {
        self.try_wait().is_none()
    }

    /// Ask the server to stop (SIGTERM on Unix, kill elsewhere).
    pub fn terminate(&mut self) {
        if !self.is_running() {
            return;
        }
        #[cfg(unix)]
        {
            // SAFETY: the child has not been reaped, so its pid is still ours.
            let rc = unsafe { libc::kill(self.pid() as libc::pid_t, libc::SIGTERM) };
            if rc == 0 {
                return;
            }
        }
        let _ = self.child.kill();
    }

    /// Force-kill the server if it is still running.
    pub fn kill(&mut self) {
        if self.is_running() {
            if let Err(e) = self.child.kill() {
                debug!(pid = self.pid(), error = %e, "Kill failed");
            }
        }
    }

    /// Block until the server exits and return its exit code.
    pub fn wait(&mut self) -> i32 {
        if let Some(code) = self.exit_code {
            return code;
        }
        match self.reaped.wait(&mut self.child) {
            Ok(status) => self.mark_exited(status),
            Err(e) => {
                warn!(pid = self.pid(), error = %e, "Failed to wait for debug server");
                self.reaped.mark_reaped();
                self.exit_code = Some(-1);
            }
        }
        self.exit_code.unwrap_or(-1)
    }

    pub fn exit_code(&self) -> Option<i32> {
        self.exit_code
    }

    /// Everything the server printed so far.
    pub fn output(&mut self) -> &str {
        loop {
            match self.rx.try_recv() {
                Ok(text) => self.output.push_str(&text),
                Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => break,
            }
        }
        &self.output
    }

    /// Wait for the readers to flush after exit, then return the full output.
    pub fn finish_output(&mut self) -> String {
        if self.exit_code.is_some() {
            drain_until_closed(
                &self.rx,
                &mut self.output,
                Duration::from_millis(READER_DRAIN_TIMEOUT_MS),
            );
            for reader in self.readers.drain(..) {
                if reader.is_finished() {
                    let _ = reader.join();
                }
            }
        }
        self.output().to_string()
    }

    fn mark_exited(&mut self, status: ExitStatus) {
        self.exit_code = Some(exit_code(status));
        debug!(pid = self.child.id(), code = ?self.exit_code, "Debug server exited");
    }
}

impl Drop for ServerProcess {
    fn drop(&mut self) {
        if self.exit_code.is_none() {
            let _ = self.child.kill();
            if self.reaped.wait(&mut self.child).is_err() {
                self.reaped.mark_reaped();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_honours_quotes() {
        assert_eq!(
            split_command_line(r#""C:\Program Files\SEGGER\JLinkGDBServerCL.exe" -if SWD -port 2331"#),
            vec![
                r"C:\Program Files\SEGGER\JLinkGDBServerCL.exe",
                "-if",
                "SWD",
                "-port",
                "2331"
            ]
        );
        assert_eq!(split_command_line("  gdb   --silent "), vec!["gdb", "--silent"]);
        assert_eq!(split_command_line("a '' b"), vec!["a", "", "b"]);
        assert!(split_command_line("   ").is_empty());
    }

    #[test]
    fn display_quotes_words_with_spaces() {
        let cmd = CommandLine::new("/opt/my tools/gdb").arg("--exec").arg("app.bin");
        assert_eq!(cmd.to_string(), r#""/opt/my tools/gdb" --exec app.bin"#);
        assert_eq!(CommandLine::parse(&cmd.to_string()), Some(cmd));
        assert_eq!(CommandLine::parse(""), None);
    }

    #[test]
    fn decoder_keeps_split_sequences() {
        let mut decoder = Utf8Decoder::default();
        let bytes = "µs".as_bytes();
        assert_eq!(decoder.push(&bytes[..1]), "");
        assert_eq!(decoder.push(&bytes[1..]), "µs");
    }

    #[cfg(unix)]
    #[test]
    fn run_command_captures_stdout_and_stderr() {
        let cmd = CommandLine::new("sh").args(["-c", "echo out; echo err 1>&2; exit 3"]);
        let result = run_command(&cmd, Duration::from_secs(10)).unwrap();
        assert_eq!(result.exit_code, 3);
        assert!(result.output.contains("out"));
        assert!(result.output.contains("err"));
    }

    #[cfg(unix)]
    #[test]
    fn run_command_kills_on_timeout() {
        let cmd = CommandLine::new("sh").args(["-c", "exec sleep 30"]);
        let start = Instant::now();
        let result = run_command(&cmd, Duration::from_millis(300)).unwrap();
        assert!(start.elapsed() < Duration::from_secs(10));
        assert_ne!(result.exit_code, 0);
    }

    #[test]
    fn spawn_missing_program_fails() {
        let cmd = CommandLine::new("definitely-not-a-real-probe-binary");
        let err = ServerProcess::spawn(&cmd, 1).err().unwrap();
        assert!(matches!(err, ProbeError::Spawn { .. }));
    }

    #[cfg(unix)]
    #[test]
    fn server_output_and_exit_code() {
        let cmd = CommandLine::new("sh").args(["-c", "echo listening; exit 0"]);
        let mut server = ServerProcess::spawn(&cmd, 2331).unwrap();
        assert_eq!(server.wait(), 0);
        assert!(server.finish_output().contains("listening"));
        // Already reaped: the kill handle must not touch the pid again.
        server.kill_handle().force_terminate();
        assert_eq!(server.exit_code(), Some(0));
    }

    #[cfg(unix)]
    #[test]
    fn kill_handle_terminates_running_server() {
        let cmd = CommandLine::new("sh").args(["-c", "exec sleep 30"]);
        let mut server = ServerProcess::spawn(&cmd, 2331).unwrap();
        server.kill_handle().force_terminate();
        assert_eq!(server.wait(), -libc::SIGKILL);
    }

    #[cfg(unix)]
    #[test]
    fn reap_guard_flips_under_the_same_lock_as_the_reap() {
        let guard = ReapGuard::default();
        let mut child = Command::new("sh").args(["-c", "exit 0"]).spawn().unwrap();
        assert!(!guard.is_reaped());

        let status = guard.wait(&mut child).unwrap();
        assert!(status.success());
        assert!(guard.is_reaped());

        // A handle created or fired after the reap must not signal the pid.
        let handle = KillHandle::new(child.id(), "short-lived", guard.clone());
        handle.force_terminate();
        let again = guard.wait_timeout(&mut child, Duration::ZERO).unwrap();
        assert_eq!(again.map(exit_code), Some(0));
    }
}

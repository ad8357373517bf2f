//! Debugger-client (GDB) sessions.
//!
//! A [`GdbSession`] drives one `arm-none-eabi-gdb` process over pipes,
//! synchronising on the `(gdb) ` prompt. [`CommandChannel`] is the seam the
//! supervisor uses to run command scripts against a session.

mod session;

pub use session::{GdbSession, SessionState, DEFAULT_COMMAND_TIMEOUT};

use crate::error::GdbError;
use crate::process::CommandLine;
use std::path::Path;

/// Something that accepts one debugger command at a time.
pub trait CommandChannel {
    /// Send `cmd`, wait for the prompt and return the response text.
    fn execute(&mut self, cmd: &str) -> Result<String, GdbError>;
}

impl CommandChannel for GdbSession {
    fn execute(&mut self, cmd: &str) -> Result<String, GdbError> {
        self.run_cmd(cmd, true, None)
    }
}

/// Build the client invocation for `image`.
///
/// ELF images are passed as the symbol/program file; anything else goes
/// through `--exec`. With no image the client starts bare.
pub fn client_command_line(gdb: &str, image: Option<&Path>) -> String {
    let mut cmd = CommandLine::new(gdb);
    if let Some(image) = image.filter(|p| !p.as_os_str().is_empty()) {
        let is_elf = image
            .extension()
            .is_some_and(|ext| ext.eq_ignore_ascii_case("elf"));
        if !is_elf {
            cmd = cmd.arg("--exec");
        }
        cmd = cmd.arg(image.display().to_string());
    }
    cmd.arg("--silent").to_string()
}

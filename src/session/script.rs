//! Command-script rendering and response scanning.

use crate::target::TargetDescriptor;

/// Template used when neither the caller, the target nor the backend
/// supplies one.
pub const DEFAULT_GDB_COMMANDS: &str = "target remote :{port}\nload\ncontinue &\nq\n";

/// Substrings in a client response that abort the script.
pub const FATAL_MARKERS: [&str; 6] = [
    "No connection could be made",
    "Target disconnected",
    "Connection timed out",
    "\"monitor\" command not supported by this target",
    "Error finishing flash operation",
    "Load failed",
];

/// First fatal marker contained in `response`, if any.
pub fn find_fatal_marker(response: &str) -> Option<&'static str> {
    FATAL_MARKERS
        .iter()
        .copied()
        .find(|marker| response.contains(marker))
}

/// `set $sp=...` / `set $pc=...` lines for the registers that are set.
pub fn register_lines(sp: Option<u64>, pc: Option<u64>) -> String {
    [("sp", sp), ("pc", pc)]
        .iter()
        .filter_map(|(reg, value)| value.map(|v| format!("set ${}={:#x}", reg, v)))
        .collect::<Vec<_>>()
        .join("\n")
}

/// Substitute target fields into `template`.
///
/// Unknown `{...}` groups are left as they are.
pub fn render_commands(template: &str, target: &TargetDescriptor) -> String {
    let hex = |v: Option<u64>| v.map(|v| format!("{:#x}", v)).unwrap_or_default();
    let port = target.gdbport.to_string();
    let substitutions = [
        ("{port}", port.clone()),
        ("{gdbport}", port),
        ("{PC_SP}", register_lines(target.sp, target.pc)),
        ("{devicename}", target.devicename.clone()),
        ("{interface}", target.interface.clone()),
        ("{usbid}", target.probe_id().unwrap_or_default().to_string()),
        ("{start_address}", hex(target.start_address)),
        ("{name}", target.name.clone()),
    ];

    let mut rendered = String::with_capacity(template.len());
    let mut rest = template;
    'outer: while let Some(open) = rest.find('{') {
        rendered.push_str(&rest[..open]);
        let tail = &rest[open..];
        for (key, value) in &substitutions {
            if tail.starts_with(key) {
                rendered.push_str(value);
                rest = &tail[key.len()..];
                continue 'outer;
            }
        }
        rendered.push('{');
        rest = &tail[1..];
    }
    rendered.push_str(rest);
    rendered
}

/// The non-blank lines of a rendered script, trimmed.
pub fn script_lines(rendered: &str) -> Vec<String> {
    rendered
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(str::to_string)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn target() -> TargetDescriptor {
        let mut t = TargetDescriptor::new("frdmk64f", "MK64FN1M0xxx12");
        t.gdbport = 50123;
        t.usbid = Some("621000000".into());
        t
    }

    #[test]
    fn register_lines_render_both_one_or_none() {
        assert_eq!(
            register_lines(Some(0x2000), Some(0x1000)),
            "set $sp=0x2000\nset $pc=0x1000"
        );
        assert_eq!(register_lines(None, Some(0x1000)), "set $pc=0x1000");
        assert_eq!(register_lines(None, None), "");
    }

    #[test]
    fn render_default_template() {
        let rendered = render_commands(DEFAULT_GDB_COMMANDS, &target());
        assert_eq!(rendered, "target remote :50123\nload\ncontinue &\nq\n");
    }

    #[test]
    fn render_registers_and_fields() {
        let mut t = target();
        t.sp = Some(0x2000);
        t.pc = Some(0x1000);
        t.start_address = Some(0x0800_0000);
        let rendered = render_commands(
            "target remote localhost:{gdbport}\n{PC_SP}\n# {devicename} {interface} {usbid} {start_address} {name}",
            &t,
        );
        assert_eq!(
            rendered,
            "target remote localhost:50123\nset $sp=0x2000\nset $pc=0x1000\n# MK64FN1M0xxx12 SWD 621000000 0x8000000 frdmk64f"
        );
    }

    #[test]
    fn unset_registers_leave_blank_line_that_is_skipped() {
        let rendered = render_commands("load\n{PC_SP}\nq", &target());
        assert_eq!(rendered, "load\n\nq");
        assert_eq!(script_lines(&rendered), vec!["load", "q"]);
    }

    #[test]
    fn unknown_placeholders_are_kept() {
        let rendered = render_commands("echo {unknown} {port}", &target());
        assert_eq!(rendered, "echo {unknown} 50123");
    }

    #[test]
    fn fatal_marker_detection() {
        assert_eq!(find_fatal_marker("all good\n"), None);
        assert_eq!(
            find_fatal_marker("Remote failure reply: Load failed\n"),
            Some("Load failed")
        );
        assert_eq!(
            find_fatal_marker("\"monitor\" command not supported by this target.\n"),
            Some("\"monitor\" command not supported by this target")
        );
    }
}

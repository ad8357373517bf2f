//! Locating the debugger-client executable.

use crate::probe::parse_version;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Debugger client shipped with the GNU Arm toolchain.
pub const GDB_NAME: &str = "arm-none-eabi-gdb";

/// Environment variable naming a GNU Arm toolchain root.
pub const ARMGCC_DIR_ENV: &str = "ARMGCC_DIR";

#[cfg(windows)]
const EXE_SUFFIX: &str = ".exe";
#[cfg(not(windows))]
const EXE_SUFFIX: &str = "";

/// Resolve the debugger client.
///
/// Order: `explicit`, `arm-none-eabi-gdb` on `PATH`, `$ARMGCC_DIR/bin`, the
/// newest toolchain under the known install locations, then the bare name.
pub fn resolve_gdb(explicit: Option<&Path>) -> String {
    if let Some(path) = explicit.filter(|p| !p.as_os_str().is_empty()) {
        return path.display().to_string();
    }

    if let Ok(path) = which::which(GDB_NAME) {
        debug!(path = %path.display(), "Using gdb from PATH");
        return path.display().to_string();
    }

    if let Ok(dir) = std::env::var(ARMGCC_DIR_ENV) {
        let gdb = gdb_in(Path::new(&dir));
        if gdb.exists() {
            return gdb.display().to_string();
        }
    }

    if let Some(root) = newest_toolchain(&search_locations()) {
        let gdb = gdb_in(&root);
        debug!(path = %gdb.display(), "Using bundled gdb");
        return gdb.display().to_string();
    }

    GDB_NAME.to_string()
}

fn gdb_in(toolchain_root: &Path) -> PathBuf {
    toolchain_root
        .join("bin")
        .join(format!("{}{}", GDB_NAME, EXE_SUFFIX))
}

#[cfg(not(windows))]
fn home_dir() -> Option<PathBuf> {
    std::env::var_os("HOME")
        .or_else(|| std::env::var_os("USERPROFILE"))
        .map(PathBuf::from)
}

#[cfg(windows)]
fn search_locations() -> Vec<PathBuf> {
    vec![
        PathBuf::from(r"C:\Program Files (x86)\GNU Arm Embedded Toolchain"),
        PathBuf::from(r"C:\Program Files (x86)\GNU Tools ARM Embedded"),
    ]
}

#[cfg(not(windows))]
fn search_locations() -> Vec<PathBuf> {
    let mut roots = vec![PathBuf::from("/usr/local"), PathBuf::from("/opt/armgcc")];
    roots.extend(home_dir());
    roots
}

/// Toolchain version encoded in its install directory name.
fn toolchain_version(dir_name: &str) -> Option<String> {
    if cfg!(windows) {
        let v = dir_name.trim().replace(' ', "-");
        (!v.is_empty()).then_some(v)
    } else {
        dir_name
            .strip_prefix("gcc-arm-none-eabi-")
            .filter(|v| !v.is_empty())
            .map(str::to_string)
    }
}

/// Highest-version toolchain directory under `roots` that contains a gcc.
pub fn newest_toolchain(roots: &[PathBuf]) -> Option<PathBuf> {
    let gcc = format!("arm-none-eabi-gcc{}", EXE_SUFFIX);
    roots
        .iter()
        .filter_map(|root| std::fs::read_dir(root).ok())
        .flatten()
        .filter_map(Result::ok)
        .filter_map(|entry| {
            let path = entry.path();
            let version = toolchain_version(&entry.file_name().to_string_lossy())?;
            path.join("bin").join(&gcc).exists().then_some((parse_version(&version), path))
        })
        .max_by(|a, b| a.0.cmp(&b.0))
        .map(|(_, path)| path)
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn fake_toolchain(root: &Path, name: &str) {
        let bin = root.join(name).join("bin");
        std::fs::create_dir_all(&bin).unwrap();
        std::fs::write(bin.join("arm-none-eabi-gcc"), b"").unwrap();
    }

    #[test]
    fn explicit_path_wins() {
        assert_eq!(
            resolve_gdb(Some(Path::new("/opt/tools/gdb"))),
            "/opt/tools/gdb"
        );
    }

    #[test]
    fn picks_highest_version() {
        let root = tempfile::tempdir().unwrap();
        fake_toolchain(root.path(), "gcc-arm-none-eabi-9-2020-q2-update");
        fake_toolchain(root.path(), "gcc-arm-none-eabi-10.3-2021.10");
        // No gcc inside: ignored.
        std::fs::create_dir_all(root.path().join("gcc-arm-none-eabi-12.2/bin")).unwrap();

        let newest = newest_toolchain(&[root.path().to_path_buf()]).unwrap();
        assert!(newest.ends_with("gcc-arm-none-eabi-10.3-2021.10"));
        assert!(gdb_in(&newest).ends_with("bin/arm-none-eabi-gdb"));
    }

    #[test]
    fn nothing_found() {
        let root = tempfile::tempdir().unwrap();
        assert_eq!(newest_toolchain(&[root.path().to_path_buf()]), None);
        assert_eq!(toolchain_version("gcc-arm-none-eabi-"), None);
        assert_eq!(toolchain_version("cmake"), None);
    }
}

use nix::unistd::isatty;
use std::{
    env,
    ffi::{OsStr, OsString},
    os::unix::{ffi::OsStrExt, io::RawFd},
    path::{Path, PathBuf},
};

pub fn running_under_rd() -> bool {
    env::var("RUNNING_UNDER_RD").is_ok()
}

/// Returns true if `fd` (defaulting to STDERR_FILENO) is not a tty.
pub fn probably_not_interactive(maybe_fd: Option<RawFd>) -> bool {
    let fd = maybe_fd.unwrap_or(libc::STDERR_FILENO);
    // Eminently tunable heuristic, but this is guaranteed to be
    // true during rd unit tests, where we care most about this
    // check (to a first degree).  A failing test shouldn't
    // hang.
    !isatty(fd).unwrap_or(false)
}

pub fn dir_exists<P: AsRef<Path>>(dir: P) -> bool {
    dir.as_ref().is_dir()
}

/// Where traces are saved when no output directory is given.
///
/// `RD_TRACE_DIR` wins, then `$XDG_DATA_HOME/rd`, then `$HOME/.local/share/rd`
/// and finally `/tmp/rd`.
pub fn trace_save_dir() -> PathBuf {
    if let Some(dir) = non_empty_env("RD_TRACE_DIR") {
        return PathBuf::from(dir);
    }
    if let Some(xdg_data_home) = non_empty_env("XDG_DATA_HOME") {
        return Path::new(&xdg_data_home).join("rd");
    }
    if let Some(home) = non_empty_env("HOME") {
        return Path::new(&home).join(".local/share/rd");
    }
    PathBuf::from("/tmp/rd")
}

fn non_empty_env(var: &str) -> Option<OsString> {
    match env::var_os(var) {
        Some(val) if !val.is_empty() => Some(val),
        _ => None,
    }
}

/// The final path component of `exe_path`, e.g. `ls` for `/bin/ls`.
pub fn base_name(exe_path: &OsStr) -> &OsStr {
    let bytes = exe_path.as_bytes();
    let trimmed = match bytes.iter().rposition(|&b| b != b'/') {
        Some(last) => &bytes[..=last],
        None => return OsStr::new("trace"),
    };
    match trimmed.iter().rposition(|&b| b == b'/') {
        Some(slash) => OsStr::from_bytes(&trimmed[slash + 1..]),
        None => OsStr::from_bytes(trimmed),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn base_name_of_absolute_path() {
        assert_eq!(OsStr::new("ls"), base_name(OsStr::new("/bin/ls")));
    }

    #[test]
    fn base_name_of_relative_path() {
        assert_eq!(OsStr::new("a.out"), base_name(OsStr::new("a.out")));
        assert_eq!(OsStr::new("prog"), base_name(OsStr::new("./build/prog")));
    }

    #[test]
    fn base_name_ignores_trailing_slashes() {
        assert_eq!(OsStr::new("dir"), base_name(OsStr::new("/tmp/dir//")));
        assert_eq!(OsStr::new("trace"), base_name(OsStr::new("///")));
    }
}

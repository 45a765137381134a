//! Linux-specific process and string helpers shared by the IPC wrappers

use crate::error::{ShmError, ShmResult};
use nix::unistd::getpid;
use std::ffi::CString;
use std::os::unix::ffi::OsStrExt;
use std::path::Path;

/// Check if process is alive using kill(pid, 0)
pub fn is_process_alive(pid: i32) -> bool {
    use nix::sys::signal::kill;
    use nix::unistd::Pid;

    if pid <= 0 {
        return false;
    }

    // Null signal: existence check only
    match kill(Pid::from_raw(pid), None) {
        Ok(_) => true,
        Err(nix::Error::ESRCH) => false,
        Err(nix::Error::EPERM) => true,
        Err(_) => false,
    }
}

/// Get current process ID
pub fn get_current_pid() -> i32 {
    getpid().as_raw()
}

/// Convert a filesystem path to a NUL-terminated string for libc
pub fn path_to_cstring(path: &Path) -> ShmResult<CString> {
    CString::new(path.as_os_str().as_bytes())
        .map_err(|_| ShmError::invalid(format!("path {} contains a NUL byte", path.display())))
}

/// Convert an IPC object name to a NUL-terminated string for libc
pub fn name_to_cstring(name: &str) -> ShmResult<CString> {
    CString::new(name).map_err(|_| ShmError::invalid(format!("name {name:?} contains a NUL byte")))
}

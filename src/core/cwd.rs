//! Best-effort working-directory introspection for PTY child processes.
//!
//! The answer is derived from the PTY's *foreground* process group where
//! possible (so `cd`s inside the shell, or a foreground `vim`, are reflected),
//! falling back to the shell's own pid. Every failure path returns `None` —
//! callers treat a missing cwd as "no cwd known" and continue.

use sysinfo::{Pid, ProcessesToUpdate, System};

/// Returns the pid of the PTY's foreground process group, given the master fd.
///
/// On Unix this is `tcgetpgrp(2)`; the pgid of a process group equals the pid
/// of its leader, which is the process we inspect.
#[cfg(unix)]
pub fn foreground_pid(master_fd: i32) -> Option<i32> {
    let pgid = unsafe { libc::tcgetpgrp(master_fd) };
    if pgid <= 0 {
        None
    } else {
        Some(pgid)
    }
}

#[cfg(not(unix))]
pub fn foreground_pid(_master_fd: i32) -> Option<i32> {
    None
}

/// Returns the current working directory of `pid`, or `None`.
///
/// Linux reads `/proc/<pid>/cwd`; macOS asks the kernel via
/// `proc_pidinfo(PROC_PIDVNODEPATHINFO)`. Anything else goes through the
/// sysinfo fallback, which also covers the fast paths failing (e.g. a
/// procfs mounted with `hidepid`).
pub fn process_cwd(pid: i32) -> Option<String> {
    if pid <= 0 {
        return None;
    }

    #[cfg(target_os = "linux")]
    {
        if let Some(path) = linux_proc_cwd(pid) {
            return Some(path);
        }
    }

    #[cfg(target_os = "macos")]
    {
        if let Some(path) = macos_vnode_cwd(pid) {
            return Some(path);
        }
    }

    sysinfo_cwd(pid)
}

#[cfg(target_os = "linux")]
fn linux_proc_cwd(pid: i32) -> Option<String> {
    let link = format!("/proc/{}/cwd", pid);
    std::fs::read_link(link)
        .ok()
        .map(|p| p.to_string_lossy().into_owned())
}

#[cfg(target_os = "macos")]
fn macos_vnode_cwd(pid: i32) -> Option<String> {
    unsafe {
        let mut vpi: libc::proc_vnodepathinfo = std::mem::zeroed();
        let ret = libc::proc_pidinfo(
            pid,
            libc::PROC_PIDVNODEPATHINFO,
            0,
            &mut vpi as *mut _ as *mut libc::c_void,
            std::mem::size_of::<libc::proc_vnodepathinfo>() as i32,
        );
        if ret <= 0 {
            return None;
        }
        let path = std::ffi::CStr::from_ptr(vpi.pvi_cdir.vip_path.as_ptr() as *const libc::c_char);
        path.to_str().ok().map(String::from)
    }
}

/// Cross-platform fallback via sysinfo's process table.
fn sysinfo_cwd(pid: i32) -> Option<String> {
    let mut sys = System::new();
    let target = Pid::from_u32(pid as u32);
    sys.refresh_processes(ProcessesToUpdate::Some(&[target]), true);
    sys.process(target)
        .and_then(|p| p.cwd())
        .map(|p| p.to_string_lossy().into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_own_process_cwd_resolves() {
        let pid = std::process::id() as i32;
        let cwd = process_cwd(pid).expect("own cwd should resolve");
        let expected = std::env::current_dir().unwrap();
        assert_eq!(cwd, expected.to_string_lossy());
    }

    #[test]
    fn test_bogus_pid_returns_none() {
        assert_eq!(process_cwd(-1), None);
        assert_eq!(process_cwd(0), None);
        // Max pid on Linux defaults to 4194304; this one should not exist.
        assert_eq!(process_cwd(i32::MAX), None);
    }
}

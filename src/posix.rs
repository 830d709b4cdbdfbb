use std::ffi::{CString, OsStr, OsString};
use std::fs::File;
use std::io::{Error, Result};
use std::os::unix::ffi::OsStrExt;
use std::os::unix::io::FromRawFd;
use std::ptr;

pub use libc::ECHILD;

fn check_os(ret: libc::c_int) -> Result<libc::c_int> {
    match ret {
        -1 => Err(Error::last_os_error()),
        ok => Ok(ok),
    }
}

/// Convert an OS string to a C string.  An interior NUL is rejected with
/// EINVAL, the same answer the OS would give for the unrepresentable name.
fn to_cstring(s: &OsStr) -> Result<CString> {
    CString::new(s.as_bytes()).map_err(|_| Error::from_raw_os_error(libc::EINVAL))
}

pub fn pipe() -> Result<(File, File)> {
    let mut ends = [-1 as libc::c_int; 2];
    check_os(unsafe { libc::pipe(ends.as_mut_ptr()) })?;
    let [read, write] = ends.map(|fd| unsafe { File::from_raw_fd(fd) });
    Ok((read, write))
}

pub fn dup(fd: i32) -> Result<File> {
    let new = check_os(unsafe { libc::dup(fd) })?;
    Ok(unsafe { File::from_raw_fd(new) })
}

pub fn dup2(oldfd: i32, newfd: i32) -> Result<()> {
    check_os(unsafe { libc::dup2(oldfd, newfd) }).map(drop)
}

/// Fork the process.  Returns `Some(child_pid)` in the parent and `None` in
/// the child.
///
/// # Safety
///
/// In a multi-threaded program the child may only call async-signal-safe
/// functions before exec.
pub unsafe fn fork() -> Result<Option<u32>> {
    match check_os(unsafe { libc::fork() })? {
        0 => Ok(None),
        pid => Ok(Some(pid as u32)),
    }
}

/// Replace the process image.  Never returns on success; on failure the
/// launch error comes back so the forked child can report it before
/// exiting.
pub fn execvp(cmd: &OsStr, argv: &[OsString]) -> Error {
    let prog = match to_cstring(cmd) {
        Ok(prog) => prog,
        Err(err) => return err,
    };
    let args: Vec<CString> = match argv.iter().map(|a| to_cstring(a)).collect() {
        Ok(args) => args,
        Err(err) => return err,
    };
    let mut argv_ptrs: Vec<*const libc::c_char> = args.iter().map(|a| a.as_ptr()).collect();
    argv_ptrs.push(ptr::null());
    unsafe { libc::execvp(prog.as_ptr(), argv_ptrs.as_ptr()) };
    Error::last_os_error()
}

/// Exit immediately, without running atexit handlers or flushing stdio.
/// For the forked child's failure path only.
pub fn hard_exit(status: i32) -> ! {
    unsafe { libc::_exit(status as libc::c_int) }
}

pub const WNOHANG: i32 = libc::WNOHANG;

pub fn waitpid(pid: u32, flags: i32) -> Result<(u32, i32)> {
    let mut status = 0;
    let reaped = check_os(unsafe {
        libc::waitpid(pid as libc::pid_t, &mut status, flags as libc::c_int)
    })?;
    Ok((reaped as u32, status))
}

/// Decode a raw `waitpid` status into a shell exit code.  Signal deaths map
/// to 128 + signal number, following the usual shell convention.
pub fn decode_exit_code(status: i32) -> i32 {
    if libc::WIFEXITED(status) {
        libc::WEXITSTATUS(status)
    } else if libc::WIFSIGNALED(status) {
        128 + libc::WTERMSIG(status)
    } else {
        1
    }
}

pub const SIGINT: i32 = libc::SIGINT;
pub const SIGTERM: i32 = libc::SIGTERM;
pub const SIGKILL: i32 = libc::SIGKILL;

pub fn kill(pid: u32, signal: i32) -> Result<()> {
    check_os(unsafe { libc::kill(pid as libc::pid_t, signal as libc::c_int) }).map(drop)
}

pub fn killpg(pgid: u32, signal: i32) -> Result<()> {
    check_os(unsafe { libc::killpg(pgid as libc::pid_t, signal as libc::c_int) }).map(drop)
}

pub fn setpgid(pid: u32, pgid: u32) -> Result<()> {
    check_os(unsafe { libc::setpgid(pid as libc::pid_t, pgid as libc::pid_t) }).map(drop)
}

pub fn is_executable(path: &OsStr) -> bool {
    to_cstring(path)
        .map(|p| unsafe { libc::access(p.as_ptr(), libc::X_OK) } == 0)
        .unwrap_or(false)
}

/// Reset signal dispositions the shell has altered back to the defaults a
/// freshly exec'd program expects.  Called in the child between fork and
/// exec.
pub fn reset_signals() -> Result<()> {
    unsafe {
        let mut empty: libc::sigset_t = std::mem::zeroed();
        check_os(libc::sigemptyset(&mut empty))?;
        // pthread_sigmask reports its error as the return value, not via
        // errno.
        let rc = libc::pthread_sigmask(libc::SIG_SETMASK, &empty, ptr::null_mut());
        if rc != 0 {
            return Err(Error::from_raw_os_error(rc));
        }
        for sig in [libc::SIGINT, libc::SIGQUIT, libc::SIGPIPE] {
            if libc::signal(sig, libc::SIG_DFL) == libc::SIG_ERR {
                return Err(Error::last_os_error());
            }
        }
    }
    Ok(())
}

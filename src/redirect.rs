//! Redirection specifications and the scoped standard-handle guard.
//!
//! Built-ins read and write the process-wide standard streams, so wiring a
//! command's redirections means temporarily overriding those streams for the
//! whole process.  [`RedirectGuard`] owns the overrides and restores the
//! previous handles when dropped, on every exit path.

use std::fs::{File, OpenOptions};
use std::io;
use std::path::PathBuf;

use crate::buffer::{make_pipe, OutputBuffer};

/// Where a command's standard input comes from.
#[derive(Debug, Default)]
pub enum StdinRedirect {
    #[default]
    Inherit,
    File(PathBuf),
    Null,
    /// Read end of a pipe created by the previous command in the pipeline.
    /// The guard consumes the handle when installing it; the node no longer
    /// owns it afterwards.
    Pipe(Option<File>),
}

/// Where a command's standard output goes.
#[derive(Debug, Default)]
pub enum StdoutRedirect {
    #[default]
    Inherit,
    OverwriteFile(PathBuf),
    AppendFile(PathBuf),
    Null,
    /// Pipe into the next command: the read end is stored on the next node's
    /// stdin at install time.
    Pipe,
    /// Drain into a shell-owned buffer.  `None` means a fresh buffer is
    /// created at install time; the walker fills in an existing buffer to
    /// chain append-mode capture across commands.
    Buffer(Option<OutputBuffer>),
}

/// Where a command's standard error goes.
#[derive(Debug, Default)]
pub enum StderrRedirect {
    #[default]
    Inherit,
    OverwriteFile(PathBuf),
    AppendFile(PathBuf),
    Null,
    /// Alias the stream to wherever stdout currently points (`2>&1`).
    MergeToStdout,
    Buffer(Option<OutputBuffer>),
}

impl StdoutRedirect {
    pub fn buffer(&self) -> Option<&OutputBuffer> {
        match self {
            StdoutRedirect::Buffer(Some(buf)) => Some(buf),
            _ => None,
        }
    }
}

impl StderrRedirect {
    pub fn buffer(&self) -> Option<&OutputBuffer> {
        match self {
            StderrRedirect::Buffer(Some(buf)) => Some(buf),
            _ => None,
        }
    }
}

/// Everything the guard needs to wire one command's streams.  `next_stdin`
/// receives the read end when stdout targets a pipe.
pub struct RedirectRequest<'a> {
    pub stdin: &'a mut StdinRedirect,
    pub stdout: &'a mut StdoutRedirect,
    pub stderr: &'a mut StderrRedirect,
    pub next_stdin: Option<&'a mut StdinRedirect>,
    pub for_builtin: bool,
}

/// Scoped override of the process-wide standard streams.
///
/// Dropping the guard restores every stream it overrode, in reverse order,
/// exactly once even when stderr aliases stdout.  For non-builtin launches it
/// also switches the console to cooked input and disarms the shell's Ctrl-C
/// handler so the child observes the signal; both are restored on drop.
pub struct RedirectGuard {
    inner: os::OsGuard,
}

impl RedirectGuard {
    /// Capture the current standard handles and install every non-inherit
    /// redirection in `req`.  On failure the partially applied overrides are
    /// reverted before the error is returned.
    pub fn install(req: RedirectRequest<'_>) -> io::Result<RedirectGuard> {
        let mut inner = os::OsGuard::default();
        match Self::apply(&mut inner, req) {
            Ok(()) => Ok(RedirectGuard { inner }),
            Err(err) => {
                // inner drops here, reverting whatever was already applied
                Err(err)
            }
        }
    }

    fn apply(inner: &mut os::OsGuard, req: RedirectRequest<'_>) -> io::Result<()> {
        match req.stdin {
            StdinRedirect::Inherit => {}
            StdinRedirect::File(path) => {
                let file = os::open_shared_read(path)?;
                inner.set_stdin(file)?;
            }
            StdinRedirect::Null => {
                let file = os::open_shared_read(&PathBuf::from(os::NULL_DEVICE))?;
                inner.set_stdin(file)?;
            }
            StdinRedirect::Pipe(handle) => {
                if let Some(file) = handle.take() {
                    inner.set_stdin(file)?;
                }
            }
        }

        match req.stdout {
            StdoutRedirect::Inherit => {}
            StdoutRedirect::OverwriteFile(path) => {
                let file = open_overwrite(path)?;
                inner.set_stdout(file)?;
            }
            StdoutRedirect::AppendFile(path) => {
                let file = open_append(path)?;
                inner.set_stdout(file)?;
            }
            StdoutRedirect::Null => {
                let file = open_overwrite(&PathBuf::from(os::NULL_DEVICE))?;
                inner.set_stdout(file)?;
            }
            StdoutRedirect::Pipe => {
                let next = req.next_stdin.ok_or_else(|| {
                    io::Error::new(
                        io::ErrorKind::InvalidInput,
                        "pipe redirection without a following command",
                    )
                })?;
                let (read, write) = make_pipe()?;
                os::set_inheritable(&read, false)?;
                *next = StdinRedirect::Pipe(Some(read));
                inner.set_stdout(write)?;
            }
            StdoutRedirect::Buffer(buf) => {
                let buf = buf.get_or_insert_with(OutputBuffer::new);
                let write = buf.attach()?;
                inner.set_stdout(write)?;
            }
        }

        match req.stderr {
            StderrRedirect::Inherit => {}
            StderrRedirect::OverwriteFile(path) => {
                let file = open_overwrite(path)?;
                inner.set_stderr(file)?;
            }
            StderrRedirect::AppendFile(path) => {
                let file = open_append(path)?;
                inner.set_stderr(file)?;
            }
            StderrRedirect::Null => {
                let file = open_overwrite(&PathBuf::from(os::NULL_DEVICE))?;
                inner.set_stderr(file)?;
            }
            StderrRedirect::MergeToStdout => {
                inner.alias_stderr_to_stdout()?;
            }
            StderrRedirect::Buffer(buf) => {
                let buf = buf.get_or_insert_with(OutputBuffer::new);
                let write = buf.attach()?;
                inner.set_stderr(write)?;
            }
        }

        if !req.for_builtin {
            inner.prepare_console_for_child()?;
        }
        Ok(())
    }
}

fn open_overwrite(path: &PathBuf) -> io::Result<File> {
    OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .open(path)
}

fn open_append(path: &PathBuf) -> io::Result<File> {
    OpenOptions::new().create(true).append(true).open(path)
}

#[cfg(unix)]
mod os {
    use super::*;
    use crate::posix;
    use std::os::unix::io::AsRawFd;

    pub const NULL_DEVICE: &str = "/dev/null";

    pub fn open_shared_read(path: &PathBuf) -> io::Result<File> {
        File::open(path)
    }

    pub fn set_inheritable(f: &File, inheritable: bool) -> io::Result<()> {
        // Unix fds are inherited across fork; close-on-exec governs exec.
        let fd = f.as_raw_fd();
        let old = fcntl_getfd(fd)?;
        let new = if inheritable {
            old & !libc::FD_CLOEXEC
        } else {
            old | libc::FD_CLOEXEC
        };
        if new != old {
            fcntl_setfd(fd, new)?;
        }
        Ok(())
    }

    fn fcntl_getfd(fd: i32) -> io::Result<i32> {
        let r = unsafe { libc::fcntl(fd, libc::F_GETFD) };
        if r < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(r)
    }

    fn fcntl_setfd(fd: i32, flags: i32) -> io::Result<()> {
        let r = unsafe { libc::fcntl(fd, libc::F_SETFD, flags) };
        if r < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    struct SavedFd {
        target: i32,
        saved: File,
    }

    #[derive(Default)]
    pub struct OsGuard {
        overrides: Vec<SavedFd>,
    }

    impl OsGuard {
        fn set_fd(&mut self, target: i32, file: File) -> io::Result<()> {
            let saved = posix::dup(target)?;
            posix::dup2(file.as_raw_fd(), target)?;
            self.overrides.push(SavedFd { target, saved });
            // `file` drops here; the duplicated descriptor stays installed.
            Ok(())
        }

        pub fn set_stdin(&mut self, file: File) -> io::Result<()> {
            self.set_fd(0, file)
        }

        pub fn set_stdout(&mut self, file: File) -> io::Result<()> {
            self.set_fd(1, file)
        }

        pub fn set_stderr(&mut self, file: File) -> io::Result<()> {
            self.set_fd(2, file)
        }

        pub fn alias_stderr_to_stdout(&mut self) -> io::Result<()> {
            // dup2 gives stderr its own descriptor to the same description,
            // so restore-and-close stays one per stream.
            let copy = posix::dup(1)?;
            self.set_fd(2, copy)
        }

        pub fn prepare_console_for_child(&mut self) -> io::Result<()> {
            // Terminal modes travel with the tty on Unix; nothing to adjust
            // here.
            Ok(())
        }
    }

    impl Drop for OsGuard {
        fn drop(&mut self) {
            while let Some(o) = self.overrides.pop() {
                let _ = posix::dup2(o.saved.as_raw_fd(), o.target);
            }
        }
    }
}

#[cfg(windows)]
mod os {
    use super::*;
    use crate::win32::{self, StdStream};
    use std::os::windows::fs::OpenOptionsExt;
    use std::os::windows::io::{AsRawHandle, RawHandle};

    pub const NULL_DEVICE: &str = win32::NUL_DEVICE;

    const FILE_SHARE_READ: u32 = 0x1;
    const FILE_SHARE_DELETE: u32 = 0x4;

    pub fn open_shared_read(path: &PathBuf) -> io::Result<File> {
        OpenOptions::new()
            .read(true)
            .share_mode(FILE_SHARE_READ | FILE_SHARE_DELETE)
            .open(path)
    }

    pub fn set_inheritable(f: &File, inheritable: bool) -> io::Result<()> {
        win32::SetHandleInformation(
            f.as_raw_handle(),
            win32::HANDLE_FLAG_INHERIT,
            if inheritable { 1 } else { 0 },
        )
    }

    struct SavedStd {
        which: StdStream,
        saved: RawHandle,
        /// The installed handle, owned so revert can close it.  `None` when
        /// the stream aliases another stream's handle, in which case revert
        /// must not close it a second time.
        installed: Option<File>,
    }

    #[derive(Default)]
    pub struct OsGuard {
        overrides: Vec<SavedStd>,
        console_mode: Option<(RawHandle, u32)>,
        rearm_ctrl: bool,
    }

    impl OsGuard {
        fn set_std(&mut self, which: StdStream, file: File) -> io::Result<()> {
            set_inheritable(&file, true)?;
            let saved = win32::GetStdHandle(which)?;
            win32::SetStdHandle(which, file.as_raw_handle())?;
            self.overrides.push(SavedStd {
                which,
                saved,
                installed: Some(file),
            });
            Ok(())
        }

        pub fn set_stdin(&mut self, file: File) -> io::Result<()> {
            self.set_std(StdStream::Input, file)
        }

        pub fn set_stdout(&mut self, file: File) -> io::Result<()> {
            self.set_std(StdStream::Output, file)
        }

        pub fn set_stderr(&mut self, file: File) -> io::Result<()> {
            self.set_std(StdStream::Error, file)
        }

        pub fn alias_stderr_to_stdout(&mut self) -> io::Result<()> {
            let saved = win32::GetStdHandle(StdStream::Error)?;
            let stdout = win32::GetStdHandle(StdStream::Output)?;
            win32::SetStdHandle(StdStream::Error, stdout)?;
            // Same underlying handle as stdout: revert restores the slot but
            // leaves closing to the stdout override.
            self.overrides.push(SavedStd {
                which: StdStream::Error,
                saved,
                installed: None,
            });
            Ok(())
        }

        pub fn prepare_console_for_child(&mut self) -> io::Result<()> {
            if let Ok(conin) = win32::GetStdHandle(StdStream::Input)
                && let Ok(mode) = win32::GetConsoleMode(conin)
            {
                let cooked = mode
                    | win32::ENABLE_PROCESSED_INPUT
                    | win32::ENABLE_LINE_INPUT
                    | win32::ENABLE_ECHO_INPUT;
                win32::SetConsoleMode(conin, cooked)?;
                self.console_mode = Some((conin, mode));
            }
            win32::DisarmCtrlHandler()?;
            self.rearm_ctrl = true;
            Ok(())
        }
    }

    impl Drop for OsGuard {
        fn drop(&mut self) {
            while let Some(o) = self.overrides.pop() {
                let _ = win32::SetStdHandle(o.which, o.saved);
                drop(o.installed);
            }
            if let Some((conin, mode)) = self.console_mode.take() {
                let _ = win32::SetConsoleMode(conin, mode);
            }
            if self.rearm_ctrl {
                let _ = win32::RearmCtrlHandler();
            }
        }
    }
}

pub use os::{set_inheritable, NULL_DEVICE};

/// True if `name` refers to the null device.
pub fn is_null_device(name: &str) -> bool {
    name.eq_ignore_ascii_case(NULL_DEVICE)
}

use std::fmt;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// A handle to a running or finished child process.
///
/// `ChildProcess` is cheaply cloneable; clones share the same underlying OS
/// handle and cached exit state, which is what lets the main walker and a
/// debug-pump worker hold the same child at once.  All methods take `&self`.
#[derive(Clone)]
pub struct ChildProcess(Arc<InnerProcess>);

struct InnerProcess {
    pid: u32,
    #[allow(dead_code)]
    ext: os::ExtProcessState,
    state: Mutex<ProcessState>,
    detached: AtomicBool,
}

#[derive(Debug)]
enum ProcessState {
    Running,
    Finished(i32),
}

impl ChildProcess {
    pub(crate) fn new(pid: u32, ext: os::ExtProcessState, detached: bool) -> ChildProcess {
        ChildProcess(Arc::new(InnerProcess {
            pid,
            ext,
            state: Mutex::new(ProcessState::Running),
            detached: AtomicBool::new(detached),
        }))
    }

    pub fn pid(&self) -> u32 {
        self.0.pid
    }

    /// The exit code, if the child is known to have finished.  Performs no
    /// system calls; use [`poll`](Self::poll) or [`wait`](Self::wait) to
    /// update the state.
    pub fn exit_code(&self) -> Option<i32> {
        match *self.0.state.lock().unwrap() {
            ProcessState::Finished(code) => Some(code),
            ProcessState::Running => None,
        }
    }

    /// Check for completion without blocking.
    pub fn poll(&self) -> Option<i32> {
        self.wait_timeout(Duration::from_secs(0)).unwrap_or(None)
    }

    /// Wait for the child to finish and return its exit code.
    pub fn wait(&self) -> io::Result<i32> {
        self.0.os_wait()
    }

    /// Like [`wait`](Self::wait), but gives up after `dur`, returning
    /// `Ok(None)`.
    pub fn wait_timeout(&self, dur: Duration) -> io::Result<Option<i32>> {
        self.0.os_wait_timeout(dur)
    }

    /// Send a controlled break to the child's process group.  The child must
    /// have been launched as a group leader.
    pub fn send_break(&self) -> io::Result<()> {
        self.0.os_send_break()
    }

    /// Forcibly terminate the child.
    pub fn kill(&self) -> io::Result<()> {
        self.0.os_kill()
    }

    /// A detached child is not waited on when the last handle drops.
    pub fn detach(&self) {
        self.0.detached.store(true, Ordering::Relaxed);
    }
}

impl Drop for InnerProcess {
    fn drop(&mut self) {
        if !self.detached.load(Ordering::Relaxed) {
            let state = self.state.get_mut().unwrap();
            if matches!(*state, ProcessState::Running) {
                let _ = self.os_wait();
            }
        }
    }
}

impl fmt::Debug for ChildProcess {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.0.state.lock().unwrap();
        f.debug_struct("ChildProcess")
            .field("pid", &self.0.pid)
            .field("state", &*state)
            .field("detached", &self.0.detached.load(Ordering::Relaxed))
            .finish()
    }
}

#[cfg(unix)]
mod os {
    use super::*;
    use crate::posix;

    pub type ExtProcessState = ();

    impl InnerProcess {
        pub(super) fn os_wait(&self) -> io::Result<i32> {
            let mut state = self.state.lock().unwrap();
            loop {
                match *state {
                    ProcessState::Finished(code) => return Ok(code),
                    ProcessState::Running => {
                        Self::waitpid_into(&mut state, self.pid, true)?;
                    }
                }
            }
        }

        pub(super) fn os_wait_timeout(&self, dur: Duration) -> io::Result<Option<i32>> {
            use std::time::Instant;

            // waitpid has no timed variant, so the wait is a WNOHANG poll
            // repeated in fixed slices until the deadline passes.  The lock
            // scope covers only the poll itself.
            const POLL_SLICE: Duration = Duration::from_millis(20);
            let deadline = Instant::now() + dur;
            loop {
                {
                    let mut state = self.state.lock().unwrap();
                    Self::waitpid_into(&mut state, self.pid, false)?;
                    if let ProcessState::Finished(code) = *state {
                        return Ok(Some(code));
                    }
                }
                let now = Instant::now();
                if now >= deadline {
                    return Ok(None);
                }
                std::thread::sleep(POLL_SLICE.min(deadline - now));
            }
        }

        pub(super) fn os_send_break(&self) -> io::Result<()> {
            let state = self.state.lock().unwrap();
            match *state {
                ProcessState::Finished(_) => Ok(()),
                ProcessState::Running => posix::killpg(self.pid, posix::SIGINT),
            }
        }

        pub(super) fn os_kill(&self) -> io::Result<()> {
            let state = self.state.lock().unwrap();
            match *state {
                ProcessState::Finished(_) => Ok(()),
                ProcessState::Running => posix::kill(self.pid, posix::SIGKILL),
            }
        }

        fn waitpid_into(state: &mut ProcessState, pid: u32, block: bool) -> io::Result<()> {
            if matches!(*state, ProcessState::Finished(_)) {
                return Ok(());
            }
            match posix::waitpid(pid, if block { 0 } else { posix::WNOHANG }) {
                Ok((pid_out, raw)) if pid_out == pid => {
                    *state = ProcessState::Finished(posix::decode_exit_code(raw));
                }
                Ok(_) => {}
                Err(e) if e.raw_os_error() == Some(posix::ECHILD) => {
                    // Someone else reaped the child; its exit code is gone.
                    *state = ProcessState::Finished(1);
                }
                Err(e) => return Err(e),
            }
            Ok(())
        }
    }
}

#[cfg(windows)]
mod os {
    use super::*;
    use crate::win32;

    #[derive(Debug)]
    pub struct ExtProcessState(pub(crate) win32::Handle);

    impl ChildProcess {
        /// The raw process handle for multi-object waits.
        pub(crate) fn raw_handle(&self) -> std::os::windows::io::RawHandle {
            use std::os::windows::io::AsRawHandle;
            self.0.ext.0.as_raw_handle()
        }
    }

    impl InnerProcess {
        pub(super) fn os_wait(&self) -> io::Result<i32> {
            {
                let state = self.state.lock().unwrap();
                if let ProcessState::Finished(code) = *state {
                    return Ok(code);
                }
            }
            // Wait without holding the lock; the handle itself is immutable.
            let event = win32::WaitForSingleObject(&self.ext.0, None)?;
            let mut state = self.state.lock().unwrap();
            if let ProcessState::Finished(code) = *state {
                return Ok(code);
            }
            if let win32::WaitEvent::OBJECT_0 = event {
                let exit_code = win32::GetExitCodeProcess(&self.ext.0)? as i32;
                *state = ProcessState::Finished(exit_code);
                Ok(exit_code)
            } else {
                Err(io::Error::other(
                    "os_wait: child not finished after WaitForSingleObject",
                ))
            }
        }

        pub(super) fn os_wait_timeout(&self, dur: Duration) -> io::Result<Option<i32>> {
            {
                let state = self.state.lock().unwrap();
                if let ProcessState::Finished(code) = *state {
                    return Ok(Some(code));
                }
            }
            let event = win32::WaitForSingleObject(&self.ext.0, Some(dur))?;
            let mut state = self.state.lock().unwrap();
            if let ProcessState::Finished(code) = *state {
                return Ok(Some(code));
            }
            if let win32::WaitEvent::OBJECT_0 = event {
                let exit_code = win32::GetExitCodeProcess(&self.ext.0)? as i32;
                *state = ProcessState::Finished(exit_code);
                Ok(Some(exit_code))
            } else {
                Ok(None)
            }
        }

        pub(super) fn os_send_break(&self) -> io::Result<()> {
            let state = self.state.lock().unwrap();
            match *state {
                ProcessState::Finished(_) => Ok(()),
                ProcessState::Running => win32::GenerateConsoleCtrlEvent(self.pid),
            }
        }

        pub(super) fn os_kill(&self) -> io::Result<()> {
            let mut state = self.state.lock().unwrap();
            if let ProcessState::Running = *state
                && let Err(err) = win32::TerminateProcess(&self.ext.0, 1)
            {
                if err.raw_os_error() != Some(winapi::shared::winerror::ERROR_ACCESS_DENIED as i32)
                {
                    return Err(err);
                }
                let rc = win32::GetExitCodeProcess(&self.ext.0)?;
                if rc == win32::STILL_ACTIVE {
                    return Err(err);
                }
                *state = ProcessState::Finished(rc as i32);
            }
            Ok(())
        }
    }
}

#[cfg(windows)]
pub(crate) use os::ExtProcessState;

//! Process-lifetime shell state.
//!
//! The engine's process-wide mutable state (the built-in registry and
//! module list, the alias table, the job tracker, the error level, and the
//! cancel event) lives in one singleton with explicit initialization and
//! teardown rather than scattered statics.  Access is brief and scoped:
//! nothing holds the state lock across a built-in invocation or a wait.

use std::collections::HashMap;
use std::sync::Mutex;

use crate::jobs::JobTable;
use crate::registry::Registry;
use crate::wait::CancelEvent;

pub struct ShellState {
    pub registry: Registry,
    pub jobs: JobTable,
    pub aliases: HashMap<String, String>,
    error_level: i32,
    exit_request: Option<i32>,
    cancel: CancelEvent,
    #[cfg(windows)]
    console_input: Option<usize>,
}

impl ShellState {
    fn new() -> std::io::Result<ShellState> {
        Ok(ShellState {
            registry: Registry::default(),
            jobs: JobTable::new(),
            aliases: HashMap::new(),
            error_level: 0,
            exit_request: None,
            cancel: CancelEvent::new()?,
            #[cfg(windows)]
            console_input: capture_console_input(),
        })
    }
}

#[cfg(windows)]
fn capture_console_input() -> Option<usize> {
    // Captured once, before any redirection override, so the wait loop can
    // watch the real console regardless of the current stdin redirection.
    crate::win32::GetStdHandle(crate::win32::StdStream::Input)
        .ok()
        .map(|h| h as usize)
}

static STATE: Mutex<Option<ShellState>> = Mutex::new(None);

/// Initialize the singleton.  Idempotent; entry points call this on their
/// way in.
pub fn init() -> std::io::Result<()> {
    let mut guard = STATE.lock().unwrap();
    if guard.is_none() {
        *guard = Some(ShellState::new()?);
    }
    Ok(())
}

/// Tear the singleton down: drop every registration and loaded module and
/// discard the state.  The module list must drain to empty here; a leak is
/// logged.
pub fn shutdown() {
    let mut guard = STATE.lock().unwrap();
    if let Some(state) = guard.as_mut() {
        state.registry.clear();
    }
    *guard = None;
}

/// Run `f` with the state locked.  The closure must not re-enter `with` and
/// must not block; callers copy out what they need and release.
pub fn with<R>(f: impl FnOnce(&mut ShellState) -> R) -> R {
    let mut guard = STATE.lock().unwrap();
    if guard.is_none() {
        *guard = Some(ShellState::new().expect("shell state initialization failed"));
    }
    f(guard.as_mut().unwrap())
}

/// The shell's cancel event.  Cloned out so waits never hold the state
/// lock.
pub fn cancel_event() -> CancelEvent {
    with(|st| st.cancel.clone())
}

/// The process-wide error level, updated by the walker after each node.
pub fn error_level() -> i32 {
    with(|st| st.error_level)
}

pub fn set_error_level(level: i32) {
    with(|st| st.error_level = level);
}

/// Run `f` against the background job table.
pub fn with_jobs<R>(f: impl FnOnce(&mut JobTable) -> R) -> R {
    with(|st| f(&mut st.jobs))
}

/// Record that a built-in asked the shell to exit.
pub fn request_exit(code: i32) {
    with(|st| st.exit_request = Some(code));
}

/// The pending exit request, if any.  The interactive driver polls this
/// after each expression.
pub fn exit_requested() -> Option<i32> {
    with(|st| st.exit_request)
}

#[cfg(windows)]
pub fn console_input() -> Option<std::os::windows::io::RawHandle> {
    with(|st| st.console_input).map(|h| h as std::os::windows::io::RawHandle)
}

//! Cancellation and the synchronous wait loop.
//!
//! Each foreground command is waited through a single multi-object wait over
//! the child (or its debug pump), the shell's cancel event, and the console
//! input handle.  Timers are explicit delays fed to the wait call; there are
//! no stacked async frames, just this state machine.

use std::io;
use std::thread;
use std::time::Duration;

use crate::plan::ExecContext;
use crate::registry::finalize_buffers;

/// Grace period between the polite break and forceful termination.
pub const GRACE_PERIOD: Duration = Duration::from_millis(50);
/// Poll interval while watching console input for shell-directed sequences.
pub const INPUT_POLL: Duration = Duration::from_millis(100);
/// Poll interval while confirming a sustained background/focus signal.
pub const DETECT_POLL: Duration = Duration::from_millis(30);
/// Consecutive confirming polls required before acting on a signal.
pub const DETECT_PASSES: u32 = 3;

/// How a synchronously waited command ended.
#[derive(Debug, PartialEq, Eq)]
pub enum WaitOutcome {
    /// The child exited on its own with this code.
    Completed(i32),
    /// The user sent the task to the background; ownership of the process
    /// moves to the job tracker and the child keeps running.
    Backgrounded,
    /// The cancel event fired; a break was sent and the caller must sweep
    /// the rest of the plan.
    Cancelled,
}

/// The event the console interrupt handler sets.  Edge-triggered: the wait
/// loop reacts within one wait cycle and the walker resets it between
/// expressions.
#[derive(Clone)]
pub struct CancelEvent(std::sync::Arc<os_event::Inner>);

impl CancelEvent {
    pub fn new() -> io::Result<CancelEvent> {
        Ok(CancelEvent(std::sync::Arc::new(os_event::Inner::new()?)))
    }

    pub fn set(&self) {
        self.0.set();
    }

    pub fn reset(&self) {
        self.0.reset();
    }

    pub fn is_set(&self) -> bool {
        self.0.is_set()
    }

    #[cfg(windows)]
    pub(crate) fn raw(&self) -> std::os::windows::io::RawHandle {
        self.0.raw()
    }

    /// Route console interrupts into this event for the process lifetime.
    pub fn arm_console_handler(&self) -> io::Result<()> {
        self.0.arm_console_handler()
    }
}

#[cfg(unix)]
mod os_event {
    use std::io;
    use std::sync::atomic::{AtomicBool, Ordering};

    pub struct Inner(AtomicBool);

    impl Inner {
        pub fn new() -> io::Result<Inner> {
            Ok(Inner(AtomicBool::new(false)))
        }
        pub fn set(&self) {
            self.0.store(true, Ordering::SeqCst);
        }
        pub fn reset(&self) {
            self.0.store(false, Ordering::SeqCst);
        }
        pub fn is_set(&self) -> bool {
            self.0.load(Ordering::SeqCst)
        }
        pub fn arm_console_handler(&self) -> io::Result<()> {
            // The driver installs the SIGINT hook (via the ctrlc crate) and
            // forwards into CancelEvent::set; nothing to do at this level.
            Ok(())
        }
    }
}

#[cfg(windows)]
mod os_event {
    use crate::win32;
    use std::io;
    use std::os::windows::io::RawHandle;
    use std::time::Duration;

    pub struct Inner(win32::Handle);

    impl Inner {
        pub fn new() -> io::Result<Inner> {
            Ok(Inner(win32::CreateEvent()?))
        }
        pub fn set(&self) {
            let _ = win32::SetEvent(&self.0);
        }
        pub fn reset(&self) {
            let _ = win32::ResetEvent(&self.0);
        }
        pub fn is_set(&self) -> bool {
            matches!(
                win32::WaitForSingleObject(&self.0, Some(Duration::from_millis(0))),
                Ok(win32::WaitEvent::OBJECT_0)
            )
        }
        pub fn raw(&self) -> RawHandle {
            use std::os::windows::io::AsRawHandle;
            self.0.as_raw_handle()
        }
        pub fn arm_console_handler(&self) -> io::Result<()> {
            win32::ArmCtrlHandler(&self.0)
        }
    }
}

/// Wait for a launched node to finish, watching for cancellation and for
/// control sequences directed at the shell rather than the child.
pub fn wait_for_completion(ctx: &mut ExecContext, cancel: &CancelEvent) -> WaitOutcome {
    let Some(process) = ctx.process.clone() else {
        return WaitOutcome::Completed(1);
    };
    let outcome = os_wait::wait_loop(ctx, &process, cancel);
    if let WaitOutcome::Completed(_) = outcome {
        // The producer side of any capture is gone; make the contents
        // readable before the walker moves on.
        finalize_buffers(ctx.stdout.buffer(), ctx.stderr.buffer());
        if let Some(pump) = ctx.debug_pump.take() {
            let _ = pump.join();
        }
    }
    outcome
}

#[cfg(unix)]
mod os_wait {
    use super::*;
    use crate::process::ChildProcess;

    pub fn wait_loop(
        ctx: &mut ExecContext,
        process: &ChildProcess,
        cancel: &CancelEvent,
    ) -> WaitOutcome {
        loop {
            if cancel.is_set() {
                if ctx.pid().is_some() {
                    let _ = process.send_break();
                    return WaitOutcome::Cancelled;
                }
                // No child yet; give the launch a moment and re-arm.
                thread::sleep(GRACE_PERIOD);
                continue;
            }
            match process.wait_timeout(INPUT_POLL) {
                Ok(Some(code)) => return WaitOutcome::Completed(code),
                Ok(None) => {}
                Err(_) => return WaitOutcome::Completed(1),
            }
        }
    }
}

#[cfg(windows)]
mod os_wait {
    use super::*;
    use crate::process::ChildProcess;
    use crate::state;
    use crate::win32;
    use std::os::windows::io::{AsRawHandle, RawHandle};
    use std::sync::atomic::Ordering;

    struct InputSignals {
        background_key: bool,
        focus_lost: bool,
        relevant_records: usize,
    }

    fn scan_input(records: &[winapi::um::wincon::INPUT_RECORD]) -> InputSignals {
        let mut signals = InputSignals {
            background_key: false,
            focus_lost: false,
            relevant_records: 0,
        };
        for record in records {
            match record.EventType {
                win32::KEY_EVENT => {
                    let key = unsafe { record.Event.KeyEvent() };
                    let ctrl = key.dwControlKeyState
                        & (win32::LEFT_CTRL_PRESSED | win32::RIGHT_CTRL_PRESSED)
                        != 0;
                    if key.bKeyDown != 0 && ctrl && key.wVirtualKeyCode == b'B' as u16 {
                        signals.background_key = true;
                        signals.relevant_records += 1;
                    }
                }
                win32::FOCUS_EVENT => {
                    let focus = unsafe { record.Event.FocusEvent() };
                    if focus.bSetFocus == 0 {
                        signals.focus_lost = true;
                        signals.relevant_records += 1;
                    }
                }
                _ => {}
            }
        }
        signals
    }

    pub fn wait_loop(
        ctx: &mut ExecContext,
        process: &ChildProcess,
        cancel: &CancelEvent,
    ) -> WaitOutcome {
        let conin = state::console_input();
        let mut background_passes = 0u32;
        let mut focus_passes = 0u32;
        // Set once the console handle has pending records the shell does not
        // act on; switches the wait into timed polling so a signaled but
        // irrelevant input handle cannot spin the loop.
        let mut input_idle = false;

        loop {
            let primary: RawHandle = match &ctx.debug_pump {
                Some(pump) => pump.as_raw_handle(),
                None => process.raw_handle(),
            };
            let mut handles: Vec<RawHandle> = vec![primary, cancel.raw()];
            if let Some(conin) = conin
                && !input_idle
            {
                handles.push(conin);
            }
            let timeout = if background_passes > 0 || focus_passes > 0 {
                Some(DETECT_POLL)
            } else if input_idle {
                Some(INPUT_POLL)
            } else if conin.is_some() {
                None
            } else {
                Some(INPUT_POLL)
            };

            let signaled = match win32::WaitForMultipleObjects(&handles, timeout) {
                Ok(win32::WaitResult::Object(idx)) => Some(idx),
                Ok(win32::WaitResult::Timeout) => None,
                Err(_) => return WaitOutcome::Completed(1),
            };

            match signaled {
                Some(0) => {
                    // Child (or its pump) is done; the exit code is cached on
                    // the process handle.
                    let code = process.wait().unwrap_or(1);
                    return WaitOutcome::Completed(code);
                }
                Some(1) => {
                    if ctx.pid().is_some() {
                        let _ = process.send_break();
                        return WaitOutcome::Cancelled;
                    }
                    thread::sleep(GRACE_PERIOD);
                    continue;
                }
                _ => {}
            }

            // Timeout, or console input: peek without consuming and track
            // how long the interesting records stay buffered.
            input_idle = false;
            let Some(conin) = conin else { continue };
            let records = match win32::PeekConsoleInput(conin, 16) {
                Ok(records) => records,
                Err(_) => continue,
            };
            let signals = scan_input(&records);

            if signals.background_key {
                background_passes += 1;
                if background_passes >= DETECT_PASSES {
                    // The foreground child left the key buffered; it is for
                    // the shell.  Consume it and hand the task over without
                    // killing it.
                    let _ = win32::DiscardConsoleInput(conin, records.len());
                    ctx.env_capture_armed.store(false, Ordering::SeqCst);
                    ctx.completion_notify = false;
                    return WaitOutcome::Backgrounded;
                }
            } else {
                background_passes = 0;
            }

            if signals.focus_lost {
                focus_passes += 1;
                if focus_passes >= DETECT_PASSES {
                    if !ctx.suppress_completion_notify {
                        ctx.completion_notify = true;
                    }
                    let _ = win32::DiscardConsoleInput(conin, records.len());
                    focus_passes = 0;
                }
            } else {
                focus_passes = 0;
            }

            if signals.relevant_records == 0 && !records.is_empty() {
                input_idle = true;
            }
        }
    }
}

/// Two-pass cancellation of the remaining live children of a plan: send a
/// controlled break to every gracefully terminable child, give the grace
/// period, then forcibly terminate whatever is still running.  A final pass
/// joins any debug-pump workers so their references are released.
pub fn cancel_plan(nodes: &mut [ExecContext]) {
    let mut sent_any = false;
    for node in nodes.iter() {
        if let Some(process) = &node.process
            && node.terminate_graceful
            && process.exit_code().is_none()
        {
            log::debug!("cancel: sending break to pid {}", process.pid());
            let _ = process.send_break();
            sent_any = true;
        }
    }
    if sent_any {
        thread::sleep(GRACE_PERIOD);
    }
    for node in nodes.iter() {
        if let Some(process) = &node.process
            && process.poll().is_none()
        {
            log::debug!("cancel: terminating pid {}", process.pid());
            let _ = process.kill();
        }
    }
    for node in nodes.iter_mut() {
        if let Some(pump) = node.debug_pump.take() {
            let _ = pump.join();
        }
    }
}

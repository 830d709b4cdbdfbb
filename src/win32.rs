#![allow(non_snake_case)]

use std::ffi::{OsStr, OsString};
use std::fs::File;
use std::io::{Error, Result};
use std::iter;
use std::mem;
use std::os::windows::ffi::{OsStrExt, OsStringExt};
use std::os::windows::io::{AsRawHandle, FromRawHandle, RawHandle};
use std::ptr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use winapi::shared::basetsd::SIZE_T;
use winapi::shared::minwindef::{BOOL, DWORD, FALSE, LPVOID, TRUE};
use winapi::shared::ntstatus::DBG_CONTINUE;
use winapi::shared::winerror::WAIT_TIMEOUT;
use winapi::um::handleapi::{CloseHandle, INVALID_HANDLE_VALUE};
use winapi::um::minwinbase::{DEBUG_EVENT, SECURITY_ATTRIBUTES};
use winapi::um::processthreadsapi::{
    GetProcessId, PROCESS_INFORMATION, STARTUPINFOW,
};
use winapi::um::winbase::{
    INFINITE, WAIT_ABANDONED, WAIT_ABANDONED_0, WAIT_FAILED, WAIT_OBJECT_0,
};
use winapi::um::wincon::INPUT_RECORD;
use winapi::um::winternl::{
    NtQueryInformationProcess, ProcessBasicInformation, ProcessWow64Information,
    PEB, PROCESS_BASIC_INFORMATION, RTL_USER_PROCESS_PARAMETERS,
};
use winapi::um::{
    consoleapi, debugapi, handleapi, memoryapi, namedpipeapi, processenv,
    processthreadsapi, shellapi, synchapi, wincon, wow64apiset,
};

pub use winapi::shared::winerror::ERROR_ELEVATION_REQUIRED;
pub use winapi::um::minwinbase::{
    CREATE_PROCESS_DEBUG_EVENT, EXIT_PROCESS_DEBUG_EVENT, LOAD_DLL_DEBUG_EVENT,
};
pub use winapi::um::winbase::{
    CREATE_NEW_CONSOLE, CREATE_NEW_PROCESS_GROUP, CREATE_UNICODE_ENVIRONMENT,
    DEBUG_ONLY_THIS_PROCESS, STARTF_USESTDHANDLES,
};
pub use winapi::um::wincon::{
    CTRL_BREAK_EVENT, ENABLE_ECHO_INPUT, ENABLE_LINE_INPUT, ENABLE_PROCESSED_INPUT,
    FOCUS_EVENT, KEY_EVENT, LEFT_CTRL_PRESSED, RIGHT_CTRL_PRESSED,
};

pub const STILL_ACTIVE: u32 = 259;
pub const HANDLE_FLAG_INHERIT: u32 = 1;
pub const NUL_DEVICE: &str = "nul";

#[derive(Debug)]
pub struct Handle(RawHandle);

unsafe impl Send for Handle {}
unsafe impl Sync for Handle {}

impl Drop for Handle {
    fn drop(&mut self) {
        unsafe {
            CloseHandle(self.as_raw_handle());
        }
    }
}

impl AsRawHandle for Handle {
    fn as_raw_handle(&self) -> RawHandle {
        self.0
    }
}

impl FromRawHandle for Handle {
    unsafe fn from_raw_handle(handle: RawHandle) -> Handle {
        Handle(handle)
    }
}

fn check(status: BOOL) -> Result<()> {
    if status != 0 {
        Ok(())
    } else {
        Err(Error::last_os_error())
    }
}

fn check_handle(raw_handle: RawHandle) -> Result<RawHandle> {
    if raw_handle != INVALID_HANDLE_VALUE && !raw_handle.is_null() {
        Ok(raw_handle)
    } else {
        Err(Error::last_os_error())
    }
}

// OsStr to zero-terminated owned vector
fn to_nullterm(s: &OsStr) -> Vec<u16> {
    s.encode_wide().chain(iter::once(0u16)).collect()
}

/// Create an anonymous byte-stream pipe with both ends inheritable.
///
/// Callers mark the parent-retained end non-inheritable with
/// `SetHandleInformation` before spawning a child.
pub fn CreatePipe() -> Result<(File, File)> {
    let mut sa = SECURITY_ATTRIBUTES {
        nLength: mem::size_of::<SECURITY_ATTRIBUTES>() as DWORD,
        lpSecurityDescriptor: ptr::null_mut(),
        bInheritHandle: TRUE,
    };
    let mut read: RawHandle = ptr::null_mut();
    let mut write: RawHandle = ptr::null_mut();
    check(unsafe {
        namedpipeapi::CreatePipe(&mut read, &mut write, &mut sa, 0)
    })?;
    Ok(unsafe { (File::from_raw_handle(read), File::from_raw_handle(write)) })
}

pub fn SetHandleInformation(handle: RawHandle, dwMask: u32, dwFlags: u32) -> Result<()> {
    check(unsafe { handleapi::SetHandleInformation(handle, dwMask, dwFlags) })
}

#[derive(Debug, Copy, Clone)]
pub enum StdStream {
    Input,
    Output,
    Error,
}

fn std_stream_id(which: StdStream) -> DWORD {
    use winapi::um::winbase::{STD_ERROR_HANDLE, STD_INPUT_HANDLE, STD_OUTPUT_HANDLE};
    match which {
        StdStream::Input => STD_INPUT_HANDLE,
        StdStream::Output => STD_OUTPUT_HANDLE,
        StdStream::Error => STD_ERROR_HANDLE,
    }
}

/// Read the current process-wide standard handle.  The returned value is
/// borrowed, not owned; it must not be closed through this function's result.
pub fn GetStdHandle(which: StdStream) -> Result<RawHandle> {
    check_handle(unsafe { processenv::GetStdHandle(std_stream_id(which)) })
}

pub fn SetStdHandle(which: StdStream, handle: RawHandle) -> Result<()> {
    check(unsafe { processenv::SetStdHandle(std_stream_id(which), handle) })
}

#[allow(clippy::too_many_arguments)]
pub fn CreateProcess(
    appname: Option<&OsStr>,
    cmdline: &OsStr,
    env_block: Option<&[u16]>,
    inherit_handles: bool,
    mut creation_flags: u32,
    stdin: Option<RawHandle>,
    stdout: Option<RawHandle>,
    stderr: Option<RawHandle>,
    sinfo_flags: u32,
) -> Result<(Handle, u64)> {
    let mut sinfo: STARTUPINFOW = unsafe { mem::zeroed() };
    sinfo.cb = mem::size_of::<STARTUPINFOW>() as DWORD;
    sinfo.hStdInput = stdin.unwrap_or(ptr::null_mut());
    sinfo.hStdOutput = stdout.unwrap_or(ptr::null_mut());
    sinfo.hStdError = stderr.unwrap_or(ptr::null_mut());
    sinfo.dwFlags = sinfo_flags;
    let mut pinfo: PROCESS_INFORMATION = unsafe { mem::zeroed() };
    let mut cmdline = to_nullterm(cmdline);
    let wc_appname = appname.map(to_nullterm);
    let env_block_ptr = env_block.map(|v| v.as_ptr()).unwrap_or(ptr::null()) as LPVOID;
    creation_flags |= CREATE_UNICODE_ENVIRONMENT;
    check(unsafe {
        processthreadsapi::CreateProcessW(
            wc_appname
                .as_ref()
                .map(|v| v.as_ptr())
                .unwrap_or(ptr::null()),
            cmdline.as_mut_ptr(),
            ptr::null_mut(),         // lpProcessAttributes
            ptr::null_mut(),         // lpThreadAttributes
            inherit_handles as BOOL, // bInheritHandles
            creation_flags,          // dwCreationFlags
            env_block_ptr,           // lpEnvironment
            ptr::null(),             // lpCurrentDirectory
            &mut sinfo,
            &mut pinfo,
        )
    })?;
    unsafe {
        drop(Handle::from_raw_handle(pinfo.hThread));
        Ok((
            Handle::from_raw_handle(pinfo.hProcess),
            pinfo.dwProcessId as u64,
        ))
    }
}

#[allow(clippy::upper_case_acronyms)]
pub enum WaitEvent {
    OBJECT_0,
    ABANDONED,
    TIMEOUT,
}

pub fn WaitForSingleObject(handle: &Handle, timeout: Option<Duration>) -> Result<WaitEvent> {
    let timeout_ms = timeout
        .map(|t| t.as_millis().min((INFINITE - 1) as u128) as u32)
        .unwrap_or(INFINITE);
    let result = unsafe { synchapi::WaitForSingleObject(handle.as_raw_handle(), timeout_ms) };
    if result == WAIT_OBJECT_0 {
        Ok(WaitEvent::OBJECT_0)
    } else if result == WAIT_ABANDONED {
        Ok(WaitEvent::ABANDONED)
    } else if result == WAIT_TIMEOUT {
        Ok(WaitEvent::TIMEOUT)
    } else if result == WAIT_FAILED {
        Err(Error::last_os_error())
    } else {
        panic!("WaitForSingleObject returned {}", result);
    }
}

pub enum WaitResult {
    Object(usize),
    Timeout,
}

/// Wait for any of the given handles, returning the index of the first
/// signaled one.
pub fn WaitForMultipleObjects(
    handles: &[RawHandle],
    timeout: Option<Duration>,
) -> Result<WaitResult> {
    assert!(handles.len() <= 64, "WaitForMultipleObjects: max 64 handles");
    let timeout_ms = timeout
        .map(|t| t.as_millis().min((INFINITE - 1) as u128) as u32)
        .unwrap_or(INFINITE);
    let result = unsafe {
        synchapi::WaitForMultipleObjects(
            handles.len() as DWORD,
            handles.as_ptr(),
            FALSE, // wait for any, not all
            timeout_ms,
        )
    };
    if result < WAIT_OBJECT_0 + handles.len() as u32 {
        Ok(WaitResult::Object((result - WAIT_OBJECT_0) as usize))
    } else if result >= WAIT_ABANDONED_0 && result < WAIT_ABANDONED_0 + handles.len() as u32 {
        // Treat abandoned mutex like signaled
        Ok(WaitResult::Object((result - WAIT_ABANDONED_0) as usize))
    } else if result == WAIT_TIMEOUT {
        Ok(WaitResult::Timeout)
    } else if result == WAIT_FAILED {
        Err(Error::last_os_error())
    } else {
        panic!("WaitForMultipleObjects returned unexpected value {}", result);
    }
}

pub fn GetExitCodeProcess(handle: &Handle) -> Result<u32> {
    let mut exit_code = 0u32;
    check(unsafe {
        processthreadsapi::GetExitCodeProcess(handle.as_raw_handle(), &mut exit_code)
    })?;
    Ok(exit_code)
}

pub fn TerminateProcess(handle: &Handle, exit_code: u32) -> Result<()> {
    check(unsafe { processthreadsapi::TerminateProcess(handle.as_raw_handle(), exit_code) })
}

/// Send CTRL_BREAK to the process group rooted at `pid`.  The target must
/// have been created with CREATE_NEW_PROCESS_GROUP.
pub fn GenerateConsoleCtrlEvent(pid: u32) -> Result<()> {
    check(unsafe { wincon::GenerateConsoleCtrlEvent(CTRL_BREAK_EVENT, pid) })
}

/// Create a manual-reset event, initially non-signaled.
pub fn CreateEvent() -> Result<Handle> {
    let handle = unsafe { synchapi::CreateEventW(ptr::null_mut(), TRUE, FALSE, ptr::null()) };
    check_handle(handle)?;
    Ok(unsafe { Handle::from_raw_handle(handle) })
}

pub fn SetEvent(event: &Handle) -> Result<()> {
    check(unsafe { synchapi::SetEvent(event.as_raw_handle()) })
}

pub fn ResetEvent(event: &Handle) -> Result<()> {
    check(unsafe { synchapi::ResetEvent(event.as_raw_handle()) })
}

pub fn GetConsoleMode(handle: RawHandle) -> Result<u32> {
    let mut mode = 0u32;
    check(unsafe { consoleapi::GetConsoleMode(handle, &mut mode) })?;
    Ok(mode)
}

pub fn SetConsoleMode(handle: RawHandle, mode: u32) -> Result<()> {
    check(unsafe { consoleapi::SetConsoleMode(handle, mode) })
}

/// Peek up to `max` pending console input records without consuming them.
pub fn PeekConsoleInput(handle: RawHandle, max: usize) -> Result<Vec<INPUT_RECORD>> {
    let mut records: Vec<INPUT_RECORD> = vec![unsafe { mem::zeroed() }; max];
    let mut fetched: DWORD = 0;
    check(unsafe {
        wincon::PeekConsoleInputW(handle, records.as_mut_ptr(), max as DWORD, &mut fetched)
    })?;
    records.truncate(fetched as usize);
    Ok(records)
}

/// Consume and discard up to `count` pending console input records.
pub fn DiscardConsoleInput(handle: RawHandle, count: usize) -> Result<()> {
    let mut records: Vec<INPUT_RECORD> = vec![unsafe { mem::zeroed() }; count];
    let mut fetched: DWORD = 0;
    check(unsafe {
        consoleapi::ReadConsoleInputW(handle, records.as_mut_ptr(), count as DWORD, &mut fetched)
    })?;
    Ok(())
}

static CANCEL_EVENT_RAW: AtomicUsize = AtomicUsize::new(0);

unsafe extern "system" fn ctrl_handler(ctrl_type: DWORD) -> BOOL {
    use winapi::um::wincon::CTRL_C_EVENT;
    if ctrl_type == CTRL_C_EVENT {
        let raw = CANCEL_EVENT_RAW.load(Ordering::Acquire);
        if raw != 0 {
            unsafe {
                synchapi::SetEvent(raw as RawHandle);
            }
            return TRUE;
        }
    }
    FALSE
}

/// Arm the shell's Ctrl-C handler: interrupts set `event` instead of killing
/// the process.
pub fn ArmCtrlHandler(event: &Handle) -> Result<()> {
    CANCEL_EVENT_RAW.store(event.as_raw_handle() as usize, Ordering::Release);
    check(unsafe { consoleapi::SetConsoleCtrlHandler(Some(ctrl_handler), TRUE) })
}

/// Remove the shell's Ctrl-C handler so a foreground child observes the
/// signal.  Re-armed by the redirection guard on revert.
pub fn DisarmCtrlHandler() -> Result<()> {
    check(unsafe { consoleapi::SetConsoleCtrlHandler(Some(ctrl_handler), FALSE) })
}

/// Re-install the Ctrl-C handler registered by [`ArmCtrlHandler`], keeping
/// the previously stored event.
pub fn RearmCtrlHandler() -> Result<()> {
    check(unsafe { consoleapi::SetConsoleCtrlHandler(Some(ctrl_handler), TRUE) })
}

/// Wait for the next debug event from any debuggee of the calling thread.
pub fn WaitForDebugEvent(timeout: Option<Duration>) -> Result<DEBUG_EVENT> {
    let timeout_ms = timeout
        .map(|t| t.as_millis().min((INFINITE - 1) as u128) as u32)
        .unwrap_or(INFINITE);
    let mut event: DEBUG_EVENT = unsafe { mem::zeroed() };
    check(unsafe { debugapi::WaitForDebugEvent(&mut event, timeout_ms) })?;
    Ok(event)
}

pub fn ContinueDebugEvent(pid: u32, tid: u32) -> Result<()> {
    check(unsafe { debugapi::ContinueDebugEvent(pid, tid, DBG_CONTINUE as DWORD) })
}

/// Close the file handles certain debug events carry, which would otherwise
/// leak in the debugger process.
pub fn CloseDebugEventHandles(event: &DEBUG_EVENT) {
    unsafe {
        match event.dwDebugEventCode {
            CREATE_PROCESS_DEBUG_EVENT => {
                let info = event.u.CreateProcessInfo();
                if !info.hFile.is_null() {
                    CloseHandle(info.hFile);
                }
            }
            LOAD_DLL_DEBUG_EVENT => {
                let info = event.u.LoadDll();
                if !info.hFile.is_null() {
                    CloseHandle(info.hFile);
                }
            }
            _ => {}
        }
    }
}

pub fn IsWow64Process(handle: RawHandle) -> Result<bool> {
    let mut wow64: BOOL = FALSE;
    check(unsafe { wow64apiset::IsWow64Process(handle, &mut wow64) })?;
    Ok(wow64 != FALSE)
}

fn check_status(status: i32) -> Result<()> {
    if status >= 0 {
        Ok(())
    } else {
        Err(Error::from_raw_os_error(status))
    }
}

/// Address of the native (64-bit on a 64-bit OS) PEB of the target process.
pub fn QueryPebAddress(handle: RawHandle) -> Result<usize> {
    let mut pbi: PROCESS_BASIC_INFORMATION = unsafe { mem::zeroed() };
    check_status(unsafe {
        NtQueryInformationProcess(
            handle,
            ProcessBasicInformation,
            &mut pbi as *mut _ as LPVOID,
            mem::size_of::<PROCESS_BASIC_INFORMATION>() as DWORD,
            ptr::null_mut(),
        )
    })?;
    Ok(pbi.PebBaseAddress as usize)
}

/// Address of the 32-bit PEB of a WOW64 target, or zero for a native target.
pub fn QueryWow64PebAddress(handle: RawHandle) -> Result<usize> {
    let mut peb32: usize = 0;
    check_status(unsafe {
        NtQueryInformationProcess(
            handle,
            ProcessWow64Information,
            &mut peb32 as *mut _ as LPVOID,
            mem::size_of::<usize>() as DWORD,
            ptr::null_mut(),
        )
    })?;
    Ok(peb32)
}

pub fn ReadProcessMemory(handle: RawHandle, address: usize, buf: &mut [u8]) -> Result<usize> {
    let mut copied: SIZE_T = 0;
    check(unsafe {
        memoryapi::ReadProcessMemory(
            handle,
            address as LPVOID,
            buf.as_mut_ptr() as LPVOID,
            buf.len() as SIZE_T,
            &mut copied,
        )
    })?;
    Ok(copied as usize)
}

/// Offset of the process-parameters pointer within the native PEB.
pub fn PebProcessParametersOffset() -> usize {
    // The winapi PEB definition is accurate through ProcessParameters, so the
    // field offset can be computed from a zeroed instance.
    let peb: PEB = unsafe { mem::zeroed() };
    let base = &peb as *const PEB as usize;
    let field = &peb.ProcessParameters as *const _ as usize;
    field - base
}

/// Offset of the environment-block pointer within the native
/// process-parameters block.  It sits directly past the fields winapi
/// declares.
pub fn ParamsEnvironmentOffset() -> usize {
    mem::size_of::<RTL_USER_PROCESS_PARAMETERS>()
}

// 32-bit process layouts, probed when the child runs under WOW64.
pub const PEB32_PROCESS_PARAMETERS_OFFSET: usize = 0x10;
pub const PARAMS32_ENVIRONMENT_OFFSET: usize = 0x48;

/// Launch through the shell association layer (ShellExecuteEx).  Used for
/// non-executable files, URL targets, and elevation fallback.  Returns the
/// process handle and pid when the launch produced a waitable process.
pub fn ShellExecute(file: &OsStr, params: Option<&OsStr>) -> Result<Option<(Handle, u64)>> {
    use winapi::um::shellapi::{SEE_MASK_NOCLOSEPROCESS, SHELLEXECUTEINFOW};
    let file = to_nullterm(file);
    let params = params.map(to_nullterm);
    let mut info: SHELLEXECUTEINFOW = unsafe { mem::zeroed() };
    info.cbSize = mem::size_of::<SHELLEXECUTEINFOW>() as DWORD;
    info.fMask = SEE_MASK_NOCLOSEPROCESS;
    info.lpFile = file.as_ptr();
    info.lpParameters = params.as_ref().map(|v| v.as_ptr()).unwrap_or(ptr::null());
    info.nShow = 1; // SW_SHOWNORMAL
    check(unsafe { shellapi::ShellExecuteExW(&mut info) })?;
    if info.hProcess.is_null() {
        return Ok(None);
    }
    let pid = unsafe { GetProcessId(info.hProcess) } as u64;
    Ok(Some((unsafe { Handle::from_raw_handle(info.hProcess) }, pid)))
}

/// Fetch the console alias definitions registered for `exe`, as
/// `(name, value)` pairs.
pub fn GetConsoleAliases(exe: &OsStr) -> Result<Vec<(OsString, OsString)>> {
    let mut exe = to_nullterm(exe);
    let len = unsafe { wincon::GetConsoleAliasesLengthW(exe.as_mut_ptr()) } as usize;
    if len == 0 {
        return Ok(Vec::new());
    }
    let mut buf: Vec<u16> = vec![0u16; len / 2 + 1];
    let copied = unsafe {
        wincon::GetConsoleAliasesW(buf.as_mut_ptr(), (buf.len() * 2) as DWORD, exe.as_mut_ptr())
    } as usize;
    if copied == 0 {
        return Err(Error::last_os_error());
    }
    let mut aliases = Vec::new();
    for entry in buf[..copied / 2].split(|&c| c == 0) {
        if entry.is_empty() {
            continue;
        }
        if let Some(eq) = entry.iter().position(|&c| c == '=' as u16) {
            aliases.push((
                OsString::from_wide(&entry[..eq]),
                OsString::from_wide(&entry[eq + 1..]),
            ));
        }
    }
    Ok(aliases)
}

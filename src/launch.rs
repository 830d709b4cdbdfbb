//! The process launcher.
//!
//! Turns one execution node into a running child process or an in-process
//! module invocation: builds the literal command line from the argument
//! vector, dispatches on the first argument's suffix, wires redirection for
//! the duration of process creation, and falls back to the shell-execute
//! association layer when direct creation is not possible.

use std::io;
use std::path::PathBuf;

use crate::plan::ExecContext;
use crate::redirect::{RedirectGuard, RedirectRequest, StdinRedirect};
use crate::registry::{self, BuiltinError};

/// Name of the interpreter that shell-script files are delegated to.
pub const SCRIPT_INTERPRETER: &str = "ys";

/// How a dispatched node ended up running.
#[derive(Debug)]
pub enum LaunchOutcome {
    /// The command completed synchronously in-process with this exit code.
    Ran(i32),
    /// A child process was created and recorded on the context.
    Child,
}

#[derive(Debug, PartialEq, Eq)]
enum FileKind {
    /// `.com`: candidate for in-process module loading.
    LoadableModule,
    /// Script suffix: re-delegate through the script interpreter.
    Script,
    /// Legacy batch suffix: re-delegate through the host interpreter.
    LegacyBatch,
    /// Directly creatable program image.
    Executable,
    /// URL or a data file: only the association layer can open it.
    ShellExec,
}

fn classify(name: &str) -> FileKind {
    if name.contains("://") {
        return FileKind::ShellExec;
    }
    let ext = match name.rfind('.') {
        Some(pos)
            if pos + 1 < name.len()
                && !name[pos + 1..].contains(std::path::MAIN_SEPARATOR)
                && !name[pos + 1..].contains('/') =>
        {
            Some(name[pos + 1..].to_ascii_lowercase())
        }
        _ => None,
    };
    match ext.as_deref() {
        Some("ys1") => FileKind::Script,
        _ => os::classify_ext(ext.as_deref()),
    }
}

/// Launch one node.  On return, either the command already completed
/// in-process (`Ran`) or `ctx.process` holds the live child (`Child`).
///
/// Failure leaves the context without a process; the walker reports the
/// error, closes the half-built pipe to the next node, and marks that node
/// as never-run.
pub fn launch(
    ctx: &mut ExecContext,
    mut next_stdin: Option<&mut StdinRedirect>,
) -> io::Result<LaunchOutcome> {
    let Some(name) = ctx.cmd.command_name().map(|n| n.into_owned()) else {
        return Err(io::Error::new(io::ErrorKind::InvalidInput, "empty command"));
    };

    match classify(&name) {
        FileKind::LoadableModule => {
            let path = PathBuf::from(&name);
            match registry::execute_module(ctx, &path, next_stdin.as_deref_mut()) {
                Ok(Some(code)) => return Ok(LaunchOutcome::Ran(code)),
                Ok(None) => {} // not a module; run it as a program
                Err(BuiltinError::Io(err)) => return Err(err),
                Err(BuiltinError::NotFound) => {}
            }
            launch_external(ctx, next_stdin)
        }
        FileKind::Script => {
            ctx.cmd
                .prepend([crate::args::CmdArg::new(SCRIPT_INTERPRETER)]);
            crate::resolve::resolve_command_path(&mut ctx.cmd);
            launch_external(ctx, next_stdin)
        }
        FileKind::LegacyBatch => {
            let interpreter = os::host_interpreter();
            // Synchronously waited batch delegation captures environment
            // changes the script makes; fire-and-forget runs do not.
            if ctx.wait {
                ctx.capture_env = true;
            }
            ctx.cmd.prepend(
                interpreter
                    .into_iter()
                    .map(crate::args::CmdArg::new)
                    .collect::<Vec<_>>(),
            );
            crate::resolve::resolve_command_path(&mut ctx.cmd);
            launch_external(ctx, next_stdin)
        }
        FileKind::ShellExec => shell_execute(ctx),
        FileKind::Executable => launch_external(ctx, next_stdin),
    }
}

/// Launch via the association layer.  Also the fallback when direct process
/// creation reports that elevation is required.
pub fn shell_execute(ctx: &mut ExecContext) -> io::Result<LaunchOutcome> {
    os::shell_execute(ctx)
}

fn launch_external(
    ctx: &mut ExecContext,
    next_stdin: Option<&mut StdinRedirect>,
) -> io::Result<LaunchOutcome> {
    let guard = RedirectGuard::install(RedirectRequest {
        stdin: &mut ctx.stdin,
        stdout: &mut ctx.stdout,
        stderr: &mut ctx.stderr,
        next_stdin,
        for_builtin: false,
    })
    .map_err(|err| {
        io::Error::new(
            err.kind(),
            format!("failed to initialize redirection: {}", err),
        )
    })?;

    let result = os::spawn(ctx);
    drop(guard);

    match result {
        Ok(()) => {
            log::debug!(
                "launched {} (pid {:?})",
                ctx.cmd.to_cmdline(),
                ctx.pid()
            );
            Ok(LaunchOutcome::Child)
        }
        Err(err) if os::is_elevation_required(&err) => {
            log::debug!("elevation required, retrying via shell-execute");
            shell_execute(ctx)
        }
        Err(err) => Err(err),
    }
}

#[cfg(unix)]
mod os {
    use super::*;
    use crate::posix;
    use crate::process::ChildProcess;
    use std::ffi::OsString;
    use std::io::Read;

    pub fn classify_ext(ext: Option<&str>) -> FileKind {
        match ext {
            Some("sh") => FileKind::LegacyBatch,
            _ => FileKind::Executable,
        }
    }

    pub fn host_interpreter() -> Vec<String> {
        vec!["sh".to_owned()]
    }

    pub fn is_elevation_required(_err: &io::Error) -> bool {
        false
    }

    fn read_exact_or_eof<const N: usize>(source: &mut std::fs::File) -> io::Result<Option<[u8; N]>> {
        let mut buf = [0u8; N];
        let mut total_read = 0;
        while total_read < N {
            let n = source.read(&mut buf[total_read..])?;
            if n == 0 {
                break;
            }
            total_read += n;
        }
        match total_read {
            0 => Ok(None),
            n if n == N => Ok(Some(buf)),
            _ => Err(io::ErrorKind::UnexpectedEof.into()),
        }
    }

    pub fn spawn(ctx: &mut ExecContext) -> io::Result<()> {
        let argv: Vec<OsString> = ctx
            .cmd
            .args
            .iter()
            .map(|arg| {
                if ctx.include_escapes {
                    OsString::from(arg.text.clone())
                } else {
                    OsString::from(arg.logical_text().into_owned())
                }
            })
            .collect();
        if argv.is_empty() {
            return Err(io::Error::new(io::ErrorKind::InvalidInput, "empty command"));
        }

        let exec_fail_pipe = posix::pipe()?;
        crate::redirect::set_inheritable(&exec_fail_pipe.0, false)?;
        crate::redirect::set_inheritable(&exec_fail_pipe.1, false)?;

        let pid;
        unsafe {
            match posix::fork()? {
                Some(child_pid) => {
                    pid = child_pid;
                }
                None => {
                    drop(exec_fail_pipe.0);
                    // The redirection guard already points fds 0-2 at the
                    // right places; they are inherited across fork.
                    let err = posix::reset_signals()
                        .and_then(|()| posix::setpgid(0, 0))
                        .map(|()| posix::execvp(&argv[0], &argv))
                        .unwrap_or_else(|setup_err| setup_err);
                    let error_code = err.raw_os_error().unwrap_or(-1) as u32;
                    use std::io::Write;
                    let mut write_end = exec_fail_pipe.1;
                    write_end.write_all(&error_code.to_le_bytes()).ok();
                    posix::hard_exit(127);
                }
            }
        }

        drop(exec_fail_pipe.1);
        let mut read_end = exec_fail_pipe.0;
        match read_exact_or_eof::<4>(&mut read_end)? {
            None => {
                ctx.process = Some(ChildProcess::new(pid, (), false));
                Ok(())
            }
            Some(error_buf) => {
                let error_code = u32::from_le_bytes(error_buf);
                Err(io::Error::from_raw_os_error(error_code as i32))
            }
        }
    }

    pub fn shell_execute(_ctx: &mut ExecContext) -> io::Result<LaunchOutcome> {
        // No association layer to delegate to on this platform.
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "no shell-execute handler for this target",
        ))
    }
}

#[cfg(windows)]
mod os {
    use super::*;
    use crate::process::{ChildProcess, ExtProcessState};
    use crate::state;
    use crate::win32;
    use std::collections::HashMap;
    use std::env;
    use std::ffi::{OsStr, OsString};
    use std::os::windows::ffi::{OsStrExt, OsStringExt};
    use std::sync::atomic::Ordering;
    use std::sync::mpsc;
    use std::sync::Arc;
    use std::thread;

    /// Ceiling on how much of a child's environment block is read back, and
    /// the step by which the request shrinks on partial-copy errors.
    const ENV_READ_CEILING: usize = 0x10000;
    const ENV_READ_STEP: usize = 0x1000;

    pub fn classify_ext(ext: Option<&str>) -> FileKind {
        match ext {
            Some("com") => FileKind::LoadableModule,
            Some("cmd") | Some("bat") => FileKind::LegacyBatch,
            Some("exe") => FileKind::Executable,
            None => FileKind::Executable,
            Some(_) => FileKind::ShellExec,
        }
    }

    pub fn host_interpreter() -> Vec<String> {
        let comspec = env::var("COMSPEC").unwrap_or_else(|_| "cmd.exe".to_owned());
        vec![comspec, "/c".to_owned()]
    }

    pub fn is_elevation_required(err: &io::Error) -> bool {
        err.raw_os_error() == Some(win32::ERROR_ELEVATION_REQUIRED as i32)
    }

    fn assemble_cmdline(ctx: &ExecContext) -> io::Result<OsString> {
        let mut cmdline = vec![];
        for (i, arg) in ctx.cmd.args.iter().enumerate() {
            if i > 0 {
                cmdline.push(' ' as u16);
            }
            let text = if ctx.include_escapes {
                arg.text.clone()
            } else {
                arg.logical_text().into_owned()
            };
            let os_text = OsString::from(text);
            if os_text.encode_wide().any(|c| c == 0) {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    "argument contains NUL",
                ));
            }
            append_quoted(&os_text, arg.quoted, &mut cmdline);
        }
        Ok(OsString::from_wide(&cmdline))
    }

    // Quoting per the CommandLineToArgvW convention.
    fn append_quoted(arg: &OsStr, force_quotes: bool, cmdline: &mut Vec<u16>) {
        if !force_quotes
            && !arg.is_empty()
            && !arg.encode_wide().any(|c| {
                c == ' ' as u16
                    || c == '\t' as u16
                    || c == '\n' as u16
                    || c == '\x0b' as u16
                    || c == '\"' as u16
            })
        {
            cmdline.extend(arg.encode_wide());
            return;
        }
        cmdline.push('"' as u16);

        let arg: Vec<_> = arg.encode_wide().collect();
        let mut i = 0;
        while i < arg.len() {
            let mut num_backslashes = 0;
            while i < arg.len() && arg[i] == '\\' as u16 {
                i += 1;
                num_backslashes += 1;
            }

            if i == arg.len() {
                for _ in 0..num_backslashes * 2 {
                    cmdline.push('\\' as u16);
                }
                break;
            } else if arg[i] == b'"' as u16 {
                for _ in 0..num_backslashes * 2 + 1 {
                    cmdline.push('\\' as u16);
                }
                cmdline.push(arg[i]);
            } else {
                for _ in 0..num_backslashes {
                    cmdline.push('\\' as u16);
                }
                cmdline.push(arg[i]);
            }
            i += 1;
        }
        cmdline.push('"' as u16);
    }

    fn current_std_handles() -> (
        Option<std::os::windows::io::RawHandle>,
        Option<std::os::windows::io::RawHandle>,
        Option<std::os::windows::io::RawHandle>,
    ) {
        (
            win32::GetStdHandle(win32::StdStream::Input).ok(),
            win32::GetStdHandle(win32::StdStream::Output).ok(),
            win32::GetStdHandle(win32::StdStream::Error).ok(),
        )
    }

    pub fn spawn(ctx: &mut ExecContext) -> io::Result<()> {
        let cmdline = assemble_cmdline(ctx)?;
        let mut flags = win32::CREATE_NEW_PROCESS_GROUP;
        if ctx.new_console {
            flags |= win32::CREATE_NEW_CONSOLE;
        }

        // Environment capture requires launching the child as a debuggee,
        // and only the creating thread can pump its debug events, so the
        // pump thread owns process creation.  An unwaited child never has
        // its environment captured; the wait flag wins.
        if ctx.capture_env && ctx.wait {
            return spawn_debugged(ctx, cmdline, flags);
        }

        let (stdin, stdout, stderr) = current_std_handles();
        let (handle, pid) = win32::CreateProcess(
            None,
            &cmdline,
            None,
            true,
            flags,
            stdin,
            stdout,
            stderr,
            win32::STARTF_USESTDHANDLES,
        )?;
        ctx.process = Some(ChildProcess::new(
            pid as u32,
            ExtProcessState(handle),
            false,
        ));
        Ok(())
    }

    fn spawn_debugged(ctx: &mut ExecContext, cmdline: OsString, flags: u32) -> io::Result<()> {
        let armed = Arc::clone(&ctx.env_capture_armed);
        armed.store(true, Ordering::SeqCst);
        let (tx, rx) = mpsc::channel::<io::Result<ChildProcess>>();
        let interpreter_exe = ctx
            .cmd
            .command_name()
            .map(|n| n.into_owned())
            .unwrap_or_default();

        let pump = thread::Builder::new()
            .name("debug-pump".into())
            .spawn(move || {
                let (stdin, stdout, stderr) = current_std_handles();
                let created = win32::CreateProcess(
                    None,
                    &cmdline,
                    None,
                    true,
                    flags | win32::DEBUG_ONLY_THIS_PROCESS,
                    stdin,
                    stdout,
                    stderr,
                    win32::STARTF_USESTDHANDLES,
                );
                let process = match created {
                    Ok((handle, pid)) => {
                        let p = ChildProcess::new(pid as u32, ExtProcessState(handle), false);
                        let _ = tx.send(Ok(p.clone()));
                        p
                    }
                    Err(err) => {
                        let _ = tx.send(Err(err));
                        return;
                    }
                };
                pump_debug_events(&process, &armed, &interpreter_exe);
            })
            .map_err(io::Error::other)?;

        match rx.recv() {
            Ok(Ok(process)) => {
                ctx.process = Some(process);
                ctx.debug_pump = Some(pump);
                Ok(())
            }
            Ok(Err(err)) => {
                let _ = pump.join();
                Err(err)
            }
            Err(_) => {
                let _ = pump.join();
                Err(io::Error::other("debug pump exited before launch"))
            }
        }
    }

    /// Acknowledge debug events until the child exits, then read its
    /// environment and alias state back into the shell.
    fn pump_debug_events(
        process: &ChildProcess,
        armed: &std::sync::atomic::AtomicBool,
        interpreter_exe: &str,
    ) {
        let aliases_before = win32::GetConsoleAliases(OsStr::new(interpreter_exe))
            .unwrap_or_default();
        loop {
            let event = match win32::WaitForDebugEvent(None) {
                Ok(event) => event,
                Err(_) => return,
            };
            win32::CloseDebugEventHandles(&event);
            let exited = event.dwDebugEventCode == win32::EXIT_PROCESS_DEBUG_EVENT
                && event.dwProcessId == process.pid();
            if exited {
                // The user may have backgrounded the task mid-run; the
                // armed flag is the tie-breaker.
                if armed.load(Ordering::SeqCst) {
                    if let Some(env) = capture_environment(process) {
                        apply_environment(env);
                    }
                    merge_alias_changes(interpreter_exe, &aliases_before);
                }
                let _ = win32::ContinueDebugEvent(event.dwProcessId, event.dwThreadId);
                return;
            }
            let _ = win32::ContinueDebugEvent(event.dwProcessId, event.dwThreadId);
        }
    }

    fn read_remote_ptr(handle: std::os::windows::io::RawHandle, address: usize, wide: bool)
        -> Option<usize>
    {
        if wide {
            let mut buf = [0u8; 8];
            win32::ReadProcessMemory(handle, address, &mut buf).ok()?;
            Some(u64::from_le_bytes(buf) as usize)
        } else {
            let mut buf = [0u8; 4];
            win32::ReadProcessMemory(handle, address, &mut buf).ok()?;
            Some(u32::from_le_bytes(buf) as usize)
        }
    }

    /// Walk the child's PEB to its environment block and read it out,
    /// probing the child's bitness to pick the right layout.
    fn capture_environment(process: &ChildProcess) -> Option<Vec<(OsString, OsString)>> {
        let handle = process.raw_handle();
        let wow64 = win32::IsWow64Process(handle).unwrap_or(false);

        let env_address = if wow64 {
            let peb32 = win32::QueryWow64PebAddress(handle).ok()?;
            if peb32 == 0 {
                return None;
            }
            let params =
                read_remote_ptr(handle, peb32 + win32::PEB32_PROCESS_PARAMETERS_OFFSET, false)?;
            read_remote_ptr(handle, params + win32::PARAMS32_ENVIRONMENT_OFFSET, false)?
        } else {
            let peb = win32::QueryPebAddress(handle).ok()?;
            let params =
                read_remote_ptr(handle, peb + win32::PebProcessParametersOffset(), true)?;
            read_remote_ptr(handle, params + win32::ParamsEnvironmentOffset(), true)?
        };
        if env_address == 0 {
            return None;
        }

        // The block's size is unknown; read up to the ceiling and shrink a
        // page at a time while the copy faults.
        let mut request = ENV_READ_CEILING;
        let mut block = Vec::new();
        while request >= ENV_READ_STEP {
            let mut buf = vec![0u8; request];
            match win32::ReadProcessMemory(handle, env_address, &mut buf) {
                Ok(copied) => {
                    buf.truncate(copied);
                    block = buf;
                    break;
                }
                Err(_) => request -= ENV_READ_STEP,
            }
        }
        if block.is_empty() {
            return None;
        }
        validate_environment_block(&block)
    }

    /// Parse and validate an environment block, preferring the native wide
    /// encoding and falling back to an ANSI interpretation for children of
    /// the earliest OS generation.
    fn validate_environment_block(block: &[u8]) -> Option<Vec<(OsString, OsString)>> {
        let wide: Vec<u16> = block
            .chunks_exact(2)
            .map(|c| u16::from_le_bytes([c[0], c[1]]))
            .collect();
        let parsed = parse_env_entries(&wide);
        if !parsed.is_empty() {
            return Some(parsed);
        }
        let ansi: Vec<u16> = block.iter().map(|&b| b as u16).collect();
        let parsed = parse_env_entries(&ansi);
        if parsed.is_empty() { None } else { Some(parsed) }
    }

    fn parse_env_entries(wide: &[u16]) -> Vec<(OsString, OsString)> {
        let mut entries = Vec::new();
        for entry in wide.split(|&c| c == 0) {
            if entry.is_empty() {
                break;
            }
            // A variable name cannot start with '='; such entries are drive
            // state, kept as-is.
            let Some(eq) = entry.iter().skip(1).position(|&c| c == '=' as u16) else {
                return Vec::new();
            };
            let eq = eq + 1;
            if entry.iter().any(|&c| c == 0xFFFF) {
                return Vec::new();
            }
            entries.push((
                OsString::from_wide(&entry[..eq]),
                OsString::from_wide(&entry[eq + 1..]),
            ));
        }
        entries
    }

    /// Replace the calling process's environment with the captured one.
    fn apply_environment(env: Vec<(OsString, OsString)>) {
        let new: HashMap<OsString, OsString> = env.into_iter().collect();
        for (key, _) in env::vars_os() {
            if !new.contains_key(&key) {
                unsafe { env::remove_var(&key) };
            }
        }
        for (key, value) in &new {
            unsafe { env::set_var(key, value) };
        }
        log::debug!("applied captured environment ({} entries)", new.len());
    }

    /// Fold console-alias changes made by the delegated interpreter into the
    /// shell's alias table.
    fn merge_alias_changes(interpreter_exe: &str, before: &[(OsString, OsString)]) {
        let Ok(after) = win32::GetConsoleAliases(OsStr::new(interpreter_exe)) else {
            return;
        };
        for (name, value) in after {
            let unchanged = before
                .iter()
                .any(|(n, v)| n == &name && v == &value);
            if !unchanged {
                let name = name.to_string_lossy().to_ascii_lowercase();
                let value = value.to_string_lossy().into_owned();
                state::with(|st| st.aliases.insert(name, value));
            }
        }
    }

    pub fn shell_execute(ctx: &mut ExecContext) -> io::Result<LaunchOutcome> {
        let file = ctx
            .cmd
            .command_name()
            .map(|n| n.into_owned())
            .unwrap_or_default();
        let params: Vec<String> = ctx.cmd.args[1..]
            .iter()
            .map(|a| a.logical_text().into_owned())
            .collect();
        let params = params.join(" ");
        let params = if params.is_empty() {
            None
        } else {
            Some(OsString::from(params))
        };

        match win32::ShellExecute(OsStr::new(&file), params.as_deref())? {
            Some((handle, pid)) => {
                ctx.process = Some(ChildProcess::new(
                    pid as u32,
                    ExtProcessState(handle),
                    false,
                ));
                Ok(LaunchOutcome::Child)
            }
            None => Ok(LaunchOutcome::Ran(0)),
        }
    }
}

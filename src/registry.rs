//! The built-in registry and module loader.
//!
//! Built-ins are named functions invoked in-process under the same
//! redirection contract as an external program.  Some are linked into the
//! shell, some are exported by dynamically loaded modules.  Registrations
//! form a LIFO list so that a module which registers, runs, and unregisters
//! shadows older registrations for the duration; loaded modules are
//! reference counted so a built-in may unregister itself mid-call without
//! unloading the code it is executing from.

use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use libloading::Library;

use crate::args::CmdContext;
use crate::buffer::OutputBuffer;
use crate::plan::ExecContext;
use crate::redirect::{RedirectGuard, RedirectRequest, StdinRedirect, StdoutRedirect};
use crate::state;

/// Character type of the loadable-module ABI: arguments are null-terminated
/// logical strings in the platform's native encoding.
#[cfg(windows)]
pub type NativeChar = u16;
#[cfg(not(windows))]
pub type NativeChar = std::os::raw::c_char;

/// A built-in linked into the shell.
pub type BuiltinFn = fn(&CmdContext) -> i32;

/// The entry point a loadable built-in module exports.
pub type ModuleEntryFn =
    unsafe extern "C" fn(argc: u32, argv: *const *const NativeChar) -> u32;

/// Fixed export name of a loadable module's entry point.
pub const MODULE_ENTRY_POINT: &[u8] = b"YoriMain\0";

/// A dynamically loaded module hosting one or more built-ins.  Unloading
/// happens when the last `Arc` drops, which the registry's explicit
/// reference counting delays past every registration and in-flight call.
pub struct LoadedModule {
    pub path: PathBuf,
    lib: Library,
}

impl LoadedModule {
    pub fn entry(&self) -> Option<ModuleEntryFn> {
        unsafe {
            self.lib
                .get::<ModuleEntryFn>(MODULE_ENTRY_POINT)
                .ok()
                .map(|sym| *sym)
        }
    }
}

impl std::fmt::Debug for LoadedModule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoadedModule")
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}

#[derive(Clone, Copy)]
pub enum BuiltinKind {
    Native(BuiltinFn),
    Foreign(ModuleEntryFn),
}

impl PartialEq for BuiltinKind {
    fn eq(&self, other: &BuiltinKind) -> bool {
        match (self, other) {
            (BuiltinKind::Native(a), BuiltinKind::Native(b)) => *a as usize == *b as usize,
            (BuiltinKind::Foreign(a), BuiltinKind::Foreign(b)) => *a as usize == *b as usize,
            _ => false,
        }
    }
}

impl std::fmt::Debug for BuiltinKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BuiltinKind::Native(_) => f.write_str("Native"),
            BuiltinKind::Foreign(_) => f.write_str("Foreign"),
        }
    }
}

/// One registry entry: a name, the function, and the module whose lifetime
/// must cover the registration.
#[derive(Debug)]
pub struct BuiltinCallback {
    name: String,
    kind: BuiltinKind,
    module: Option<Arc<LoadedModule>>,
}

struct ModuleSlot {
    module: Arc<LoadedModule>,
    refs: usize,
}

/// Process-global name-to-function table plus the loaded-module list and the
/// active-module pointer.  Owned by the shell state singleton.
#[derive(Default)]
pub struct Registry {
    callbacks: Vec<BuiltinCallback>,
    modules: Vec<ModuleSlot>,
    active: Option<Arc<LoadedModule>>,
}

impl Registry {
    /// Register `name`, shadowing any earlier registration of the same name.
    /// A registration performed while a module-hosted command runs is
    /// attributed to that module, which keeps the module loaded until the
    /// registration is removed.
    pub fn register(&mut self, name: &str, kind: BuiltinKind) {
        let module = self.active.clone();
        if let Some(m) = &module {
            self.retain_module_arc(m);
        }
        log::debug!("registering builtin {}", name);
        self.callbacks.insert(
            0,
            BuiltinCallback {
                name: name.to_ascii_uppercase(),
                kind,
                module,
            },
        );
    }

    /// Remove the most recent registration matching `name` and `kind`.
    /// Returns false if none matched.
    pub fn unregister(&mut self, name: &str, kind: BuiltinKind) -> bool {
        let upper = name.to_ascii_uppercase();
        let Some(idx) = self
            .callbacks
            .iter()
            .position(|cb| cb.name == upper && cb.kind == kind)
        else {
            return false;
        };
        let cb = self.callbacks.remove(idx);
        if let Some(m) = cb.module {
            self.release_module(&m);
        }
        true
    }

    /// First-match lookup by case-insensitive name, falling back to the
    /// statically linked `YoriCmd_<UPPERNAME>` table.
    pub fn resolve(&self, name: &str) -> Option<(BuiltinKind, Option<Arc<LoadedModule>>)> {
        let upper = name.to_ascii_uppercase();
        if let Some(cb) = self.callbacks.iter().find(|cb| cb.name == upper) {
            return Some((cb.kind, cb.module.clone()));
        }
        crate::cmds::lookup_static(&upper).map(|f| (BuiltinKind::Native(f), None))
    }

    /// Load the module at `path`, or bump the reference count of an already
    /// loaded one.
    pub fn load_module(&mut self, path: &Path) -> io::Result<Arc<LoadedModule>> {
        if let Some(slot) = self.modules.iter_mut().find(|s| s.module.path == path) {
            slot.refs += 1;
            return Ok(Arc::clone(&slot.module));
        }
        let lib = unsafe { Library::new(path) }.map_err(io::Error::other)?;
        log::debug!("loaded module {}", path.display());
        let module = Arc::new(LoadedModule {
            path: path.to_owned(),
            lib,
        });
        self.modules.push(ModuleSlot {
            module: Arc::clone(&module),
            refs: 1,
        });
        Ok(module)
    }

    /// Add a reference to an already loaded module, e.g. for the duration of
    /// an invocation of one of its built-ins.
    pub fn retain_module(&mut self, module: &Arc<LoadedModule>) {
        self.retain_module_arc(module);
    }

    fn retain_module_arc(&mut self, module: &Arc<LoadedModule>) {
        if let Some(slot) = self
            .modules
            .iter_mut()
            .find(|s| Arc::ptr_eq(&s.module, module))
        {
            slot.refs += 1;
        } else {
            self.modules.push(ModuleSlot {
                module: Arc::clone(module),
                refs: 1,
            });
        }
    }

    /// Drop a reference; the module's entry leaves the list at zero.  The
    /// library itself unloads once the last `Arc` clone drops, which may be
    /// after an in-flight invocation returns.
    pub fn release_module(&mut self, module: &Arc<LoadedModule>) {
        if let Some(idx) = self
            .modules
            .iter()
            .position(|s| Arc::ptr_eq(&s.module, module))
        {
            self.modules[idx].refs -= 1;
            if self.modules[idx].refs == 0 {
                let slot = self.modules.remove(idx);
                log::debug!("unloading module {}", slot.module.path.display());
            }
        }
    }

    /// Swap the active-module pointer, returning the previous value so a
    /// nested invocation can restore it.
    pub fn set_active(&mut self, module: Option<Arc<LoadedModule>>) -> Option<Arc<LoadedModule>> {
        std::mem::replace(&mut self.active, module)
    }

    pub fn loaded_module_count(&self) -> usize {
        self.modules.len()
    }

    pub fn callback_count(&self) -> usize {
        self.callbacks.len()
    }

    /// Drop every registration, releasing hosting modules.  Called at
    /// shutdown; afterwards the module list should be empty.
    pub fn clear(&mut self) {
        while let Some(cb) = self.callbacks.pop() {
            if let Some(m) = cb.module {
                self.release_module(&m);
            }
        }
        if !self.modules.is_empty() {
            log::warn!(
                "{} loaded modules still referenced at shutdown",
                self.modules.len()
            );
            self.modules.clear();
        }
    }
}

/// Outcome classification for built-in dispatch.
#[derive(Debug)]
pub enum BuiltinError {
    /// The name resolves to no registered or statically linked built-in.
    NotFound,
    Io(io::Error),
}

impl From<io::Error> for BuiltinError {
    fn from(err: io::Error) -> BuiltinError {
        BuiltinError::Io(err)
    }
}

impl std::fmt::Display for BuiltinError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BuiltinError::NotFound => f.write_str("unrecognized command"),
            BuiltinError::Io(err) => std::fmt::Display::fmt(err, f),
        }
    }
}

impl std::error::Error for BuiltinError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            BuiltinError::NotFound => None,
            BuiltinError::Io(err) => Some(err),
        }
    }
}

/// Invoke a built-in synchronously in-process.
///
/// Only one built-in runs at a time on the shell thread; the registry lock
/// is never held across the call, so the built-in is free to register or
/// unregister names, including its own.
pub fn invoke_builtin(
    ctx: &mut ExecContext,
    mut next_stdin: Option<&mut StdinRedirect>,
) -> Result<i32, BuiltinError> {
    // Pipes between concurrently running built-ins are not supported; the
    // output is captured and re-streamed into the next command instead.
    let forward = matches!(ctx.stdout, StdoutRedirect::Pipe);
    if forward {
        ctx.stdout = StdoutRedirect::Buffer(None);
    }

    ctx.cmd.remove_escapes();
    let name = ctx
        .cmd
        .command_name()
        .map(|n| n.into_owned())
        .ok_or(BuiltinError::NotFound)?;

    let (kind, module) =
        state::with(|st| st.registry.resolve(&name)).ok_or(BuiltinError::NotFound)?;

    let guard = RedirectGuard::install(RedirectRequest {
        stdin: &mut ctx.stdin,
        stdout: &mut ctx.stdout,
        stderr: &mut ctx.stderr,
        next_stdin: next_stdin.as_deref_mut(),
        for_builtin: true,
    })?;

    let prev_active = if let Some(m) = &module {
        state::with(|st| {
            st.registry.retain_module(m);
            st.registry.set_active(Some(Arc::clone(m)))
        })
    } else {
        None
    };

    let code = match kind {
        BuiltinKind::Native(f) => f(&ctx.cmd),
        BuiltinKind::Foreign(entry) => call_foreign(entry, &ctx.cmd),
    };

    if let Some(m) = &module {
        state::with(|st| {
            st.registry.set_active(prev_active);
            st.registry.release_module(m);
        });
    }

    drop(guard);

    // Give the captured output somewhere to go, or make sure it is complete
    // before anyone reads it.
    if forward {
        if let (Some(buf), Some(next)) = (ctx.stdout.buffer().cloned(), next_stdin) {
            *next = StdinRedirect::Pipe(Some(buf.forward_to_next()?));
        }
        // The forwarded buffer now belongs to the consumer's stdin; the
        // node reverts to its pipe designation so the walker does not chain
        // further capture into it.
        ctx.stdout = StdoutRedirect::Pipe;
    } else {
        finalize_buffers(ctx.stdout.buffer(), ctx.stderr.buffer());
    }

    Ok(code)
}

fn call_foreign(entry: ModuleEntryFn, cmd: &CmdContext) -> i32 {
    let storage: Vec<Vec<NativeChar>> = cmd
        .args
        .iter()
        .map(|arg| encode_native(&arg.logical_text()))
        .collect();
    let argv: Vec<*const NativeChar> = storage.iter().map(|s| s.as_ptr()).collect();
    // The entry point must not retain the argument pointers past the call;
    // that is the module ABI contract.
    let rc = unsafe { entry(argv.len() as u32, argv.as_ptr()) };
    rc as i32
}

#[cfg(windows)]
fn encode_native(s: &str) -> Vec<NativeChar> {
    s.encode_utf16().chain(std::iter::once(0)).collect()
}

#[cfg(not(windows))]
fn encode_native(s: &str) -> Vec<NativeChar> {
    s.bytes()
        .filter(|&b| b != 0)
        .map(|b| b as NativeChar)
        .chain(std::iter::once(0))
        .collect()
}

/// Load the module at `path` and run its entry point as a command.  This is
/// the `.com` in-process dispatch path; `Ok(None)` means the file is not a
/// loadable module and the caller should launch it as an external program.
pub fn execute_module(
    ctx: &mut ExecContext,
    path: &Path,
    mut next_stdin: Option<&mut StdinRedirect>,
) -> Result<Option<i32>, BuiltinError> {
    let module = match state::with(|st| st.registry.load_module(path)) {
        Ok(m) => m,
        Err(_) => return Ok(None),
    };
    let Some(entry) = module.entry() else {
        state::with(|st| st.registry.release_module(&module));
        return Ok(None);
    };

    let forward = matches!(ctx.stdout, StdoutRedirect::Pipe);
    if forward {
        ctx.stdout = StdoutRedirect::Buffer(None);
    }

    ctx.cmd.remove_escapes();
    let guard = RedirectGuard::install(RedirectRequest {
        stdin: &mut ctx.stdin,
        stdout: &mut ctx.stdout,
        stderr: &mut ctx.stderr,
        next_stdin: next_stdin.as_deref_mut(),
        for_builtin: true,
    })?;

    let prev_active = state::with(|st| st.registry.set_active(Some(Arc::clone(&module))));
    let code = call_foreign(entry, &ctx.cmd);
    state::with(|st| {
        st.registry.set_active(prev_active);
        st.registry.release_module(&module);
    });
    drop(guard);

    if forward {
        if let (Some(buf), Some(next)) = (ctx.stdout.buffer().cloned(), next_stdin) {
            *next = StdinRedirect::Pipe(Some(buf.forward_to_next()?));
        }
        ctx.stdout = StdoutRedirect::Pipe;
    } else {
        finalize_buffers(ctx.stdout.buffer(), ctx.stderr.buffer());
    }
    Ok(Some(code))
}

/// Finalize any buffers attached to a completed command so their contents
/// are safe to read.
pub fn finalize_buffers(stdout: Option<&OutputBuffer>, stderr: Option<&OutputBuffer>) {
    if let Some(buf) = stdout {
        buf.wait_eof();
    }
    if let Some(buf) = stderr {
        buf.wait_eof();
    }
}

//! Top-level entry points: evaluate an expression string, or run one
//! through the registry path only.  These are also the callbacks a loadable
//! module uses to re-enter the shell.

use crate::expand;
use crate::parse;
use crate::plan::ExecPlan;
use crate::registry::{self, BuiltinError, BuiltinKind};
use crate::state;

/// Evaluate a full expression: back-quote substitution, environment
/// expansion, re-parse, plan, walk.
///
/// Per-node failures are reported on standard error and surface through the
/// error level; only an expression that parses to nothing returns false.
pub fn execute_expression(expr: &str) -> bool {
    if state::init().is_err() {
        return false;
    }
    state::cancel_event().reset();

    let expanded = expand::expand_backquotes(expr);
    let mut ctx = parse::parse_cmdline(&expanded, 0);
    expand::expand_env(&mut ctx);
    if ctx.is_empty() {
        return false;
    }
    let mut plan = ExecPlan::from_context(&ctx, &expanded);
    if plan.command_count() == 0 {
        return false;
    }
    crate::plan::execute_plan(&mut plan, false);
    true
}

/// Evaluate an expression through the built-in registry only: no path
/// resolution and no external process lookup.  Used by loadable modules to
/// invoke shell functionality by name.
pub fn execute_builtin_string(expr: &str) -> bool {
    if state::init().is_err() {
        return false;
    }
    let mut ctx = parse::parse_cmdline(expr, 0);
    expand::expand_env(&mut ctx);
    if ctx.is_empty() {
        return false;
    }
    let mut plan = ExecPlan::from_context(&ctx, expr);
    if plan.command_count() != 1 {
        eprintln!("ysh: builtin expression must be a single command");
        return false;
    }
    let mut node = plan.nodes.remove(0);
    match registry::invoke_builtin(&mut node, None) {
        Ok(code) => {
            state::set_error_level(code);
            true
        }
        Err(BuiltinError::NotFound) => {
            let name = node
                .cmd
                .command_name()
                .map(|n| n.into_owned())
                .unwrap_or_default();
            eprintln!("Unrecognized command: {}", name);
            state::set_error_level(1);
            false
        }
        Err(BuiltinError::Io(err)) => {
            eprintln!("ysh: failed to initialize redirection: {}", err);
            state::set_error_level(1);
            false
        }
    }
}

/// Register a built-in under `name`.  When called from inside a dynamically
/// loaded command, the registration is attributed to that module and keeps
/// it loaded.
pub fn register_builtin(name: &str, func: crate::registry::BuiltinFn) {
    state::with(|st| st.registry.register(name, BuiltinKind::Native(func)));
}

/// Remove the most recent registration of `name` with `func`.  Safe to call
/// from inside the registered function itself.
pub fn unregister_builtin(name: &str, func: crate::registry::BuiltinFn) -> bool {
    state::with(|st| st.registry.unregister(name, BuiltinKind::Native(func)))
}

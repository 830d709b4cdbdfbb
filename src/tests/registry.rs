use std::sync::atomic::{AtomicUsize, Ordering};

use super::common;
use crate::args::{CmdArg, CmdContext};
use crate::plan::ExecContext;
use crate::registry::{invoke_builtin, BuiltinError, BuiltinKind};
use crate::state;

fn context_for(words: &[&str]) -> ExecContext {
    let args = words.iter().map(|w| CmdArg::new(*w)).collect();
    ExecContext::new(CmdContext::new(args))
}

fn resolve_kind(name: &str) -> Option<BuiltinKind> {
    state::with(|st| st.registry.resolve(name)).map(|(kind, _)| kind)
}

#[test]
fn static_builtins_resolve_by_convention() {
    assert!(resolve_kind("ECHO").is_some());
    assert!(resolve_kind("echo").is_some());
    assert!(resolve_kind("TrUe").is_some());
    assert!(resolve_kind("no_such_command_zz").is_none());
}

#[test]
fn registration_shadows_and_unregistration_unshadows() {
    fn first(_: &CmdContext) -> i32 {
        11
    }
    fn second(_: &CmdContext) -> i32 {
        22
    }

    let _lock = common::engine_lock();
    crate::shell::register_builtin("shadow_test", first);
    crate::shell::register_builtin("shadow_test", second);

    let kind = resolve_kind("shadow_test").unwrap();
    assert!(kind == BuiltinKind::Native(second));

    assert!(crate::shell::unregister_builtin("shadow_test", second));
    let kind = resolve_kind("shadow_test").unwrap();
    assert!(kind == BuiltinKind::Native(first));

    assert!(crate::shell::unregister_builtin("shadow_test", first));
    assert!(resolve_kind("shadow_test").is_none());
}

#[test]
fn unregister_requires_matching_function() {
    fn registered(_: &CmdContext) -> i32 {
        0
    }
    fn other(_: &CmdContext) -> i32 {
        0
    }

    let _lock = common::engine_lock();
    crate::shell::register_builtin("match_test", registered);
    assert!(!crate::shell::unregister_builtin("match_test", other));
    assert!(crate::shell::unregister_builtin("match_test", registered));
}

static TRANSIENT_CALLS: AtomicUsize = AtomicUsize::new(0);

fn transient(_: &CmdContext) -> i32 {
    TRANSIENT_CALLS.fetch_add(1, Ordering::SeqCst);
    // A built-in may deregister itself while it is on the stack.
    assert!(crate::shell::unregister_builtin("transient_test", transient));
    7
}

#[test]
fn builtin_may_unregister_itself_mid_call() {
    let _lock = common::engine_lock();
    crate::shell::register_builtin("transient_test", transient);

    let mut ctx = context_for(&["transient_test"]);
    let code = invoke_builtin(&mut ctx, None).unwrap();
    assert_eq!(code, 7);
    assert_eq!(TRANSIENT_CALLS.load(Ordering::SeqCst), 1);

    let mut ctx = context_for(&["transient_test"]);
    assert!(matches!(
        invoke_builtin(&mut ctx, None),
        Err(BuiltinError::NotFound)
    ));
}

#[test]
fn invoke_strips_escapes_from_arguments() {
    fn probe(cmd: &CmdContext) -> i32 {
        assert_eq!(cmd.args[1].text, "a|b");
        assert!(!cmd.args[1].has_escapes);
        0
    }

    let _lock = common::engine_lock();
    crate::shell::register_builtin("escape_probe", probe);
    let mut ctx = context_for(&["escape_probe"]);
    let mut escaped = CmdArg::new("a^|b");
    escaped.has_escapes = true;
    ctx.cmd.args.push(escaped);
    assert_eq!(invoke_builtin(&mut ctx, None).unwrap(), 0);
    assert!(crate::shell::unregister_builtin("escape_probe", probe));
}

#[test]
fn execute_builtin_string_sets_error_level() {
    fn fixed_code(_: &CmdContext) -> i32 {
        42
    }

    let _lock = common::engine_lock();
    crate::shell::register_builtin("code_test", fixed_code);
    assert!(crate::execute_builtin_string("code_test"));
    assert_eq!(state::error_level(), 42);
    assert!(crate::shell::unregister_builtin("code_test", fixed_code));
}

#[test]
fn execute_builtin_string_rejects_unknown_names() {
    let _lock = common::engine_lock();
    assert!(!crate::execute_builtin_string("definitely_not_registered_zz"));
    assert_eq!(state::error_level(), 1);
}

#[test]
fn shutdown_releases_every_registration() {
    fn nop(_: &CmdContext) -> i32 {
        0
    }

    let _lock = common::engine_lock();
    crate::shell::register_builtin("shutdown_probe", nop);
    state::shutdown();
    // The state rebuilds lazily; the old registration is gone and no module
    // references survived teardown.
    assert!(resolve_kind("shutdown_probe").is_none());
    assert_eq!(state::with(|st| st.registry.loaded_module_count()), 0);
}

#[test]
fn no_modules_remain_after_native_churn() {
    fn nop(_: &CmdContext) -> i32 {
        0
    }

    let _lock = common::engine_lock();
    crate::shell::register_builtin("churn_test", nop);
    assert!(crate::shell::unregister_builtin("churn_test", nop));
    assert_eq!(state::with(|st| st.registry.loaded_module_count()), 0);
}

use super::common;
use crate::parse::parse_cmdline;
use crate::plan::{ChainCondition, ExecPlan};
use crate::redirect::{StderrRedirect, StdinRedirect, StdoutRedirect};

fn build(expr: &str) -> ExecPlan {
    let ctx = parse_cmdline(expr, 0);
    ExecPlan::from_context(&ctx, expr)
}

#[test]
fn single_command_plan() {
    let plan = build("prog arg1 arg2");
    assert_eq!(plan.command_count(), 1);
    assert!(plan.wait);
    assert_eq!(plan.nodes[0].cmd.arg_count(), 3);
    assert_eq!(plan.nodes[0].chain, ChainCondition::Always);
}

#[test]
fn pipe_connects_and_does_not_wait_producer() {
    let plan = build("a | b");
    assert_eq!(plan.command_count(), 2);
    assert!(matches!(plan.nodes[0].stdout, StdoutRedirect::Pipe));
    assert!(!plan.nodes[0].wait);
    assert_eq!(plan.nodes[1].chain, ChainCondition::Concurrent);
    // The plan as a whole waits on the consumer.
    assert!(plan.wait);
}

#[test]
fn conditional_operators_set_chaining() {
    let plan = build("a && b || c");
    assert_eq!(plan.command_count(), 3);
    assert_eq!(plan.nodes[1].chain, ChainCondition::OnSuccess);
    assert_eq!(plan.nodes[2].chain, ChainCondition::OnFailure);
}

#[test]
fn trailing_ampersand_clears_plan_wait() {
    let plan = build("a & b &");
    assert_eq!(plan.command_count(), 2);
    assert!(!plan.nodes[0].wait);
    assert!(!plan.nodes[1].wait);
    assert!(!plan.wait);
}

#[test]
fn quiet_background_suppresses_notification() {
    let plan = build("a &!& b");
    assert!(!plan.nodes[0].wait);
    assert!(plan.nodes[0].suppress_completion_notify);
    assert!(!plan.nodes[1].suppress_completion_notify);
}

#[test]
fn redirection_operators_fold_into_node() {
    let plan = build("prog < in.txt > out.txt 2>> err.txt");
    assert_eq!(plan.command_count(), 1);
    let node = &plan.nodes[0];
    assert!(matches!(node.stdin, StdinRedirect::File(ref p) if p.ends_with("in.txt")));
    assert!(matches!(node.stdout, StdoutRedirect::OverwriteFile(ref p) if p.ends_with("out.txt")));
    assert!(matches!(node.stderr, StderrRedirect::AppendFile(ref p) if p.ends_with("err.txt")));
    assert_eq!(node.cmd.arg_count(), 1);
}

#[test]
fn merge_and_null_redirections() {
    let plan = build(&format!("prog 2>&1 > {}", crate::redirect::NULL_DEVICE));
    let node = &plan.nodes[0];
    assert!(matches!(node.stderr, StderrRedirect::MergeToStdout));
    assert!(matches!(node.stdout, StdoutRedirect::Null));
}

#[test]
fn quoted_operator_stays_an_argument() {
    let plan = build("echo \"&&\" done");
    assert_eq!(plan.command_count(), 1);
    assert_eq!(plan.nodes[0].cmd.arg_count(), 3);
}

#[test]
fn append_redirection() {
    let plan = build("prog >> log.txt");
    assert!(matches!(
        plan.nodes[0].stdout,
        StdoutRedirect::AppendFile(_)
    ));
}

#[test]
fn coerce_capture_buffers_default_output_and_waits() {
    let mut plan = build("a | b & c");
    plan.coerce_capture();
    // Pipe plumbing stays; default outputs become buffers; nothing is left
    // unwaited.
    assert!(matches!(plan.nodes[0].stdout, StdoutRedirect::Pipe));
    assert!(matches!(plan.nodes[1].stdout, StdoutRedirect::Buffer(None)));
    assert!(matches!(plan.nodes[2].stdout, StdoutRedirect::Buffer(None)));
    assert!(plan.nodes.iter().all(|n| n.wait));
    assert!(plan.wait);
}

// Walker behavior, exercised hermetically through the BUILTIN bypass so no
// path resolution or external processes are involved.

#[test]
fn walks_sequential_captures_in_order() {
    let _lock = common::engine_lock();
    let (out, code) = common::run_captured("BUILTIN echo one && BUILTIN echo two");
    assert_eq!(out, "one\ntwo\n");
    assert_eq!(code, 0);
}

#[test]
fn on_success_skips_after_failure() {
    let _lock = common::engine_lock();
    let (out, code) = common::run_captured("BUILTIN false && BUILTIN echo skipped");
    assert_eq!(out, "");
    assert_eq!(code, 1);
}

#[test]
fn on_failure_runs_after_failure() {
    let _lock = common::engine_lock();
    let (out, code) = common::run_captured("BUILTIN false || BUILTIN echo rescue");
    assert_eq!(out, "rescue\n");
    assert_eq!(code, 0);
}

#[test]
fn and_after_skipped_group_is_skipped() {
    let _lock = common::engine_lock();
    let (out, code) = common::run_captured(
        "BUILTIN false && BUILTIN echo a && BUILTIN echo b || BUILTIN echo c",
    );
    assert_eq!(out, "c\n");
    assert_eq!(code, 0);
}

#[test]
fn success_chain_runs_both_sides() {
    let _lock = common::engine_lock();
    let (out, code) = common::run_captured("BUILTIN true && BUILTIN echo ran || BUILTIN echo not");
    assert_eq!(out, "ran\n");
    assert_eq!(code, 0);
}

#[test]
fn unknown_builtin_reports_and_fails() {
    let _lock = common::engine_lock();
    let (out, code) = common::run_captured("BUILTIN nosuchthing");
    assert_eq!(out, "");
    assert_eq!(code, 1);
}

#[test]
fn exit_code_of_last_node_wins() {
    let _lock = common::engine_lock();
    let (_, code) = common::run_captured("BUILTIN true && BUILTIN false");
    assert_eq!(code, 1);
}

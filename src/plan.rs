//! Execution plans: the node list a parsed command turns into, and the walk
//! that runs it.
//!
//! A plan is a forward-only sequence of execution contexts.  Each node
//! carries the condition under which it runs relative to its predecessor's
//! exit status; pipe and buffer plumbing between adjacent nodes is created
//! as the walk reaches them.

use std::env;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::thread::JoinHandle;

use crate::args::{CmdArg, CmdContext};
use crate::expand;
use crate::launch::{self, LaunchOutcome};
use crate::process::ChildProcess;
use crate::redirect::{is_null_device, StderrRedirect, StdinRedirect, StdoutRedirect};
use crate::registry::{self, BuiltinError};
use crate::resolve;
use crate::state;
use crate::wait::{self, WaitOutcome};

/// Flag the peer interpreter recognizes as "execute this expression and
/// exit", used for subshell delegation.
pub const SUBSHELL_FLAG: &str = "/ss";

/// Condition under which a node runs, relative to the error level its
/// predecessors left behind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ChainCondition {
    #[default]
    Always,
    /// Run only when the error level is zero (`&&`).
    OnSuccess,
    /// Run only when the error level is non-zero (`||`).
    OnFailure,
    /// Run regardless, launched while the predecessor may still be running
    /// (`|`, `&`).
    Concurrent,
    /// Never run; set when the predecessor failed to launch.
    Never,
}

/// Runtime state for a single command node.
#[derive(Debug)]
pub struct ExecContext {
    pub cmd: CmdContext,
    pub stdin: StdinRedirect,
    pub stdout: StdoutRedirect,
    pub stderr: StderrRedirect,

    /// Wait for the command to finish before advancing.
    pub wait: bool,
    /// Launch on a fresh console.
    pub new_console: bool,
    /// Launch as a debuggee and apply its final environment to the shell.
    pub capture_env: bool,
    /// Pass escape characters through to the external command line.
    pub include_escapes: bool,
    /// Do not raise the task-completed indicator for this node.
    pub suppress_completion_notify: bool,
    /// Eligible for a controlled break before forceful termination.
    pub terminate_graceful: bool,
    /// Set by the wait loop when completion should be announced.
    pub completion_notify: bool,

    pub chain: ChainCondition,

    pub process: Option<ChildProcess>,
    pub debug_pump: Option<JoinHandle<()>>,
    /// Shared with the debug pump; cleared when the task is sent to the
    /// background so a stale capture is not applied.
    pub env_capture_armed: Arc<AtomicBool>,
}

impl ExecContext {
    pub fn new(cmd: CmdContext) -> ExecContext {
        ExecContext {
            cmd,
            stdin: StdinRedirect::Inherit,
            stdout: StdoutRedirect::Inherit,
            stderr: StderrRedirect::Inherit,
            wait: true,
            new_console: false,
            capture_env: false,
            include_escapes: false,
            suppress_completion_notify: false,
            terminate_graceful: true,
            completion_notify: false,
            chain: ChainCondition::Always,
            process: None,
            debug_pump: None,
            env_capture_armed: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn pid(&self) -> Option<u32> {
        self.process.as_ref().map(ChildProcess::pid)
    }
}

/// A full execution plan: the node list, the flat expression it came from
/// (kept for subshell delegation), and the top-level wait flag.
#[derive(Debug)]
pub struct ExecPlan {
    pub nodes: Vec<ExecContext>,
    pub command_string: String,
    pub wait: bool,
}

impl ExecPlan {
    /// Build a plan from a parsed command context.  Unquoted, unescaped
    /// operator arguments split the context into nodes and set their
    /// chaining; redirection operators fold into the surrounding node.
    pub fn from_context(ctx: &CmdContext, source: &str) -> ExecPlan {
        let mut nodes: Vec<ExecContext> = Vec::new();
        let mut current = ExecContext::new(CmdContext::default());
        let mut args = ctx.args.iter().peekable();

        fn take_filename(args: &mut std::iter::Peekable<std::slice::Iter<CmdArg>>) -> Option<String> {
            args.next().map(|a| a.logical_text().into_owned())
        }

        while let Some(arg) = args.next() {
            if arg.is_operator_candidate() {
                match arg.text.as_str() {
                    "|" => {
                        current.stdout = StdoutRedirect::Pipe;
                        current.wait = false;
                        nodes.push(std::mem::replace(
                            &mut current,
                            ExecContext::new(CmdContext::default()),
                        ));
                        current.chain = ChainCondition::Concurrent;
                        continue;
                    }
                    "&&" | "||" => {
                        let chain = if arg.text == "&&" {
                            ChainCondition::OnSuccess
                        } else {
                            ChainCondition::OnFailure
                        };
                        nodes.push(std::mem::replace(
                            &mut current,
                            ExecContext::new(CmdContext::default()),
                        ));
                        current.chain = chain;
                        continue;
                    }
                    "&" | "&!&" => {
                        current.wait = false;
                        if arg.text == "&!&" {
                            current.suppress_completion_notify = true;
                        }
                        nodes.push(std::mem::replace(
                            &mut current,
                            ExecContext::new(CmdContext::default()),
                        ));
                        current.chain = ChainCondition::Concurrent;
                        continue;
                    }
                    "<" => {
                        if let Some(path) = take_filename(&mut args) {
                            current.stdin = if is_null_device(&path) {
                                StdinRedirect::Null
                            } else {
                                StdinRedirect::File(path.into())
                            };
                        }
                        continue;
                    }
                    ">" | ">>" => {
                        if let Some(path) = take_filename(&mut args) {
                            current.stdout = if is_null_device(&path) {
                                StdoutRedirect::Null
                            } else if arg.text == ">" {
                                StdoutRedirect::OverwriteFile(path.into())
                            } else {
                                StdoutRedirect::AppendFile(path.into())
                            };
                        }
                        continue;
                    }
                    "2>" | "2>>" => {
                        if let Some(path) = take_filename(&mut args) {
                            current.stderr = if is_null_device(&path) {
                                StderrRedirect::Null
                            } else if arg.text == "2>" {
                                StderrRedirect::OverwriteFile(path.into())
                            } else {
                                StderrRedirect::AppendFile(path.into())
                            };
                        }
                        continue;
                    }
                    "2>&1" => {
                        current.stderr = StderrRedirect::MergeToStdout;
                        continue;
                    }
                    _ => {}
                }
            }
            current.cmd.args.push(arg.clone());
        }
        if !current.cmd.is_empty() {
            nodes.push(current);
        }

        let wait = nodes.last().map(|n| n.wait).unwrap_or(true);
        ExecPlan {
            nodes,
            command_string: source.to_owned(),
            wait,
        }
    }

    pub fn command_count(&self) -> usize {
        self.nodes.len()
    }

    /// Force every default-output node to capture into a shell buffer and to
    /// be waited on.  Back-quote expansion runs plans through this so the
    /// inner command's output is always collected.
    pub fn coerce_capture(&mut self) {
        for node in &mut self.nodes {
            if matches!(node.stdout, StdoutRedirect::Inherit) {
                node.stdout = StdoutRedirect::Buffer(None);
            }
            if !node.wait {
                node.wait = true;
            }
        }
        if let Some(last) = self.nodes.last() {
            self.wait = last.wait;
        }
    }
}

/// Delegate an entire expression to a subshell: re-invoke this interpreter
/// with the single-statement flag and do not wait.  Preserves start-now,
/// return-immediately semantics for compound non-waiting expressions.
fn delegate_to_subshell(command_string: &str) -> bool {
    let Ok(exe) = env::current_exe() else {
        return false;
    };
    let mut expr = CmdArg::new(command_string);
    expr.quoted = true;
    let cmd = CmdContext::new(vec![
        CmdArg::new(exe.to_string_lossy().into_owned()),
        CmdArg::new(SUBSHELL_FLAG),
        expr,
    ]);
    let mut node = ExecContext::new(cmd);
    node.wait = false;
    match launch::launch(&mut node, None) {
        Ok(LaunchOutcome::Child) => {
            if let Some(process) = node.process.take() {
                let cmdline = command_string.to_owned();
                state::with(|st| st.jobs.add(process, cmdline));
            }
            true
        }
        Ok(LaunchOutcome::Ran(_)) => true,
        Err(err) => {
            eprintln!("ysh: failed to start subshell: {}", err);
            false
        }
    }
}

/// Walk the plan, launching each runnable node and chaining on exit status.
/// Publishes every node's status to the shell's error level.  When
/// `want_buffer` is set, returns the final node's capture buffer for
/// back-quote substitution.
pub fn execute_plan(plan: &mut ExecPlan, want_buffer: bool) -> Option<crate::buffer::OutputBuffer> {
    // A compound expression that should not be waited on cannot be walked
    // here without waiting; hand the whole thing to a subshell.
    if !want_buffer && plan.command_count() > 1 && !plan.wait {
        if delegate_to_subshell(&plan.command_string) {
            state::set_error_level(0);
        } else {
            state::set_error_level(1);
        }
        return None;
    }

    let cancel = state::cancel_event();
    let mut prev_buffer: Option<crate::buffer::OutputBuffer> = None;
    let mut last_buffer: Option<crate::buffer::OutputBuffer> = None;
    let mut skipping_group = false;
    let mut cancelled = false;
    let count = plan.nodes.len();

    for i in 0..count {
        if cancel.is_set() {
            cancelled = true;
            break;
        }

        let error_level = state::error_level();
        let run = match plan.nodes[i].chain {
            ChainCondition::Always => true,
            ChainCondition::OnSuccess => error_level == 0,
            ChainCondition::OnFailure => error_level != 0,
            // A concurrent node belongs to the same group as its
            // predecessor: it launches iff the predecessor did.
            ChainCondition::Concurrent => !skipping_group,
            ChainCondition::Never => false,
        };
        match plan.nodes[i].chain {
            ChainCondition::Always => skipping_group = false,
            ChainCondition::OnSuccess | ChainCondition::OnFailure => skipping_group = !run,
            ChainCondition::Concurrent | ChainCondition::Never => {}
        }
        if !run || plan.nodes[i].cmd.is_empty() {
            continue;
        }

        // A second buffer-capturing node reuses the previous buffer in
        // append mode, so sequential captures accumulate.
        if plan.nodes[i].wait
            && prev_buffer.is_some()
            && let StdoutRedirect::Buffer(slot) = &mut plan.nodes[i].stdout
            && slot.is_none()
        {
            *slot = prev_buffer.clone();
        }

        expand::expand_alias(&mut plan.nodes[i].cmd);

        let (status, node_cancelled) = run_node(plan, i, want_buffer);
        state::set_error_level(status);

        let node = &plan.nodes[i];
        if let Some(buf) = node.stdout.buffer() {
            prev_buffer = Some(buf.clone());
            last_buffer = Some(buf.clone());
        }
        if node.completion_notify {
            log::info!("task completed: {}", node.cmd.to_cmdline());
        }
        if node_cancelled {
            cancelled = true;
            break;
        }
    }

    if cancelled || cancel.is_set() {
        wait::cancel_plan(&mut plan.nodes);
        state::set_error_level(1);
    }

    last_buffer
}

/// How a node's dispatch ended, before any waiting.
enum Disposition {
    /// Ran to completion in-process with this code.
    Done(i32),
    /// A live child is recorded on the node.
    Live,
    /// Resolution failed for a single non-waited command; hand the whole
    /// expression to a subshell.
    Delegate,
}

/// Dispatch and run a single node, returning its exit status and whether
/// cancellation was observed while waiting on it.
fn run_node(plan: &mut ExecPlan, i: usize, want_buffer: bool) -> (i32, bool) {
    let single_command = plan.command_count() == 1;
    let plan_wait = plan.wait;
    let command_string = plan.command_string.clone();

    let (left, right) = plan.nodes.split_at_mut(i + 1);
    let node = &mut left[i];
    let next_stdin = right.first_mut().map(|n| &mut n.stdin);

    let Some(first) = node.cmd.command_name().map(|n| n.into_owned()) else {
        return (1, false);
    };

    let dispatch: Result<Disposition, String> = (|| {
        let node = &mut *node;
        // URL targets go straight to the association layer.
        if first.contains("://") {
            return match launch::shell_execute(node) {
                Ok(LaunchOutcome::Ran(code)) => Ok(Disposition::Done(code)),
                Ok(LaunchOutcome::Child) => Ok(Disposition::Live),
                Err(err) => Err(format!("ysh: {}: {}", first, err)),
            };
        }
        // The BUILTIN literal bypasses path resolution entirely.
        if first.eq_ignore_ascii_case("BUILTIN") && node.cmd.arg_count() > 1 {
            node.cmd.shift(1);
            return builtin_disposition(node, next_stdin);
        }
        if resolve::resolve_command_path(&mut node.cmd) {
            match launch::launch(node, next_stdin) {
                Ok(LaunchOutcome::Ran(code)) => Ok(Disposition::Done(code)),
                Ok(LaunchOutcome::Child) => Ok(Disposition::Live),
                Err(err) => Err(format!("ysh: {}: {}", first, err)),
            }
        } else if single_command && !plan_wait && !want_buffer {
            // Not on the path, but a single non-waited command may still be
            // something the subshell can start.
            Ok(Disposition::Delegate)
        } else {
            builtin_disposition(node, next_stdin)
        }
    })();

    match dispatch {
        Ok(Disposition::Done(code)) => (code, false),
        Ok(Disposition::Live) => finish_child(node),
        Ok(Disposition::Delegate) => {
            let ok = delegate_to_subshell(&command_string);
            (if ok { 0 } else { 1 }, false)
        }
        Err(message) => {
            eprintln!("{}", message);
            fail_next(right);
            (1, false)
        }
    }
}

fn builtin_disposition(
    node: &mut ExecContext,
    next_stdin: Option<&mut StdinRedirect>,
) -> Result<Disposition, String> {
    match registry::invoke_builtin(node, next_stdin) {
        Ok(code) => Ok(Disposition::Done(code)),
        Err(BuiltinError::NotFound) => {
            let name = node
                .cmd
                .command_name()
                .map(|n| n.into_owned())
                .unwrap_or_default();
            Err(format!("Unrecognized command: {}", name))
        }
        Err(BuiltinError::Io(err)) => {
            Err(format!("ysh: failed to initialize redirection: {}", err))
        }
    }
}

/// A child is live on the node: wait for it, background it, or track it.
fn finish_child(node: &mut ExecContext) -> (i32, bool) {
    if !node.wait {
        if let Some(process) = node.process.take() {
            let cmdline = node.cmd.to_cmdline();
            state::with(|st| st.jobs.add(process, cmdline));
        }
        return (0, false);
    }
    let cancel = state::cancel_event();
    match wait::wait_for_completion(node, &cancel) {
        WaitOutcome::Completed(code) => (code, false),
        WaitOutcome::Backgrounded => {
            if let Some(process) = node.process.take() {
                let cmdline = node.cmd.to_cmdline();
                state::with(|st| st.jobs.add(process, cmdline));
            }
            (0, false)
        }
        WaitOutcome::Cancelled => (1, true),
    }
}

/// After a launch failure, close the half-built pipe into the following
/// node and mark it never-run.
fn fail_next(rest: &mut [ExecContext]) {
    if let Some(next) = rest.first_mut() {
        if matches!(next.stdin, StdinRedirect::Pipe(_)) {
            next.stdin = StdinRedirect::Inherit;
        }
        next.chain = ChainCondition::Never;
    }
}

use std::fs;
use std::io::Write;
use std::time::{Duration, Instant};

use super::common::{self, run_captured};
use crate::parse::parse_cmdline;
use crate::plan::{execute_plan, ExecPlan};
use crate::state;

fn run(expr: &str) -> i32 {
    let ctx = parse_cmdline(expr, 0);
    let mut plan = ExecPlan::from_context(&ctx, expr);
    execute_plan(&mut plan, false);
    state::error_level()
}

#[test]
fn captures_external_stdout() {
    let _lock = common::engine_lock();
    let (out, code) = run_captured("echo hello");
    assert_eq!(out, "hello\n");
    assert_eq!(code, 0);
}

#[test]
fn ordered_conditional_output() {
    let _lock = common::engine_lock();
    let (out, code) = run_captured("echo one && echo two");
    assert_eq!(out, "one\ntwo\n");
    assert_eq!(code, 0);
}

#[test]
fn nonzero_exit_blocks_on_success_chain() {
    let _lock = common::engine_lock();
    let (out, code) = run_captured("sh -c \"exit 1\" && echo skipped");
    assert_eq!(out, "");
    assert_eq!(code, 1);
}

#[test]
fn child_exit_code_is_published() {
    let _lock = common::engine_lock();
    let (_, code) = run_captured("sh -c \"exit 13\"");
    assert_eq!(code, 13);
}

#[test]
fn pipeline_delivers_bytes_in_order() {
    let _lock = common::engine_lock();
    let (out, code) = run_captured("echo a | wc -l");
    assert_eq!(out.trim(), "1");
    assert_eq!(code, 0);
}

#[test]
fn builtin_pipes_into_external_consumer() {
    let _lock = common::engine_lock();
    // The producer is a built-in: its output is captured and re-streamed
    // into the external consumer's stdin.
    let (out, code) = run_captured("BUILTIN echo counted line | wc -l");
    assert_eq!(out.trim(), "1");
    assert_eq!(code, 0);
}

#[test]
fn redirects_output_to_file() {
    let _lock = common::engine_lock();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("out.txt");
    let code = run(&format!("echo data > {}", path.display()));
    assert_eq!(code, 0);
    assert_eq!(fs::read_to_string(&path).unwrap(), "data\n");
}

#[test]
fn reads_stdin_from_file() {
    let _lock = common::engine_lock();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("in.txt");
    let mut f = fs::File::create(&path).unwrap();
    f.write_all(b"from file\n").unwrap();
    drop(f);

    let (out, code) = run_captured(&format!("cat < {}", path.display()));
    assert_eq!(out, "from file\n");
    assert_eq!(code, 0);
}

#[test]
fn stderr_redirects_to_its_own_file() {
    let _lock = common::engine_lock();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("err.txt");
    let code = run(&format!(
        "sh -c \"echo oops >&2\" 2> {}",
        path.display()
    ));
    assert_eq!(code, 0);
    assert_eq!(fs::read_to_string(&path).unwrap(), "oops\n");
}

#[test]
fn null_redirection_discards_output() {
    let _lock = common::engine_lock();
    let code = run("echo discarded > /dev/null");
    assert_eq!(code, 0);
}

#[test]
fn unresolvable_command_reports_failure() {
    let _lock = common::engine_lock();
    let (out, code) = run_captured("no_such_program_zzz_12345");
    assert_eq!(out, "");
    assert_eq!(code, 1);
}

#[test]
fn cancellation_terminates_within_grace() {
    let _lock = common::engine_lock();
    let cancel = state::cancel_event();
    cancel.reset();

    let setter = {
        let cancel = cancel.clone();
        std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(150));
            cancel.set();
        })
    };

    let started = Instant::now();
    let code = run("sleep 10");
    let elapsed = started.elapsed();
    setter.join().unwrap();
    cancel.reset();

    assert_eq!(code, 1);
    assert!(
        elapsed < Duration::from_secs(3),
        "cancellation took {:?}",
        elapsed
    );
}

#[test]
fn background_command_transfers_to_job_tracker() {
    let _lock = common::engine_lock();
    let before = state::with_jobs(|jobs| jobs.len());
    let code = run("sleep 0.2 &");
    assert_eq!(code, 0);
    assert_eq!(state::with_jobs(|jobs| jobs.len()), before + 1);

    // The job finishes on its own and is reaped, not killed.
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        let reaped = state::with_jobs(|jobs| jobs.reap());
        if !reaped.is_empty() {
            assert!(reaped.iter().any(|(_, cmd, code)| {
                cmd.contains("sleep") && *code == 0
            }));
            break;
        }
        assert!(Instant::now() < deadline, "background job never finished");
        std::thread::sleep(Duration::from_millis(20));
    }
}

#[test]
fn standard_fds_survive_a_full_plan() {
    use std::mem::MaybeUninit;

    fn fd_identity(fd: i32) -> (u64, u64) {
        let mut stat = MaybeUninit::<libc::stat>::uninit();
        let rc = unsafe { libc::fstat(fd, stat.as_mut_ptr()) };
        assert_eq!(rc, 0);
        let stat = unsafe { stat.assume_init() };
        (stat.st_dev as u64, stat.st_ino as u64)
    }

    let _lock = common::engine_lock();
    let before: Vec<_> = (0..3).map(fd_identity).collect();

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("o.txt");
    run(&format!("echo x > {} && cat < {}", path.display(), path.display()));
    let _ = run_captured("echo piped | wc -c");

    let after: Vec<_> = (0..3).map(fd_identity).collect();
    assert_eq!(before, after);
}

#[test]
fn append_redirection_accumulates() {
    let _lock = common::engine_lock();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("log.txt");
    run(&format!("echo first >> {}", path.display()));
    run(&format!("echo second >> {}", path.display()));
    assert_eq!(
        fs::read_to_string(&path).unwrap(),
        "first\nsecond\n"
    );
}

#[test]
fn backquote_with_external_command() {
    let _lock = common::engine_lock();
    let expanded = crate::expand::expand_backquotes("pre `echo mid` post");
    assert_eq!(expanded, "pre mid post");
}

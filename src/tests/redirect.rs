use std::fs;
use std::io::Write;

use super::common;
use crate::redirect::{
    RedirectGuard, RedirectRequest, StderrRedirect, StdinRedirect, StdoutRedirect,
};

fn install(
    stdin: &mut StdinRedirect,
    stdout: &mut StdoutRedirect,
    stderr: &mut StderrRedirect,
) -> RedirectGuard {
    RedirectGuard::install(RedirectRequest {
        stdin,
        stdout,
        stderr,
        next_stdin: None,
        for_builtin: true,
    })
    .unwrap()
}

#[test]
fn overwrite_redirects_and_restores() {
    let _lock = common::engine_lock();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("out.txt");

    let mut stdin = StdinRedirect::Inherit;
    let mut stdout = StdoutRedirect::OverwriteFile(path.clone());
    let mut stderr = StderrRedirect::Inherit;
    {
        let guard = install(&mut stdin, &mut stdout, &mut stderr);
        let mut out = std::io::stdout();
        out.write_all(b"redirected line\n").unwrap();
        out.flush().unwrap();
        drop(guard);
    }
    assert_eq!(fs::read_to_string(&path).unwrap(), "redirected line\n");

    // After revert, writing again must not touch the file.
    let mut out = std::io::stdout();
    out.write_all(b"").unwrap();
    out.flush().unwrap();
    assert_eq!(fs::read_to_string(&path).unwrap(), "redirected line\n");
}

#[test]
fn append_accumulates_across_scopes() {
    let _lock = common::engine_lock();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("log.txt");

    for chunk in ["first\n", "second\n"] {
        let mut stdin = StdinRedirect::Inherit;
        let mut stdout = StdoutRedirect::AppendFile(path.clone());
        let mut stderr = StderrRedirect::Inherit;
        let guard = install(&mut stdin, &mut stdout, &mut stderr);
        let mut out = std::io::stdout();
        out.write_all(chunk.as_bytes()).unwrap();
        out.flush().unwrap();
        drop(guard);
    }
    assert_eq!(fs::read_to_string(&path).unwrap(), "first\nsecond\n");
}

#[test]
fn overwrite_truncates_previous_contents() {
    let _lock = common::engine_lock();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("out.txt");
    fs::write(&path, "stale contents that should disappear").unwrap();

    let mut stdin = StdinRedirect::Inherit;
    let mut stdout = StdoutRedirect::OverwriteFile(path.clone());
    let mut stderr = StderrRedirect::Inherit;
    let guard = install(&mut stdin, &mut stdout, &mut stderr);
    let mut out = std::io::stdout();
    out.write_all(b"new").unwrap();
    out.flush().unwrap();
    drop(guard);

    assert_eq!(fs::read_to_string(&path).unwrap(), "new");
}

#[test]
fn stderr_merge_lands_in_stdout_target() {
    let _lock = common::engine_lock();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("both.txt");

    let mut stdin = StdinRedirect::Inherit;
    let mut stdout = StdoutRedirect::OverwriteFile(path.clone());
    let mut stderr = StderrRedirect::MergeToStdout;
    let guard = install(&mut stdin, &mut stdout, &mut stderr);
    {
        let mut out = std::io::stdout();
        out.write_all(b"out;").unwrap();
        out.flush().unwrap();
        let mut err = std::io::stderr();
        err.write_all(b"err;").unwrap();
        err.flush().unwrap();
    }
    drop(guard);

    assert_eq!(fs::read_to_string(&path).unwrap(), "out;err;");
}

#[test]
fn buffer_sink_captures_stdout() {
    let _lock = common::engine_lock();
    let mut stdin = StdinRedirect::Inherit;
    let mut stdout = StdoutRedirect::Buffer(None);
    let mut stderr = StderrRedirect::Inherit;
    let guard = install(&mut stdin, &mut stdout, &mut stderr);
    {
        let mut out = std::io::stdout();
        out.write_all(b"captured").unwrap();
        out.flush().unwrap();
    }
    drop(guard);

    let buffer = stdout.buffer().unwrap();
    buffer.wait_eof();
    assert_eq!(buffer.contents_string(), "captured");
}

#[test]
fn pipe_source_is_consumed_on_install() {
    let _lock = common::engine_lock();
    let (read, write) = crate::buffer::make_pipe().unwrap();
    drop(write);
    let mut stdin = StdinRedirect::Pipe(Some(read));
    let mut stdout = StdoutRedirect::Inherit;
    let mut stderr = StderrRedirect::Inherit;
    let guard = install(&mut stdin, &mut stdout, &mut stderr);
    drop(guard);
    // The node no longer owns the read end.
    assert!(matches!(stdin, StdinRedirect::Pipe(None)));
}

#[test]
fn partial_failure_reverts_cleanly() {
    let _lock = common::engine_lock();
    let dir = tempfile::tempdir().unwrap();
    let missing = dir.path().join("no").join("such").join("dir").join("f.txt");

    let mut stdin = StdinRedirect::Inherit;
    let mut stdout = StdoutRedirect::OverwriteFile(missing);
    let mut stderr = StderrRedirect::Inherit;
    let result = RedirectGuard::install(RedirectRequest {
        stdin: &mut stdin,
        stdout: &mut stdout,
        stderr: &mut stderr,
        next_stdin: None,
        for_builtin: true,
    });
    assert!(result.is_err());

    // Standard output still works after the failed install.
    let mut out = std::io::stdout();
    out.write_all(b"").unwrap();
    out.flush().unwrap();
}

#[cfg(unix)]
#[test]
fn standard_fds_identical_after_guard() {
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
    let path = dir.path().join("x.txt");
    let mut stdin = StdinRedirect::Null;
    let mut stdout = StdoutRedirect::OverwriteFile(path.clone());
    let mut stderr = StderrRedirect::MergeToStdout;
    let guard = install(&mut stdin, &mut stdout, &mut stderr);
    drop(guard);

    let after: Vec<_> = (0..3).map(fd_identity).collect();
    assert_eq!(before, after);
}

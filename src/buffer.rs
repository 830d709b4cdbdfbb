//! Shell-owned output buffers.
//!
//! A buffer drains a producer's pipe into memory on a worker thread so the
//! captured bytes can be consumed after the producer exits: spliced into a
//! command line by back-quote expansion, or re-streamed into the next
//! command of a pipeline when the producer was a built-in.

use std::fs::File;
use std::io::{self, Read, Write};
use std::sync::{Arc, Condvar, Mutex};
use std::thread;

#[cfg(unix)]
use crate::posix;
#[cfg(windows)]
use crate::win32;

/// Create an anonymous pipe, returning `(read_end, write_end)`.
pub fn make_pipe() -> io::Result<(File, File)> {
    #[cfg(unix)]
    return posix::pipe();
    #[cfg(windows)]
    return win32::CreatePipe();
}

const DRAIN_CHUNK: usize = 8192;

struct BufferState {
    data: Vec<u8>,
    /// Number of drain workers that have not yet observed EOF.
    active_drains: usize,
}

struct Inner {
    state: Mutex<BufferState>,
    eof: Condvar,
}

/// A reference-counted in-memory sink for process output.
///
/// Each [`attach`](OutputBuffer::attach) opens a fresh pipe into the same
/// buffer: the first attach creates the buffer's initial drain, later
/// attaches append, letting a second process write to the buffer after the
/// first finishes.  [`wait_eof`](OutputBuffer::wait_eof) establishes the
/// happens-before between the producer closing its write end and any read of
/// the complete contents.
#[derive(Clone)]
pub struct OutputBuffer(Arc<Inner>);

impl OutputBuffer {
    pub fn new() -> OutputBuffer {
        OutputBuffer(Arc::new(Inner {
            state: Mutex::new(BufferState {
                data: Vec::new(),
                active_drains: 0,
            }),
            eof: Condvar::new(),
        }))
    }

    /// Open a new pipe into this buffer and return its write end.  A drain
    /// worker owns the read end and releases it when the producer closes the
    /// write end.
    pub fn attach(&self) -> io::Result<File> {
        let (mut read, write) = make_pipe()?;
        {
            let mut state = self.0.state.lock().unwrap();
            state.active_drains += 1;
        }
        let inner = Arc::clone(&self.0);
        let spawned = thread::Builder::new()
            .name("output-drain".into())
            .spawn(move || {
                let mut chunk = [0u8; DRAIN_CHUNK];
                loop {
                    match read.read(&mut chunk) {
                        Ok(0) | Err(_) => break,
                        Ok(n) => {
                            let mut state = inner.state.lock().unwrap();
                            state.data.extend_from_slice(&chunk[..n]);
                        }
                    }
                }
                let mut state = inner.state.lock().unwrap();
                state.active_drains -= 1;
                if state.active_drains == 0 {
                    inner.eof.notify_all();
                }
            });
        if let Err(err) = spawned {
            // No drain ever started; undo its registration so finalize
            // cannot block on it.
            let mut state = self.0.state.lock().unwrap();
            state.active_drains -= 1;
            if state.active_drains == 0 {
                self.0.eof.notify_all();
            }
            return Err(err);
        }
        Ok(write)
    }

    /// Block until every drain worker has observed EOF and flushed its last
    /// byte.  Contents are complete once this returns.
    pub fn wait_eof(&self) {
        let mut state = self.0.state.lock().unwrap();
        while state.active_drains > 0 {
            state = self.0.eof.wait(state).unwrap();
        }
    }

    /// The captured bytes.  Only meaningful after [`wait_eof`].
    pub fn contents(&self) -> Vec<u8> {
        self.0.state.lock().unwrap().data.clone()
    }

    /// The captured bytes as text.  Only meaningful after [`wait_eof`].
    pub fn contents_string(&self) -> String {
        String::from_utf8_lossy(&self.contents()).into_owned()
    }

    /// Re-stream the captured contents through a fresh pipe, returning the
    /// read end for use as the next command's standard input.  A writer
    /// thread feeds the pipe and closes it, so the consumer observes the
    /// exact bytes followed by EOF.
    pub fn forward_to_next(&self) -> io::Result<File> {
        self.wait_eof();
        let (read, mut write) = make_pipe()?;
        let data = self.contents();
        thread::Builder::new()
            .name("buffer-forward".into())
            .spawn(move || {
                // A consumer that exits early breaks the pipe; that is its
                // prerogative.
                let _ = write.write_all(&data);
            })
            .map_err(io::Error::other)?;
        Ok(read)
    }
}

impl Default for OutputBuffer {
    fn default() -> OutputBuffer {
        OutputBuffer::new()
    }
}

impl std::fmt::Debug for OutputBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.0.state.lock().unwrap();
        f.debug_struct("OutputBuffer")
            .field("len", &state.data.len())
            .field("active_drains", &state.active_drains)
            .finish()
    }
}

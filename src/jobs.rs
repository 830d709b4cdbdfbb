//! Background job tracking.
//!
//! Commands that run without being waited on (backgrounded pipelines, or a
//! foreground task the user sent to the background mid-run) transfer
//! ownership of their process handle here.  The table is polled between
//! interactive commands to report completions.

use crate::process::ChildProcess;

/// A single tracked background job.
#[derive(Debug)]
pub struct BackgroundJob {
    pub id: usize,
    pub pid: u32,
    pub command: String,
    pub process: ChildProcess,
}

/// The shell's background-process list.
#[derive(Debug, Default)]
pub struct JobTable {
    jobs: Vec<BackgroundJob>,
    next_id: usize,
}

impl JobTable {
    pub fn new() -> JobTable {
        JobTable {
            jobs: Vec::new(),
            next_id: 1,
        }
    }

    /// Take ownership of `process` and start tracking it.  Returns the job
    /// id.  The process is detached so that dropping other clones of the
    /// handle never blocks on it.
    pub fn add(&mut self, process: ChildProcess, command: String) -> usize {
        let id = self.next_id;
        self.next_id += 1;
        process.detach();
        log::debug!("job {}: tracking pid {} ({})", id, process.pid(), command);
        self.jobs.push(BackgroundJob {
            id,
            pid: process.pid(),
            command,
            process,
        });
        id
    }

    /// Poll every job without blocking; finished jobs are removed and
    /// returned as `(id, command, exit_code)`.
    pub fn reap(&mut self) -> Vec<(usize, String, i32)> {
        let mut done = Vec::new();
        self.jobs.retain(|job| match job.process.poll() {
            Some(code) => {
                done.push((job.id, job.command.clone(), code));
                false
            }
            None => true,
        });
        done
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    /// Jobs in id order, for listing.
    pub fn jobs(&self) -> impl Iterator<Item = &BackgroundJob> {
        self.jobs.iter()
    }
}

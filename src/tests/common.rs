use std::sync::{Mutex, MutexGuard};

// Tests that run plans override the process-wide standard streams and read
// the process-wide error level, so they must not interleave.
static ENGINE_LOCK: Mutex<()> = Mutex::new(());

pub fn engine_lock() -> MutexGuard<'static, ()> {
    ENGINE_LOCK.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Parse `expr`, build a plan, force capture, run it, and return the
/// captured output plus the resulting error level.
pub fn run_captured(expr: &str) -> (String, i32) {
    let ctx = crate::parse::parse_cmdline(expr, 0);
    let mut plan = crate::plan::ExecPlan::from_context(&ctx, expr);
    plan.coerce_capture();
    let buffer = crate::plan::execute_plan(&mut plan, true);
    let output = match buffer {
        Some(buffer) => {
            buffer.wait_eof();
            buffer.contents_string()
        }
        None => String::new(),
    };
    (output, crate::state::error_level())
}

//! Minimal interactive driver for the ysh execution engine.
//!
//! Reads expressions from standard input and evaluates them.  Invoked with
//! the single-statement flag (`ysh /ss "<expr>"`) it executes one
//! expression and exits with its error level, which is how the engine
//! delegates non-waiting compound expressions to a subshell.

use std::env;
use std::io::{self, BufRead, Write};
use std::process::ExitCode;

fn main() -> ExitCode {
    let args: Vec<String> = env::args().skip(1).collect();

    if ysh::init().is_err() {
        eprintln!("ysh: failed to initialize");
        return ExitCode::FAILURE;
    }

    // Subshell mode: run the expression and report its error level.
    if args.first().map(String::as_str) == Some(ysh::SUBSHELL_FLAG) {
        let expr = args[1..].join(" ");
        ysh::execute_expression(&expr);
        let code = ysh::error_level();
        ysh::shutdown();
        return ExitCode::from((code & 0xff) as u8);
    }

    install_interrupt_handler();

    let stdin = io::stdin();
    let mut lines = stdin.lock().lines();
    loop {
        print!("ysh> ");
        let _ = io::stdout().flush();
        let Some(Ok(line)) = lines.next() else {
            break;
        };
        let line = line.trim();
        if !line.is_empty() {
            ysh::execute_expression(line);
        }
        for (id, command, code) in ysh::with_jobs(|jobs| jobs.reap()) {
            println!("[{}] done ({}): {}", id, code, command);
        }
        if let Some(code) = ysh::exit_requested() {
            ysh::shutdown();
            return ExitCode::from((code & 0xff) as u8);
        }
    }

    ysh::shutdown();
    ExitCode::SUCCESS
}

#[cfg(unix)]
fn install_interrupt_handler() {
    let cancel = ysh::cancel_event();
    if let Err(err) = ctrlc::set_handler(move || cancel.set()) {
        eprintln!("ysh: failed to install interrupt handler: {}", err);
    }
}

#[cfg(windows)]
fn install_interrupt_handler() {
    if let Err(err) = ysh::cancel_event().arm_console_handler() {
        eprintln!("ysh: failed to install interrupt handler: {}", err);
    }
}

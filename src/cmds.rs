//! Statically linked built-in commands.
//!
//! Built-ins linked into the shell follow the `YoriCmd_<UPPERNAME>` export
//! convention; a command name that is not in the dynamic registry resolves
//! against this table.  Every function runs under the caller's redirection
//! scope and talks to the process-wide standard streams.

use std::env;
use std::io::{self, Write};

use crate::args::CmdContext;
use crate::registry::BuiltinFn;
use crate::state;

pub static STATIC_BUILTINS: &[(&str, BuiltinFn)] = &[
    ("YoriCmd_ALIAS", cmd_alias),
    ("YoriCmd_CHDIR", cmd_chdir),
    ("YoriCmd_ECHO", cmd_echo),
    ("YoriCmd_EXIT", cmd_exit),
    ("YoriCmd_FALSE", cmd_false),
    ("YoriCmd_SET", cmd_set),
    ("YoriCmd_TRUE", cmd_true),
];

/// Look up the statically linked built-in whose export symbol is
/// `YoriCmd_` + `upper_name`.
pub fn lookup_static(upper_name: &str) -> Option<BuiltinFn> {
    let symbol = format!("YoriCmd_{}", upper_name);
    STATIC_BUILTINS
        .iter()
        .find(|(name, _)| *name == symbol)
        .map(|&(_, f)| f)
}

fn cmd_echo(cmd: &CmdContext) -> i32 {
    let mut newline = true;
    let mut start = 1;
    if cmd.args.get(1).map(|a| a.text.as_str()) == Some("-n") {
        newline = false;
        start = 2;
    }
    let text = cmd.args[start.min(cmd.args.len())..]
        .iter()
        .map(|a| a.text.as_str())
        .collect::<Vec<_>>()
        .join(" ");
    let mut out = io::stdout();
    let result = if newline {
        writeln!(out, "{}", text)
    } else {
        write!(out, "{}", text)
    };
    let _ = out.flush();
    if result.is_err() { 1 } else { 0 }
}

fn cmd_exit(cmd: &CmdContext) -> i32 {
    let code = cmd
        .args
        .get(1)
        .and_then(|a| a.text.parse::<i32>().ok())
        .unwrap_or(0);
    state::request_exit(code);
    code
}

fn cmd_chdir(cmd: &CmdContext) -> i32 {
    match cmd.args.get(1) {
        Some(dir) => match env::set_current_dir(&dir.text) {
            Ok(()) => 0,
            Err(err) => {
                eprintln!("chdir: {}: {}", dir.text, err);
                1
            }
        },
        None => {
            match env::current_dir() {
                Ok(cwd) => println!("{}", cwd.display()),
                Err(err) => {
                    eprintln!("chdir: {}", err);
                    return 1;
                }
            }
            0
        }
    }
}

fn cmd_set(cmd: &CmdContext) -> i32 {
    match cmd.args.get(1) {
        None => {
            let mut out = io::stdout();
            for (key, value) in env::vars() {
                let _ = writeln!(out, "{}={}", key, value);
            }
            0
        }
        Some(arg) => match arg.text.split_once('=') {
            Some((name, "")) => {
                unsafe { env::remove_var(name) };
                0
            }
            Some((name, value)) => {
                unsafe { env::set_var(name, value) };
                0
            }
            None => {
                // `set NAME` prints matching variables, like the host shell.
                let prefix = arg.text.to_ascii_uppercase();
                let mut found = false;
                for (key, value) in env::vars() {
                    if key.to_ascii_uppercase().starts_with(&prefix) {
                        println!("{}={}", key, value);
                        found = true;
                    }
                }
                if found { 0 } else { 1 }
            }
        },
    }
}

fn cmd_alias(cmd: &CmdContext) -> i32 {
    match cmd.args.get(1) {
        None => {
            for (name, value) in state::with(|st| st.aliases.clone()) {
                println!("{}={}", name, value);
            }
            0
        }
        Some(arg) => match arg.text.split_once('=') {
            Some((name, "")) => {
                state::with(|st| st.aliases.remove(&name.to_ascii_lowercase()));
                0
            }
            Some((name, value)) => {
                let (name, value) = (name.to_ascii_lowercase(), value.to_owned());
                state::with(|st| st.aliases.insert(name, value));
                0
            }
            None => {
                let name = arg.text.to_ascii_lowercase();
                match state::with(|st| st.aliases.get(&name).cloned()) {
                    Some(value) => {
                        println!("{}={}", name, value);
                        0
                    }
                    None => 1,
                }
            }
        },
    }
}

fn cmd_true(_cmd: &CmdContext) -> i32 {
    0
}

fn cmd_false(_cmd: &CmdContext) -> i32 {
    1
}

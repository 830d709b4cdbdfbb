//! Expansion passes over an expression before it becomes a plan: back-quote
//! substitution, textual environment references, and first-argument alias
//! rewriting.

use std::env;

use crate::args::{CmdContext, BACKQUOTE_CHAR, ESCAPE_CHAR};
use crate::parse;
use crate::plan::{self, ExecPlan};
use crate::state;

/// Find the byte offsets of the first unescaped pair of back-quote
/// delimiters.  Escaped back-quotes are skipped, so they never open or
/// close a substitution.
pub fn find_backquote_span(expr: &str) -> Option<(usize, usize)> {
    let mut first: Option<usize> = None;
    let mut chars = expr.char_indices();
    while let Some((off, c)) = chars.next() {
        if c == ESCAPE_CHAR {
            chars.next();
            continue;
        }
        if c == BACKQUOTE_CHAR {
            match first {
                None => first = Some(off),
                Some(start) => return Some((start, off)),
            }
        }
    }
    None
}

/// Normalize captured command output for splicing into a command line:
/// trailing newlines are stripped and interior newlines become spaces.
pub fn normalize_captured(captured: &str) -> String {
    let trimmed = captured.trim_end_matches(['\r', '\n']);
    trimmed
        .replace("\r\n", " ")
        .replace(['\r', '\n'], " ")
}

/// Expand every back-quote substitution in `expr`.
///
/// Each inner expression is parsed, environment-expanded, forced to capture
/// its output into a shell buffer, executed, and its normalized output
/// spliced in place of the delimited span.  The scan restarts from the
/// beginning after each splice, so output that itself contains back-quotes
/// is expanded again.
pub fn expand_backquotes(expr: &str) -> String {
    let mut expr = expr.to_owned();
    while let Some((start, end)) = find_backquote_span(&expr) {
        let inner = expr[start + BACKQUOTE_CHAR.len_utf8()..end].to_owned();
        log::debug!("expanding back-quoted expression: {}", inner);
        let mut ctx = parse::parse_cmdline(&inner, 0);
        expand_env(&mut ctx);
        let mut inner_plan = ExecPlan::from_context(&ctx, &inner);
        inner_plan.coerce_capture();
        let buffer = plan::execute_plan(&mut inner_plan, true);
        let captured = match buffer {
            Some(buffer) => {
                buffer.wait_eof();
                buffer.contents_string()
            }
            None => String::new(),
        };
        let mut next = String::with_capacity(expr.len() + captured.len());
        next.push_str(&expr[..start]);
        next.push_str(&normalize_captured(&captured));
        next.push_str(&expr[end + BACKQUOTE_CHAR.len_utf8()..]);
        expr = next;
    }
    expr
}

/// Expand `%NAME%` environment references textually in every argument.
/// Undefined references are left as written.  Escaped percent signs do not
/// open a reference.
pub fn expand_env(ctx: &mut CmdContext) {
    for arg in &mut ctx.args {
        if arg.text.contains('%') {
            arg.text = expand_env_text(&arg.text);
        }
    }
}

fn expand_env_text(text: &str) -> String {
    let chars: Vec<char> = text.chars().collect();
    let mut out = String::with_capacity(text.len());
    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
        if c == ESCAPE_CHAR {
            out.push(c);
            if i + 1 < chars.len() {
                out.push(chars[i + 1]);
                i += 2;
            } else {
                i += 1;
            }
            continue;
        }
        if c == '%' {
            if let Some(len) = chars[i + 1..].iter().position(|&c| c == '%') {
                let name: String = chars[i + 1..i + 1 + len].iter().collect();
                if let Ok(value) = env::var(&name) {
                    out.push_str(&value);
                    i += len + 2;
                    continue;
                }
            }
        }
        out.push(c);
        i += 1;
    }
    out
}

/// Rewrite the first argument through the alias table, splicing the alias
/// definition's arguments in its place.  Expansion is single-level.
pub fn expand_alias(ctx: &mut CmdContext) {
    let Some(name) = ctx.command_name().map(|n| n.to_ascii_lowercase()) else {
        return;
    };
    let Some(definition) = state::with(|st| st.aliases.get(&name).cloned()) else {
        return;
    };
    let replacement = parse::parse_cmdline(&definition, 0);
    if replacement.is_empty() {
        return;
    }
    log::debug!("alias {} -> {}", name, definition);
    ctx.args.splice(0..1, replacement.args);
}

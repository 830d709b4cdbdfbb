//! The command-context producer: turns a source string into an argument
//! vector with quote and escape metadata.  The execution engine itself never
//! re-tokenizes source text; expansion re-enters through this entry point.

use crate::args::{CmdArg, CmdContext, ESCAPE_CHAR};

/// Characters that delimit arguments on their own when unquoted and
/// unescaped.  Runs of these form the shell operators.
fn is_operator_char(c: char) -> bool {
    matches!(c, '|' | '&' | '<' | '>')
}

/// Parse a command line into a [`CmdContext`].  `cursor` is a byte offset
/// into `line`; the argument it falls in becomes the context's current
/// argument.
///
/// Rules:
/// - whitespace separates arguments outside quotes;
/// - `"` toggles quoting; quote characters are stripped but the argument is
///   marked quoted, which prevents operator interpretation;
/// - `^` escapes the following character anywhere; both characters are kept
///   in the argument text and the argument is marked as containing escapes;
/// - unquoted operator characters (`|`, `&`, `<`, `>`) self-delimit, so
///   `a|b` parses the same as `a | b`.  A lone `2` directly before `>`
///   fuses with the redirection operator (`2>`, `2>>`, `2>&1`).
pub fn parse_cmdline(line: &str, cursor: usize) -> CmdContext {
    let chars: Vec<(usize, char)> = line.char_indices().collect();
    let mut args: Vec<CmdArg> = Vec::new();
    let mut spans: Vec<(usize, usize)> = Vec::new();

    let mut text = String::new();
    let mut quoted = false;
    let mut has_escapes = false;
    let mut start = 0usize;
    let mut started = false;

    let mut i = 0usize;

    macro_rules! flush {
        ($end:expr) => {
            if started {
                args.push(CmdArg {
                    text: std::mem::take(&mut text),
                    quoted,
                    has_escapes,
                });
                spans.push((start, $end));
                quoted = false;
                has_escapes = false;
                started = false;
            }
        };
    }

    while i < chars.len() {
        let (off, c) = chars[i];
        if c == ESCAPE_CHAR {
            if !started {
                started = true;
                start = off;
            }
            has_escapes = true;
            text.push(c);
            if i + 1 < chars.len() {
                text.push(chars[i + 1].1);
                i += 2;
            } else {
                i += 1;
            }
            continue;
        }
        if c == '"' {
            if !started {
                started = true;
                start = off;
            }
            quoted = true;
            i += 1;
            while i < chars.len() && chars[i].1 != '"' {
                if chars[i].1 == ESCAPE_CHAR && i + 1 < chars.len() {
                    has_escapes = true;
                    text.push(chars[i].1);
                    text.push(chars[i + 1].1);
                    i += 2;
                } else {
                    text.push(chars[i].1);
                    i += 1;
                }
            }
            i += 1; // closing quote, if any
            continue;
        }
        if c.is_whitespace() {
            flush!(off);
            i += 1;
            continue;
        }
        if is_operator_char(c) {
            // "2>"-family redirections fuse the stream number with the
            // operator; anything else ends the preceding argument first.
            let fuse_stderr = started && !quoted && !has_escapes && text == "2" && c == '>';
            if !fuse_stderr {
                flush!(off);
                started = true;
                start = off;
            }
            let run_start = i;
            match c {
                '|' => {
                    i += 1;
                    if i < chars.len() && chars[i].1 == '|' {
                        i += 1;
                    }
                }
                '&' => {
                    i += 1;
                    if i + 1 < chars.len() && chars[i].1 == '!' && chars[i + 1].1 == '&' {
                        i += 2;
                    } else if i < chars.len() && chars[i].1 == '&' {
                        i += 1;
                    }
                }
                '<' => {
                    i += 1;
                }
                '>' => {
                    i += 1;
                    if i < chars.len() && chars[i].1 == '>' {
                        i += 1;
                    } else if fuse_stderr
                        && i + 1 < chars.len()
                        && chars[i].1 == '&'
                        && chars[i + 1].1 == '1'
                    {
                        i += 2;
                    }
                }
                _ => unreachable!(),
            }
            for &(_, oc) in &chars[run_start..i] {
                text.push(oc);
            }
            let end = chars.get(i).map(|&(o, _)| o).unwrap_or(line.len());
            flush!(end);
            continue;
        }
        if !started {
            started = true;
            start = off;
        }
        text.push(c);
        i += 1;
    }
    flush!(line.len());

    let mut ctx = CmdContext::new(args);
    ctx.current_arg = spans
        .iter()
        .position(|&(s, e)| cursor >= s && cursor <= e)
        .unwrap_or_else(|| spans.len().saturating_sub(1));
    ctx
}

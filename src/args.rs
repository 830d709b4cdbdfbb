use std::borrow::Cow;
use std::fmt;

/// The character that escapes the following character in a command line.
/// Escaped characters lose any operator or delimiter meaning.
pub const ESCAPE_CHAR: char = '^';

/// The delimiter pair for command substitution.
pub const BACKQUOTE_CHAR: char = '`';

/// A single command-line argument with the metadata the planner and launcher
/// need: whether it was quoted in the source (a quoted argument never acts as
/// an operator) and whether it contains escape characters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CmdArg {
    /// Argument text with escape characters still embedded.
    pub text: String,
    pub quoted: bool,
    pub has_escapes: bool,
}

impl CmdArg {
    pub fn new(text: impl Into<String>) -> CmdArg {
        CmdArg {
            text: text.into(),
            quoted: false,
            has_escapes: false,
        }
    }

    /// True if this argument may be interpreted as a shell operator.
    pub fn is_operator_candidate(&self) -> bool {
        !self.quoted && !self.has_escapes
    }

    /// The argument as a program sees it, with escape characters removed.
    pub fn logical_text(&self) -> Cow<'_, str> {
        if !self.has_escapes {
            return Cow::Borrowed(&self.text);
        }
        let mut out = String::with_capacity(self.text.len());
        let mut chars = self.text.chars();
        while let Some(c) = chars.next() {
            if c == ESCAPE_CHAR {
                if let Some(next) = chars.next() {
                    out.push(next);
                }
            } else {
                out.push(c);
            }
        }
        Cow::Owned(out)
    }
}

impl fmt::Display for CmdArg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.text)
    }
}

/// A parsed command: the argument vector plus the index of the argument the
/// caller's cursor fell in, used by completion.
#[derive(Debug, Clone, Default)]
pub struct CmdContext {
    pub args: Vec<CmdArg>,
    pub current_arg: usize,
}

impl CmdContext {
    pub fn new(args: Vec<CmdArg>) -> CmdContext {
        CmdContext {
            args,
            current_arg: 0,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.args.is_empty()
    }

    pub fn arg_count(&self) -> usize {
        self.args.len()
    }

    /// Logical text of the first argument, the command name.
    pub fn command_name(&self) -> Option<Cow<'_, str>> {
        self.args.first().map(CmdArg::logical_text)
    }

    /// Strip escape characters from every argument in place.  Built-ins see
    /// logical argument values.
    pub fn remove_escapes(&mut self) {
        for arg in &mut self.args {
            if arg.has_escapes {
                arg.text = arg.logical_text().into_owned();
                arg.has_escapes = false;
            }
        }
    }

    /// Flatten back into a single command-line string.  Quoted arguments are
    /// re-quoted; escape characters are preserved.
    pub fn to_cmdline(&self) -> String {
        let mut out = String::new();
        for (i, arg) in self.args.iter().enumerate() {
            if i > 0 {
                out.push(' ');
            }
            if arg.quoted || arg.text.is_empty() || arg.text.contains(' ') {
                out.push('"');
                out.push_str(&arg.text);
                out.push('"');
            } else {
                out.push_str(&arg.text);
            }
        }
        out
    }

    /// Drop the first `n` arguments, keeping current-argument tracking sane.
    pub fn shift(&mut self, n: usize) {
        self.args.drain(..n.min(self.args.len()));
        self.current_arg = self.current_arg.saturating_sub(n);
    }

    /// Insert arguments at the front, e.g. an interpreter name when
    /// delegating a script file.
    pub fn prepend(&mut self, args: impl IntoIterator<Item = CmdArg>) {
        let mut new: Vec<CmdArg> = args.into_iter().collect();
        let shift = new.len();
        new.append(&mut self.args);
        self.args = new;
        self.current_arg += shift;
    }
}

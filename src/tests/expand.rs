use super::common;
use crate::args::CmdArg;
use crate::expand::{
    expand_alias, expand_backquotes, expand_env, find_backquote_span, normalize_captured,
};
use crate::parse::parse_cmdline;
use crate::state;

#[test]
fn finds_first_unescaped_pair() {
    assert_eq!(find_backquote_span("a `b` c"), Some((2, 4)));
    assert_eq!(find_backquote_span("no quotes here"), None);
    // An unmatched delimiter is not a span.
    assert_eq!(find_backquote_span("just ` one"), None);
}

#[test]
fn escaped_backquotes_are_not_delimiters() {
    assert_eq!(find_backquote_span("a ^`b^` c"), None);
    // The escape shields only its own character.
    assert_eq!(find_backquote_span("a ^``b` c"), Some((4, 6)));
}

#[test]
fn normalize_trims_and_flattens() {
    assert_eq!(normalize_captured("out\n"), "out");
    assert_eq!(normalize_captured("out\r\n"), "out");
    assert_eq!(normalize_captured("a\nb\nc\n\n"), "a b c");
    assert_eq!(normalize_captured("a\r\nb\r\n"), "a b");
    assert_eq!(normalize_captured(""), "");
}

#[test]
fn env_references_expand_textually() {
    unsafe { std::env::set_var("YSH_TEST_VAR", "expanded") };
    let mut ctx = parse_cmdline("echo %YSH_TEST_VAR%/tail", 0);
    expand_env(&mut ctx);
    assert_eq!(ctx.args[1].text, "expanded/tail");
}

#[test]
fn undefined_references_stay_literal() {
    let mut ctx = parse_cmdline("echo %YSH_NO_SUCH_VAR%", 0);
    expand_env(&mut ctx);
    assert_eq!(ctx.args[1].text, "%YSH_NO_SUCH_VAR%");
}

#[test]
fn escaped_percent_does_not_expand() {
    unsafe { std::env::set_var("YSH_TEST_VAR2", "nope") };
    let mut ctx = parse_cmdline("echo ^%YSH_TEST_VAR2^%", 0);
    expand_env(&mut ctx);
    assert_eq!(ctx.args[1].text, "^%YSH_TEST_VAR2^%");
}

#[test]
fn alias_rewrites_first_argument_only() {
    let _lock = common::engine_lock();
    state::with(|st| {
        st.aliases
            .insert("ll".to_owned(), "list -la".to_owned())
    });
    let mut ctx = parse_cmdline("ll target", 0);
    expand_alias(&mut ctx);
    let texts: Vec<_> = ctx.args.iter().map(|a| a.text.clone()).collect();
    assert_eq!(texts, ["list", "-la", "target"]);
    state::with(|st| st.aliases.remove("ll"));
}

#[test]
fn alias_expansion_is_single_level() {
    let _lock = common::engine_lock();
    state::with(|st| {
        st.aliases.insert("loop1".to_owned(), "loop1 again".to_owned());
    });
    let mut ctx = parse_cmdline("loop1", 0);
    expand_alias(&mut ctx);
    let texts: Vec<_> = ctx.args.iter().map(|a| a.text.clone()).collect();
    assert_eq!(texts, ["loop1", "again"]);
    state::with(|st| st.aliases.remove("loop1"));
}

#[test]
fn backquote_substitutes_captured_output() {
    let _lock = common::engine_lock();
    let result = expand_backquotes("x `BUILTIN echo y` z");
    assert_eq!(result, "x y z");
}

#[test]
fn backquote_inner_newlines_become_spaces() {
    let _lock = common::engine_lock();
    let result = expand_backquotes("pre `BUILTIN echo a && BUILTIN echo b` post");
    assert_eq!(result, "pre a b post");
}

#[test]
fn backquote_expansion_handles_multiple_spans() {
    let _lock = common::engine_lock();
    let result = expand_backquotes("`BUILTIN echo 1`-`BUILTIN echo 2`");
    assert_eq!(result, "1-2");
}

#[test]
fn expression_without_backquotes_is_untouched() {
    let result = expand_backquotes("plain expression ^` still plain");
    assert_eq!(result, "plain expression ^` still plain");
}

#[test]
fn full_expression_splices_into_arguments() {
    let _lock = common::engine_lock();
    assert!(crate::execute_expression(
        "BUILTIN echo x `BUILTIN echo y` z"
    ));
    // After expansion the outer command saw three arguments; it echoed them
    // into the void (inherited stdout), and the error level is clean.
    assert_eq!(state::error_level(), 0);
}

#[test]
fn alias_args_carry_quote_metadata() {
    let _lock = common::engine_lock();
    state::with(|st| {
        st.aliases
            .insert("say".to_owned(), "echo \"two words\"".to_owned())
    });
    let mut ctx = parse_cmdline("say", 0);
    expand_alias(&mut ctx);
    assert_eq!(ctx.args[1].text, "two words");
    assert!(ctx.args[1].quoted);
    state::with(|st| st.aliases.remove("say"));
}

#[test]
fn prepend_helper_builds_args() {
    // Used by script delegation: interpreter goes in front.
    let mut ctx = parse_cmdline("script.ys1 arg", 0);
    ctx.prepend([CmdArg::new("ys")]);
    let texts: Vec<_> = ctx.args.iter().map(|a| a.text.clone()).collect();
    assert_eq!(texts, ["ys", "script.ys1", "arg"]);
}

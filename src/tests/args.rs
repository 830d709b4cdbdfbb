use crate::args::{CmdArg, CmdContext};

#[test]
fn logical_text_strips_escapes() {
    let mut arg = CmdArg::new("a^|b");
    arg.has_escapes = true;
    assert_eq!(arg.logical_text(), "a|b");
}

#[test]
fn logical_text_without_escapes_borrows() {
    let arg = CmdArg::new("plain");
    assert_eq!(arg.logical_text(), "plain");
}

#[test]
fn trailing_escape_is_dropped() {
    let mut arg = CmdArg::new("abc^");
    arg.has_escapes = true;
    assert_eq!(arg.logical_text(), "abc");
}

#[test]
fn quoted_args_are_not_operator_candidates() {
    let mut arg = CmdArg::new("|");
    assert!(arg.is_operator_candidate());
    arg.quoted = true;
    assert!(!arg.is_operator_candidate());
}

#[test]
fn remove_escapes_rewrites_in_place() {
    let mut arg = CmdArg::new("x^>y");
    arg.has_escapes = true;
    let mut ctx = CmdContext::new(vec![arg]);
    ctx.remove_escapes();
    assert_eq!(ctx.args[0].text, "x>y");
    assert!(!ctx.args[0].has_escapes);
}

#[test]
fn to_cmdline_requotes() {
    let mut spaced = CmdArg::new("two words");
    spaced.quoted = true;
    let ctx = CmdContext::new(vec![CmdArg::new("prog"), spaced]);
    assert_eq!(ctx.to_cmdline(), "prog \"two words\"");
}

#[test]
fn shift_and_prepend_track_current_arg() {
    let mut ctx = CmdContext::new(vec![
        CmdArg::new("a"),
        CmdArg::new("b"),
        CmdArg::new("c"),
    ]);
    ctx.current_arg = 2;
    ctx.shift(1);
    assert_eq!(ctx.args[0].text, "b");
    assert_eq!(ctx.current_arg, 1);
    ctx.prepend([CmdArg::new("interp")]);
    assert_eq!(ctx.args[0].text, "interp");
    assert_eq!(ctx.args[1].text, "b");
    assert_eq!(ctx.current_arg, 2);
}

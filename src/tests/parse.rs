use crate::parse::parse_cmdline;

fn texts(line: &str) -> Vec<String> {
    parse_cmdline(line, 0)
        .args
        .iter()
        .map(|a| a.text.clone())
        .collect()
}

#[test]
fn splits_on_whitespace() {
    assert_eq!(texts("echo  hello   world"), ["echo", "hello", "world"]);
}

#[test]
fn quotes_group_and_mark() {
    let ctx = parse_cmdline("copy \"a file\" dest", 0);
    assert_eq!(ctx.args[1].text, "a file");
    assert!(ctx.args[1].quoted);
    assert!(!ctx.args[0].quoted);
}

#[test]
fn unterminated_quote_runs_to_end() {
    let ctx = parse_cmdline("echo \"half open", 0);
    assert_eq!(ctx.args[1].text, "half open");
    assert!(ctx.args[1].quoted);
}

#[test]
fn escape_retained_and_marked() {
    let ctx = parse_cmdline("echo a^|b", 0);
    assert_eq!(ctx.args[1].text, "a^|b");
    assert!(ctx.args[1].has_escapes);
    assert_eq!(ctx.args[1].logical_text(), "a|b");
}

#[test]
fn operators_self_delimit() {
    assert_eq!(texts("a|b"), ["a", "|", "b"]);
    assert_eq!(texts("a&&b"), ["a", "&&", "b"]);
    assert_eq!(texts("a||b"), ["a", "||", "b"]);
    assert_eq!(texts("a&b"), ["a", "&", "b"]);
    assert_eq!(texts("a>out"), ["a", ">", "out"]);
    assert_eq!(texts("a>>out"), ["a", ">>", "out"]);
    assert_eq!(texts("a<in"), ["a", "<", "in"]);
}

#[test]
fn concurrent_quiet_operator() {
    assert_eq!(texts("a &!& b"), ["a", "&!&", "b"]);
}

#[test]
fn stderr_redirections_fuse_stream_number() {
    assert_eq!(texts("prog 2>err.txt"), ["prog", "2>", "err.txt"]);
    assert_eq!(texts("prog 2>>err.txt"), ["prog", "2>>", "err.txt"]);
    assert_eq!(texts("prog 2>&1"), ["prog", "2>&1"]);
}

#[test]
fn two_without_redirection_stays_an_argument() {
    assert_eq!(texts("echo 2 x"), ["echo", "2", "x"]);
}

#[test]
fn quoted_operator_is_literal() {
    let ctx = parse_cmdline("echo \"|\" next", 0);
    assert_eq!(ctx.args[1].text, "|");
    assert!(ctx.args[1].quoted);
    assert!(!ctx.args[1].is_operator_candidate());
}

#[test]
fn cursor_selects_current_argument() {
    let ctx = parse_cmdline("first second third", 8);
    assert_eq!(ctx.current_arg, 1);
    let ctx = parse_cmdline("first second third", 0);
    assert_eq!(ctx.current_arg, 0);
    let ctx = parse_cmdline("first second third", 18);
    assert_eq!(ctx.current_arg, 2);
}

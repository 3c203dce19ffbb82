use bucketail::{compile_delimited, compile_optional, ConfigError};

#[test]
fn named_captures_are_listed_in_order() {
    let p = compile_delimited(r"/^(?P<host>\S+) (\d+) (?P<path>\S+)$/", false, true).unwrap();
    assert_eq!(p.names(), ["host", "path"]);
    assert!(p.has_name("path"));
    assert!(!p.has_name("status"));
    assert!(p.is_match("example.com 200 /index.html"));
}

#[test]
fn multiline_lets_dot_cross_newlines() {
    let single = compile_delimited(r"/^a.b$/", false, false).unwrap();
    let multi = compile_delimited(r"/^a.b$/", true, false).unwrap();
    assert!(!single.is_match("a\nb"));
    assert!(multi.is_match("a\nb"));
    assert!(multi.is_match("x\na-b\ny"), "anchors match at line boundaries");
}

#[test]
fn blank_optional_patterns_are_absent() {
    assert!(compile_optional(None, false, false).unwrap().is_none());
    assert!(compile_optional(Some("   "), false, false).unwrap().is_none());
    assert!(compile_optional(Some("/x/"), false, false).unwrap().is_some());
    assert!(matches!(
        compile_optional(Some("/x/"), false, true),
        Err(ConfigError::NoNamedCaptures(_))
    ));
    assert!(matches!(compile_delimited("/", false, false), Err(ConfigError::InvalidPattern { .. })));
}

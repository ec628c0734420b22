//! Parser: literals, structure, macro expansion, and error reporting.

use cel_core::ast::{Constant, ExprId, ExprKind};
use cel_parser::{parse, MacroSet, Parser};

fn root_kind(source: &str) -> ExprKind {
    parse(source)
        .unwrap_or_else(|e| panic!("parse '{source}': {e}"))
        .root()
        .kind
        .clone()
}

#[test]
fn literals() {
    assert_eq!(root_kind("42"), ExprKind::Const(Constant::Int(42)));
    assert_eq!(root_kind("42u"), ExprKind::Const(Constant::Uint(42)));
    assert_eq!(root_kind("0x2a"), ExprKind::Const(Constant::Int(42)));
    assert_eq!(root_kind("1.5"), ExprKind::Const(Constant::Double(1.5)));
    assert_eq!(root_kind("-3"), ExprKind::Const(Constant::Int(-3)));
    assert_eq!(root_kind("-2.5"), ExprKind::Const(Constant::Double(-2.5)));
    assert_eq!(root_kind("true"), ExprKind::Const(Constant::Bool(true)));
    assert_eq!(root_kind("null"), ExprKind::Const(Constant::Null));
    assert_eq!(
        root_kind("\"hi\""),
        ExprKind::Const(Constant::String("hi".to_string()))
    );
    assert_eq!(
        root_kind("b\"hi\""),
        ExprKind::Const(Constant::Bytes(b"hi".to_vec()))
    );
}

#[test]
fn int_literal_range() {
    assert_eq!(
        root_kind("-9223372036854775808"),
        ExprKind::Const(Constant::Int(i64::MIN))
    );
    assert!(parse("9223372036854775808").is_err());
    assert!(parse("-9223372036854775809").is_err());
    assert_eq!(
        root_kind("18446744073709551615u"),
        ExprKind::Const(Constant::Uint(u64::MAX))
    );
}

#[test]
fn operator_structure() {
    // 1 + 2 * 3 parses as 1 + (2 * 3)
    let ast = parse("1 + 2 * 3").unwrap();
    let ExprKind::Call(add) = &ast.root().kind else {
        panic!("expected call at root");
    };
    assert_eq!(add.function, "_+_");
    let ExprKind::Call(mul) = &add.args[1].kind else {
        panic!("expected nested multiply");
    };
    assert_eq!(mul.function, "_*_");
}

#[test]
fn member_chains() {
    let ast = parse("a.b.c").unwrap();
    let ExprKind::Select(outer) = &ast.root().kind else {
        panic!("expected select");
    };
    assert_eq!(outer.field, "c");
    assert!(!outer.test_only);

    let ast = parse("a.f(1)").unwrap();
    let ExprKind::Call(call) = &ast.root().kind else {
        panic!("expected member call");
    };
    assert!(call.target.is_some());
    assert_eq!(call.function, "f");

    let ast = parse("a[0]").unwrap();
    let ExprKind::Call(index) = &ast.root().kind else {
        panic!("expected index call");
    };
    assert_eq!(index.function, "_[_]");
}

#[test]
fn leading_dot_is_absolute() {
    let ast = parse(".a.b").unwrap();
    let ExprKind::Select(sel) = &ast.root().kind else {
        panic!("expected select");
    };
    assert_eq!(sel.field, "b");
    assert_eq!(sel.operand.kind, ExprKind::Ident(".a".to_string()));
}

#[test]
fn struct_literals_take_qualified_names() {
    let ast = parse("pkg.Msg{a: 1, ?b: x}").unwrap();
    let ExprKind::Struct(st) = &ast.root().kind else {
        panic!("expected struct");
    };
    assert_eq!(st.message_name, "pkg.Msg");
    assert_eq!(st.entries.len(), 2);
    assert!(!st.entries[0].optional);
    assert!(st.entries[1].optional);
}

#[test]
fn optional_syntax() {
    let ast = parse("[?a, b, ?c]").unwrap();
    let ExprKind::List(list) = &ast.root().kind else {
        panic!("expected list");
    };
    assert_eq!(list.optional_indices, vec![0, 2]);

    let ast = parse("m.?k").unwrap();
    let ExprKind::Call(call) = &ast.root().kind else {
        panic!("expected opt-select call");
    };
    assert_eq!(call.function, "_?._");

    let ast = parse("m[?k]").unwrap();
    let ExprKind::Call(call) = &ast.root().kind else {
        panic!("expected opt-index call");
    };
    assert_eq!(call.function, "_[?_]");
}

#[test]
fn has_expands_to_a_presence_test() {
    let ast = parse("has(a.b)").unwrap();
    let ExprKind::Select(sel) = &ast.root().kind else {
        panic!("expected select");
    };
    assert!(sel.test_only);
    assert_eq!(sel.field, "b");
    // the pre-expansion call is remembered
    assert!(ast.source().macro_calls.contains_key(&ast.root().id));
}

#[test]
fn has_requires_a_field_selection() {
    assert!(parse("has(a)").is_err());
    assert!(parse("has(a[0])").is_err());
}

#[test]
fn comprehension_macros_desugar() {
    let ast = parse("[1].exists(i, i > 0)").unwrap();
    let ExprKind::Comprehension(comp) = &ast.root().kind else {
        panic!("expected comprehension");
    };
    assert_eq!(comp.iter_var, "i");
    assert_eq!(comp.accu_var, "__result__");
    assert!(comp.iter_var2.is_none());
    assert!(ast.source().macro_calls.contains_key(&ast.root().id));

    // iteration variable must be a simple identifier
    assert!(parse("[1].exists(a.b, true)").is_err());
    // and must not shadow the accumulator
    assert!(parse("[1].exists(__result__, true)").is_err());
}

#[test]
fn disabled_macros_stay_plain_calls() {
    let parser = Parser::with_macros(MacroSet::standard().without("exists"));
    let ast = parser.parse("[1].exists(i, i > 0)").unwrap();
    assert!(matches!(&ast.root().kind, ExprKind::Call(call) if call.function == "exists"));
}

#[test]
fn node_ids_are_unique_and_positions_recorded() {
    let ast = parse("a + b * [1, 2][0]").unwrap();
    let mut ids = Vec::new();
    ast.root().visit(&mut |e| ids.push(e.id));
    let mut deduped = ids.clone();
    deduped.sort_unstable();
    deduped.dedup();
    assert_eq!(deduped.len(), ids.len(), "duplicate ids in {ids:?}");
    assert!(!ids.contains(&ExprId::NONE));
    for id in &ids {
        assert!(
            ast.source().positions.contains_key(id),
            "node {id} has no position"
        );
    }
}

#[test]
fn error_positions_render_line_and_column() {
    let err = parse("1 +\n+ }").unwrap_err();
    let rendered = err.to_string();
    assert!(rendered.contains("syntax error at 2:"), "{rendered}");
}

#[test]
fn reserved_words_are_rejected() {
    assert!(parse("while").is_err());
    assert!(parse("1 + function").is_err());
}

#[test]
fn nesting_depth_is_bounded() {
    let deep = format!("{}1{}", "(".repeat(500), ")".repeat(500));
    assert!(parse(&deep).is_err());
}

#[test]
fn trailing_input_is_rejected() {
    assert!(parse("1 2").is_err());
    assert!(parse("").is_err());
}

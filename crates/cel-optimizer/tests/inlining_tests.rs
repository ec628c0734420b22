//! Identifier inlining and presence-test rewriting.

use cel_core::{unparse, CelType, EmptyActivation, Env, StructDecl, Value};
use cel_optimizer::{InlineVariable, InliningOptimizer, OptimizeError, Optimizer};
use cel_parser::parse;
use pretty_assertions::assert_eq;

fn env() -> Env {
    Env::builder()
        .extension("strings", 2)
        .register_struct(
            StructDecl::new("TestAllTypes")
                .field("single_any", CelType::Any)
                .field("single_int32", CelType::Int),
        )
        .variable("msg", CelType::Struct("TestAllTypes".to_string()))
        .variable("x", CelType::Int)
        .variable("wrapped", CelType::Struct("google.protobuf.Int64Value".to_string()))
        .build()
        .unwrap()
}

fn inlined(env: &Env, source: &str, inlines: Vec<InlineVariable>) -> String {
    let ast = parse(source).unwrap_or_else(|e| panic!("parse '{source}': {e}"));
    let out = InliningOptimizer::new(inlines)
        .optimize(env, &ast)
        .unwrap_or_else(|e| panic!("inline '{source}': {e}"));
    unparse(&out)
}

#[test]
fn plain_references_are_replaced() {
    let env = env();
    let repl = parse("x * 2").unwrap();
    assert_eq!(
        inlined(&env, "a.b + 1", vec![InlineVariable::from_ast("a.b", &repl)]),
        "x * 2 + 1"
    );
    // every occurrence is replaced
    assert_eq!(
        inlined(&env, "a.b + a.b", vec![InlineVariable::from_ast("a.b", &repl)]),
        "x * 2 + x * 2"
    );
}

#[test]
fn qualified_chains_match_as_operands() {
    let env = env();
    let repl = parse("[1, 2]").unwrap();
    assert_eq!(
        inlined(&env, "a.b.c + 1", vec![InlineVariable::from_ast("a.b", &repl)]),
        "[1, 2].c + 1"
    );
}

#[test]
fn inlining_preserves_evaluation() {
    let env = env();
    let source = "a.b + a.b * 2";
    let ast = parse(source).unwrap();
    let out = InliningOptimizer::new(vec![InlineVariable::from_ast("a.b", &parse("3 + 4").unwrap())])
        .optimize(&env, &ast)
        .unwrap();
    let checked = env.check(&out).unwrap();
    let value = env.plan(&checked).unwrap().eval(&EmptyActivation).unwrap();
    assert_eq!(value, Value::Int(21));
}

#[test]
fn no_op_inlines_terminate_and_preserve_shape() {
    let env = env();
    let repl = parse("x").unwrap();
    assert_eq!(
        inlined(&env, "x + x", vec![InlineVariable::from_ast("x", &repl)]),
        "x + x"
    );
}

#[test]
fn comprehension_bindings_shadow_inlines() {
    let env = env();
    let repl = parse("5").unwrap();
    assert_eq!(
        inlined(
            &env,
            "x + [1].map(x, x * 2)[0]",
            vec![InlineVariable::from_ast("x", &repl)]
        ),
        "5 + [1].map(x, x * 2)[0]"
    );
}

#[test]
fn internal_names_are_rejected() {
    let env = env();
    let ast = parse("1 + 1").unwrap();
    let err = InliningOptimizer::new(vec![InlineVariable::from_ast(
        "@r0",
        &parse("1").unwrap(),
    )])
    .optimize(&env, &ast)
    .unwrap_err();
    assert_eq!(err, OptimizeError::InternalName("@r0".to_string()));
}

// ---------------------------------------------------------------------------
// Presence-test rewrites
// ---------------------------------------------------------------------------

#[test]
fn presence_over_list_literal_becomes_size_check() {
    let env = env();
    let source = "has(msg.single_any.processing_purpose)";
    let ast = parse(source).unwrap();
    let inline = InlineVariable::from_ast(
        "msg.single_any.processing_purpose",
        &parse("[1, 2, 3]").unwrap(),
    );
    let out = InliningOptimizer::new(vec![inline]).optimize(&env, &ast).unwrap();
    assert_eq!(unparse(&out), "[1, 2, 3].size() != 0");
    let checked = env.check(&out).unwrap();
    let value = env.plan(&checked).unwrap().eval(&EmptyActivation).unwrap();
    assert_eq!(value, Value::Bool(true));
}

#[test]
fn presence_over_literals_compares_against_zero_values() {
    let env = env();
    for (replacement, expected) in [
        ("7", "7 != 0"),
        ("0u", "0u != 0u"),
        ("1.5", "1.5 != 0.0"),
        ("false", "false != false"),
        ("\"txt\"", "\"txt\".size() != 0"),
        ("b\"z\"", "b\"z\".size() != 0"),
        ("{\"k\": 1}", "{\"k\": 1}.size() != 0"),
    ] {
        let ast = parse("has(a.b)").unwrap();
        let inline = InlineVariable::from_ast("a.b", &parse(replacement).unwrap());
        let out = InliningOptimizer::new(vec![inline]).optimize(&env, &ast).unwrap();
        assert_eq!(unparse(&out), expected, "for replacement '{replacement}'");
    }
}

#[test]
fn presence_over_time_values_compares_against_epoch() {
    let env = env();
    let ast = parse("has(a.b)").unwrap();
    let inline = InlineVariable::from_ast("a.b", &parse("timestamp(\"2001-01-01T00:00:00Z\")").unwrap());
    let out = InliningOptimizer::new(vec![inline]).optimize(&env, &ast).unwrap();
    assert_eq!(
        unparse(&out),
        "timestamp(\"2001-01-01T00:00:00Z\") != timestamp(0)"
    );

    let ast = parse("has(a.b)").unwrap();
    let inline = InlineVariable::from_ast("a.b", &parse("duration(\"5s\")").unwrap());
    let out = InliningOptimizer::new(vec![inline]).optimize(&env, &ast).unwrap();
    assert_eq!(unparse(&out), "duration(\"5s\") != duration(\"0\")");
}

#[test]
fn presence_over_struct_literal_compares_against_empty() {
    let env = env();
    let ast = parse("has(a.b)").unwrap();
    let inline = InlineVariable::from_ast("a.b", &parse("TestAllTypes{single_int32: 1}").unwrap());
    let out = InliningOptimizer::new(vec![inline]).optimize(&env, &ast).unwrap();
    assert_eq!(unparse(&out), "TestAllTypes{single_int32: 1} != TestAllTypes{}");
}

#[test]
fn presence_over_wrapper_ident_compares_against_null() {
    let env = env();
    let ast = parse("has(a.b)").unwrap();
    let inline = InlineVariable::from_ast("a.b", &parse("wrapped").unwrap());
    let out = InliningOptimizer::new(vec![inline]).optimize(&env, &ast).unwrap();
    assert_eq!(unparse(&out), "wrapped != null");
}

#[test]
fn presence_over_typed_ident_uses_its_declared_type() {
    let env = env();
    let ast = parse("has(a.b)").unwrap();
    let inline = InlineVariable::from_ast("a.b", &parse("x").unwrap());
    let out = InliningOptimizer::new(vec![inline]).optimize(&env, &ast).unwrap();
    assert_eq!(unparse(&out), "x != 0");

    // an explicit type wins over the declaration lookup
    let ast = parse("has(a.b)").unwrap();
    let inline = InlineVariable::from_ast("a.b", &parse("x").unwrap()).with_type(CelType::String);
    let out = InliningOptimizer::new(vec![inline]).optimize(&env, &ast).unwrap();
    assert_eq!(unparse(&out), "x.size() != 0");
}
